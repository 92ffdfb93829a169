//! Double-mapped SPSC byte ring over anonymous shared memory.
//!
//! A [`RingBuf`] is one endpoint of a single-producer single-consumer
//! ring whose data region is mapped twice into adjacent virtual pages.
//! Because of that mirror, every record of up to `capacity` bytes is a
//! single contiguous slice no matter where it lands modulo capacity —
//! the producer and consumer never deal with wrap-around.
//!
//! # Protocol
//!
//! The producer calls [`reserve`](RingBuf::reserve) to get a writable
//! range and [`publish`](RingBuf::publish) to commit everything reserved
//! so far. The consumer calls [`peek`](RingBuf::peek) or
//! [`read`](RingBuf::read) to see published bytes and
//! [`consume`](RingBuf::consume) to hand the space back. Two shared
//! atomic cursors with release/acquire pairing are the complete
//! synchronization state; the data path is wait-free, non-blocking and
//! lock-free, and reports "not available now" as `None`.
//!
//! # Cross-process use
//!
//! The ring lives in an anonymous shared-memory object. The creating
//! endpoint owns the fd and can export it with [`RingBuf::fd`] (for
//! example over a socket ancillary message); any other party attaches
//! with [`RingBuf::attach`].
//!
//! ```no_run
//! use mirror_ring::RingBuf;
//!
//! # fn main() -> Result<(), mirror_ring::RingError> {
//! let mut producer = RingBuf::create(1)?;
//! let mut consumer = RingBuf::attach(producer.fd())?;
//!
//! let buf = producer.reserve(8).expect("empty ring has space");
//! buf.copy_from_slice(&42u64.to_ne_bytes());
//! producer.publish();
//!
//! let record = consumer.read(8).expect("published data is readable");
//! assert_eq!(record, 42u64.to_ne_bytes());
//! consumer.consume();
//! # Ok(())
//! # }
//! ```

pub mod layout;
pub mod mapping;
pub mod ring;

pub use layout::{LayoutError, RingHeader, FORMAT_VERSION};
pub use mapping::RingMapping;
pub use ring::{FillReport, RingBuf, RingError, WatermarkCallback};
