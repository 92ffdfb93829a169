//! SPSC ring endpoint.
//!
//! [`RingBuf`] is one endpoint of a single-producer single-consumer byte
//! ring. Exactly one endpoint per ring acts as the producer
//! ([`reserve`](RingBuf::reserve) / [`publish`](RingBuf::publish)) and
//! exactly one as the consumer ([`peek`](RingBuf::peek) /
//! [`read`](RingBuf::read) / [`consume`](RingBuf::consume)); the two may
//! live in different processes sharing the fd.
//!
//! The data path is wait-free and non-blocking: insufficient space or data
//! is reported as `None`, never as an error, and nothing ever retries
//! internally.

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::Ordering;

use crate::layout::{self, LayoutError, RingHeader};
use crate::mapping::{self, RingMapping};

/// Producer-side watermark hook, run on the publishing thread.
pub type WatermarkCallback = Box<dyn FnMut() + Send>;

/// The shared-memory handle, with ownership encoded in the variant.
enum RingFd {
    /// Allocated by this endpoint; closed when the endpoint drops.
    Owned(OwnedFd),
    /// Provided by the caller; the caller keeps it open and closes it.
    Shared(RawFd),
}

impl RingFd {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            RingFd::Owned(fd) => fd.as_raw_fd(),
            RingFd::Shared(fd) => *fd,
        }
    }
}

/// One endpoint of a double-mapped SPSC byte ring.
///
/// Endpoints are movable but not copyable; dropping one releases the
/// mapping and, on the creating side, the underlying handle. A single
/// endpoint is not thread-safe — operations take `&mut self` and must not
/// be interleaved from multiple threads. The normal arrangement is one
/// producer endpoint and one consumer endpoint, each on its own thread or
/// in its own process.
pub struct RingBuf {
    mapping: RingMapping,
    fd: RingFd,
    page: usize,
    capacity: u64,
    /// Producer speculative cursor: reserved but not yet published.
    local_head: u64,
    /// Consumer speculative cursor: read but not yet consumed.
    local_tail: u64,
    watermark: u64,
    watermark_cb: Option<WatermarkCallback>,
}

impl RingBuf {
    /// Create a new ring with a data region of `pages` pages.
    ///
    /// Allocates an anonymous shared-memory handle, sizes it to
    /// `(pages + 1) · page`, installs the double mapping and initializes
    /// the header. The returned endpoint owns the handle.
    pub fn create(pages: u64) -> Result<Self, RingError> {
        if pages == 0 {
            return Err(RingError::InvalidConfig("pages must be at least 1"));
        }
        let page = layout::page_size() as u64;
        let total = pages
            .checked_add(1)
            .and_then(|p| p.checked_mul(page))
            .ok_or(RingError::InvalidConfig("ring size overflows"))?;

        let fd = mapping::create_memfd().map_err(RingError::HandleAllocation)?;
        mapping::set_handle_len(fd.as_raw_fd(), total).map_err(RingError::Sizing)?;

        // On failure past this point the OwnedFd drop closes the handle.
        let mut ring = Self::attach_inner(fd.as_raw_fd())?;
        ring.fd = RingFd::Owned(fd);

        // SAFETY: we are the creating endpoint and the fd has not been
        // shared yet, so nothing else is looking at the header.
        let header = unsafe { &mut *(ring.mapping.base() as *mut RingHeader) };
        header.init(ring.capacity);

        tracing::debug!(pages, capacity = ring.capacity, "created ring");
        Ok(ring)
    }

    /// Attach to an existing ring over a caller-provided handle.
    ///
    /// Re-establishes the mapping and leaves the header untouched. The
    /// returned endpoint does not own the handle; the mapping itself stays
    /// valid even if the caller closes the fd afterwards.
    pub fn attach(fd: RawFd) -> Result<Self, RingError> {
        let ring = Self::attach_inner(fd)?;
        tracing::debug!(fd, capacity = ring.capacity, "attached ring");
        Ok(ring)
    }

    fn attach_inner(fd: RawFd) -> Result<Self, RingError> {
        let page = layout::page_size();
        let len = mapping::handle_len(fd).map_err(RingError::Mapping)?;
        let capacity = layout::validate_geometry(len, page as u64).map_err(RingError::Layout)?;

        let mapping = RingMapping::establish(fd, page, capacity as usize)
            .map_err(RingError::Mapping)?;

        // SAFETY: the mapping holds at least one page, which starts with
        // the header record.
        let header = unsafe { &*(mapping.base() as *const RingHeader) };
        header.validate(capacity).map_err(RingError::Layout)?;

        // Start the private cursors from the shared ones so that a late
        // attach joins an active ring in a consistent state.
        let local_head = header.head.load(Ordering::Acquire);
        let local_tail = header.tail.load(Ordering::Acquire);

        Ok(Self {
            mapping,
            fd: RingFd::Shared(fd),
            page,
            capacity,
            local_head,
            local_tail,
            watermark: 0,
            watermark_cb: None,
        })
    }

    /// The underlying shared-memory handle, for transfer to another
    /// process (for instance via a socket ancillary message).
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Capacity of the data region in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.capacity
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: the mapping holds a live RingHeader at its base for as
        // long as self exists.
        unsafe { &*(self.mapping.base() as *const RingHeader) }
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: base + page is the start of the data region, inside the
        // mapping.
        unsafe { self.mapping.base().add(self.page) }
    }

    /// Reserve `size` bytes for writing. Producer-only.
    ///
    /// Returns a contiguous mutable range backed by the mirror, so the
    /// caller never deals with wrap-around. The bytes become visible to
    /// the consumer at the next [`publish`](RingBuf::publish).
    ///
    /// One byte of capacity is permanently unreservable: the fill never
    /// reaches `capacity`, which is what lets head/tail equality mean
    /// "empty" without a separate flag. `reserve(0)` and any `size >=
    /// capacity` return `None`; otherwise `None` means the consumer has
    /// not freed enough space yet.
    pub fn reserve(&mut self, size: usize) -> Option<&mut [u8]> {
        let size = size as u64;
        if size == 0 || size >= self.capacity {
            return None;
        }

        let tail = self.header().tail.load(Ordering::Acquire);
        let fits = if self.local_head >= tail {
            self.local_head + size < tail + self.capacity
        } else {
            self.local_head + size < tail
        };
        if !fits {
            return None;
        }

        let offset = self.local_head as usize;
        self.local_head = (self.local_head + size) % self.capacity;

        // SAFETY: offset < capacity and size < capacity, so the range lies
        // inside the double-mapped data span; the consumer cannot observe
        // these bytes before the next publish.
        Some(unsafe {
            std::slice::from_raw_parts_mut(self.data_ptr().add(offset), size as usize)
        })
    }

    /// Make everything reserved since the last publish visible to the
    /// consumer. Producer-only; the producer's single commit point.
    ///
    /// If a watermark is configured and the published fill exceeds it, the
    /// callback runs synchronously on this thread before returning.
    /// Calling back into the ring from the callback is not supported.
    pub fn publish(&mut self) {
        self.header().head.store(self.local_head, Ordering::Release);

        if self.watermark != 0 {
            let tail = self.header().tail.load(Ordering::Acquire);
            let fill = (self.local_head + self.capacity - tail) % self.capacity;
            if fill > self.watermark {
                if let Some(cb) = self.watermark_cb.as_mut() {
                    cb();
                }
            }
        }
    }

    fn published(&self, size: u64) -> bool {
        let head = self.header().head.load(Ordering::Acquire);
        if self.local_tail <= head {
            self.local_tail + size <= head
        } else {
            self.local_tail + size <= head + self.capacity
        }
    }

    /// Look at the next `size` published bytes without advancing any
    /// cursor. Consumer-only.
    ///
    /// Idempotent: repeated peeks return the same range until a
    /// [`read`](RingBuf::read) or [`consume`](RingBuf::consume)
    /// intervenes. Concurrent producer progress can only make more data
    /// available, never less.
    pub fn peek(&self, size: usize) -> Option<&[u8]> {
        if size as u64 > self.capacity || !self.published(size as u64) {
            return None;
        }
        // SAFETY: local_tail < capacity and size <= capacity, so the range
        // lies inside the double-mapped data span; the bytes were stored
        // before a release on head which the acquire above observed.
        Some(unsafe {
            std::slice::from_raw_parts(self.data_ptr().add(self.local_tail as usize), size)
        })
    }

    /// Take the next `size` published bytes. Consumer-only.
    ///
    /// A successful peek that also advances the private read cursor. The
    /// space is handed back to the producer only at the next
    /// [`consume`](RingBuf::consume). On failure the cursor is unchanged.
    pub fn read(&mut self, size: usize) -> Option<&[u8]> {
        if size as u64 > self.capacity || !self.published(size as u64) {
            return None;
        }
        let offset = self.local_tail as usize;
        self.local_tail = (self.local_tail + size as u64) % self.capacity;
        // SAFETY: as in peek; offset is the cursor value before the
        // advance.
        Some(unsafe { std::slice::from_raw_parts(self.data_ptr().add(offset), size) })
    }

    /// Free everything read since the last consume for reuse by the
    /// producer. Consumer-only; the consumer's single commit point.
    ///
    /// Ranges previously returned by `read`/`peek` must not be used after
    /// this (the borrow on `&mut self` enforces it).
    pub fn consume(&mut self) {
        self.header().tail.store(self.local_tail, Ordering::Release);
    }

    /// Configure or clear the high-watermark hook. Producer-side.
    ///
    /// After a publish that leaves more than `threshold` bytes of fill,
    /// the callback is invoked on the publishing thread. A threshold of 0
    /// disables the hook; a nonzero threshold without a callback is
    /// rejected.
    pub fn set_watermark(
        &mut self,
        threshold: u64,
        callback: Option<WatermarkCallback>,
    ) -> Result<(), RingError> {
        if threshold != 0 && callback.is_none() {
            return Err(RingError::InvalidConfig(
                "a nonzero watermark requires a callback",
            ));
        }
        self.watermark = threshold;
        self.watermark_cb = callback;
        Ok(())
    }

    /// Snapshot the four cursors for diagnostics.
    pub fn fill_report(&self) -> FillReport {
        let header = self.header();
        FillReport {
            head: header.head.load(Ordering::Acquire),
            tail: header.tail.load(Ordering::Acquire),
            local_head: self.local_head,
            local_tail: self.local_tail,
            capacity: self.capacity,
        }
    }

    /// Print a fill snapshot to stderr. Best-effort; the format is not
    /// part of the ABI.
    pub fn print_fill(&self) {
        eprintln!("{}", self.fill_report());
    }
}

/// Snapshot of the ring's cursors, partitioned into spans.
///
/// The spans follow the cyclic cursor order `tail → local_tail → head →
/// local_head → tail` and always sum to the capacity. Note that the two
/// local cursors are this endpoint's view; the other endpoint's private
/// cursor may already be further along.
#[derive(Debug, Clone, Copy)]
pub struct FillReport {
    pub head: u64,
    pub tail: u64,
    pub local_head: u64,
    pub local_tail: u64,
    pub capacity: u64,
}

impl FillReport {
    #[inline]
    fn span(&self, from: u64, to: u64) -> u64 {
        (to + self.capacity - from) % self.capacity
    }

    /// Bytes read but not yet committed by `consume`.
    pub fn consumed(&self) -> u64 {
        self.span(self.tail, self.local_tail)
    }

    /// Published bytes not yet read.
    pub fn used(&self) -> u64 {
        self.span(self.local_tail, self.head)
    }

    /// Bytes reserved but not yet published.
    pub fn reserved(&self) -> u64 {
        self.span(self.head, self.local_head)
    }

    /// Bytes available for reservation, sentinel byte included.
    pub fn free(&self) -> u64 {
        self.capacity - self.consumed() - self.used() - self.reserved()
    }
}

impl std::fmt::Display for FillReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[ free: {} consumed: {} used: {} reserved: {} | head={} tail={} ]",
            self.free(),
            self.consumed(),
            self.used(),
            self.reserved(),
            self.head,
            self.tail,
        )
    }
}

/// Errors from ring construction and configuration.
///
/// The data path never produces errors; it signals "not available now"
/// with `None`.
#[derive(Debug)]
pub enum RingError {
    /// The OS refused to allocate the shared-memory handle.
    HandleAllocation(io::Error),
    /// The OS refused to size the shared-memory object.
    Sizing(io::Error),
    /// The OS refused a mapping, or the object could not be inspected.
    Mapping(io::Error),
    /// The object's geometry or header failed validation.
    Layout(LayoutError),
    /// A caller-supplied parameter combination is invalid.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for RingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HandleAllocation(e) => {
                write!(f, "cannot allocate shared-memory handle: {}", e)
            }
            Self::Sizing(e) => write!(f, "cannot size shared-memory object: {}", e),
            Self::Mapping(e) => write!(f, "cannot map ring buffer: {}", e),
            Self::Layout(e) => write!(f, "{}", e),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for RingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::HandleAllocation(e) | Self::Sizing(e) | Self::Mapping(e) => Some(e),
            Self::Layout(e) => Some(e),
            Self::InvalidConfig(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn create_ring() {
        let ring = RingBuf::create(1).unwrap();
        assert_eq!(ring.size() as usize, layout::page_size());
    }

    #[test]
    fn create_rejects_zero_pages() {
        assert!(matches!(
            RingBuf::create(0),
            Err(RingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn create_fails_for_absurd_size() {
        // An exabyte-scale ring cannot be sized or mapped.
        assert!(RingBuf::create(1 << 50).is_err());
    }

    #[test]
    fn reserve_on_empty_ring() {
        let mut ring = RingBuf::create(1).unwrap();
        assert!(ring.reserve(4).is_some());
    }

    #[test]
    fn reserve_zero_is_refused() {
        let mut ring = RingBuf::create(1).unwrap();
        assert!(ring.reserve(0).is_none());
    }

    #[test]
    fn read_on_empty_ring() {
        let mut ring = RingBuf::create(1).unwrap();
        assert!(ring.read(4).is_none());
    }

    #[test]
    fn write_read_roundtrip() {
        let mut ring = RingBuf::create(1).unwrap();

        ring.reserve(8).unwrap().fill(0x2A);
        ring.publish();

        assert_eq!(ring.read(8).unwrap(), &[0x2A; 8]);
    }

    #[test]
    fn reserve_capacity_fails_capacity_minus_one_succeeds() {
        let mut ring = RingBuf::create(1).unwrap();
        let cap = ring.size() as usize;

        // The sentinel byte: fill can never reach capacity.
        assert!(ring.reserve(cap).is_none());
        assert!(ring.reserve(cap - 1).is_some());
    }

    #[test]
    fn wraparound_record_is_contiguous() {
        let mut ring = RingBuf::create(1).unwrap();
        let cap = ring.size() as usize;

        // Push the cursors past 80% of capacity.
        let first = cap * 4 / 5;
        assert!(ring.reserve(first).is_some());
        ring.publish();
        assert!(ring.read(first).is_some());
        ring.consume();

        // This record wraps physically but is one contiguous slice.
        let ev = cap / 2;
        let buf = ring.reserve(ev).unwrap();
        buf[ev - 8..].copy_from_slice(&42u64.to_ne_bytes());
        ring.publish();

        let got = ring.read(ev).unwrap();
        assert_eq!(u64::from_ne_bytes(got[ev - 8..].try_into().unwrap()), 42);
    }

    #[test]
    fn peek_is_idempotent() {
        let mut ring = RingBuf::create(1).unwrap();

        let payload: Vec<u8> = (0..16u8).collect();
        ring.reserve(16).unwrap().copy_from_slice(&payload);
        ring.publish();

        let first = ring.peek(16).unwrap().as_ptr();
        let second = ring.peek(16).unwrap().as_ptr();
        assert_eq!(first, second);
        assert_eq!(ring.peek(16).unwrap(), &payload[..]);

        // Peek never advances the cursor; read still sees everything.
        assert_eq!(ring.read(16).unwrap(), &payload[..]);
    }

    #[test]
    fn peek_beyond_published_fails() {
        let mut ring = RingBuf::create(1).unwrap();
        ring.reserve(8).unwrap().fill(1);
        ring.publish();

        assert!(ring.peek(9).is_none());
        assert!(ring.peek(8).is_some());
    }

    #[test]
    fn attach_after_create() {
        let mut producer = RingBuf::create(1).unwrap();
        let mut consumer = RingBuf::attach(producer.fd()).unwrap();
        assert_eq!(producer.size(), consumer.size());

        let pattern: Vec<u8> = (0..16u8).map(|i| i.wrapping_mul(7)).collect();
        producer.reserve(16).unwrap().copy_from_slice(&pattern);
        producer.publish();

        assert_eq!(consumer.read(16).unwrap(), &pattern[..]);
        consumer.consume();

        // With the space returned, a near-capacity reservation wraps.
        let cap = producer.size() as usize;
        assert!(producer.reserve(cap - 20).is_some());
    }

    #[test]
    fn watermark_fires_per_qualifying_publish() {
        let mut ring = RingBuf::create(1).unwrap();
        let cap = ring.size();

        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        ring.set_watermark(
            cap / 2,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })),
        )
        .unwrap();

        assert!(ring.reserve((cap * 3 / 5) as usize).is_some());
        ring.publish();
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        // Fill is unchanged and still above the threshold.
        ring.publish();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn watermark_requires_callback() {
        let mut ring = RingBuf::create(1).unwrap();
        assert!(matches!(
            ring.set_watermark(16, None),
            Err(RingError::InvalidConfig(_))
        ));
        // Zero clears without a callback.
        assert!(ring.set_watermark(0, None).is_ok());
    }

    #[test]
    fn fill_report_partitions_capacity() {
        let mut ring = RingBuf::create(1).unwrap();
        let cap = ring.size();

        let report = ring.fill_report();
        assert_eq!(report.free(), cap);

        assert!(ring.reserve(100).is_some());
        let report = ring.fill_report();
        assert_eq!(report.reserved(), 100);
        assert_eq!(report.free(), cap - 100);

        ring.publish();
        let report = ring.fill_report();
        assert_eq!(report.used(), 100);
        assert_eq!(report.reserved(), 0);

        assert!(ring.read(40).is_some());
        let report = ring.fill_report();
        assert_eq!(report.consumed(), 40);
        assert_eq!(report.used(), 60);

        ring.consume();
        let report = ring.fill_report();
        assert_eq!(report.consumed(), 0);
        assert_eq!(report.used(), 60);
        assert_eq!(report.free(), cap - 60);
        assert_eq!(
            report.free() + report.consumed() + report.used() + report.reserved(),
            cap
        );
    }

    #[test]
    fn cursors_stay_in_range() {
        let mut ring = RingBuf::create(1).unwrap();
        let cap = ring.size();

        for chunk in [64usize, 1000, 4000, 1, 4095] {
            if ring.reserve(chunk).is_some() {
                ring.publish();
            }
            if ring.read(chunk).is_some() {
                ring.consume();
            }
            let report = ring.fill_report();
            assert!(report.head < cap);
            assert!(report.tail < cap);
            assert!(report.local_head < cap);
            assert!(report.local_tail < cap);
        }
    }
}
