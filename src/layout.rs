//! Shared-memory layout definitions.
//!
//! This module defines the `repr(C)` header that sits at offset 0 of the
//! shared object, and the geometry rules that attach enforces before
//! mapping anything.
//!
//! # Memory layout of the shared object
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Ring header (one page; struct occupies first 32 bytes) │
//! │    +0   u64 version = 1                                 │
//! │    +8   u64 size    = capacity in bytes                 │
//! │    +16  u64 atomic head (producer write cursor)         │
//! │    +24  u64 atomic tail (consumer read cursor)          │
//! ├─────────────────────────────────────────────────────────┤
//! │  Data region (capacity bytes, capacity = pages · page)  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The object's total length is `(pages + 1) · page` with `pages >= 1`.
//! All fields are in host byte order; the ring is an intra-host IPC
//! mechanism and the layout is stable across processes on one machine.

use std::sync::atomic::AtomicU64;

/// Current on-memory format version.
pub const FORMAT_VERSION: u64 = 1;

/// Ring header at offset 0 of the shared object.
///
/// `version` and `size` are written once at creation and read-only
/// afterwards. `head` and `tail` are the only fields mutated after
/// creation: `head` by the producer (release), `tail` by the consumer
/// (release), each read by the other side with acquire.
#[repr(C)]
pub struct RingHeader {
    /// Format version; [`FORMAT_VERSION`] after initialization.
    pub version: u64,
    /// Capacity of the data region in bytes; a positive page multiple.
    pub size: u64,
    /// Producer-published write cursor, modulo `size`.
    pub head: AtomicU64,
    /// Consumer-committed read cursor, modulo `size`.
    pub tail: AtomicU64,
}

const _: () = assert!(core::mem::size_of::<RingHeader>() == 32);

impl RingHeader {
    /// Initialize a freshly created header.
    ///
    /// Must only be called by the creating endpoint, before the fd is
    /// handed to any other party.
    pub fn init(&mut self, capacity: u64) {
        self.version = FORMAT_VERSION;
        self.size = capacity;
        self.head = AtomicU64::new(0);
        self.tail = AtomicU64::new(0);
    }

    /// Validate header contents against the capacity derived from the
    /// object's length.
    ///
    /// An all-zero header is accepted: a party attaching between the
    /// creator's `ftruncate` and its header initialization observes zeros
    /// and correctly sees an empty ring.
    pub fn validate(&self, capacity: u64) -> Result<(), LayoutError> {
        if self.version == 0 && self.size == 0 {
            return Ok(());
        }
        if self.version != FORMAT_VERSION {
            return Err(LayoutError::VersionMismatch {
                expected: FORMAT_VERSION,
                found: self.version,
            });
        }
        if self.size != capacity {
            return Err(LayoutError::SizeMismatch {
                declared: self.size,
                derived: capacity,
            });
        }
        Ok(())
    }
}

/// Query the system page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Derive the data-region capacity from the shared object's length.
///
/// Rejects a length that is not a page multiple, and a length of at most
/// one page (header only, no data region).
pub fn validate_geometry(len: u64, page: u64) -> Result<u64, LayoutError> {
    if len % page != 0 {
        return Err(LayoutError::NotPageAligned { len, page });
    }
    if len <= page {
        return Err(LayoutError::NoDataRegion { len });
    }
    Ok(len - page)
}

/// Errors from geometry and header validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Object length is not a multiple of the page size.
    NotPageAligned { len: u64, page: u64 },
    /// Object holds a header page but no data region.
    NoDataRegion { len: u64 },
    /// Header carries a format version this build does not understand.
    VersionMismatch { expected: u64, found: u64 },
    /// Header's declared capacity disagrees with the object's length.
    SizeMismatch { declared: u64, derived: u64 },
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotPageAligned { len, page } => {
                write!(
                    f,
                    "object length {} is not a multiple of the page size {}",
                    len, page
                )
            }
            Self::NoDataRegion { len } => {
                write!(
                    f,
                    "object length {} leaves no data region after the header page",
                    len
                )
            }
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "ring format version mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Self::SizeMismatch { declared, derived } => {
                write!(
                    f,
                    "header declares capacity {} but the object length implies {}",
                    declared, derived
                )
            }
        }
    }
}

impl std::error::Error for LayoutError {}
