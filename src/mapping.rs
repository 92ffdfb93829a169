//! Mapping engine: memfd allocation and the double mapping.
//!
//! The data region is mapped twice, back to back, so that any range of at
//! most `capacity` bytes starting inside the first copy is contiguous in
//! virtual memory even when it wraps the ring logically.
//!
//! # Virtual layout after [`RingMapping::establish`]
//!
//! ```text
//! [ base, base+page )                          header        (shared)
//! [ base+page, base+page+capacity )            data          (shared)
//! [ base+page+capacity, base+page+2·capacity ) data mirror   (shared,
//!                                              aliases the prior range)
//! ```
//!
//! Two `mmap` calls build this: the first maps `page + 2·capacity` bytes
//! over offset 0 (the trailing `capacity` bytes are placeholder address
//! space), the second pins the mirror over the placeholder with
//! `MAP_FIXED`, re-mapping offset `page` of the same object.

use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// An established ring mapping.
///
/// Owns the whole `page + 2·capacity` virtual span and releases it with a
/// single `munmap` on drop. The memory stays valid for the lifetime of
/// this value regardless of what happens to the fd it was mapped from.
pub struct RingMapping {
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; cross-endpoint access to it
// is synchronized by the ring's atomic cursors, not by this type.
unsafe impl Send for RingMapping {}

impl RingMapping {
    /// Map header, data and mirror over `fd` as one contiguous range.
    ///
    /// `capacity` must already be validated as a positive multiple of
    /// `page` no larger than the object's data region.
    pub fn establish(fd: RawFd, page: usize, capacity: usize) -> io::Result<Self> {
        let len = page + 2 * capacity;

        // SAFETY: fd is a live shared-memory object of at least
        // page + capacity bytes; len covers that plus placeholder address
        // space for the mirror.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = base as *mut u8;

        // SAFETY: the target range [base+page+capacity, base+len) lies
        // inside the mapping created above, so MAP_FIXED replaces our own
        // placeholder pages and nothing else.
        let mirror = unsafe {
            libc::mmap(
                base.add(page + capacity) as *mut libc::c_void,
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                page as libc::off_t,
            )
        };
        if mirror == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // SAFETY: base/len describe the mapping installed above.
            unsafe {
                libc::munmap(base as *mut libc::c_void, len);
            }
            return Err(err);
        }

        tracing::trace!(len, capacity, "established double mapping");
        Ok(Self { base, len })
    }

    /// Base address of the mapping (the header).
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Total length of the mapped span.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for RingMapping {
    fn drop(&mut self) {
        // SAFETY: base/len were returned by mmap and cover the full span,
        // mirror included.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Allocate an anonymous shared-memory handle.
pub(crate) fn create_memfd() -> io::Result<OwnedFd> {
    // SAFETY: the name is a valid NUL-terminated string; memfd_create
    // does not retain the pointer.
    let fd = unsafe { libc::memfd_create(c"mirror-ring".as_ptr(), libc::MFD_CLOEXEC) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by memfd_create and is owned by no one
    // else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Size the shared-memory object to `len` bytes.
pub(crate) fn set_handle_len(fd: RawFd, len: u64) -> io::Result<()> {
    let len: libc::off_t = len
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "object length exceeds off_t"))?;
    // SAFETY: fd is a live memfd.
    if unsafe { libc::ftruncate(fd, len) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Report the shared-memory object's current length.
pub(crate) fn handle_len(fd: RawFd) -> io::Result<u64> {
    // SAFETY: stat is a plain-old-data struct; fstat fills it or fails.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.st_size as u64)
}
