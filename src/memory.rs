//! This module contains the memory reader used to inspect the process's own
//! address space from hook callbacks
//!
//! Reads are exact-length-or-nothing: the caller either receives every byte
//! requested or [`None`]. Unreadable memory is an expected outcome on this
//! crate's hot path (hook callbacks probe pointers handed to arbitrary
//! functions), so it is reported as an absent value, not an error. [`read`]
//! never panics and never logs.

/// A transient read request: `len` bytes starting at `base`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// First address of the region
    pub base: usize,
    /// Number of bytes to read
    pub len: usize,
}

impl MemoryRegion {
    /// Creates a region covering `len` bytes starting at `base`
    pub fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }
}

/// Reads exactly `region.len` bytes from this process's address space.
///
/// Returns [`None`] when the base address is null, the region is not fully
/// mapped, the region is not readable, or the read comes back short. A null
/// base is rejected before any OS call.
pub fn read(region: MemoryRegion) -> Option<Vec<u8>> {
    if region.base == 0 {
        return None;
    }
    if region.len == 0 {
        return Some(Vec::new());
    }
    // reject lengths no allocation or live mapping could satisfy
    if region.len > isize::MAX as usize || region.base.checked_add(region.len).is_none() {
        return None;
    }
    read_os(region.base, region.len)
}

/// Reads exactly `len` bytes starting at `base`; see [`read`]
pub fn read_bytes(base: usize, len: usize) -> Option<Vec<u8>> {
    read(MemoryRegion::new(base, len))
}

/// Linux read primitive: a single `process_vm_readv` against our own pid. The
/// kernel validates the remote range, so an unmapped or unreadable region
/// fails the call instead of faulting, and a short transfer is detected from
/// the byte count.
#[cfg(target_os = "linux")]
fn read_os(base: usize, len: usize) -> Option<Vec<u8>> {
    let mut buffer = vec![0u8; len];
    let local = libc::iovec {
        iov_base: buffer.as_mut_ptr().cast(),
        iov_len: len,
    };
    let remote = libc::iovec {
        iov_base: base as *mut libc::c_void,
        iov_len: len,
    };
    // Safety: the local iovec covers our freshly allocated buffer and the
    // remote iovec is length-bounded; the kernel checks the remote mapping
    let copied = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    (copied == len as isize).then_some(buffer)
}

/// Portable read primitive: query the region map for full readable coverage
/// of the range, then copy. The copy is not atomic with a concurrent unmap,
/// which the Linux primitive above avoids.
#[cfg(not(target_os = "linux"))]
fn read_os(base: usize, len: usize) -> Option<Vec<u8>> {
    use region::Protection;

    let end = base + len;
    let mut covered = base;
    for queried in region::query_range(base as *const u8, len).ok()? {
        let queried = queried.ok()?;
        let range = queried.as_range();
        if range.start > covered {
            // hole in the mapping
            return None;
        }
        if !queried.protection().contains(Protection::READ) {
            return None;
        }
        covered = covered.max(range.end);
        if covered >= end {
            break;
        }
    }
    if covered < end {
        return None;
    }

    let mut buffer = vec![0u8; len];
    // Safety: the range was fully readable above; length matches the buffer
    unsafe {
        std::ptr::copy_nonoverlapping(base as *const u8, buffer.as_mut_ptr(), len);
    }
    Some(buffer)
}
