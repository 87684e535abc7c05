//! This module contains the raw byte patcher used to plant and revert the
//! entry jump at a target function

use std::ptr;

use region::Protection;

/// A reversible in-place byte patch.
///
/// Applying the patch saves the bytes it overwrites; dropping the guard
/// writes them back. Both the write and the restore lift the page protection
/// of the patched range for the duration of the copy.
pub(crate) struct PatchGuard {
    /// Bytes that were at `location` before the patch
    original: Vec<u8>,
    /// Start of the patched range
    location: *mut u8,
}

// Safety: the guard only dereferences `location` in `apply` and `drop`, and
// the engine serializes both behind its table lock.
unsafe impl Send for PatchGuard {}

impl PatchGuard {
    /// Overwrites `patch.len()` bytes at `location` and returns a guard that
    /// restores the original bytes when dropped.
    ///
    /// # Safety
    ///
    /// - `location` must be valid for reads and writes of `patch.len()` bytes
    ///   for the lifetime of the guard
    /// - no thread may be executing inside the patched range during the write
    ///   or during the restore
    pub(crate) unsafe fn apply(location: *mut u8, patch: &[u8]) -> Result<Self, region::Error> {
        let mut original = vec![0u8; patch.len()];
        // Safety: caller guarantees the range is valid for reads
        ptr::copy_nonoverlapping(location, original.as_mut_ptr(), patch.len());

        // Safety: the handle restores the previous protection at scope end
        let _handle = region::protect_with_handle(location, patch.len(), Protection::READ_WRITE_EXECUTE)?;
        // Safety: caller guarantees the range is valid for writes
        ptr::copy_nonoverlapping(patch.as_ptr(), location, patch.len());

        Ok(Self { original, location })
    }
}

impl Drop for PatchGuard {
    fn drop(&mut self) {
        // Safety: the creator of the guard promised the range stays valid for
        // its lifetime; the write simply puts the saved bytes back
        unsafe {
            match region::protect_with_handle(
                self.location,
                self.original.len(),
                Protection::READ_WRITE_EXECUTE,
            ) {
                Ok(_handle) => {
                    ptr::copy_nonoverlapping(self.original.as_ptr(), self.location, self.original.len());
                }
                Err(error) => {
                    log::error!("leaving patch at {:#x} in place: {error}", self.location as usize);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::slice;

    #[test]
    /// Tests that a patch is applied and reverted on drop
    fn test_apply_and_restore() {
        let mut data = vec![1u8, 2, 3, 4, 5];
        let ptr = data.as_mut_ptr();

        // patch the middle of the buffer
        let guard = unsafe { PatchGuard::apply(ptr.add(1), &[9, 9, 9]).unwrap() };
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 5) }, [1, 9, 9, 9, 5]);

        // dropping the guard puts the old bytes back
        drop(guard);
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 5) }, [1, 2, 3, 4, 5]);
    }

    #[test]
    /// Tests that patching read-only memory works and the protection is
    /// restored afterwards
    fn test_read_only_target() {
        // a byte string literal lives in a read-only section
        let data: &'static [u8; 6] = b"abcdef";
        let ptr = std::hint::black_box(data.as_ptr() as *mut u8);

        let guard = unsafe { PatchGuard::apply(ptr, &[b'x', b'y']).unwrap() };
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 6) }, b"xycdef");
        drop(guard);
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 6) }, b"abcdef");

        // the temporary write permission must be gone again
        let info = region::query(ptr).unwrap();
        assert!(!info.protection().contains(Protection::WRITE));
    }
}
