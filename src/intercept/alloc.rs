//! This module contains the slot allocator for stub and continuation code
//!
//! Slots must land within `rel32` branch range of the hooked function, so
//! pages are mapped inside free gaps close to the target. The gap search
//! walks the mapping table the way detour-rs does
//! (<https://github.com/darfink/detour-rs>), one queried region at a time.

use std::ops::Range;
use std::slice;
use std::sync::Mutex;

use lazy_static::lazy_static;
use region::{Allocation, Protection};
use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;

/// Span on either side of a target within which slot pages must land.
///
/// Kept a little under 2 GiB so every byte of a slot stays addressable with
/// a signed 32-bit displacement from the patch site.
pub(crate) const PROXIMITY_RANGE: usize = 0x7000_0000;

/// Fixed size of one slot. Large enough for the entry stub plus a relocated
/// prologue and its jump back.
pub(crate) const SLOT_SIZE: usize = 128;

#[derive(Debug, Error)]
/// Errors that occur while allocating a code slot
pub(crate) enum AllocError {
    /// No free page within reach of the target accepted a mapping
    #[error("no free code page within branch range of {origin:#x}")]
    Exhausted {
        /// Target address the search was centered on
        origin: usize,
    },
    /// The mapping table could not be inspected
    #[error(transparent)]
    Region(#[from] region::Error),
}

lazy_static! {
    /// Process-wide slot pools, shared by all installed hooks
    static ref POOLS: Mutex<Vec<CodePool>> = Mutex::new(Vec::new());
}

/// Hands out a slot within branch range of `origin`, mapping a new pool page
/// near it when no existing pool is in reach.
pub(crate) fn allocate_near(origin: usize) -> Result<CodeSlot, AllocError> {
    let range = proximity_range(origin);
    let mut pools = POOLS.lock().unwrap();

    // prefer a pool that is already mapped within reach
    for pool in pools.iter_mut() {
        if pool.in_range(&range) {
            if let Some(data) = pool.pool.alloc(SLOT_SIZE) {
                return Ok(CodeSlot { data });
            }
        }
    }

    let pool = map_near(origin, &range)?;
    let data = pool
        .pool
        .alloc(SLOT_SIZE)
        .ok_or(AllocError::Exhausted { origin })?;
    pools.push(pool);
    Ok(CodeSlot { data })
}

/// The window of addresses acceptable for slots serving `origin`.
fn proximity_range(origin: usize) -> Range<usize> {
    origin.saturating_sub(PROXIMITY_RANGE)..origin.saturating_add(PROXIMITY_RANGE)
}

/// One executable slot handed out to a single hook.
pub(crate) struct CodeSlot {
    /// Backing slice inside a pool page; returns to the pool on drop
    data: SliceBox<u8>,
}

impl CodeSlot {
    /// First byte of the slot.
    pub(crate) fn address(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// The slot as a writable slice.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}

/// A pool of slots carved out of one read-write-execute page.
struct CodePool {
    /// Allocator handing out `SLOT_SIZE` slices of the page
    pool: SlicePool<u8>,
    /// First byte of the page
    base: usize,
    /// Page length in bytes
    len: usize,
}

impl CodePool {
    /// Tries to map a pool page at `address`, keeping it only when the
    /// kernel placed it fully inside `range`.
    fn map_at(address: usize, size: usize, range: &Range<usize>) -> Option<Self> {
        let mapping =
            region::alloc_at(address as *const u8, size, Protection::READ_WRITE_EXECUTE).ok()?;
        let base = mapping.as_ptr::<u8>() as usize;
        let len = mapping.len();
        if !(range.contains(&base) && range.contains(&(base + len - 1))) {
            // placed out of reach; dropping the mapping unmaps it
            return None;
        }
        Some(Self {
            pool: SlicePool::new(SliceableAllocation(mapping)),
            base,
            len,
        })
    }

    /// Returns true when every byte of the pool lies inside `range`.
    fn in_range(&self, range: &Range<usize>) -> bool {
        range.contains(&self.base) && range.contains(&(self.base + self.len - 1))
    }
}

/// Search direction relative to the origin.
#[derive(Clone, Copy)]
enum Direction {
    /// Walk towards higher addresses
    Above,
    /// Walk towards lower addresses
    Below,
}

/// Walks the mapping table outward from `origin` and maps a pool page in the
/// first free gap the kernel accepts.
fn map_near(origin: usize, range: &Range<usize>) -> Result<CodePool, AllocError> {
    let page = region::page::size();

    // search above the origin first, then below it
    for direction in [Direction::Above, Direction::Below] {
        let mut current = origin;
        while current > 0 && range.contains(&current) && range.contains(&(current + page - 1)) {
            match region::query(current as *const u8) {
                Ok(mapped) => {
                    // occupied; skip the whole region
                    current = match direction {
                        Direction::Above => mapped.as_range().end,
                        Direction::Below => mapped.as_range().start.saturating_sub(page),
                    };
                }
                Err(region::Error::UnmappedRegion) => {
                    if let Some(pool) = CodePool::map_at(current, page, range) {
                        return Ok(pool);
                    }
                    current = match direction {
                        Direction::Above => current + page,
                        Direction::Below => current.saturating_sub(page),
                    };
                }
                Err(error) => return Err(AllocError::Region(error)),
            }
        }
    }

    Err(AllocError::Exhausted { origin })
}

/// Wrapper making a page mapping usable as backing storage for `SlicePool`.
struct SliceableAllocation(Allocation);

impl AsRef<[u8]> for SliceableAllocation {
    fn as_ref(&self) -> &[u8] {
        // Safety: the allocation owns the whole mapped range
        unsafe { slice::from_raw_parts(self.0.as_ptr(), self.0.len()) }
    }
}

impl AsMut<[u8]> for SliceableAllocation {
    fn as_mut(&mut self) -> &mut [u8] {
        // Safety: the allocation owns the whole mapped range
        unsafe { slice::from_raw_parts_mut(self.0.as_mut_ptr(), self.0.len()) }
    }
}

// Safety: the wrapper owns the anonymous mapping and nothing else aliases it
unsafe impl Send for SliceableAllocation {}
unsafe impl Sync for SliceableAllocation {}
