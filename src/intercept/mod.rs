//! # Interception
//!
//! This module contains the engine that reroutes calls of a live function
//! through hook callbacks.
//!
//! Installing a hook overwrites the first five bytes of the target with a
//! `jmp rel32` to a small per-hook stub allocated within branch range. The
//! stub identifies the hook and enters a shared thunk that snapshots the
//! argument registers, runs `on_enter`, then continues into a relocated copy
//! of the overwritten prologue so the target behaves as if it had never been
//! patched. When the hook observes returns, the thunk also swaps the saved
//! return address for an exit thunk that runs `on_leave` with the raw return
//! value before handing control back to the real caller.
//!
//! Installs and uninstalls are serialized behind one table lock and may run
//! from any thread. The dispatch path itself takes no locks. Uninstalling
//! restores the original bytes but retires the hook's stub slot and
//! descriptor instead of freeing them, so a call that entered the
//! interception path just before the restore still finds everything it
//! needs.
//!
//! Patching live code has contracts no engine can check:
//!
//! - the target must be the entry of a function at least five bytes long
//! - no thread may be executing the target's first bytes while they are
//!   being rewritten (install and uninstall)
//! - no code may branch into the middle of the overwritten span

mod alloc;
mod patch;
mod thunk;
mod trampoline;

use std::collections::HashMap;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use region::Protection;
use thiserror::Error;

use crate::hook::{HookCallback, ResolvedHook};
use crate::memory;

use alloc::CodeSlot;
use patch::PatchGuard;

// the stub must fit in front of the continuation
const _: () = assert!(trampoline::STUB_LEN <= trampoline::CONTINUATION_OFFSET);

#[derive(Debug, Error)]
/// Errors that occur while installing a hook
pub enum AttachError {
    /// Another hook already occupies the target
    #[error("address {address:#x} is already hooked")]
    AlreadyHooked {
        /// The contested target address
        address: usize,
    },
    /// The hook resolved to address zero
    #[error("hook target address is null")]
    NullAddress,
    /// The target is unmapped or not executable
    #[error("no executable mapping at {address:#x}")]
    NotExecutable {
        /// The rejected target address
        address: usize,
    },
    /// The leading bytes of the target could not be read
    #[error("could not read {len} bytes of code at {address:#x}")]
    UnreadableTarget {
        /// The target address
        address: usize,
        /// Bytes the engine tried to read
        len: usize,
    },
    /// The leading bytes of the target do not decode as instructions
    #[error("bytes at {address:#x} do not decode as instructions")]
    InvalidInstruction {
        /// Where decoding failed
        address: usize,
    },
    /// No free page within branch range accepted a slot mapping
    #[error("no free code slot within branch range of {address:#x}")]
    NoNearbySlot {
        /// The target address
        address: usize,
    },
    /// The relocated prologue does not fit its slot
    #[error("relocating the prologue of {address:#x} overflows its slot")]
    ContinuationTooLarge {
        /// The target address
        address: usize,
    },
    /// The slot ended up outside `rel32` range of the target
    #[error("code slot is out of branch range of {address:#x}")]
    StubOutOfReach {
        /// The target address
        address: usize,
    },
    /// Re-encoding the prologue failed
    #[error("prologue relocation failed: {0}")]
    Relocation(#[from] iced_x86::IcedError),
    /// A memory mapping or protection call failed
    #[error(transparent)]
    Memory(#[from] region::Error),
}

/// Descriptor shared between an installed hook and the dispatch path.
///
/// The per-hook stub carries a raw pointer to this, so once installed the
/// descriptor is never freed: uninstalling moves it to the retired list,
/// keeping it valid for calls still inside the interception path.
pub(crate) struct HookShared {
    /// Hook name, used in dispatch-side log lines
    pub(crate) name: String,
    /// Resolved target address
    pub(crate) address: usize,
    /// Callback running before the target body
    pub(crate) on_enter: Option<HookCallback>,
    /// Callback running after the target body returns
    pub(crate) on_leave: Option<HookCallback>,
    /// Address of the relocated prologue inside the slot
    pub(crate) continuation: usize,
}

/// Everything an installed hook owns.
struct ActiveHook {
    /// Shared descriptor referenced by the stub
    shared: Arc<HookShared>,
    /// Entry patch; restores the original prologue on drop
    patch: PatchGuard,
    /// Slot holding the stub and the relocated prologue
    slot: CodeSlot,
}

lazy_static! {
    /// Table of active interceptions, keyed by target address. Doubles as
    /// the install/uninstall serialization point.
    static ref ACTIVE: Mutex<HashMap<usize, ActiveHook>> = Mutex::new(HashMap::new());
    /// Uninstalled descriptors and slots, kept alive for calls that were
    /// already inside the interception path
    static ref RETIRED: Mutex<Vec<(Arc<HookShared>, CodeSlot)>> = Mutex::new(Vec::new());
}

/// Live interception of one target.
///
/// Dropping the handle uninstalls the hook, under the same quiescence
/// contract as installing it.
#[derive(Debug)]
pub struct InterceptionHandle {
    /// Hooked target address
    address: usize,
    /// Name of the hook occupying the target
    name: String,
}

impl InterceptionHandle {
    /// The intercepted address.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Name of the installed hook.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Uninstalls the hook.
    ///
    /// The target gets its original bytes back. The hook's slot and
    /// descriptor are retired rather than freed, so calls that already
    /// entered the interception path complete safely.
    pub fn uninstall(self) {}
}

impl Drop for InterceptionHandle {
    fn drop(&mut self) {
        // hold the table lock across the restore so a concurrent install at
        // this address cannot observe the patched prologue
        let mut active = ACTIVE.lock().unwrap();
        if let Some(hook) = active.remove(&self.address) {
            let ActiveHook { shared, patch, slot } = hook;
            // restore the original prologue before retiring anything
            drop(patch);
            log::debug!("hook `{}` at {:#x} uninstalled", self.name, shared.address);
            RETIRED.lock().unwrap().push((shared, slot));
        }
    }
}

/// Installs a resolved hook and returns the handle that owns it.
///
/// The target's first instructions are relocated into a nearby slot and its
/// entry is overwritten with a jump into the interception path. Callbacks
/// start firing as soon as this returns.
///
/// # Safety
///
/// - `hook` must target the entry of a real function that is at least five
///   bytes long
/// - no thread may be executing the target's first bytes during the install
/// - no code may branch into the overwritten span other than to its start
pub unsafe fn install(hook: ResolvedHook) -> Result<InterceptionHandle, AttachError> {
    let (name, address, on_enter, on_leave) = hook.into_parts();

    if address == 0 {
        return Err(AttachError::NullAddress);
    }

    // one interception procedure at a time; the table lock covers the whole
    // install so a concurrent uninstall cannot interleave
    let mut active = ACTIVE.lock().unwrap();
    if active.contains_key(&address) {
        return Err(AttachError::AlreadyHooked { address });
    }

    let target_region =
        region::query(address as *const u8).map_err(|_| AttachError::NotExecutable { address })?;
    if !target_region.protection().contains(Protection::EXECUTE) {
        return Err(AttachError::NotExecutable { address });
    }

    let window = memory::read_bytes(address, trampoline::PROLOGUE_WINDOW).ok_or(
        AttachError::UnreadableTarget {
            address,
            len: trampoline::PROLOGUE_WINDOW,
        },
    )?;
    let prologue = trampoline::steal_prologue(address, &window)?;

    let mut slot = alloc::allocate_near(address).map_err(|error| match error {
        alloc::AllocError::Exhausted { .. } => AttachError::NoNearbySlot { address },
        alloc::AllocError::Region(inner) => AttachError::Memory(inner),
    })?;

    let continuation_address = slot.address() + trampoline::CONTINUATION_OFFSET;
    let shared = Arc::new(HookShared {
        name: name.clone(),
        address,
        on_enter,
        on_leave,
        continuation: continuation_address,
    });

    let stub =
        trampoline::encode_stub(Arc::as_ptr(&shared) as usize, thunk::enter_thunk_address());
    let continuation = trampoline::encode_continuation(
        &prologue,
        address,
        continuation_address,
        alloc::SLOT_SIZE - trampoline::CONTINUATION_OFFSET,
    )?;

    {
        let data = slot.as_mut_slice();
        data[..stub.len()].copy_from_slice(&stub);
        data[trampoline::CONTINUATION_OFFSET..trampoline::CONTINUATION_OFFSET + continuation.len()]
            .copy_from_slice(&continuation);
    }
    // the slot contents must be visible to every core before the entry jump
    // goes live
    fence(Ordering::SeqCst);

    let patch_bytes = trampoline::encode_patch(address, slot.address(), prologue.len)?;
    // Safety: the span decoded as whole instructions at `address`, and the
    // caller upholds the quiescence contract from the module docs
    let guard = PatchGuard::apply(address as *mut u8, &patch_bytes)?;

    log::debug!(
        "hook `{name}` stub at {:#x} intercepting {address:#x}",
        slot.address()
    );
    active.insert(
        address,
        ActiveHook {
            shared,
            patch: guard,
            slot,
        },
    );

    Ok(InterceptionHandle { address, name })
}
