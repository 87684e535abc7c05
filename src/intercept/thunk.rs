//! This module contains the shared entry and exit thunks and the Rust
//! dispatchers they call into
//!
//! Every stub funnels into one entry thunk. The thunk snapshots the
//! argument registers, hands the hook descriptor (smuggled in `r11`) to
//! [`wiretap_enter_dispatch`], restores the registers and jumps wherever the
//! dispatcher pointed it, normally the relocated prologue. When a hook wants
//! the return value, the dispatcher swaps the return address on the stack
//! for the exit thunk and parks the real one on a per-thread stack, so
//! recursion and nested hooked calls unwind in order.

use std::arch::global_asm;
use std::cell::RefCell;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::Arc;

use crate::context::{AbiValue, InvocationContext};

use super::HookShared;

/// Register block captured by the entry thunk, in its exact stack layout.
#[repr(C)]
pub(crate) struct EnterRegisters {
    /// xmm0..xmm7; preserved for the target, not decoded
    _xmm: [[u8; 16]; 8],
    /// Alignment pad keeping the dispatch call site 16-byte aligned
    _pad: u64,
    /// Scratch register, preserved for the target but not decoded
    _r10: u64,
    /// Sixth integer argument
    r9: u64,
    /// Fifth integer argument
    r8: u64,
    /// First integer argument
    rdi: u64,
    /// Second integer argument
    rsi: u64,
    /// Third integer argument
    rdx: u64,
    /// Fourth integer argument
    rcx: u64,
    /// Vector argument count for variadic targets; preserved, not decoded
    _rax: u64,
}

// The thunk addresses the block relative to rsp, so the layout must stay in
// lockstep with the save sequence below.
const _: () = assert!(mem::size_of::<EnterRegisters>() == 0xc8);

/// One planted exit: where the call really returns to and whose hook to run.
struct PendingReturn {
    /// Return address the exit thunk must restore
    return_address: usize,
    /// Hook whose `on_leave` runs at that point
    hook: Arc<HookShared>,
}

thread_local! {
    /// Exit records for the hooked calls this thread is currently inside,
    /// innermost last
    static PENDING_RETURNS: RefCell<Vec<PendingReturn>> = const { RefCell::new(Vec::new()) };
}

extern "C" {
    /// Shared entry thunk (assembly below). Only its address is taken.
    fn wiretap_enter_thunk();
    /// Shared exit thunk (assembly below). Only its address is taken.
    fn wiretap_exit_thunk();
}

/// Address the per-hook stubs jump to.
pub(crate) fn enter_thunk_address() -> usize {
    wiretap_enter_thunk as usize
}

/// Address planted in place of a return address when `on_leave` is armed.
fn exit_thunk_address() -> usize {
    wiretap_exit_thunk as usize
}

/// Entry-side dispatcher, called by the entry thunk.
///
/// Runs `on_enter` with the live argument registers, arms the exit thunk
/// when the hook wants the return value, and returns the address the thunk
/// should jump to in order to resume the target.
///
/// # Safety
///
/// Only the entry thunk calls this. `hook` must point at a descriptor kept
/// alive by the engine, `stack_top` at the return-address slot of the
/// intercepted call, and `registers` at the register block the thunk saved.
#[no_mangle]
unsafe extern "C" fn wiretap_enter_dispatch(
    hook: *const HookShared,
    stack_top: *mut usize,
    registers: *const EnterRegisters,
) -> *const u8 {
    // Safety: the engine retires descriptors instead of freeing them, so the
    // pointer is valid for as long as any stub can still reach this point
    let shared = &*hook;
    let registers = &*registers;

    if let Some(on_enter) = &shared.on_enter {
        let register_args = [
            AbiValue::new(registers.rdi),
            AbiValue::new(registers.rsi),
            AbiValue::new(registers.rdx),
            AbiValue::new(registers.rcx),
            AbiValue::new(registers.r8),
            AbiValue::new(registers.r9),
        ];
        // stack arguments start just above the return address
        let stack_args_base = stack_top as usize + mem::size_of::<usize>();
        let context = InvocationContext::entry(&register_args, stack_args_base);
        run_callback(&shared.name, "on_enter", || on_enter(&context));
    }

    if shared.on_leave.is_some() {
        // Safety: `hook` came from `Arc::as_ptr`; bump the count so the
        // pending record owns a reference of its own
        Arc::increment_strong_count(hook);
        let hook = Arc::from_raw(hook);

        // Safety: the slot holds the caller's return address; swapping it
        // reroutes the target's `ret` through the exit thunk
        let return_address = *stack_top;
        PENDING_RETURNS.with(|pending| {
            pending.borrow_mut().push(PendingReturn {
                return_address,
                hook,
            });
        });
        *stack_top = exit_thunk_address();
    }

    shared.continuation as *const u8
}

/// Exit-side dispatcher, called by the exit thunk with the raw `rax` value.
///
/// Runs `on_leave` with the return value and hands back the address the
/// intercepted call must really return to.
///
/// # Safety
///
/// Only the exit thunk calls this, and only on a thread whose innermost
/// pending record was planted by [`wiretap_enter_dispatch`].
#[no_mangle]
unsafe extern "C" fn wiretap_exit_dispatch(raw_return_value: u64) -> *const u8 {
    let pending = PENDING_RETURNS.with(|pending| pending.borrow_mut().pop());
    let Some(pending) = pending else {
        // only reachable if the pending stack was corrupted; there is no
        // return address to restore, so the process cannot continue
        log::error!("exit thunk fired with no pending return");
        process::abort();
    };

    if let Some(on_leave) = &pending.hook.on_leave {
        let context = InvocationContext::exit(AbiValue::new(raw_return_value));
        run_callback(&pending.hook.name, "on_leave", || on_leave(&context));
    }

    pending.return_address as *const u8
}

/// Runs a hook callback, containing any panic at the dispatch boundary so
/// the intercepted call proceeds unharmed.
fn run_callback(name: &str, phase: &str, callback: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        log::error!("hook `{name}` {phase} callback panicked: {message}");
    }
}

// Entry thunk. Reached from a per-hook stub with `r11` holding the hook
// descriptor and `rsp` still pointing at the caller's return address, so
// rsp % 16 == 8 exactly as at any function entry. Saves every register that
// may carry an argument (SysV x86-64), calls the dispatcher with the
// descriptor, the return-address slot and the register block, then restores
// the registers and jumps to whatever the dispatcher returned. The 0x88-byte
// area holds xmm0..xmm7 plus one pad qword, landing the call site on a
// 16-byte boundary.
//
// Exit thunk. Reached by `ret` from the target, so rsp % 16 == 0 here. Only
// the return registers need saving. `rax` rides into the dispatcher as the
// raw return value, and the dispatcher hands back the caller's real return
// address to jump to.
global_asm!(
    r#"
    .balign 16
    .global wiretap_enter_thunk
wiretap_enter_thunk:
    push rax
    push rcx
    push rdx
    push rsi
    push rdi
    push r8
    push r9
    push r10
    sub rsp, 0x88
    movups xmmword ptr [rsp + 0x00], xmm0
    movups xmmword ptr [rsp + 0x10], xmm1
    movups xmmword ptr [rsp + 0x20], xmm2
    movups xmmword ptr [rsp + 0x30], xmm3
    movups xmmword ptr [rsp + 0x40], xmm4
    movups xmmword ptr [rsp + 0x50], xmm5
    movups xmmword ptr [rsp + 0x60], xmm6
    movups xmmword ptr [rsp + 0x70], xmm7
    mov rdi, r11
    lea rsi, [rsp + 0xc8]
    mov rdx, rsp
    call wiretap_enter_dispatch
    mov r11, rax
    movups xmm7, xmmword ptr [rsp + 0x70]
    movups xmm6, xmmword ptr [rsp + 0x60]
    movups xmm5, xmmword ptr [rsp + 0x50]
    movups xmm4, xmmword ptr [rsp + 0x40]
    movups xmm3, xmmword ptr [rsp + 0x30]
    movups xmm2, xmmword ptr [rsp + 0x20]
    movups xmm1, xmmword ptr [rsp + 0x10]
    movups xmm0, xmmword ptr [rsp + 0x00]
    add rsp, 0x88
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rax
    jmp r11

    .balign 16
    .global wiretap_exit_thunk
wiretap_exit_thunk:
    push rax
    push rdx
    sub rsp, 0x20
    movups xmmword ptr [rsp + 0x00], xmm0
    movups xmmword ptr [rsp + 0x10], xmm1
    mov rdi, rax
    call wiretap_exit_dispatch
    mov r11, rax
    movups xmm1, xmmword ptr [rsp + 0x10]
    movups xmm0, xmmword ptr [rsp + 0x00]
    add rsp, 0x20
    pop rdx
    pop rax
    jmp r11
"#
);
