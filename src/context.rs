//! This module contains the per-invocation view handed to hook callbacks
//!
//! Arguments and return values are exposed exactly as the calling convention
//! sees them: opaque machine-word slots. Decoding width and signedness is the
//! callback author's explicit choice ([`AbiValue::to_u32`] and friends), never
//! an implicit coercion by the framework.

use std::fmt;
use std::marker::PhantomData;
use std::mem;

use crate::memory;

/// One calling-convention slot (register or stack), prior to any
/// type-specific decoding
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiValue(u64);

impl AbiValue {
    /// Wraps a raw slot value
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit slot contents
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Decodes the slot as an unsigned 64-bit integer
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// Decodes the low 32 bits of the slot as an unsigned integer, the way a
    /// `u32` parameter is passed: upper register bits are insignificant
    pub fn to_u32(self) -> u32 {
        self.0 as u32
    }

    /// Decodes the low 32 bits as a signed integer
    pub fn to_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    /// Decodes the slot as a signed 64-bit integer
    pub fn to_i64(self) -> i64 {
        self.0 as i64
    }

    /// Decodes the slot as an address
    pub fn to_usize(self) -> usize {
        self.0 as usize
    }

    /// Decodes the slot as a const pointer
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    /// True when the slot holds a null pointer
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Renders as a `0x`-prefixed address, the form hook log lines use
impl fmt::Display for AbiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for AbiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Ephemeral view of one intercepted call, valid only for the duration of the
/// callback it is handed to.
///
/// Entry callbacks observe the live argument slots; exit callbacks observe
/// the return value. The context borrows dispatcher stack state and is
/// deliberately neither `Send` nor `Sync`; it must not outlive or leave the
/// callback invocation.
pub struct InvocationContext<'a> {
    /// Argument slots passed in registers, in parameter order; empty on exit
    register_args: &'a [AbiValue],
    /// Address of the first stack-passed argument slot, 0 when unavailable
    stack_args_base: usize,
    /// The call's return slot, present only on exit
    return_value: Option<AbiValue>,
    /// Pins the context to the dispatcher's stack frame and thread
    _stack_scoped: PhantomData<*const ()>,
}

impl<'a> InvocationContext<'a> {
    /// Builds the entry-side view over the saved register slots and the
    /// caller's outgoing stack arguments
    pub(crate) fn entry(register_args: &'a [AbiValue], stack_args_base: usize) -> Self {
        Self {
            register_args,
            stack_args_base,
            return_value: None,
            _stack_scoped: PhantomData,
        }
    }

    /// Builds the exit-side view over the call's return slot
    pub(crate) fn exit(return_value: AbiValue) -> Self {
        Self {
            register_args: &[],
            stack_args_base: 0,
            return_value: Some(return_value),
            _stack_scoped: PhantomData,
        }
    }

    /// Returns argument slot `index` in parameter order.
    ///
    /// Register-passed slots are snapshots taken at function entry.
    /// Stack-passed slots (beyond the registers the convention provides) are
    /// read from the live caller frame through the memory reader, so an
    /// unreadable frame yields [`None`] rather than a fault. Indexes past the
    /// target's real parameter count read whatever occupies those slots; only
    /// the caller knows how many are meaningful. Exit contexts carry no
    /// arguments.
    pub fn arg(&self, index: usize) -> Option<AbiValue> {
        if let Some(value) = self.register_args.get(index) {
            return Some(*value);
        }
        if self.stack_args_base == 0 {
            return None;
        }
        let slot = index - self.register_args.len();
        let address = self
            .stack_args_base
            .checked_add(slot.checked_mul(mem::size_of::<u64>())?)?;
        let bytes = memory::read_bytes(address, mem::size_of::<u64>())?;
        let raw: [u8; 8] = bytes.try_into().ok()?;
        Some(AbiValue(u64::from_ne_bytes(raw)))
    }

    /// The return slot, present only in exit callbacks
    pub fn return_value(&self) -> Option<AbiValue> {
        self.return_value
    }
}

impl fmt::Debug for InvocationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("register_args", &self.register_args)
            .field("stack_args_base", &format_args!("{:#x}", self.stack_args_base))
            .field("return_value", &self.return_value)
            .finish()
    }
}
