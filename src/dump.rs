//! This module contains a builder for hooks that log a buffer argument of
//! the call they intercept

use crate::hexdump::{hexdump, HexdumpOptions};
use crate::hook::HookDefinition;
use crate::memory;

/// Builder for a hook that dumps a `(pointer, length)` argument pair every
/// time its target is called.
///
/// The entry callback decodes the configured arguments, reads the buffer out
/// of the process and logs a call summary followed by a hex dump. A null
/// pointer or an unreadable buffer downgrades the call to a warning; the
/// intercepted function itself is never disturbed.
///
/// ```
/// use wiretap::dump::BufferDump;
///
/// let hook = BufferDump::new("cwc_encrypt")
///     .pointer_arg(0)
///     .length_arg(1)
///     .into_definition("cwc_encrypt", "cwc_encrypt");
/// assert!(hook.has_on_enter());
/// ```
pub struct BufferDump {
    /// Event name prefixed to every log line
    event: String,
    /// Argument index carrying the buffer pointer
    pointer_arg: usize,
    /// Argument index carrying the buffer length
    length_arg: usize,
    /// What the buffer is called in log lines
    label: String,
}

impl BufferDump {
    /// Starts a builder for `event`, dumping argument 0 as the pointer and
    /// argument 1 as the length of a plaintext buffer.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            pointer_arg: 0,
            length_arg: 1,
            label: "plaintext".into(),
        }
    }

    /// Selects the argument carrying the buffer pointer.
    pub fn pointer_arg(mut self, index: usize) -> Self {
        self.pointer_arg = index;
        self
    }

    /// Selects the argument carrying the buffer length.
    pub fn length_arg(mut self, index: usize) -> Self {
        self.length_arg = index;
        self
    }

    /// Names the buffer in log lines.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Builds the hook definition carrying the dump callback.
    pub fn into_definition(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
    ) -> HookDefinition {
        let Self {
            event,
            pointer_arg,
            length_arg,
            label,
        } = self;
        let mut null_subject = label.clone();
        if let Some(first) = null_subject.get_mut(0..1) {
            first.make_ascii_uppercase();
        }

        HookDefinition::new(name, target).on_enter(move |context| {
            let (Some(pointer), Some(length)) =
                (context.arg(pointer_arg), context.arg(length_arg))
            else {
                log::warn!("{event}: argument {pointer_arg} or {length_arg} unavailable");
                return;
            };
            let length = length.to_u32() as usize;

            if pointer.is_null() {
                log::warn!("{null_subject} pointer was NULL");
                return;
            }

            match memory::read_bytes(pointer.to_usize(), length) {
                Some(bytes) => {
                    log::info!("{event} called ({label}_addr={pointer},len={length})");
                    let options = HexdumpOptions {
                        offset: 0,
                        length: Some(length),
                        header: true,
                        ansi: false,
                    };
                    log::info!("{}", hexdump(&bytes, &options));
                }
                None => {
                    log::warn!("{event}: {label} buffer unreadable (addr={pointer},len={length})");
                }
            }
        })
    }
}
