//! This module contains the declarative hook types
//!
//! A hook pairs a target (the text form of an address or symbol) with the
//! callbacks to run around each call of that target. Definitions are built
//! once, validated by the registry, resolved to a concrete address, and from
//! then on never change.

use std::fmt;
use std::sync::Arc;

use crate::context::InvocationContext;

/// A callback invoked around an intercepted call.
///
/// Callbacks run synchronously on whichever target thread made the call,
/// possibly concurrently from several threads, so they must be `Send + Sync`
/// and any cross-call state they capture must be synchronized by the author.
pub type HookCallback = Arc<dyn Fn(&InvocationContext) + Send + Sync>;

/// A declarative hook: a name, a target, and the callbacks present.
///
/// The target stays in its textual form (`0x`-prefixed literal or symbol
/// name) until install time, so a malformed literal fails that hook alone
/// rather than aborting definition construction. At least one callback must
/// be present for the definition to pass registry validation.
pub struct HookDefinition {
    /// Unique key within a registry
    name: String,
    /// Target text, resolved once at install time
    target: String,
    /// Callback run immediately before the target body, with live arguments
    on_enter: Option<HookCallback>,
    /// Callback run immediately after the target returns, with the return value
    on_leave: Option<HookCallback>,
}

impl HookDefinition {
    /// Creates a definition with no callbacks; attach at least one of
    /// [`on_enter`](Self::on_enter) / [`on_leave`](Self::on_leave) before
    /// registering it
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            on_enter: None,
            on_leave: None,
        }
    }

    /// Attaches the entry callback
    pub fn on_enter(mut self, callback: impl Fn(&InvocationContext) + Send + Sync + 'static) -> Self {
        self.on_enter = Some(Arc::new(callback));
        self
    }

    /// Attaches the exit callback
    pub fn on_leave(mut self, callback: impl Fn(&InvocationContext) + Send + Sync + 'static) -> Self {
        self.on_leave = Some(Arc::new(callback));
        self
    }

    /// The definition's unique name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unresolved target text
    pub fn target(&self) -> &str {
        &self.target
    }

    /// True when an entry callback is attached
    pub fn has_on_enter(&self) -> bool {
        self.on_enter.is_some()
    }

    /// True when an exit callback is attached
    pub fn has_on_leave(&self) -> bool {
        self.on_leave.is_some()
    }

    /// Splits the definition into name and callbacks for installation
    pub(crate) fn into_parts(self) -> (String, Option<HookCallback>, Option<HookCallback>) {
        (self.name, self.on_enter, self.on_leave)
    }
}

impl fmt::Debug for HookDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDefinition")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("on_enter", &self.on_enter.is_some())
            .field("on_leave", &self.on_leave.is_some())
            .finish()
    }
}

/// A definition whose target has been resolved to a concrete address.
///
/// Produced by the resolver, consumed exactly once by the interception
/// engine; the engine's handle then owns the installed state.
#[derive(Debug)]
pub struct ResolvedHook {
    /// The definition, unchanged
    definition: HookDefinition,
    /// The resolved code address
    address: usize,
}

impl ResolvedHook {
    /// Pairs a definition with its resolved address
    pub fn new(definition: HookDefinition, address: usize) -> Self {
        Self {
            definition,
            address,
        }
    }

    /// The hook's name
    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// The cached target address
    pub fn address(&self) -> usize {
        self.address
    }

    /// The underlying definition
    pub fn definition(&self) -> &HookDefinition {
        &self.definition
    }

    /// Splits into the pieces the engine installs
    pub(crate) fn into_parts(self) -> (String, usize, Option<HookCallback>, Option<HookCallback>) {
        let address = self.address;
        let (name, on_enter, on_leave) = self.definition.into_parts();
        (name, address, on_enter, on_leave)
    }
}

#[cfg(test)]
mod tests {
    use super::HookDefinition;

    #[test]
    /// Callback presence is tracked per capability
    fn test_capability_flags() {
        let bare = HookDefinition::new("h", "0x1000");
        assert!(!bare.has_on_enter());
        assert!(!bare.has_on_leave());

        let enter_only = HookDefinition::new("h", "0x1000").on_enter(|_| {});
        assert!(enter_only.has_on_enter());
        assert!(!enter_only.has_on_leave());

        let both = HookDefinition::new("h", "0x1000").on_enter(|_| {}).on_leave(|_| {});
        assert!(both.has_on_enter());
        assert!(both.has_on_leave());
    }

    #[test]
    /// Debug output names the hook without trying to render callbacks
    fn test_debug_shape() {
        let definition = HookDefinition::new("cwc_encrypt", "0x1422AE020").on_enter(|_| {});
        let rendered = format!("{definition:?}");
        assert!(rendered.contains("cwc_encrypt"));
        assert!(rendered.contains("0x1422AE020"));
    }
}
