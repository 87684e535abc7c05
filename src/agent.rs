//! This module contains the attach loop that takes a registry of hook
//! definitions live against the current process

use thiserror::Error;

use crate::hook::{HookDefinition, ResolvedHook};
use crate::intercept::{self, AttachError, InterceptionHandle};
use crate::registry::HookRegistry;
use crate::resolve::{self, ProcessImage, ResolveError};

#[derive(Debug, Error)]
/// Why a hook did not install
pub enum AttachFailure {
    /// The target text did not resolve to an address
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The interception engine rejected the resolved target
    #[error(transparent)]
    Attach(#[from] AttachError),
}

/// Hooks installed by [`attach`], plus the ones that failed.
///
/// Dropping the session uninstalls every hook it still holds.
#[derive(Debug)]
pub struct AgentSession {
    /// Handles of the hooks that installed, in install order
    installed: Vec<InterceptionHandle>,
    /// Hooks that did not install, with the reason, in install order
    failures: Vec<(String, AttachFailure)>,
}

impl AgentSession {
    /// Handles of the installed hooks.
    pub fn installed(&self) -> &[InterceptionHandle] {
        &self.installed
    }

    /// Hooks that did not install, by name, with the reason.
    pub fn failures(&self) -> &[(String, AttachFailure)] {
        &self.failures
    }

    /// Uninstalls every hook of the session, newest first.
    pub fn detach(mut self) {
        let count = self.installed.len();
        while let Some(handle) = self.installed.pop() {
            handle.uninstall();
        }
        log::info!("session detached; {count} hooks uninstalled");
    }
}

/// Resolves and installs every hook in `registry`, in name order.
///
/// Hooks go through the full lifecycle one at a time: parse the target,
/// resolve it against `image`, install. A hook that fails any step is
/// logged and recorded in the session; it never blocks the remaining hooks.
///
/// # Safety
///
/// Every hook target that resolves must satisfy the contract of
/// [`intercept::install`].
pub unsafe fn attach(registry: HookRegistry, image: &dyn ProcessImage) -> AgentSession {
    let total = registry.len();
    let mut installed = Vec::new();
    let mut failures = Vec::new();

    for (name, definition) in registry {
        match install_one(definition, image) {
            Ok(handle) => {
                log::info!("hook `{name}` installed at {:#x}", handle.address());
                installed.push(handle);
            }
            Err(failure) => {
                log::warn!("hook `{name}` not installed: {failure}");
                failures.push((name, failure));
            }
        }
    }

    log::info!("{} of {total} hooks installed", installed.len());
    AgentSession {
        installed,
        failures,
    }
}

/// Takes one definition through resolve and install.
///
/// # Safety
///
/// Same contract as [`intercept::install`].
unsafe fn install_one(
    definition: HookDefinition,
    image: &dyn ProcessImage,
) -> Result<InterceptionHandle, AttachFailure> {
    let address = resolve::resolve_target(definition.target(), image)?;
    let handle = intercept::install(ResolvedHook::new(definition, address))?;
    Ok(handle)
}
