//! This module contains the hook registry
//!
//! Discovery is an explicit registration step: the embedding agent supplies
//! its definitions, the registry validates their shape, and the result is a
//! name-keyed, read-only collection. Validation failures are packaging
//! errors and abort agent startup, while resolution and installation
//! failures are isolated per hook later on.

use std::collections::btree_map;
use std::collections::BTreeMap;

use thiserror::Error;

use crate::hook::HookDefinition;

/// Shape errors found during discovery; any one of these fails discovery as
/// a whole
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A definition has an empty name and could never be addressed
    #[error("hook definition has an empty name")]
    EmptyName,
    /// Two definitions share a name
    #[error("duplicate hook name `{name}`")]
    DuplicateName {
        /// The contested name
        name: String,
    },
    /// A definition has no target text to resolve
    #[error("hook `{name}` has no target")]
    MissingTarget {
        /// Name of the targetless definition
        name: String,
    },
    /// A definition declares neither callback and could never observe a call
    #[error("hook `{name}` declares neither an entry nor an exit callback")]
    InertDefinition {
        /// Name of the inert definition
        name: String,
    },
}

/// The validated, name-keyed hook collection.
///
/// Built once at startup and read-only afterwards. Iteration is in name
/// order, so a given definition set always installs (and logs) in the same
/// sequence.
#[derive(Debug, Default)]
pub struct HookRegistry {
    /// Definitions keyed by their unique names
    hooks: BTreeMap<String, HookDefinition>,
}

impl HookRegistry {
    /// Validates and collects definitions into a registry.
    ///
    /// Every definition must carry a non-empty name, a non-empty target, and
    /// at least one callback; names must be unique. The first violation
    /// fails discovery.
    pub fn discover(
        definitions: impl IntoIterator<Item = HookDefinition>,
    ) -> Result<Self, RegistryError> {
        let mut hooks = BTreeMap::new();
        for definition in definitions {
            if definition.name().is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if definition.target().is_empty() {
                return Err(RegistryError::MissingTarget {
                    name: definition.name().to_owned(),
                });
            }
            if !definition.has_on_enter() && !definition.has_on_leave() {
                return Err(RegistryError::InertDefinition {
                    name: definition.name().to_owned(),
                });
            }
            if hooks.contains_key(definition.name()) {
                return Err(RegistryError::DuplicateName {
                    name: definition.name().to_owned(),
                });
            }
            hooks.insert(definition.name().to_owned(), definition);
        }
        Ok(Self { hooks })
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// True when no hooks are registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Looks up a definition by name
    pub fn get(&self, name: &str) -> Option<&HookDefinition> {
        self.hooks.get(name)
    }

    /// Registered names, in iteration (name) order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hooks.keys().map(String::as_str)
    }

    /// Definitions in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HookDefinition)> {
        self.hooks.iter().map(|(name, def)| (name.as_str(), def))
    }
}

impl IntoIterator for HookRegistry {
    type Item = (String, HookDefinition);
    type IntoIter = btree_map::IntoIter<String, HookDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.hooks.into_iter()
    }
}
