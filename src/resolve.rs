//! This module contains the address resolver
//!
//! Hook targets arrive as text: either a `0x`-prefixed hexadecimal literal or
//! a bare symbol name. Classification is purely syntactic, parsing happens
//! once per hook at install time, and the resolved address is cached in the
//! [`ResolvedHook`](crate::hook::ResolvedHook); nothing is re-resolved on
//! the call path. Resolution is deterministic for a given process image.

use std::collections::HashMap;

use thiserror::Error;

/// Symbol-table lookup supplied by the embedding runtime.
///
/// The framework never walks export tables itself; whatever attached the
/// agent to the process provides the `name -> address` mapping.
pub trait ProcessImage {
    /// Returns the address of `name`, or [`None`] if the image exports no
    /// such symbol
    fn symbol_address(&self, name: &str) -> Option<usize>;
}

/// A plain map works as a process image; handy for fixtures and for hosts
/// that snapshot their export table up front
impl ProcessImage for HashMap<String, usize> {
    fn symbol_address(&self, name: &str) -> Option<usize> {
        self.get(name).copied()
    }
}

/// A hook target classified from its textual form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// An already-parsed `0x`-prefixed literal address
    Literal(usize),
    /// A name to be looked up in the process image
    Symbol(String),
}

/// Errors turning target text into an address
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The text announced itself as a literal but is not valid hexadecimal
    #[error("invalid address literal `{literal}`")]
    Parse {
        /// The offending target text, verbatim
        literal: String,
    },
    /// The process image has no symbol with this name
    #[error("symbol `{name}` not found in the process image")]
    SymbolNotFound {
        /// The name that failed to resolve
        name: String,
    },
}

impl TargetSpec {
    /// Classifies target text: a `0x`/`0X` prefix makes it a literal (parsed
    /// here, [`ResolveError::Parse`] on bad digits), anything else is a
    /// symbol name
    pub fn parse(text: &str) -> Result<Self, ResolveError> {
        match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(digits) => usize::from_str_radix(digits, 16)
                .map(Self::Literal)
                .map_err(|_| ResolveError::Parse {
                    literal: text.to_owned(),
                }),
            None => Ok(Self::Symbol(text.to_owned())),
        }
    }
}

/// Resolves a classified target to a concrete address.
///
/// Literals resolve to themselves without consulting the image; symbols
/// perform exactly one lookup.
pub fn resolve(spec: &TargetSpec, image: &dyn ProcessImage) -> Result<usize, ResolveError> {
    match spec {
        TargetSpec::Literal(address) => Ok(*address),
        TargetSpec::Symbol(name) => {
            image
                .symbol_address(name)
                .ok_or_else(|| ResolveError::SymbolNotFound {
                    name: name.clone(),
                })
        }
    }
}

/// Parses and resolves target text in one step
pub fn resolve_target(text: &str, image: &dyn ProcessImage) -> Result<usize, ResolveError> {
    resolve(&TargetSpec::parse(text)?, image)
}
