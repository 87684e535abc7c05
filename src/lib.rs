#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod context;
pub mod dump;
pub mod hexdump;
pub mod hook;
pub mod memory;
pub mod registry;
pub mod resolve;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub mod agent;
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub mod intercept;

#[cfg(test)]
mod testlog;
