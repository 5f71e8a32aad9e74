//! vmgate - per-identity VM lifecycle cache
//!
//! Clones a VM from a template the first time an identity connects, keeps
//! reusing it while sessions are live and shuts it down once it has been
//! idle past a threshold.

pub mod activity;
pub mod audit;
pub mod backend;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod error;
pub mod handoff;
pub mod identity;
pub mod poll;
pub mod probe;
pub mod provision;
pub mod reaper;
pub mod store;
pub mod ui;

#[cfg(test)]
mod testing;

pub use error::{VmgateError, VmgateResult};
