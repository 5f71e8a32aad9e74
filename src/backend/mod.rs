//! Hypervisor backends
//!
//! The provisioner and reaper only see the `ResourceBackend` trait; the
//! Proxmox implementation drives `qm` on the local node.

mod factory;
mod proxmox;
mod runtime;

pub use factory::create_backend;
pub use proxmox::ProxmoxBackend;
pub use runtime::{PowerState, ResourceBackend, ResourceId};
