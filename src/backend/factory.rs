//! Backend factory
//!
//! Instantiates the configured hypervisor backend.

use crate::backend::proxmox::ProxmoxBackend;
use crate::backend::runtime::ResourceBackend;
use crate::config::Config;
use crate::error::{VmgateError, VmgateResult};
use std::sync::Arc;

/// Create the backend named by `backend.kind`
pub fn create_backend(config: &Config) -> VmgateResult<Arc<dyn ResourceBackend>> {
    match config.backend.kind.as_str() {
        "proxmox" => Ok(Arc::new(ProxmoxBackend::new(&config.backend))),
        other => Err(VmgateError::UnsupportedBackend(other.to_string())),
    }
}
