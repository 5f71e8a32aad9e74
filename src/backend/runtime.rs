//! Hypervisor backend abstraction
//!
//! Provides a trait for the VM operations the provisioner and reaper need,
//! so the lifecycle logic stays independent of the hypervisor CLI.

use crate::error::VmgateResult;
use crate::identity::ResourceKey;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// Backend handle for one VM, derived purely from its resource key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub vmid: u32,
    pub name: String,
}

impl From<&ResourceKey> for ResourceId {
    fn from(key: &ResourceKey) -> Self {
        Self {
            vmid: key.vmid(),
            name: key.as_str().to_string(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.vmid, self.name)
    }
}

/// Power state as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    /// The VM does not exist
    Absent,
    /// The backend answered with a state we do not recognise
    Unknown,
}

impl PowerState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Confirmed not running: stopped or gone
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Stopped | Self::Absent)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Absent => write!(f, "absent"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Abstract hypervisor interface
///
/// Implementations must be safe to call from many processes at once; the
/// lifecycle lease in the state store serialises calls per VM.
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// Check if the backend tooling is usable on this host
    async fn is_available(&self) -> VmgateResult<bool>;

    /// Clone a new VM from a template.
    ///
    /// Fails with `ConcurrentProvisionConflict` if the id is already taken.
    async fn clone_vm(&self, template_id: u32, vm: &ResourceId) -> VmgateResult<()>;

    /// Set one VM configuration option
    async fn set_config(&self, vm: &ResourceId, key: &str, value: &str) -> VmgateResult<()>;

    /// Start a VM; starting a running VM is not an error
    async fn start(&self, vm: &ResourceId) -> VmgateResult<()>;

    /// Request an orderly shutdown without waiting for it to finish
    async fn graceful_stop(&self, vm: &ResourceId) -> VmgateResult<()>;

    /// Power the VM off immediately
    async fn forced_stop(&self, vm: &ResourceId) -> VmgateResult<()>;

    /// Remove the VM and its disks; removing a missing VM is not an error
    async fn destroy(&self, vm: &ResourceId) -> VmgateResult<()>;

    /// Query the power state
    async fn power_state(&self, vm: &ResourceId) -> VmgateResult<PowerState>;

    /// Run a guest agent command and return its raw output
    async fn exec_in_guest(&self, vm: &ResourceId, command: &str) -> VmgateResult<String>;

    /// Whether the guest agent answers
    async fn ping_guest_channel(&self, vm: &ResourceId) -> VmgateResult<bool>;

    /// Get the human-readable backend name for display
    fn backend_name(&self) -> &'static str;
}
