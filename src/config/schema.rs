//! Configuration schema for vmgate
//!
//! Configuration is stored at `~/.config/vmgate/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Identity to resource key mapping
    pub identity: IdentityConfig,

    /// Hypervisor backend settings
    pub backend: BackendConfig,

    /// First-boot configuration image settings
    pub bootstrap: BootstrapConfig,

    /// Provisioning deadlines
    pub provision: ProvisionConfig,

    /// Idle reaping settings
    pub reaper: ReaperConfig,

    /// State store settings
    pub store: StoreConfig,
}

impl Config {
    /// Reject values that parse but cannot work, such as a zero poll
    /// interval that would spin on the backend until its deadline
    pub fn validate(&self) -> Result<(), String> {
        let intervals = [
            ("provision.boot_poll_interval_ms", self.provision.boot_poll_interval_ms),
            ("provision.service_poll_interval_ms", self.provision.service_poll_interval_ms),
            ("reaper.shutdown_poll_interval_ms", self.reaper.shutdown_poll_interval_ms),
        ];
        match intervals.iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(format!("{} must be greater than zero", key)),
            None => Ok(()),
        }
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Identity namespace settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Account name prefix, e.g. "vm" for accounts vm1, vm2, ...
    pub prefix: String,

    /// Added to the numeric suffix to form the backend VM id
    pub id_offset: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            prefix: "vm".to_string(),
            id_offset: 1000,
        }
    }
}

/// Hypervisor backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend kind (only "proxmox" is supported)
    pub kind: String,

    /// Path to the qm binary
    pub qm_path: String,

    /// VM id of the template new resources are cloned from
    pub template_id: u32,

    /// Full clone instead of linked clone
    pub full_clone: bool,

    /// Upper bound for a single backend command
    pub command_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: "proxmox".to_string(),
            qm_path: "qm".to_string(),
            template_id: 9000,
            full_clone: false,
            command_timeout_secs: 30,
        }
    }
}

impl BackendConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// First-boot configuration image settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Directory the seed images are written to
    pub image_dir: PathBuf,

    /// Storage id the image directory is exposed as
    pub storage: String,

    /// Seed image tool
    pub tool: String,

    /// Login created in the guest (defaults to the identity)
    pub guest_user: Option<String>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("/var/lib/vz/template/iso"),
            storage: "local".to_string(),
            tool: "cloud-localds".to_string(),
            guest_user: None,
        }
    }
}

/// Provisioning deadlines and poll intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Deadline for the guest channel to answer after start
    pub boot_timeout_secs: u64,

    /// Interval between boot readiness checks
    pub boot_poll_interval_ms: u64,

    /// Deadline for the guest to report an IPv4 address
    pub address_timeout_secs: u64,

    /// Port the handoff connects to
    pub service_port: u16,

    /// Deadline for the service port to accept connections
    pub service_timeout_secs: u64,

    /// Interval between service port probes
    pub service_poll_interval_ms: u64,

    /// Timeout for a single TCP connect attempt
    pub connect_timeout_ms: u64,

    /// Deadline for acquiring a key's lifecycle lease
    pub lock_timeout_secs: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            boot_timeout_secs: 120,
            boot_poll_interval_ms: 2000,
            address_timeout_secs: 60,
            service_port: 22,
            service_timeout_secs: 60,
            service_poll_interval_ms: 1000,
            connect_timeout_ms: 2000,
            lock_timeout_secs: 300,
        }
    }
}

/// Idle reaping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Minutes without activity before a resource is stopped
    pub idle_threshold_minutes: u32,

    /// Deadline for a graceful stop before escalating to a forced stop
    pub shutdown_timeout_secs: u64,

    /// Interval between power-state checks while stopping
    pub shutdown_poll_interval_ms: u64,

    /// Sweep interval in watch mode
    pub interval_secs: u64,

    /// Process name whose presence marks a live session for an identity
    pub session_process: String,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            idle_threshold_minutes: 20,
            shutdown_timeout_secs: 60,
            shutdown_poll_interval_ms: 2000,
            interval_secs: 60,
            session_process: "sshd".to_string(),
        }
    }
}

/// State store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding state records (defaults to the user state dir)
    pub dir: Option<PathBuf>,
}
