//! Error types for vmgate
//!
//! All modules use `VmgateResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for vmgate operations
pub type VmgateResult<T> = Result<T, VmgateError>;

/// All errors that can occur in vmgate
#[derive(Error, Debug)]
pub enum VmgateError {
    // Identity errors
    #[error("Invalid identity '{identity}': {reason}")]
    InvalidIdentity { identity: String, reason: String },

    #[error("No public key found in {0}")]
    PublicKeyMissing(PathBuf),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    // Backend errors
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend command failed: {command}: {stderr}")]
    BackendCommand { command: String, stderr: String },

    #[error("Resource {resource} did not become ready within {waited_secs}s")]
    ResourceNotReady { resource: String, waited_secs: u64 },

    #[error("Service {address}:{port} did not accept connections within {waited_secs}s")]
    ServiceNotReady {
        address: String,
        port: u16,
        waited_secs: u64,
    },

    #[error("No usable IPv4 address reported by guest of {0}")]
    AddressResolutionFailed(String),

    #[error("Resource {0} was created concurrently by another provisioner")]
    ConcurrentProvisionConflict(String),

    #[error("Stop of {resource} was never confirmed, even after forced stop")]
    ShutdownNotConfirmed { resource: String },

    #[error("Failed to build bootstrap image: {0}")]
    BootstrapImage(String),

    // Store errors
    #[error("Stale state entry for {key}: backend reports {state}")]
    StaleEntry { key: String, state: String },

    #[error("Timed out after {waited_secs}s waiting for lock on {key}")]
    LockTimeout { key: String, waited_secs: u64 },

    #[error("Corrupt record {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl VmgateError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Check if the whole connection attempt may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::LockTimeout { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::BackendUnavailable(_) => Some("Check that qm is installed and pve-cluster is running"),
            Self::InvalidIdentity { .. } => Some("Check identity.prefix in the configuration"),
            Self::LockTimeout { .. } => Some("Another process is driving this resource, retry shortly"),
            Self::ResourceNotReady { .. } => {
                Some("Check that the template has qemu-guest-agent installed")
            }
            Self::BootstrapImage(_) => Some("Install cloud-image-utils (provides cloud-localds)"),
            _ => None,
        }
    }
}
