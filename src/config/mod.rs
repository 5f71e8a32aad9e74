//! Configuration management for vmgate

pub mod schema;

pub use schema::Config;

use crate::error::{VmgateError, VmgateResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vmgate")
            .join("config.toml")
    }

    /// Get the state directory path, honouring `store.dir`
    pub fn state_dir(config: &Config) -> PathBuf {
        if let Some(ref dir) = config.store.dir {
            return dir.clone();
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vmgate")
    }

    /// Get the audit log path
    pub fn audit_log_path(config: &Config) -> PathBuf {
        Self::state_dir(config).join("audit.log")
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub async fn load(&self) -> VmgateResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> VmgateResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| VmgateError::io(format!("reading config from {}", path.display()), e))?;

        let invalid = |reason: String| VmgateError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        };
        let config: Config = toml::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        config.validate().map_err(invalid)?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> VmgateResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        self.write_raw(&content).await?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Read the raw config file contents, empty if it does not exist yet
    pub async fn read_raw(&self) -> VmgateResult<String> {
        if !self.config_path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&self.config_path).await.map_err(|e| {
            VmgateError::io(
                format!("reading config from {}", self.config_path.display()),
                e,
            )
        })
    }

    /// Write raw config contents, creating the directory if needed
    pub async fn write_raw(&self, content: &str) -> VmgateResult<()> {
        self.ensure_config_dir().await?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            VmgateError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> VmgateResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| VmgateError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure the state directory exists, owner-only when newly created.
    ///
    /// An existing directory keeps its mode so a shared store can be group
    /// writable.
    pub async fn ensure_state_dirs(config: &Config) -> VmgateResult<()> {
        let dir = Self::state_dir(config);
        if dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| VmgateError::io(format!("creating directory {}", dir.display()), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(&dir, perms)
                .map_err(|e| VmgateError::io("setting state dir permissions", e))?;
        }

        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
