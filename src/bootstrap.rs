//! First-boot configuration images
//!
//! New VMs get a cloud-init NoCloud seed ISO carrying the hostname, the login
//! and the caller's public key. Seeds are content-addressed: the same
//! parameters always map to the same image file, which is built once and
//! never modified.

use crate::config::schema::BootstrapConfig;
use crate::error::{VmgateError, VmgateResult};
use crate::identity::ResourceKey;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

/// Parameters baked into a seed image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapParams {
    pub hostname: String,
    pub login: String,
    pub display_name: String,
    pub public_key: String,
}

impl BootstrapParams {
    /// Reject values that would break out of their field in the seed
    pub fn validate(&self) -> VmgateResult<()> {
        let invalid = |what: &str| VmgateError::BootstrapImage(format!("invalid {}", what));

        if self.public_key.is_empty() || self.public_key.contains(['\n', '\r']) {
            return Err(invalid("public key"));
        }
        if self.display_name.chars().any(char::is_control) {
            return Err(invalid("display name"));
        }
        let is_name = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        };
        if !is_name(&self.login) {
            return Err(invalid("login"));
        }
        if !is_name(&self.hostname) {
            return Err(invalid("hostname"));
        }
        Ok(())
    }

    /// cloud-config document (JSON is valid YAML)
    pub fn user_data(&self) -> String {
        let doc = serde_json::json!({
            "hostname": self.hostname,
            "manage_etc_hosts": true,
            "users": [{
                "name": self.login,
                "gecos": self.display_name,
                "shell": "/bin/bash",
                "sudo": "ALL=(ALL) NOPASSWD:ALL",
                "lock_passwd": true,
                "ssh_authorized_keys": [self.public_key],
            }],
            "ssh_pwauth": false,
        });
        format!("#cloud-config\n{}\n", doc)
    }

    /// NoCloud meta-data document
    pub fn meta_data(&self, digest: &str) -> String {
        let doc = serde_json::json!({
            "instance-id": format!("{}-{}", self.hostname, digest),
            "local-hostname": self.hostname,
        });
        format!("{}\n", doc)
    }

    /// First 12 hex chars of the SHA-256 of the user data
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.user_data().as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..6])
    }
}

/// Builds an attachable first-boot image
#[async_trait]
pub trait BootstrapImageBuilder: Send + Sync {
    /// Build (or reuse) the image and return its backend volume reference
    async fn build(&self, key: &ResourceKey, params: &BootstrapParams) -> VmgateResult<String>;
}

/// NoCloud seed ISOs built with `cloud-localds`
pub struct CloudInitBuilder {
    image_dir: PathBuf,
    storage: String,
    tool: String,
}

impl CloudInitBuilder {
    pub fn new(config: &BootstrapConfig) -> Self {
        Self {
            image_dir: config.image_dir.clone(),
            storage: config.storage.clone(),
            tool: config.tool.clone(),
        }
    }

    fn image_name(key: &ResourceKey, digest: &str) -> String {
        format!("{}-seed-{}.iso", key, digest)
    }

    async fn run_tool(&self, iso: &Path, user_data: &Path, meta_data: &Path) -> VmgateResult<()> {
        debug!("Executing: {} {}", self.tool, iso.display());

        let output = Command::new(&self.tool)
            .arg(iso)
            .arg(user_data)
            .arg(meta_data)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| VmgateError::BootstrapImage(format!("running {}: {}", self.tool, e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(VmgateError::BootstrapImage(format!(
                "{} failed: {}",
                self.tool,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl BootstrapImageBuilder for CloudInitBuilder {
    async fn build(&self, key: &ResourceKey, params: &BootstrapParams) -> VmgateResult<String> {
        params.validate()?;

        let digest = params.digest();
        let name = Self::image_name(key, &digest);
        let reference = format!("{}:iso/{}", self.storage, name);
        let target = self.image_dir.join(&name);

        if target.exists() {
            debug!(%key, "Reusing seed image {}", target.display());
            return Ok(reference);
        }

        fs::create_dir_all(&self.image_dir).await.map_err(|e| {
            VmgateError::io(format!("creating {}", self.image_dir.display()), e)
        })?;

        // Build in a scratch dir on the same filesystem, then rename into place
        let scratch = tempfile::TempDir::new_in(&self.image_dir)
            .map_err(|e| VmgateError::io("creating seed scratch dir", e))?;
        let user_data = scratch.path().join("user-data");
        let meta_data = scratch.path().join("meta-data");
        let iso = scratch.path().join("seed.iso");

        fs::write(&user_data, params.user_data())
            .await
            .map_err(|e| VmgateError::io("writing user-data", e))?;
        fs::write(&meta_data, params.meta_data(&digest))
            .await
            .map_err(|e| VmgateError::io("writing meta-data", e))?;

        self.run_tool(&iso, &user_data, &meta_data).await?;

        fs::rename(&iso, &target)
            .await
            .map_err(|e| VmgateError::io(format!("installing {}", target.display()), e))?;

        info!(%key, "Built seed image {}", name);
        Ok(reference)
    }
}

/// Read the first public key from an authorized_keys style file
pub async fn read_public_key(path: &Path) -> VmgateResult<String> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| VmgateError::io(format!("reading public key {}", path.display()), e))?;

    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .ok_or_else(|| VmgateError::PublicKeyMissing(path.to_path_buf()))
}
