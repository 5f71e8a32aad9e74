//! Proxmox VE backend
//!
//! Implements the ResourceBackend trait by driving the `qm` CLI on the
//! hypervisor host. Every invocation is bounded by the configured command
//! timeout.

use crate::backend::runtime::{PowerState, ResourceBackend, ResourceId};
use crate::config::schema::BackendConfig;
use crate::error::{VmgateError, VmgateResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Backend using the Proxmox `qm` command
pub struct ProxmoxBackend {
    qm: String,
    full_clone: bool,
    command_timeout: Duration,
}

impl ProxmoxBackend {
    /// Create a new Proxmox backend
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            qm: config.qm_path.clone(),
            full_clone: config.full_clone,
            command_timeout: config.command_timeout(),
        }
    }

    /// Execute a qm command and return the output
    async fn exec(&self, args: &[&str]) -> VmgateResult<Output> {
        debug!("Executing: {} {:?}", self.qm, args);

        let mut cmd = Command::new(&self.qm);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => Err(
                VmgateError::BackendUnavailable(format!("{} not found", self.qm)),
            ),
            Ok(Err(e)) => Err(VmgateError::command_failed(
                format!("{} {:?}", self.qm, args),
                e,
            )),
            Err(_) => Err(VmgateError::BackendUnavailable(format!(
                "{} {} timed out after {}s",
                self.qm,
                args.join(" "),
                self.command_timeout.as_secs()
            ))),
        }
    }

    /// Execute a qm command that must succeed, returning stdout
    async fn exec_checked(&self, args: &[&str]) -> VmgateResult<String> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(command_error(args, &output))
        }
    }
}

fn command_error(args: &[&str], output: &Output) -> VmgateError {
    VmgateError::BackendCommand {
        command: format!("qm {}", args.join(" ")),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

/// Parse `qm status` output ("status: running")
fn parse_status(stdout: &str) -> PowerState {
    let state = stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("status:"))
        .map(str::trim);

    match state {
        Some("running") => PowerState::Running,
        Some("stopped") => PowerState::Stopped,
        _ => PowerState::Unknown,
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("does not exist")
}

fn is_already_taken(stderr: &str) -> bool {
    stderr.contains("already exists")
}

#[async_trait]
impl ResourceBackend for ProxmoxBackend {
    async fn is_available(&self) -> VmgateResult<bool> {
        match self.exec(&["list"]).await {
            Ok(output) => Ok(output.status.success()),
            Err(VmgateError::BackendUnavailable(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn clone_vm(&self, template_id: u32, vm: &ResourceId) -> VmgateResult<()> {
        let template = template_id.to_string();
        let vmid = vm.vmid.to_string();
        let mut args = vec!["clone", template.as_str(), vmid.as_str(), "--name", vm.name.as_str()];
        if self.full_clone {
            args.extend(["--full", "1"]);
        }

        let output = self.exec(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_already_taken(&stderr) {
            Err(VmgateError::ConcurrentProvisionConflict(vm.to_string()))
        } else {
            Err(command_error(&args, &output))
        }
    }

    async fn set_config(&self, vm: &ResourceId, key: &str, value: &str) -> VmgateResult<()> {
        let vmid = vm.vmid.to_string();
        let option = format!("--{}", key);
        self.exec_checked(&["set", &vmid, &option, value]).await?;
        Ok(())
    }

    async fn start(&self, vm: &ResourceId) -> VmgateResult<()> {
        let vmid = vm.vmid.to_string();
        let args = ["start", vmid.as_str()];
        let output = self.exec(&args).await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("already running") {
            Ok(())
        } else {
            Err(command_error(&args, &output))
        }
    }

    async fn graceful_stop(&self, vm: &ResourceId) -> VmgateResult<()> {
        let vmid = vm.vmid.to_string();
        let args = ["shutdown", vmid.as_str()];

        // qm shutdown blocks until the guest is down; the request is already
        // delivered when our timeout fires, and the caller polls power state.
        let output = match self.exec(&args).await {
            Ok(output) => output,
            Err(VmgateError::BackendUnavailable(reason)) if reason.contains("timed out") => {
                debug!("Shutdown of {} still in progress", vm);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("not running") || stderr.contains("timeout")
        {
            Ok(())
        } else {
            Err(command_error(&args, &output))
        }
    }

    async fn forced_stop(&self, vm: &ResourceId) -> VmgateResult<()> {
        let vmid = vm.vmid.to_string();
        self.exec_checked(&["stop", &vmid]).await?;
        Ok(())
    }

    async fn destroy(&self, vm: &ResourceId) -> VmgateResult<()> {
        let vmid = vm.vmid.to_string();
        let args = ["destroy", vmid.as_str(), "--purge"];
        let output = self.exec(&args).await?;

        if output.status.success() || is_missing(&String::from_utf8_lossy(&output.stderr)) {
            Ok(())
        } else {
            Err(command_error(&args, &output))
        }
    }

    async fn power_state(&self, vm: &ResourceId) -> VmgateResult<PowerState> {
        let vmid = vm.vmid.to_string();
        let args = ["status", vmid.as_str()];
        let output = self.exec(&args).await?;

        if output.status.success() {
            return Ok(parse_status(&String::from_utf8_lossy(&output.stdout)));
        }
        if is_missing(&String::from_utf8_lossy(&output.stderr)) {
            return Ok(PowerState::Absent);
        }
        Err(command_error(&args, &output))
    }

    async fn exec_in_guest(&self, vm: &ResourceId, command: &str) -> VmgateResult<String> {
        let vmid = vm.vmid.to_string();
        self.exec_checked(&["guest", "cmd", &vmid, command]).await
    }

    async fn ping_guest_channel(&self, vm: &ResourceId) -> VmgateResult<bool> {
        let vmid = vm.vmid.to_string();
        let output = self.exec(&["guest", "cmd", &vmid, "ping"]).await?;
        Ok(output.status.success())
    }

    fn backend_name(&self) -> &'static str {
        "Proxmox VE"
    }
}
