//! Provisioner
//!
//! Turns "no resource" into "running, reachable resource" for one key. The
//! whole sequence runs under the key's lifecycle lease, so concurrent first
//! connections serialise on it: the first creates the VM and stores the
//! address, the rest find the stored entry and return it.
//!
//! A connection that arrives while the reaper is evicting the same key
//! waits for the lease, then finds no entry and starts the VM again.

mod address;

pub use address::{first_ipv4, INTERFACES_COMMAND};

use crate::audit::AuditLog;
use crate::backend::{PowerState, ResourceBackend, ResourceId};
use crate::bootstrap::{BootstrapImageBuilder, BootstrapParams};
use crate::config::Config;
use crate::error::{VmgateError, VmgateResult};
use crate::identity::ResourceKey;
use crate::poll::PollSpec;
use crate::probe::PortProbe;
use crate::store::StateStore;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing and placement knobs for provisioning
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub template_id: u32,
    pub boot: PollSpec,
    pub address: PollSpec,
    pub service: PollSpec,
    pub service_port: u16,
    pub lock_timeout: Duration,
}

impl ProvisionSettings {
    pub fn from_config(config: &Config) -> Self {
        let p = &config.provision;
        let boot_interval = Duration::from_millis(p.boot_poll_interval_ms);
        Self {
            template_id: config.backend.template_id,
            boot: PollSpec::new(boot_interval, Duration::from_secs(p.boot_timeout_secs)),
            address: PollSpec::new(boot_interval, Duration::from_secs(p.address_timeout_secs)),
            service: PollSpec::new(
                Duration::from_millis(p.service_poll_interval_ms),
                Duration::from_secs(p.service_timeout_secs),
            ),
            service_port: p.service_port,
            lock_timeout: Duration::from_secs(p.lock_timeout_secs),
        }
    }
}

/// How a ready resource was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionOutcome {
    /// Stored entry reused without touching the backend
    Cached,
    /// VM existed stopped and was started
    Started,
    /// VM was already running but had no entry
    Adopted,
    /// VM was cloned from the template
    Created,
}

/// A running resource with a resolved address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ready {
    pub address: Ipv4Addr,
    pub outcome: ProvisionOutcome,
}

/// Creates, starts and resolves resources
pub struct Provisioner {
    backend: Arc<dyn ResourceBackend>,
    store: StateStore,
    images: Arc<dyn BootstrapImageBuilder>,
    probe: Arc<dyn PortProbe>,
    settings: ProvisionSettings,
    audit: Arc<AuditLog>,
}

impl Provisioner {
    pub fn new(
        backend: Arc<dyn ResourceBackend>,
        store: StateStore,
        images: Arc<dyn BootstrapImageBuilder>,
        probe: Arc<dyn PortProbe>,
        settings: ProvisionSettings,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            backend,
            store,
            images,
            probe,
            settings,
            audit,
        }
    }

    /// Return a ready, reachable resource for `key`, creating it if needed
    pub async fn provision(
        &self,
        key: &ResourceKey,
        params: &BootstrapParams,
    ) -> VmgateResult<Ready> {
        let _lease = self
            .store
            .lease(key, "provision", self.settings.lock_timeout)
            .await?;

        if let Some(address) = self.store.get(key).await?.and_then(|e| e.address) {
            debug!(%key, %address, "Reusing stored address");
            // Stamped before the lease drops so a sweep cannot see the old watermark
            self.store.touch(key).await?;
            return Ok(Ready {
                address,
                outcome: ProvisionOutcome::Cached,
            });
        }

        let vm = ResourceId::from(key);
        let state = self.backend.power_state(&vm).await?;
        debug!(%key, vmid = vm.vmid, %state, "No stored address");

        let outcome = match state {
            PowerState::Absent => {
                self.create(key, &vm, params).await?;
                ProvisionOutcome::Created
            }
            PowerState::Running => ProvisionOutcome::Adopted,
            PowerState::Stopped | PowerState::Unknown => {
                info!(%key, vmid = vm.vmid, "Starting VM");
                self.backend.start(&vm).await?;
                self.audit
                    .log(
                        "resource.started",
                        &serde_json::json!({ "key": key.as_str(), "vmid": vm.vmid }),
                    )
                    .await;
                ProvisionOutcome::Started
            }
        };

        let resolved = async {
            self.wait_for_boot(&vm).await?;
            self.resolve_address(&vm).await
        }
        .await;
        let address = match resolved {
            Ok(address) => address,
            Err(e) => {
                self.abandon(key, &vm, outcome).await;
                return Err(e);
            }
        };
        self.store.put(key, address).await?;
        info!(%key, %address, ?outcome, "Resource ready");

        if outcome == ProvisionOutcome::Created {
            self.audit
                .log(
                    "resource.provisioned",
                    &serde_json::json!({
                        "key": key.as_str(),
                        "vmid": vm.vmid,
                        "address": address.to_string(),
                    }),
                )
                .await;
        }

        self.wait_for_service(address).await?;
        Ok(Ready { address, outcome })
    }

    /// Clone, attach the seed image, enable the agent and start.
    ///
    /// A VM cloned here is destroyed again if a later step fails.
    async fn create(
        &self,
        key: &ResourceKey,
        vm: &ResourceId,
        params: &BootstrapParams,
    ) -> VmgateResult<()> {
        let image = self.images.build(key, params).await?;

        info!(%key, vmid = vm.vmid, template = self.settings.template_id, "Cloning VM");
        let cloned = match self.backend.clone_vm(self.settings.template_id, vm).await {
            Ok(()) => true,
            Err(VmgateError::ConcurrentProvisionConflict(_)) => {
                debug!(%key, "VM appeared concurrently, continuing with it");
                false
            }
            Err(e) => return Err(e),
        };

        let configured = async {
            self.backend
                .set_config(vm, "ide2", &format!("{},media=cdrom", image))
                .await?;
            self.backend.set_config(vm, "agent", "enabled=1").await?;
            self.backend.start(vm).await
        }
        .await;

        if let Err(e) = configured {
            if cloned {
                warn!(%key, "Setup failed, destroying fresh clone: {}", e);
                if let Err(cleanup) = self.backend.destroy(vm).await {
                    warn!(%key, "Failed to destroy {}: {}", vm, cleanup);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Undo what this attempt did to a VM that never became usable.
    ///
    /// Nothing records such a VM, so the reaper would never reclaim it. An
    /// adopted VM was running before this attempt and is left alone.
    async fn abandon(&self, key: &ResourceKey, vm: &ResourceId, outcome: ProvisionOutcome) {
        match outcome {
            ProvisionOutcome::Created => {
                warn!(%key, vmid = vm.vmid, "VM never became ready, destroying it");
                if let Err(e) = self.backend.forced_stop(vm).await {
                    debug!(%key, "Stop before destroy failed: {}", e);
                }
                if let Err(e) = self.backend.destroy(vm).await {
                    warn!(%key, "Failed to destroy {}: {}", vm, e);
                }
            }
            ProvisionOutcome::Started => {
                warn!(%key, vmid = vm.vmid, "VM never became ready, stopping it");
                if let Err(e) = self.backend.forced_stop(vm).await {
                    warn!(%key, "Failed to stop {}: {}", vm, e);
                }
            }
            ProvisionOutcome::Adopted | ProvisionOutcome::Cached => {}
        }
    }

    async fn wait_for_boot(&self, vm: &ResourceId) -> VmgateResult<()> {
        let backend = &self.backend;
        let ready = self
            .settings
            .boot
            .until_true("guest agent", || async move {
                if !backend.power_state(vm).await?.is_running() {
                    return Ok(false);
                }
                backend.ping_guest_channel(vm).await
            })
            .await?;

        if ready {
            Ok(())
        } else {
            Err(VmgateError::ResourceNotReady {
                resource: vm.to_string(),
                waited_secs: self.settings.boot.timeout_secs(),
            })
        }
    }

    async fn resolve_address(&self, vm: &ResourceId) -> VmgateResult<Ipv4Addr> {
        let backend = &self.backend;
        let found = self
            .settings
            .address
            .until("guest address", || async move {
                match backend.exec_in_guest(vm, INTERFACES_COMMAND).await {
                    Ok(reply) => Ok(address::try_first_ipv4(&reply)),
                    // Agent up but networking not reported yet
                    Err(VmgateError::BackendCommand { stderr, .. }) => {
                        debug!(vmid = vm.vmid, "Interface query failed: {}", stderr);
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        found.ok_or_else(|| VmgateError::AddressResolutionFailed(vm.to_string()))
    }

    async fn wait_for_service(&self, address: Ipv4Addr) -> VmgateResult<()> {
        let probe = &self.probe;
        let port = self.settings.service_port;
        let reachable = self
            .settings
            .service
            .until_true("service port", || async move {
                Ok(probe.is_reachable(address, port).await)
            })
            .await?;

        if reachable {
            Ok(())
        } else {
            Err(VmgateError::ServiceNotReady {
                address: address.to_string(),
                port,
                waited_secs: self.settings.service.timeout_secs(),
            })
        }
    }
}
