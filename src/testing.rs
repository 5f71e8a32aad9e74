//! In-memory doubles for backend, sessions, probe and image builder

use crate::activity::SessionObserver;
use crate::backend::{PowerState, ResourceBackend, ResourceId};
use crate::bootstrap::{BootstrapImageBuilder, BootstrapParams};
use crate::error::{VmgateError, VmgateResult};
use crate::identity::ResourceKey;
use crate::probe::PortProbe;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct FakeVm {
    state: PowerState,
    config: HashMap<String, String>,
    pings: u32,
}

/// Hypervisor double.
///
/// Guests answer the agent after `boot_pings` pings and report
/// `10.0.0.<vmid % 1000>` unless an address is set explicitly.
#[derive(Default)]
pub struct FakeBackend {
    vms: Mutex<HashMap<u32, FakeVm>>,
    addresses: Mutex<HashMap<u32, Option<Ipv4Addr>>>,
    broken: Mutex<HashSet<u32>>,
    slow_graceful: Mutex<HashSet<u32>>,
    panic_graceful: Mutex<HashSet<u32>>,
    stopped_at: Mutex<HashMap<u32, Instant>>,
    calls: Mutex<Vec<String>>,
    clones: AtomicU32,
    boot_pings: AtomicU32,
    ignore_graceful: AtomicBool,
    ignore_forced: AtomicBool,
    fail_graceful: AtomicBool,
    fail_start: AtomicBool,
    clone_delay_ms: AtomicU32,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing VM
    pub fn insert_vm(&self, vmid: u32, state: PowerState) {
        self.vms.lock().unwrap().insert(
            vmid,
            FakeVm {
                state,
                config: HashMap::new(),
                pings: 0,
            },
        );
    }

    /// Override the guest address; `None` reports only loopback
    pub fn set_address(&self, vmid: u32, address: Option<Ipv4Addr>) {
        self.addresses.lock().unwrap().insert(vmid, address);
    }

    /// Make every call for `vmid` fail as unavailable
    pub fn break_vm(&self, vmid: u32) {
        self.broken.lock().unwrap().insert(vmid);
    }

    pub fn set_boot_pings(&self, pings: u32) {
        self.boot_pings.store(pings, Ordering::SeqCst);
    }

    pub fn set_ignore_graceful(&self, ignore: bool) {
        self.ignore_graceful.store(ignore, Ordering::SeqCst);
    }

    /// Ignore shutdown requests for one VM only
    pub fn ignore_graceful_for(&self, vmid: u32) {
        self.slow_graceful.lock().unwrap().insert(vmid);
    }

    /// Panic inside the shutdown request for `vmid`
    pub fn panic_on_graceful(&self, vmid: u32) {
        self.panic_graceful.lock().unwrap().insert(vmid);
    }

    /// Make the shutdown request itself fail
    pub fn set_fail_graceful(&self, fail: bool) {
        self.fail_graceful.store(fail, Ordering::SeqCst);
    }

    pub fn set_ignore_forced(&self, ignore: bool) {
        self.ignore_forced.store(ignore, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_clone_delay(&self, delay: Duration) {
        self.clone_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub fn clone_count(&self) -> u32 {
        self.clones.load(Ordering::SeqCst)
    }

    pub fn state(&self, vmid: u32) -> PowerState {
        self.vms
            .lock()
            .unwrap()
            .get(&vmid)
            .map_or(PowerState::Absent, |vm| vm.state)
    }

    /// When `vmid` last went from running to stopped
    pub fn stopped_at(&self, vmid: u32) -> Option<Instant> {
        self.stopped_at.lock().unwrap().get(&vmid).copied()
    }

    pub fn config_value(&self, vmid: u32, key: &str) -> Option<String> {
        self.vms
            .lock()
            .unwrap()
            .get(&vmid)
            .and_then(|vm| vm.config.get(key).cloned())
    }

    /// Backend calls so far, as "<op> <vmid>"
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.split(' ').next() == Some(op))
            .count()
    }

    fn record(&self, op: &str, vm: &ResourceId) -> VmgateResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", op, vm.vmid));
        if self.broken.lock().unwrap().contains(&vm.vmid) {
            return Err(VmgateError::BackendUnavailable(format!("{} {}", op, vm)));
        }
        Ok(())
    }

    fn set_state(&self, vm: &ResourceId, state: PowerState) -> VmgateResult<()> {
        let mut vms = self.vms.lock().unwrap();
        let entry = vms.get_mut(&vm.vmid).ok_or_else(|| VmgateError::BackendCommand {
            command: format!("qm {}", vm.vmid),
            stderr: "does not exist".to_string(),
        })?;
        if entry.state.is_running() && state == PowerState::Stopped {
            self.stopped_at.lock().unwrap().insert(vm.vmid, Instant::now());
        }
        entry.state = state;
        entry.pings = 0;
        Ok(())
    }

    fn interfaces_json(&self, vmid: u32) -> String {
        let address = self
            .addresses
            .lock()
            .unwrap()
            .get(&vmid)
            .copied()
            .unwrap_or_else(|| Some(Ipv4Addr::new(10, 0, 0, (vmid % 1000) as u8)));

        let mut interfaces = vec![serde_json::json!({
            "name": "lo",
            "ip-addresses": [
                {"ip-address-type": "ipv4", "ip-address": "127.0.0.1", "prefix": 8}
            ]
        })];
        if let Some(address) = address {
            interfaces.push(serde_json::json!({
                "name": "eth0",
                "ip-addresses": [
                    {"ip-address-type": "ipv6", "ip-address": "fe80::1", "prefix": 64},
                    {"ip-address-type": "ipv4", "ip-address": address.to_string(), "prefix": 24}
                ]
            }));
        }
        serde_json::Value::Array(interfaces).to_string()
    }
}

#[async_trait]
impl ResourceBackend for FakeBackend {
    async fn is_available(&self) -> VmgateResult<bool> {
        Ok(true)
    }

    async fn clone_vm(&self, _template_id: u32, vm: &ResourceId) -> VmgateResult<()> {
        self.record("clone", vm)?;
        let delay = self.clone_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay.into())).await;
        }

        let mut vms = self.vms.lock().unwrap();
        if vms.contains_key(&vm.vmid) {
            return Err(VmgateError::ConcurrentProvisionConflict(vm.to_string()));
        }
        vms.insert(
            vm.vmid,
            FakeVm {
                state: PowerState::Stopped,
                config: HashMap::new(),
                pings: 0,
            },
        );
        self.clones.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_config(&self, vm: &ResourceId, key: &str, value: &str) -> VmgateResult<()> {
        self.record("set", vm)?;
        let mut vms = self.vms.lock().unwrap();
        let entry = vms.get_mut(&vm.vmid).ok_or_else(|| VmgateError::BackendCommand {
            command: format!("qm set {}", vm.vmid),
            stderr: "does not exist".to_string(),
        })?;
        entry.config.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn start(&self, vm: &ResourceId) -> VmgateResult<()> {
        self.record("start", vm)?;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(VmgateError::BackendCommand {
                command: format!("qm start {}", vm.vmid),
                stderr: "start failed".to_string(),
            });
        }
        self.set_state(vm, PowerState::Running)
    }

    async fn graceful_stop(&self, vm: &ResourceId) -> VmgateResult<()> {
        self.record("shutdown", vm)?;
        if self.panic_graceful.lock().unwrap().contains(&vm.vmid) {
            panic!("shutdown of {} blew up", vm);
        }
        if self.fail_graceful.load(Ordering::SeqCst) {
            return Err(VmgateError::BackendCommand {
                command: format!("qm shutdown {}", vm.vmid),
                stderr: "shutdown request failed".to_string(),
            });
        }
        if self.ignore_graceful.load(Ordering::SeqCst)
            || self.slow_graceful.lock().unwrap().contains(&vm.vmid)
        {
            return Ok(());
        }
        self.set_state(vm, PowerState::Stopped)
    }

    async fn forced_stop(&self, vm: &ResourceId) -> VmgateResult<()> {
        self.record("stop", vm)?;
        if self.ignore_forced.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(vm, PowerState::Stopped)
    }

    async fn destroy(&self, vm: &ResourceId) -> VmgateResult<()> {
        self.record("destroy", vm)?;
        self.vms.lock().unwrap().remove(&vm.vmid);
        Ok(())
    }

    async fn power_state(&self, vm: &ResourceId) -> VmgateResult<PowerState> {
        self.record("status", vm)?;
        Ok(self.state(vm.vmid))
    }

    async fn exec_in_guest(&self, vm: &ResourceId, command: &str) -> VmgateResult<String> {
        self.record("guest", vm)?;
        if !self.state(vm.vmid).is_running() {
            return Err(VmgateError::BackendCommand {
                command: format!("qm guest cmd {} {}", vm.vmid, command),
                stderr: "VM is not running".to_string(),
            });
        }
        match command {
            "network-get-interfaces" => Ok(self.interfaces_json(vm.vmid)),
            other => Err(VmgateError::BackendCommand {
                command: format!("qm guest cmd {} {}", vm.vmid, other),
                stderr: "unsupported".to_string(),
            }),
        }
    }

    async fn ping_guest_channel(&self, vm: &ResourceId) -> VmgateResult<bool> {
        self.record("ping", vm)?;
        let needed = self.boot_pings.load(Ordering::SeqCst);
        let mut vms = self.vms.lock().unwrap();
        let Some(entry) = vms.get_mut(&vm.vmid) else {
            return Ok(false);
        };
        if !entry.state.is_running() {
            return Ok(false);
        }
        entry.pings += 1;
        Ok(entry.pings > needed)
    }

    fn backend_name(&self) -> &'static str {
        "fake"
    }
}

/// Session observer double
#[derive(Default)]
pub struct FakeSessions {
    live: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeSessions {
    pub fn set_live(&self, identity: &str, live: bool) {
        let mut set = self.live.lock().unwrap();
        if live {
            set.insert(identity.to_string());
        } else {
            set.remove(identity);
        }
    }

    pub fn set_failing(&self, identity: &str) {
        self.failing.lock().unwrap().insert(identity.to_string());
    }
}

#[async_trait]
impl SessionObserver for FakeSessions {
    async fn has_live_session(&self, identity: &str) -> VmgateResult<bool> {
        if self.failing.lock().unwrap().contains(identity) {
            return Err(VmgateError::command_exec("pgrep", "observer failed"));
        }
        Ok(self.live.lock().unwrap().contains(identity))
    }
}

/// Port probe double that succeeds after `failures` refused attempts
#[derive(Default)]
pub struct FakeProbe {
    failures: AtomicU32,
    never: AtomicBool,
    attempts: AtomicU32,
}

impl FakeProbe {
    pub fn refusing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            never: AtomicBool::new(true),
            ..Self::default()
        }
    }
}

#[async_trait]
impl PortProbe for FakeProbe {
    async fn is_reachable(&self, _address: Ipv4Addr, _port: u16) -> bool {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        !self.never.load(Ordering::SeqCst) && attempt > self.failures.load(Ordering::SeqCst)
    }
}

/// Image builder double
#[derive(Default)]
pub struct FakeImageBuilder {
    builds: AtomicU32,
}

impl FakeImageBuilder {
    pub fn build_count(&self) -> u32 {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BootstrapImageBuilder for FakeImageBuilder {
    async fn build(&self, key: &ResourceKey, params: &BootstrapParams) -> VmgateResult<String> {
        params.validate()?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(format!("local:iso/{}-seed.iso", key))
    }
}
