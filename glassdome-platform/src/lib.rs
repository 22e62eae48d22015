//! Platform Adapter Interface: the uniform capability surface Glassdome's
//! core uses to talk to a specific hypervisor or cloud, plus a
//! `LocalSimAdapter` reference implementation.
//!
//! Grounded in `glassdome.networking.proxmox_handler.ProxmoxNetworkHandler`
//! (the abstract method set) and in mvirt-node's reconciler pattern of
//! comparing a caller-observed desired state against what a client
//! reports back.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum PlatformError {
    #[error("platform error: {0}")]
    Other(String),
    #[error("vm not found: {0}")]
    VmNotFound(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Isolated,
    Nat,
    Bridged,
    Routed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub cidr: String,
    pub vlan_id: Option<u16>,
    pub network_type: NetworkType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSizing {
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInterfaceInfo {
    pub index: u32,
    pub mac_address: String,
    pub ip_address: Option<Ipv4Addr>,
    pub interface_name: Option<String>,
    pub platform_config: serde_json::Value,
}

/// Uniform capability surface a platform (Proxmox, AWS, ESXi, ...) must
/// expose to Glassdome's core. Implementations MUST be safe to call
/// concurrently and MUST treat create/delete as idempotent on retry.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Pure mapping from an abstract network definition to a
    /// platform-specific config blob. No I/O.
    fn generate_network_config(&self, network: &NetworkSpec, instance: &str) -> serde_json::Value;

    async fn create_network(
        &self,
        network: &NetworkSpec,
        config: &serde_json::Value,
        instance: &str,
    ) -> Result<bool>;

    async fn delete_network(&self, config: &serde_json::Value, instance: &str) -> Result<bool>;

    async fn attach_interface(
        &self,
        vm_id: &str,
        network: &NetworkSpec,
        config: &serde_json::Value,
        index: u32,
        instance: &str,
    ) -> Result<VmInterfaceInfo>;

    async fn detach_interface(&self, vm_id: &str, index: u32, instance: &str) -> Result<()>;

    /// `None` means the VM itself is gone; `Some(vec![])` means it exists
    /// but has no interfaces yet.
    async fn get_vm_interfaces(
        &self,
        vm_id: &str,
        instance: &str,
    ) -> Result<Option<Vec<VmInterfaceInfo>>>;

    /// Must be globally unique on the platform at the time of the call.
    async fn next_vm_id(&self, instance: &str) -> Result<String>;

    /// Clone `template_id` into a new VM sized per `sizing`, optionally
    /// with a pre-assigned static IP on its first interface.
    async fn create_vm(
        &self,
        instance: &str,
        template_id: &str,
        sizing: &VmSizing,
        ip: Option<Ipv4Addr>,
    ) -> Result<String>;

    async fn stop_vm(&self, instance: &str, vm_id: &str) -> Result<()>;

    async fn delete_vm(&self, instance: &str, vm_id: &str) -> Result<()>;

    /// Single ICMP reachability probe. Returns false on any failure
    /// (including "host unreachable"), never an error - this is a
    /// best-effort health signal, not a platform operation.
    async fn ping(&self, ip: Ipv4Addr) -> bool;
}

#[derive(Debug, Clone)]
struct SimVm {
    template_id: String,
    sizing: VmSizing,
    interfaces: Vec<VmInterfaceInfo>,
    running: bool,
}

/// In-memory simulated hypervisor. Backs the test suite and serves as the
/// one illustrative `PlatformAdapter` implementation: sequential VM ids,
/// tracked networks/interfaces, and the ability to inject failures or IP
/// drift for reconciler tests.
pub struct LocalSimAdapter {
    next_id: AtomicU64,
    networks: Mutex<HashMap<String, NetworkSpec>>,
    vms: Mutex<HashMap<String, SimVm>>,
    fail_create_vm: Mutex<bool>,
    unreachable_ips: Mutex<Vec<Ipv4Addr>>,
}

impl Default for LocalSimAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSimAdapter {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(100),
            networks: Mutex::new(HashMap::new()),
            vms: Mutex::new(HashMap::new()),
            fail_create_vm: Mutex::new(false),
            unreachable_ips: Mutex::new(Vec::new()),
        }
    }

    /// Test hook: make the next `create_vm` call fail.
    pub fn set_fail_create_vm(&self, fail: bool) {
        *self.fail_create_vm.lock().unwrap() = fail;
    }

    /// Test hook: mark an IP as failing `ping`.
    pub fn set_unreachable(&self, ip: Ipv4Addr) {
        self.unreachable_ips.lock().unwrap().push(ip);
    }

    /// Test hook: simulate platform-side drift by rewriting a VM's
    /// first-interface IP out from under the caller.
    pub fn drift_vm_ip(&self, vm_id: &str, new_ip: Ipv4Addr) {
        if let Some(vm) = self.vms.lock().unwrap().get_mut(vm_id) {
            if let Some(iface) = vm.interfaces.first_mut() {
                iface.ip_address = Some(new_ip);
            }
        }
    }

    /// Test hook: simulate the VM disappearing from the platform.
    pub fn remove_vm(&self, vm_id: &str) {
        self.vms.lock().unwrap().remove(vm_id);
    }
}

#[async_trait]
impl PlatformAdapter for LocalSimAdapter {
    fn generate_network_config(&self, network: &NetworkSpec, _instance: &str) -> serde_json::Value {
        let bridge = match network.network_type {
            NetworkType::Isolated => "vmbr2",
            NetworkType::Nat => "vmbr1",
            NetworkType::Bridged => "vmbr0",
            NetworkType::Routed => "vmbr1",
        };
        serde_json::json!({
            "bridge": bridge,
            "model": "virtio",
            "vlan_tag": network.vlan_id,
        })
    }

    async fn create_network(
        &self,
        network: &NetworkSpec,
        _config: &serde_json::Value,
        _instance: &str,
    ) -> Result<bool> {
        self.networks
            .lock()
            .unwrap()
            .insert(network.name.clone(), network.clone());
        Ok(true)
    }

    async fn delete_network(&self, _config: &serde_json::Value, _instance: &str) -> Result<bool> {
        Ok(true)
    }

    async fn attach_interface(
        &self,
        vm_id: &str,
        _network: &NetworkSpec,
        config: &serde_json::Value,
        index: u32,
        _instance: &str,
    ) -> Result<VmInterfaceInfo> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| PlatformError::VmNotFound(vm_id.to_string()))?;
        let mac = format!("52:54:00:{:02x}:{:02x}:{:02x}", index, index + 1, index + 2);
        let iface = VmInterfaceInfo {
            index,
            mac_address: mac,
            ip_address: None,
            interface_name: Some(format!("net{index}")),
            platform_config: config.clone(),
        };
        vm.interfaces.push(iface.clone());
        Ok(iface)
    }

    async fn detach_interface(&self, vm_id: &str, index: u32, _instance: &str) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| PlatformError::VmNotFound(vm_id.to_string()))?;
        vm.interfaces.retain(|i| i.index != index);
        Ok(())
    }

    async fn get_vm_interfaces(
        &self,
        vm_id: &str,
        _instance: &str,
    ) -> Result<Option<Vec<VmInterfaceInfo>>> {
        Ok(self
            .vms
            .lock()
            .unwrap()
            .get(vm_id)
            .map(|vm| vm.interfaces.clone()))
    }

    async fn next_vm_id(&self, _instance: &str) -> Result<String> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
    }

    async fn create_vm(
        &self,
        _instance: &str,
        template_id: &str,
        sizing: &VmSizing,
        ip: Option<Ipv4Addr>,
    ) -> Result<String> {
        if *self.fail_create_vm.lock().unwrap() {
            return Err(PlatformError::Other("simulated create_vm failure".into()));
        }

        let vm_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let mut interfaces = Vec::new();
        if let Some(ip) = ip {
            interfaces.push(VmInterfaceInfo {
                index: 0,
                mac_address: "52:54:00:00:00:01".to_string(),
                ip_address: Some(ip),
                interface_name: Some("net0".to_string()),
                platform_config: serde_json::json!({}),
            });
        }

        self.vms.lock().unwrap().insert(
            vm_id.clone(),
            SimVm {
                template_id: template_id.to_string(),
                sizing: sizing.clone(),
                interfaces,
                running: true,
            },
        );
        Ok(vm_id)
    }

    async fn stop_vm(&self, _instance: &str, vm_id: &str) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| PlatformError::VmNotFound(vm_id.to_string()))?;
        vm.running = false;
        Ok(())
    }

    async fn delete_vm(&self, _instance: &str, vm_id: &str) -> Result<()> {
        self.vms.lock().unwrap().remove(vm_id);
        Ok(())
    }

    async fn ping(&self, ip: Ipv4Addr) -> bool {
        !self.unreachable_ips.lock().unwrap().contains(&ip)
    }
}
