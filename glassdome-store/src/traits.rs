use async_trait::async_trait;

use crate::entities::{DeployedVm, HotSpare, NetworkDefinition, PlatformNetworkMapping, VmInterfaceRow};
use crate::error::Result;
use crate::event::Event;
use tokio::sync::broadcast;

#[async_trait]
pub trait NetworkStore: Send + Sync {
    async fn list_networks(&self) -> Vec<NetworkDefinition>;
    async fn list_networks_by_lab(&self, lab_id: &str) -> Vec<NetworkDefinition>;
    async fn get_network(&self, id: &str) -> Option<NetworkDefinition>;
    async fn get_network_by_name(&self, name: &str) -> Option<NetworkDefinition>;
    async fn create_network(&self, network: NetworkDefinition) -> Result<NetworkDefinition>;
    async fn delete_network(&self, id: &str) -> Result<()>;

    async fn create_mapping(&self, mapping: PlatformNetworkMapping) -> Result<PlatformNetworkMapping>;
    async fn list_provisioned_mappings(&self) -> Vec<PlatformNetworkMapping>;
    async fn update_mapping(&self, mapping: PlatformNetworkMapping) -> Result<()>;
}

#[async_trait]
pub trait VmInterfaceStore: Send + Sync {
    async fn list_interfaces(&self) -> Vec<VmInterfaceRow>;
    async fn list_interfaces_for_vm(&self, vm_id: &str) -> Vec<VmInterfaceRow>;
    async fn upsert_interface(&self, interface: VmInterfaceRow) -> Result<()>;
    async fn update_interface_ip(&self, id: &str, ip: std::net::Ipv4Addr) -> Result<()>;
    async fn delete_interface(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait DeployedVmStore: Send + Sync {
    async fn list_vms(&self) -> Vec<DeployedVm>;
    async fn list_vms_by_lab(&self, lab_id: &str) -> Vec<DeployedVm>;
    async fn list_deployed_vms(&self) -> Vec<DeployedVm>;
    async fn get_vm(&self, id: &str) -> Option<DeployedVm>;
    async fn create_vm(&self, vm: DeployedVm) -> Result<DeployedVm>;
    async fn update_vm_ip(&self, id: &str, ip: std::net::Ipv4Addr) -> Result<()>;
    async fn update_vm_status(&self, id: &str, status: crate::entities::VmStatus) -> Result<()>;
    async fn delete_vm(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait HotSpareStore: Send + Sync {
    async fn list_spares(&self) -> Vec<HotSpare>;
    async fn list_spares_by_family(&self, platform_instance: &str, os_type: &str) -> Vec<HotSpare>;
    async fn get_spare(&self, id: &str) -> Option<HotSpare>;
    async fn insert_spare(&self, spare: HotSpare) -> Result<HotSpare>;
    async fn mark_ready(&self, id: &str, ip: Option<std::net::Ipv4Addr>) -> Result<()>;
    async fn mark_failed(&self, id: &str) -> Result<()>;
    async fn record_health_check(&self, id: &str, success: bool) -> Result<Option<HotSpare>>;
    async fn release(&self, id: &str) -> Result<()>;

    /// The one operation the Hot Spare Pool's race-freedom rests on: pick
    /// a single `ready` spare matching `(platform_instance, os_type)`,
    /// ordered by `ready_at`, and atomically flip it to `in_use`. Returns
    /// `None` if no such spare exists - callers never block waiting for
    /// one, and two concurrent callers never receive the same spare.
    async fn acquire_ready_spare(
        &self,
        platform_instance: &str,
        os_type: &str,
        mission_id: &str,
    ) -> Option<HotSpare>;
}

/// Composite store the rest of the core depends on, plus a subscription
/// for resource-change events - same shape as mvirt-api's `DataStore`.
#[async_trait]
pub trait DataStore:
    NetworkStore + VmInterfaceStore + DeployedVmStore + HotSpareStore + Send + Sync
{
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}
