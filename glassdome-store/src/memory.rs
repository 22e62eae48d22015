use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use crate::entities::{
    DeployedVm, HotSpare, NetworkDefinition, PlatformNetworkMapping, SpareStatus, VmInterfaceRow,
    VmStatus,
};
use crate::error::{Result, StoreError};
use crate::event::Event;
use crate::traits::{DataStore, DeployedVmStore, HotSpareStore, NetworkStore, VmInterfaceStore};

/// Single-process, in-memory reference implementation of [`DataStore`].
///
/// Glassdome's non-goals exclude cross-process orchestrator failover, so
/// unlike mvirt-api's Raft-replicated `ApiState`, mutation here is
/// guarded by plain `tokio::sync::Mutex`es rather than a consensus log -
/// same "all writes go through one serialized path" shape, one process
/// instead of many.
pub struct InMemoryStore {
    networks: Mutex<HashMap<String, NetworkDefinition>>,
    mappings: Mutex<HashMap<String, PlatformNetworkMapping>>,
    interfaces: Mutex<HashMap<String, VmInterfaceRow>>,
    vms: Mutex<HashMap<String, DeployedVm>>,
    spares: Mutex<HashMap<String, HotSpare>>,
    events: broadcast::Sender<Event>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            networks: Mutex::new(HashMap::new()),
            mappings: Mutex::new(HashMap::new()),
            interfaces: Mutex::new(HashMap::new()),
            vms: Mutex::new(HashMap::new()),
            spares: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn emit(&self, event: Event) {
        // No active subscribers is not an error - the store works fine
        // with nothing listening.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl NetworkStore for InMemoryStore {
    async fn list_networks(&self) -> Vec<NetworkDefinition> {
        self.networks.lock().await.values().cloned().collect()
    }

    async fn list_networks_by_lab(&self, lab_id: &str) -> Vec<NetworkDefinition> {
        self.networks
            .lock()
            .await
            .values()
            .filter(|n| n.lab_id == lab_id)
            .cloned()
            .collect()
    }

    async fn get_network(&self, id: &str) -> Option<NetworkDefinition> {
        self.networks.lock().await.get(id).cloned()
    }

    async fn get_network_by_name(&self, name: &str) -> Option<NetworkDefinition> {
        self.networks
            .lock()
            .await
            .values()
            .find(|n| n.name == name)
            .cloned()
    }

    async fn create_network(&self, network: NetworkDefinition) -> Result<NetworkDefinition> {
        let mut networks = self.networks.lock().await;
        if networks.contains_key(&network.id) {
            return Err(StoreError::DuplicateId(network.id));
        }
        if networks.values().any(|n| n.name == network.name) {
            return Err(StoreError::Conflict(format!(
                "network name already in use: {}",
                network.name
            )));
        }
        networks.insert(network.id.clone(), network.clone());
        drop(networks);
        self.emit(Event::NetworkCreated {
            id: network.id.clone(),
        });
        Ok(network)
    }

    async fn delete_network(&self, id: &str) -> Result<()> {
        let mut networks = self.networks.lock().await;
        networks
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        drop(networks);

        let mut mappings = self.mappings.lock().await;
        mappings.retain(|_, m| m.network_id != id);
        drop(mappings);

        self.emit(Event::NetworkDeleted { id: id.to_string() });
        Ok(())
    }

    async fn create_mapping(
        &self,
        mapping: PlatformNetworkMapping,
    ) -> Result<PlatformNetworkMapping> {
        let mut mappings = self.mappings.lock().await;
        if mappings.values().any(|m| {
            m.network_id == mapping.network_id
                && m.platform == mapping.platform
                && m.platform_instance == mapping.platform_instance
        }) {
            return Err(StoreError::Conflict(format!(
                "mapping already exists for network {} on {}:{}",
                mapping.network_id, mapping.platform, mapping.platform_instance
            )));
        }
        mappings.insert(mapping.id.clone(), mapping.clone());
        Ok(mapping)
    }

    async fn list_provisioned_mappings(&self) -> Vec<PlatformNetworkMapping> {
        self.mappings
            .lock()
            .await
            .values()
            .filter(|m| m.provisioned)
            .cloned()
            .collect()
    }

    async fn update_mapping(&self, mapping: PlatformNetworkMapping) -> Result<()> {
        let mut mappings = self.mappings.lock().await;
        if !mappings.contains_key(&mapping.id) {
            return Err(StoreError::NotFound(mapping.id));
        }
        mappings.insert(mapping.id.clone(), mapping);
        Ok(())
    }
}

#[async_trait]
impl VmInterfaceStore for InMemoryStore {
    async fn list_interfaces(&self) -> Vec<VmInterfaceRow> {
        self.interfaces.lock().await.values().cloned().collect()
    }

    async fn list_interfaces_for_vm(&self, vm_id: &str) -> Vec<VmInterfaceRow> {
        self.interfaces
            .lock()
            .await
            .values()
            .filter(|i| i.vm_id == vm_id)
            .cloned()
            .collect()
    }

    async fn upsert_interface(&self, interface: VmInterfaceRow) -> Result<()> {
        let mut interfaces = self.interfaces.lock().await;
        let duplicate = interfaces.values().any(|i| {
            i.id != interface.id
                && i.vm_id == interface.vm_id
                && i.platform == interface.platform
                && i.platform_instance == interface.platform_instance
                && i.interface_index == interface.interface_index
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "interface {} already exists on vm {}",
                interface.interface_index, interface.vm_id
            )));
        }
        interfaces.insert(interface.id.clone(), interface);
        Ok(())
    }

    async fn update_interface_ip(&self, id: &str, ip: Ipv4Addr) -> Result<()> {
        let mut interfaces = self.interfaces.lock().await;
        let interface = interfaces
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        interface.ip_address = Some(ip);
        Ok(())
    }

    async fn delete_interface(&self, id: &str) -> Result<()> {
        self.interfaces
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl DeployedVmStore for InMemoryStore {
    async fn list_vms(&self) -> Vec<DeployedVm> {
        self.vms.lock().await.values().cloned().collect()
    }

    async fn list_vms_by_lab(&self, lab_id: &str) -> Vec<DeployedVm> {
        self.vms
            .lock()
            .await
            .values()
            .filter(|v| v.lab_id == lab_id)
            .cloned()
            .collect()
    }

    async fn list_deployed_vms(&self) -> Vec<DeployedVm> {
        self.vms
            .lock()
            .await
            .values()
            .filter(|v| v.status == VmStatus::Deployed)
            .cloned()
            .collect()
    }

    async fn get_vm(&self, id: &str) -> Option<DeployedVm> {
        self.vms.lock().await.get(id).cloned()
    }

    async fn create_vm(&self, vm: DeployedVm) -> Result<DeployedVm> {
        let mut vms = self.vms.lock().await;
        if vms.contains_key(&vm.id) {
            return Err(StoreError::DuplicateId(vm.id));
        }
        let duplicate_platform_id = vms
            .values()
            .any(|v| v.platform == vm.platform && v.platform_instance == vm.platform_instance && v.vm_id == vm.vm_id);
        if duplicate_platform_id {
            return Err(StoreError::Conflict(format!(
                "vm id {} already deployed on {}:{}",
                vm.vm_id, vm.platform, vm.platform_instance
            )));
        }
        vms.insert(vm.id.clone(), vm.clone());
        drop(vms);
        self.emit(Event::VmCreated { id: vm.id.clone() });
        Ok(vm)
    }

    async fn update_vm_ip(&self, id: &str, ip: Ipv4Addr) -> Result<()> {
        let mut vms = self.vms.lock().await;
        let vm = vms
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        vm.ip_address = Some(ip);
        vm.updated_at = Utc::now();
        drop(vms);
        self.emit(Event::VmStatusUpdated { id: id.to_string() });
        Ok(())
    }

    async fn update_vm_status(&self, id: &str, status: VmStatus) -> Result<()> {
        let mut vms = self.vms.lock().await;
        let vm = vms
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        vm.status = status;
        vm.updated_at = Utc::now();
        drop(vms);
        self.emit(Event::VmStatusUpdated { id: id.to_string() });
        Ok(())
    }

    async fn delete_vm(&self, id: &str) -> Result<()> {
        self.vms
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.emit(Event::VmDeleted { id: id.to_string() });
        Ok(())
    }
}

#[async_trait]
impl HotSpareStore for InMemoryStore {
    async fn list_spares(&self) -> Vec<HotSpare> {
        self.spares.lock().await.values().cloned().collect()
    }

    async fn list_spares_by_family(&self, platform_instance: &str, os_type: &str) -> Vec<HotSpare> {
        self.spares
            .lock()
            .await
            .values()
            .filter(|s| s.platform_instance == platform_instance && s.os_type == os_type)
            .cloned()
            .collect()
    }

    async fn get_spare(&self, id: &str) -> Option<HotSpare> {
        self.spares.lock().await.get(id).cloned()
    }

    async fn insert_spare(&self, spare: HotSpare) -> Result<HotSpare> {
        let mut spares = self.spares.lock().await;
        if spares.contains_key(&spare.id) {
            return Err(StoreError::DuplicateId(spare.id));
        }
        if let Some(ip) = spare.ip_address {
            let ip_taken = spares.values().any(|s| {
                s.ip_address == Some(ip) && !matches!(s.status, SpareStatus::Failed | SpareStatus::Destroying)
            });
            if ip_taken {
                return Err(StoreError::Conflict(format!("ip {ip} already assigned")));
            }
        }
        spares.insert(spare.id.clone(), spare.clone());
        drop(spares);
        self.emit(Event::SpareProvisioned {
            id: spare.id.clone(),
        });
        Ok(spare)
    }

    async fn mark_ready(&self, id: &str, ip: Option<Ipv4Addr>) -> Result<()> {
        let mut spares = self.spares.lock().await;
        let spare = spares
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        spare.status = SpareStatus::Ready;
        spare.ready_at = Some(Utc::now());
        if ip.is_some() {
            spare.ip_address = ip;
        }
        drop(spares);
        self.emit(Event::SpareStatusChanged { id: id.to_string() });
        Ok(())
    }

    async fn mark_failed(&self, id: &str) -> Result<()> {
        let mut spares = self.spares.lock().await;
        let spare = spares
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        spare.status = SpareStatus::Failed;
        drop(spares);
        self.emit(Event::SpareStatusChanged { id: id.to_string() });
        Ok(())
    }

    async fn record_health_check(&self, id: &str, success: bool) -> Result<Option<HotSpare>> {
        let mut spares = self.spares.lock().await;
        let spare = spares
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if success {
            spare.last_health_check = Some(Utc::now());
            spare.health_check_failures = 0;
            Ok(None)
        } else {
            spare.health_check_failures += 1;
            if spare.health_check_failures >= 3 {
                spare.status = SpareStatus::Failed;
                let snapshot = spare.clone();
                drop(spares);
                self.emit(Event::SpareStatusChanged { id: id.to_string() });
                Ok(Some(snapshot))
            } else {
                Ok(None)
            }
        }
    }

    async fn release(&self, id: &str) -> Result<()> {
        self.spares
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.emit(Event::SpareReleased { id: id.to_string() });
        Ok(())
    }

    async fn acquire_ready_spare(
        &self,
        platform_instance: &str,
        os_type: &str,
        mission_id: &str,
    ) -> Option<HotSpare> {
        // Single critical section per call: scan for the oldest `ready`
        // spare matching (platform_instance, os_type) and flip it to
        // `in_use` before releasing the lock. No `.await` happens between
        // the scan and the mutation, so this is equivalent to
        // `SELECT ... FOR UPDATE SKIP LOCKED` - two concurrent callers
        // can never observe and claim the same row.
        let mut spares = self.spares.lock().await;
        let chosen_id = spares
            .values()
            .filter(|s| {
                s.status == SpareStatus::Ready
                    && s.platform_instance == platform_instance
                    && s.os_type == os_type
            })
            .min_by_key(|s| s.ready_at)
            .map(|s| s.id.clone())?;

        let spare = spares.get_mut(&chosen_id).expect("just located by id");
        spare.status = SpareStatus::InUse;
        spare.assigned_to_mission = Some(mission_id.to_string());
        spare.assigned_at = Some(Utc::now());
        let snapshot = spare.clone();
        drop(spares);

        self.emit(Event::SpareAcquired {
            id: snapshot.id.clone(),
            mission_id: mission_id.to_string(),
        });
        Some(snapshot)
    }
}

impl DataStore for InMemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::NetworkType;
    use std::sync::Arc;

    fn make_network(id: &str, name: &str) -> NetworkDefinition {
        NetworkDefinition {
            id: id.to_string(),
            name: name.to_string(),
            cidr: "10.1.0.0/24".to_string(),
            vlan_id: None,
            gateway: Ipv4Addr::new(10, 1, 0, 1),
            network_type: NetworkType::Isolated,
            dhcp_enabled: false,
            dhcp_range_start: None,
            dhcp_range_end: None,
            dns_servers: vec![],
            lab_id: "lab-1".to_string(),
            created_at: Utc::now(),
        }
    }

    fn make_spare(id: &str, instance: &str, os_type: &str, ready_at_offset_secs: i64) -> HotSpare {
        HotSpare {
            id: id.to_string(),
            vm_id: format!("vmid-{id}"),
            name: format!("spare-{id}"),
            platform: "proxmox".to_string(),
            platform_instance: instance.to_string(),
            node: "pve01".to_string(),
            os_type: os_type.to_string(),
            template_id: "9003".to_string(),
            ip_address: Some(Ipv4Addr::new(192, 168, 3, 100)),
            status: SpareStatus::Ready,
            assigned_to_mission: None,
            last_health_check: None,
            health_check_failures: 0,
            created_at: Utc::now(),
            ready_at: Some(Utc::now() + chrono::Duration::seconds(ready_at_offset_secs)),
            assigned_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_network_name_is_rejected() {
        let store = InMemoryStore::new();
        store.create_network(make_network("n1", "lab-net")).await.unwrap();
        let err = store
            .create_network(make_network("n2", "lab-net"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_network_cascades_to_mappings() {
        let store = InMemoryStore::new();
        store.create_network(make_network("n1", "lab-net")).await.unwrap();
        store
            .create_mapping(PlatformNetworkMapping {
                id: "m1".to_string(),
                network_id: "n1".to_string(),
                platform: "proxmox".to_string(),
                platform_instance: "01".to_string(),
                platform_config: serde_json::json!({}),
                provisioned: true,
                provision_error: None,
            })
            .await
            .unwrap();

        store.delete_network("n1").await.unwrap();
        assert!(store.list_provisioned_mappings().await.is_empty());
    }

    #[tokio::test]
    async fn s5_acquire_is_race_free_under_concurrency() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_spare(make_spare("s1", "01", "ubuntu", 0))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .acquire_ready_spare("01", "ubuntu", &format!("mission-{i}"))
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let spare = store.get_spare("s1").await.unwrap();
        assert_eq!(spare.status, SpareStatus::InUse);
    }

    #[tokio::test]
    async fn acquire_picks_oldest_ready_spare_first() {
        let store = InMemoryStore::new();
        store
            .insert_spare(make_spare("newer", "01", "ubuntu", 100))
            .await
            .unwrap();
        store
            .insert_spare(make_spare("older", "01", "ubuntu", 1))
            .await
            .unwrap();

        let acquired = store
            .acquire_ready_spare("01", "ubuntu", "mission-1")
            .await
            .unwrap();
        assert_eq!(acquired.id, "older");
    }

    #[tokio::test]
    async fn acquire_returns_none_when_no_match() {
        let store = InMemoryStore::new();
        store
            .insert_spare(make_spare("s1", "01", "windows10", 0))
            .await
            .unwrap();

        let result = store.acquire_ready_spare("01", "ubuntu", "mission-1").await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn three_consecutive_health_check_failures_mark_spare_failed() {
        let store = InMemoryStore::new();
        store
            .insert_spare(make_spare("s1", "01", "ubuntu", 0))
            .await
            .unwrap();

        assert!(store.record_health_check("s1", false).await.unwrap().is_none());
        assert!(store.record_health_check("s1", false).await.unwrap().is_none());
        let failed = store.record_health_check("s1", false).await.unwrap();
        assert!(failed.is_some());
        assert_eq!(store.get_spare("s1").await.unwrap().status, SpareStatus::Failed);
    }
}
