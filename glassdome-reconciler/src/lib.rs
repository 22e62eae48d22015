//! State Reconciler: closes the gap between recorded state and platform
//! reality on a fixed cadence. Records drift, logs it, and self-heals
//! only the handful of fields that are safe to refresh (observed IPs).
//!
//! Grounded in `glassdome.networking.reconciler.NetworkReconciler`: same
//! three checks (provisioned networks, VM interfaces, deployed VMs),
//! same ring-buffered result history, same "never abort the cycle on a
//! single check's failure" posture.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use glassdome_audit::AuditLogger;
use glassdome_platform::{NetworkSpec, NetworkType as PlatformNetworkType, PlatformAdapter};
use glassdome_store::{DataStore, VmStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Network,
    VmInterface,
    DeployedVm,
}

#[derive(Debug, Clone)]
pub struct ReconciliationResult {
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub platform_instance: String,
    pub expected: String,
    pub observed: String,
    pub drifted: bool,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl ReconciliationResult {
    fn ok(kind: ResourceKind, id: impl Into<String>, instance: impl Into<String>, state: impl Into<String>) -> Self {
        let state = state.into();
        Self {
            resource_kind: kind,
            resource_id: id.into(),
            platform_instance: instance.into(),
            expected: state.clone(),
            observed: state,
            drifted: false,
            detail: String::new(),
            timestamp: Utc::now(),
        }
    }

    fn drift(
        kind: ResourceKind,
        id: impl Into<String>,
        instance: impl Into<String>,
        expected: impl Into<String>,
        observed: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            resource_kind: kind,
            resource_id: id.into(),
            platform_instance: instance.into(),
            expected: expected.into(),
            observed: observed.into(),
            drifted: true,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    fn error(kind: ResourceKind, id: impl Into<String>, instance: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            resource_kind: kind,
            resource_id: id.into(),
            platform_instance: instance.into(),
            expected: "ok".to_string(),
            observed: "error".to_string(),
            drifted: true,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Invoked once per drifted result. Implementations MUST NOT block the
/// reconciliation loop for long; errors are logged and otherwise ignored.
#[async_trait]
pub trait DriftCallback: Send + Sync {
    async fn on_drift(&self, result: &ReconciliationResult) -> Result<(), String>;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconcilerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub total_checks: u64,
    pub recent_drift_count: usize,
}

pub struct StateReconciler {
    store: Arc<dyn DataStore>,
    platform: Arc<dyn PlatformAdapter>,
    audit: Arc<AuditLogger>,
    interval_secs: u64,
    max_history: usize,
    history: Mutex<VecDeque<ReconciliationResult>>,
    last_run: Mutex<Option<DateTime<Utc>>>,
    total_checks: Mutex<u64>,
    callbacks: Mutex<Vec<Arc<dyn DriftCallback>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StateReconciler {
    pub fn new(
        store: Arc<dyn DataStore>,
        platform: Arc<dyn PlatformAdapter>,
        audit: Arc<AuditLogger>,
        interval_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            platform,
            audit,
            interval_secs,
            max_history: 1000,
            history: Mutex::new(VecDeque::new()),
            last_run: Mutex::new(None),
            total_checks: Mutex::new(0),
            callbacks: Mutex::new(Vec::new()),
            stop_tx: Mutex::new(None),
            task_handle: Mutex::new(None),
        })
    }

    /// Subscribe a best-effort drift callback. Takes `&Arc<Self>` (rather
    /// than consuming an owned `StateReconciler`) since `new` already
    /// hands back an `Arc` for sharing with the background maintenance
    /// task, and callers may want to register a callback after `start`.
    pub async fn register_callback(self: &Arc<Self>, callback: Arc<dyn DriftCallback>) {
        self.callbacks.lock().await.push(callback);
    }

    pub async fn start(self: &Arc<Self>) {
        let mut stop_guard = self.stop_tx.lock().await;
        if stop_guard.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *stop_guard = Some(tx);
        drop(stop_guard);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(this.interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.run_cycle().await;
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.task_handle.lock().await = Some(handle);
    }

    pub async fn stop(self: &Arc<Self>) {
        let tx = self.stop_tx.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.task_handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Runs one full reconciliation pass: all three checks, never
    /// aborting on a single check's failure.
    pub async fn run_cycle(self: &Arc<Self>) -> Vec<ReconciliationResult> {
        let mut results = Vec::new();
        results.extend(self.check_provisioned_networks().await);
        results.extend(self.check_vm_interfaces().await);
        results.extend(self.check_deployed_vms().await);

        for result in &results {
            self.record(result.clone()).await;
            if result.drifted {
                self.audit.drift_detected(&result.resource_id, &result.detail);
                let callbacks = self.callbacks.lock().await.clone();
                for callback in &callbacks {
                    if let Err(err) = callback.on_drift(result).await {
                        tracing::warn!("drift callback failed: {err}");
                    }
                }
            }
        }

        *self.last_run.lock().await = Some(Utc::now());
        *self.total_checks.lock().await += 1;
        results
    }

    async fn record(&self, result: ReconciliationResult) {
        let mut history = self.history.lock().await;
        history.push_back(result);
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    async fn check_provisioned_networks(&self) -> Vec<ReconciliationResult> {
        let mut results = Vec::new();
        for mapping in self.store.list_provisioned_mappings().await {
            let network = match self.store.get_network(&mapping.network_id).await {
                Some(n) => n,
                None => {
                    results.push(ReconciliationResult::drift(
                        ResourceKind::Network,
                        mapping.network_id.clone(),
                        mapping.platform_instance.clone(),
                        "network definition present",
                        "network definition missing",
                        "network deleted but mapping remains",
                    ));
                    continue;
                }
            };

            let spec = NetworkSpec {
                name: network.name.clone(),
                cidr: network.cidr.clone(),
                vlan_id: network.vlan_id,
                network_type: map_network_type(network.network_type),
            };

            // No platform exposes a dedicated "does this network exist"
            // call; re-asserting via create_network (idempotent by
            // contract) doubles as the existence probe here.
            let reasserted = self
                .platform
                .create_network(&spec, &mapping.platform_config, &mapping.platform_instance)
                .await;

            match reasserted {
                Ok(true) => {
                    results.push(ReconciliationResult::ok(
                        ResourceKind::Network,
                        network.id.clone(),
                        mapping.platform_instance.clone(),
                        "present",
                    ));
                }
                Ok(false) => {
                    results.push(ReconciliationResult::drift(
                        ResourceKind::Network,
                        network.id.clone(),
                        mapping.platform_instance.clone(),
                        "present",
                        "missing",
                        "platform reports network missing",
                    ));
                }
                Err(err) => {
                    results.push(ReconciliationResult::error(
                        ResourceKind::Network,
                        network.id.clone(),
                        mapping.platform_instance.clone(),
                        err.to_string(),
                    ));
                }
            }
        }
        results
    }

    async fn check_vm_interfaces(&self) -> Vec<ReconciliationResult> {
        let mut results = Vec::new();
        let interfaces = self.store.list_interfaces().await;

        let mut groups: HashMap<(String, String, String), Vec<_>> = HashMap::new();
        for interface in interfaces {
            groups
                .entry((
                    interface.platform.clone(),
                    interface.platform_instance.clone(),
                    interface.vm_id.clone(),
                ))
                .or_default()
                .push(interface);
        }

        for ((_, instance, vm_id), persisted) in groups {
            let live = match self.platform.get_vm_interfaces(&vm_id, &instance).await {
                Ok(live) => live,
                Err(err) => {
                    results.push(ReconciliationResult::error(
                        ResourceKind::VmInterface,
                        vm_id.clone(),
                        instance.clone(),
                        err.to_string(),
                    ));
                    continue;
                }
            };

            let live = match live {
                None => {
                    results.push(ReconciliationResult::drift(
                        ResourceKind::VmInterface,
                        vm_id.clone(),
                        instance.clone(),
                        "vm present",
                        "vm missing",
                        "interface missing: vm not found on platform",
                    ));
                    continue;
                }
                Some(live) => live,
            };

            for row in persisted {
                let live_match = live.iter().find(|i| i.index == row.interface_index);
                match live_match {
                    None => {
                        results.push(ReconciliationResult::drift(
                            ResourceKind::VmInterface,
                            row.id.clone(),
                            instance.clone(),
                            format!("interface {}", row.interface_index),
                            "absent",
                            "interface missing",
                        ));
                    }
                    Some(live_iface) if live_iface.ip_address != row.ip_address => {
                        let expected = row
                            .ip_address
                            .map(|ip| ip.to_string())
                            .unwrap_or_else(|| "none".to_string());
                        let observed = live_iface
                            .ip_address
                            .map(|ip| ip.to_string())
                            .unwrap_or_else(|| "none".to_string());

                        if let Some(ip) = live_iface.ip_address {
                            let _ = self.store.update_interface_ip(&row.id, ip).await;
                        }

                        results.push(ReconciliationResult::drift(
                            ResourceKind::VmInterface,
                            row.id.clone(),
                            instance.clone(),
                            expected,
                            observed,
                            "IP drifted",
                        ));
                    }
                    Some(_) => {
                        results.push(ReconciliationResult::ok(
                            ResourceKind::VmInterface,
                            row.id.clone(),
                            instance.clone(),
                            "present",
                        ));
                    }
                }
            }
        }
        results
    }

    async fn check_deployed_vms(&self) -> Vec<ReconciliationResult> {
        let mut results = Vec::new();
        for vm in self.store.list_deployed_vms().await {
            if vm.status != VmStatus::Deployed {
                continue;
            }

            let live = match self.platform.get_vm_interfaces(&vm.vm_id, &vm.platform_instance).await {
                Ok(live) => live,
                Err(err) => {
                    results.push(ReconciliationResult::error(
                        ResourceKind::DeployedVm,
                        vm.id.clone(),
                        vm.platform_instance.clone(),
                        err.to_string(),
                    ));
                    continue;
                }
            };

            match live {
                None => {
                    results.push(ReconciliationResult::drift(
                        ResourceKind::DeployedVm,
                        vm.id.clone(),
                        vm.platform_instance.clone(),
                        "vm present",
                        "vm missing",
                        "VM missing",
                    ));
                }
                Some(interfaces) => {
                    let primary_ip = interfaces.iter().find_map(|i| i.ip_address);
                    match primary_ip {
                        Some(ip) if Some(ip) != vm.ip_address => {
                            let _ = self.store.update_vm_ip(&vm.id, ip).await;
                            results.push(ReconciliationResult::drift(
                                ResourceKind::DeployedVm,
                                vm.id.clone(),
                                vm.platform_instance.clone(),
                                vm.ip_address.map(|ip| ip.to_string()).unwrap_or_else(|| "none".to_string()),
                                ip.to_string(),
                                "IP drifted",
                            ));
                        }
                        _ => {
                            results.push(ReconciliationResult::ok(
                                ResourceKind::DeployedVm,
                                vm.id.clone(),
                                vm.platform_instance.clone(),
                                "present",
                            ));
                        }
                    }
                }
            }
        }
        results
    }

    pub async fn status(&self) -> ReconcilerStatus {
        let history = self.history.lock().await;
        ReconcilerStatus {
            running: self.stop_tx.lock().await.is_some(),
            interval_secs: self.interval_secs,
            last_run: *self.last_run.lock().await,
            total_checks: *self.total_checks.lock().await,
            recent_drift_count: history.iter().filter(|r| r.drifted).count(),
        }
    }

    pub async fn drift_history(&self, limit: usize) -> Vec<ReconciliationResult> {
        let history = self.history.lock().await;
        history
            .iter()
            .filter(|r| r.drifted)
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}

fn map_network_type(network_type: glassdome_store::NetworkType) -> PlatformNetworkType {
    match network_type {
        glassdome_store::NetworkType::Isolated => PlatformNetworkType::Isolated,
        glassdome_store::NetworkType::Nat => PlatformNetworkType::Nat,
        glassdome_store::NetworkType::Bridged => PlatformNetworkType::Bridged,
        glassdome_store::NetworkType::Routed => PlatformNetworkType::Routed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glassdome_platform::{LocalSimAdapter, VmSizing};
    use glassdome_store::{DeployedVm, InMemoryStore, IpMethod, PlatformNetworkMapping, VmInterfaceRow};
    use std::net::Ipv4Addr;

    fn reconciler() -> (Arc<StateReconciler>, Arc<InMemoryStore>, Arc<LocalSimAdapter>) {
        let store = Arc::new(InMemoryStore::new());
        let platform = Arc::new(LocalSimAdapter::new());
        let audit = Arc::new(AuditLogger::new_noop());
        let reconciler = StateReconciler::new(
            store.clone() as Arc<dyn DataStore>,
            platform.clone() as Arc<dyn PlatformAdapter>,
            audit,
            30,
        );
        (reconciler, store, platform)
    }

    #[tokio::test]
    async fn s6_detects_and_heals_ip_drift() {
        let (reconciler, store, platform) = reconciler();

        let vm_id = platform
            .create_vm(
                "01",
                "tmpl-9000",
                &VmSizing {
                    cpu_cores: 2,
                    memory_mb: 2048,
                    disk_gb: 20,
                },
                Some(Ipv4Addr::new(10, 0, 0, 5)),
            )
            .await
            .unwrap();

        store
            .create_vm(DeployedVm {
                id: "vm-row-1".to_string(),
                lab_id: "lab-1".to_string(),
                name: "web-01".to_string(),
                vm_id: vm_id.clone(),
                platform: "proxmox".to_string(),
                platform_instance: "01".to_string(),
                os_type: "ubuntu".to_string(),
                template_id: "tmpl-9000".to_string(),
                cpu_cores: 2,
                memory_mb: 2048,
                disk_gb: 20,
                status: VmStatus::Deployed,
                ip_address: Some(Ipv4Addr::new(10, 0, 0, 5)),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        platform.drift_vm_ip(&vm_id, Ipv4Addr::new(10, 0, 0, 9));

        let results = reconciler.run_cycle().await;
        let drift = results
            .iter()
            .find(|r| r.resource_kind == ResourceKind::DeployedVm && r.drifted)
            .expect("expected a drifted deployed-vm result");
        assert_eq!(drift.expected, "10.0.0.5");
        assert_eq!(drift.observed, "10.0.0.9");

        let updated = store.get_vm("vm-row-1").await.unwrap();
        assert_eq!(updated.ip_address, Some(Ipv4Addr::new(10, 0, 0, 9)));
    }

    #[tokio::test]
    async fn missing_vm_is_reported_as_drift() {
        let (reconciler, store, platform) = reconciler();
        let vm_id = platform
            .create_vm(
                "01",
                "tmpl-9000",
                &VmSizing {
                    cpu_cores: 1,
                    memory_mb: 512,
                    disk_gb: 10,
                },
                None,
            )
            .await
            .unwrap();

        store
            .create_vm(DeployedVm {
                id: "vm-row-2".to_string(),
                lab_id: "lab-1".to_string(),
                name: "gone-01".to_string(),
                vm_id: vm_id.clone(),
                platform: "proxmox".to_string(),
                platform_instance: "01".to_string(),
                os_type: "ubuntu".to_string(),
                template_id: "tmpl-9000".to_string(),
                cpu_cores: 1,
                memory_mb: 512,
                disk_gb: 10,
                status: VmStatus::Deployed,
                ip_address: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        platform.remove_vm(&vm_id);

        let results = reconciler.run_cycle().await;
        let drift = results
            .iter()
            .find(|r| r.resource_kind == ResourceKind::DeployedVm)
            .unwrap();
        assert!(drift.drifted);
        assert_eq!(drift.detail, "VM missing");
    }

    #[tokio::test]
    async fn network_deleted_but_mapping_remains_is_reported() {
        let (reconciler, store, _platform) = reconciler();
        store
            .create_mapping(PlatformNetworkMapping {
                id: "map-1".to_string(),
                network_id: "ghost-network".to_string(),
                platform: "proxmox".to_string(),
                platform_instance: "01".to_string(),
                platform_config: serde_json::json!({}),
                provisioned: true,
                provision_error: None,
            })
            .await
            .unwrap();

        let results = reconciler.run_cycle().await;
        let drift = results
            .iter()
            .find(|r| r.resource_kind == ResourceKind::Network)
            .unwrap();
        assert!(drift.drifted);
        assert_eq!(drift.detail, "network deleted but mapping remains");
    }

    #[tokio::test]
    async fn missing_interface_is_reported_without_healing() {
        let (reconciler, store, platform) = reconciler();
        let vm_id = platform
            .create_vm(
                "01",
                "tmpl-9000",
                &VmSizing {
                    cpu_cores: 1,
                    memory_mb: 512,
                    disk_gb: 10,
                },
                None,
            )
            .await
            .unwrap();

        store
            .upsert_interface(VmInterfaceRow {
                id: "iface-1".to_string(),
                vm_id: vm_id.clone(),
                platform: "proxmox".to_string(),
                platform_instance: "01".to_string(),
                interface_index: 7,
                interface_name: Some("net7".to_string()),
                mac_address: "52:54:00:aa:bb:cc".to_string(),
                ip_address: Some(Ipv4Addr::new(10, 2, 0, 5)),
                ip_method: IpMethod::Static,
                subnet_mask: None,
                gateway: None,
                platform_config: serde_json::json!({}),
                connected: true,
            })
            .await
            .unwrap();

        let results = reconciler.run_cycle().await;
        let drift = results
            .iter()
            .find(|r| r.resource_kind == ResourceKind::VmInterface)
            .unwrap();
        assert!(drift.drifted);
        assert_eq!(drift.detail, "interface missing");
    }

    #[tokio::test]
    async fn status_reports_run_counts_and_recent_drift() {
        let (reconciler, _store, _platform) = reconciler();
        reconciler.run_cycle().await;
        reconciler.run_cycle().await;
        let status = reconciler.status().await;
        assert_eq!(status.total_checks, 2);
    }

    struct CollectingCallback {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DriftCallback for CollectingCallback {
        async fn on_drift(&self, result: &ReconciliationResult) -> Result<(), String> {
            self.seen.lock().await.push(result.resource_id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn registered_callback_fires_on_drift() {
        let (reconciler, store, _platform) = reconciler();
        let callback = Arc::new(CollectingCallback {
            seen: Mutex::new(Vec::new()),
        });
        reconciler.register_callback(callback.clone()).await;

        store
            .create_mapping(PlatformNetworkMapping {
                id: "map-1".to_string(),
                network_id: "ghost-network".to_string(),
                platform: "proxmox".to_string(),
                platform_instance: "01".to_string(),
                platform_config: serde_json::json!({}),
                provisioned: true,
                provision_error: None,
            })
            .await
            .unwrap();

        reconciler.run_cycle().await;

        let seen = callback.seen.lock().await;
        assert_eq!(seen.as_slice(), ["ghost-network"]);
    }
}
