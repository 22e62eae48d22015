//! Hot Spare Pool: keeps a minimum population of ready, pre-installed VMs
//! per OS family so a mission can acquire one in constant time.
//!
//! Grounded in `glassdome.reaper.hot_spare.HotSparePool` for the
//! lifecycle/maintenance/acquire shape, and in
//! `glassdome-store::HotSpareStore::acquire_ready_spare` for the
//! race-free selection itself (this crate never touches the spare map
//! directly - it only calls through the store trait).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use glassdome_audit::AuditLogger;
use glassdome_platform::{PlatformAdapter, VmSizing};
use glassdome_store::{DataStore, HotSpare, SpareStatus};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("platform error: {0}")]
    Platform(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("ip range exhausted for family {0}")]
    IpRangeExhausted(String),
    #[error("spare not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Per-OS-family pool configuration. Defaults mirror the original
/// `POOL_CONFIG_PARAMS` (min=5, max=8) for `ubuntu` and `windows10`.
#[derive(Debug, Clone)]
pub struct FamilyConfig {
    pub platform_instance: String,
    pub os_family: String,
    pub template_id: String,
    pub min_spares: u32,
    pub max_spares: u32,
    pub ip_range_start: Ipv4Addr,
    pub ip_range_end: Ipv4Addr,
    pub sizing: VmSizing,
    pub health_check_interval_secs: u64,
}

impl FamilyConfig {
    fn key(&self) -> (String, String) {
        (self.platform_instance.clone(), self.os_family.clone())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FamilyStatus {
    pub platform_instance: String,
    pub os_family: String,
    pub ready: u32,
    pub provisioning: u32,
    pub booting: u32,
    pub in_use: u32,
    pub failed: u32,
    pub min_spares: u32,
    pub max_spares: u32,
}

/// Manages the hot spare population for every configured OS family on
/// every configured platform instance.
pub struct HotSparePool {
    store: Arc<dyn DataStore>,
    platform: Arc<dyn PlatformAdapter>,
    audit: Arc<AuditLogger>,
    configs: Vec<FamilyConfig>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl HotSparePool {
    pub fn new(
        store: Arc<dyn DataStore>,
        platform: Arc<dyn PlatformAdapter>,
        audit: Arc<AuditLogger>,
        configs: Vec<FamilyConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            platform,
            audit,
            configs,
            stop_tx: Mutex::new(None),
            task_handle: Mutex::new(None),
        })
    }

    fn config_for(&self, platform_instance: &str, os_family: &str) -> Option<&FamilyConfig> {
        self.configs
            .iter()
            .find(|c| c.platform_instance == platform_instance && c.os_family == os_family)
    }

    /// Idempotent: calling `start` twice while already running is a no-op.
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
            let tick = this
                .configs
                .iter()
                .map(|c| c.health_check_interval_secs)
                .min()
                .unwrap_or(30);
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.run_maintenance_cycle().await;
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

    /// Idempotent: calling `stop` when not running is a no-op.
    pub async fn stop(self: &Arc<Self>) {
        let tx = self.stop_tx.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.task_handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn run_maintenance_cycle(self: &Arc<Self>) {
        for config in &self.configs {
            self.replenish_family(config).await;
            self.health_check_family(config).await;
        }
    }

    async fn current_non_terminal_count(&self, config: &FamilyConfig) -> u32 {
        self.store
            .list_spares_by_family(&config.platform_instance, &config.os_family)
            .await
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    SpareStatus::Ready | SpareStatus::Provisioning | SpareStatus::Booting
                )
            })
            .count() as u32
    }

    async fn allocate_free_ip(&self, config: &FamilyConfig) -> Result<Ipv4Addr> {
        let used: std::collections::HashSet<Ipv4Addr> = self
            .store
            .list_spares_by_family(&config.platform_instance, &config.os_family)
            .await
            .iter()
            .filter(|s| !matches!(s.status, SpareStatus::Failed | SpareStatus::Destroying))
            .filter_map(|s| s.ip_address)
            .collect();

        let start: u32 = config.ip_range_start.into();
        let end: u32 = config.ip_range_end.into();
        for octets in start..=end {
            let candidate = Ipv4Addr::from(octets);
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(PoolError::IpRangeExhausted(config.os_family.clone()))
    }

    async fn replenish_family(self: &Arc<Self>, config: &FamilyConfig) {
        let deficit = config
            .min_spares
            .saturating_sub(self.current_non_terminal_count(config).await);

        for _ in 0..deficit {
            self.provision_one(config).await;
        }
    }

    async fn provision_one(self: &Arc<Self>, config: &FamilyConfig) {
        let ip = match self.allocate_free_ip(config).await {
            Ok(ip) => ip,
            Err(err) => {
                self.audit
                    .spare_provisioning_failed(&config.os_family, &err.to_string());
                return;
            }
        };

        let vm_id = match self.platform.next_vm_id(&config.platform_instance).await {
            Ok(id) => id,
            Err(err) => {
                self.audit
                    .spare_provisioning_failed(&config.os_family, &err.to_string());
                return;
            }
        };

        let spare_id = Uuid::new_v4().to_string();
        let spare = HotSpare {
            id: spare_id.clone(),
            vm_id: vm_id.clone(),
            name: format!("spare-{}-{}", config.os_family, &spare_id[..8]),
            platform: "proxmox".to_string(),
            platform_instance: config.platform_instance.clone(),
            node: config.platform_instance.clone(),
            os_type: config.os_family.clone(),
            template_id: config.template_id.clone(),
            ip_address: Some(ip),
            status: SpareStatus::Provisioning,
            assigned_to_mission: None,
            last_health_check: None,
            health_check_failures: 0,
            created_at: Utc::now(),
            ready_at: None,
            assigned_at: None,
        };

        if self.store.insert_spare(spare).await.is_err() {
            return;
        }

        match self
            .platform
            .create_vm(&config.platform_instance, &config.template_id, &config.sizing, Some(ip))
            .await
        {
            Ok(_) => {
                let _ = self.store.mark_ready(&spare_id, Some(ip)).await;
                self.audit.spare_provisioned(&spare_id, &config.os_family);
            }
            Err(err) => {
                let _ = self.store.mark_failed(&spare_id).await;
                self.audit.spare_provisioning_failed(&spare_id, &err.to_string());
            }
        }
    }

    async fn health_check_family(&self, config: &FamilyConfig) {
        let spares = self
            .store
            .list_spares_by_family(&config.platform_instance, &config.os_family)
            .await;

        for spare in spares.into_iter().filter(|s| s.status == SpareStatus::Ready) {
            let Some(ip) = spare.ip_address else { continue };
            let reachable = self.platform.ping(ip).await;
            if let Ok(Some(_failed)) = self.store.record_health_check(&spare.id, reachable).await {
                self.audit
                    .drift_detected(&spare.id, "hot spare failed 3 consecutive health checks");
            }
        }
    }

    /// Acquire a ready spare for `os_family` on any configured platform
    /// instance matching it, claim it for `mission_id`, and immediately
    /// dispatch non-blocking replacement provisioning.
    pub async fn acquire(self: &Arc<Self>, os_family: &str, mission_id: &str) -> Option<HotSpare> {
        for config in self.configs.iter().filter(|c| c.os_family == os_family) {
            if let Some(spare) = self
                .store
                .acquire_ready_spare(&config.platform_instance, os_family, mission_id)
                .await
            {
                self.audit.spare_acquired(&spare.id, mission_id);
                let this = Arc::clone(self);
                let config = config.clone();
                tokio::spawn(async move {
                    this.dispatch_replacement(&config).await;
                });
                return Some(spare);
            }
        }
        None
    }

    /// Re-checks the current count before provisioning - an acquisition
    /// spike across many callers must not over-provision past the
    /// configured minimum.
    async fn dispatch_replacement(self: &Arc<Self>, config: &FamilyConfig) {
        let count = self.current_non_terminal_count(config).await;
        if count >= config.min_spares {
            return;
        }
        self.provision_one(config).await;
    }

    /// Transition a spare to destroying, stop+delete it on the platform,
    /// then drop the row. `destroy=false` (reset) is not yet implemented
    /// and falls through to destroy.
    pub async fn release(&self, spare_id: &str, _destroy: bool) -> Result<()> {
        let spare = self
            .store
            .get_spare(spare_id)
            .await
            .ok_or_else(|| PoolError::NotFound(spare_id.to_string()))?;

        self.platform
            .stop_vm(&spare.platform_instance, &spare.vm_id)
            .await
            .map_err(|e| PoolError::Platform(e.to_string()))?;
        self.platform
            .delete_vm(&spare.platform_instance, &spare.vm_id)
            .await
            .map_err(|e| PoolError::Platform(e.to_string()))?;

        self.store
            .release(spare_id)
            .await
            .map_err(|e| PoolError::Store(e.to_string()))?;
        self.audit.spare_released(spare_id);
        Ok(())
    }

    pub async fn pool_status(&self) -> Vec<FamilyStatus> {
        let mut counts: HashMap<(String, String), FamilyStatus> = HashMap::new();
        for config in &self.configs {
            counts.insert(
                config.key(),
                FamilyStatus {
                    platform_instance: config.platform_instance.clone(),
                    os_family: config.os_family.clone(),
                    ready: 0,
                    provisioning: 0,
                    booting: 0,
                    in_use: 0,
                    failed: 0,
                    min_spares: config.min_spares,
                    max_spares: config.max_spares,
                },
            );
        }

        for config in &self.configs {
            let spares = self
                .store
                .list_spares_by_family(&config.platform_instance, &config.os_family)
                .await;
            if let Some(status) = counts.get_mut(&config.key()) {
                for spare in &spares {
                    match spare.status {
                        SpareStatus::Ready => status.ready += 1,
                        SpareStatus::Provisioning => status.provisioning += 1,
                        SpareStatus::Booting => status.booting += 1,
                        SpareStatus::InUse => status.in_use += 1,
                        SpareStatus::Failed => status.failed += 1,
                        SpareStatus::Resetting | SpareStatus::Destroying => {}
                    }
                }
            }
        }

        counts.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glassdome_platform::LocalSimAdapter;
    use glassdome_store::InMemoryStore;

    fn ubuntu_config() -> FamilyConfig {
        FamilyConfig {
            platform_instance: "01".to_string(),
            os_family: "ubuntu".to_string(),
            template_id: "tmpl-9000".to_string(),
            min_spares: 2,
            max_spares: 4,
            ip_range_start: Ipv4Addr::new(10, 1, 3, 10),
            ip_range_end: Ipv4Addr::new(10, 1, 3, 50),
            sizing: VmSizing {
                cpu_cores: 2,
                memory_mb: 2048,
                disk_gb: 20,
            },
            health_check_interval_secs: 30,
        }
    }

    fn test_pool() -> Arc<HotSparePool> {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
        let platform: Arc<dyn PlatformAdapter> = Arc::new(LocalSimAdapter::new());
        let audit = Arc::new(AuditLogger::new_noop());
        HotSparePool::new(store, platform, audit, vec![ubuntu_config()])
    }

    #[tokio::test]
    async fn replenish_fills_up_to_minimum() {
        let pool = test_pool();
        pool.replenish_family(&ubuntu_config()).await;
        let status = pool.pool_status().await;
        let ubuntu = status.iter().find(|s| s.os_family == "ubuntu").unwrap();
        assert_eq!(ubuntu.ready, 2);
    }

    #[tokio::test]
    async fn acquire_returns_none_when_pool_empty() {
        let pool = test_pool();
        assert!(pool.acquire("ubuntu", "mission-1").await.is_none());
    }

    #[tokio::test]
    async fn acquire_claims_a_ready_spare_and_dispatches_replacement() {
        let pool = test_pool();
        pool.replenish_family(&ubuntu_config()).await;

        let spare = pool.acquire("ubuntu", "mission-1").await;
        assert!(spare.is_some());
        assert_eq!(spare.unwrap().assigned_to_mission, Some("mission-1".to_string()));

        // allow the fire-and-forget replacement task to run
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let status = pool.pool_status().await;
        let ubuntu = status.iter().find(|s| s.os_family == "ubuntu").unwrap();
        assert_eq!(ubuntu.ready + ubuntu.provisioning, 2);
        assert_eq!(ubuntu.in_use, 1);
    }

    #[tokio::test]
    async fn release_stops_and_deletes_then_drops_row() {
        let pool = test_pool();
        pool.replenish_family(&ubuntu_config()).await;
        let spare = pool.acquire("ubuntu", "mission-1").await.unwrap();

        pool.release(&spare.id, true).await.unwrap();
        let status = pool.pool_status().await;
        let ubuntu = status.iter().find(|s| s.os_family == "ubuntu").unwrap();
        assert_eq!(ubuntu.in_use, 0);
    }

    #[tokio::test]
    async fn three_consecutive_ping_failures_fail_the_spare() {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
        let platform = Arc::new(LocalSimAdapter::new());
        let audit = Arc::new(AuditLogger::new_noop());
        let config = ubuntu_config();

        let pool = HotSparePool::new(
            store.clone(),
            platform.clone() as Arc<dyn PlatformAdapter>,
            audit,
            vec![config.clone()],
        );
        pool.replenish_family(&config).await;

        let ready = store
            .list_spares_by_family(&config.platform_instance, &config.os_family)
            .await;
        let ip = ready[0].ip_address.unwrap();
        platform.set_unreachable(ip);

        for _ in 0..3 {
            pool.health_check_family(&config).await;
        }

        let status = pool.pool_status().await;
        let ubuntu = status.iter().find(|s| s.os_family == "ubuntu").unwrap();
        assert_eq!(ubuntu.failed, 1);
    }
}
