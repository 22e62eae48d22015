//! Layered configuration: built-in defaults, optionally overridden by a
//! TOML file. CLI flags (handled in `main.rs`) are the final layer.
//!
//! Unknown keys in the file are ignored rather than rejected, same
//! tolerance the spec requires of `LabSpec` deserialization - a config
//! file written against an older binary should still load.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use glassdome_platform::VmSizing;
use glassdome_pool::FamilyConfig;

fn default_platform_instance() -> String {
    "01".to_string()
}

fn default_reconciler_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlassdomeConfig {
    /// Which platform instance the CLI's single adapter represents.
    pub platform_instance: String,
    /// State reconciler cadence, seconds.
    pub reconciler_interval_secs: u64,
    /// Hot spare pool family definitions. Empty means the pool has
    /// nothing to maintain - `pool-status`/`acquire` will simply report
    /// zero families.
    pub pool: Vec<PoolFamilyToml>,
}

impl Default for GlassdomeConfig {
    fn default() -> Self {
        Self {
            platform_instance: default_platform_instance(),
            reconciler_interval_secs: default_reconciler_interval(),
            pool: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolFamilyToml {
    pub os_family: String,
    pub template_id: String,
    #[serde(default = "default_min_spares")]
    pub min_spares: u32,
    #[serde(default = "default_max_spares")]
    pub max_spares: u32,
    pub ip_range_start: Ipv4Addr,
    pub ip_range_end: Ipv4Addr,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

fn default_min_spares() -> u32 {
    5
}
fn default_max_spares() -> u32 {
    8
}
fn default_cpu_cores() -> u32 {
    2
}
fn default_memory_mb() -> u32 {
    2048
}
fn default_disk_gb() -> u32 {
    20
}
fn default_health_check_interval() -> u64 {
    30
}

impl GlassdomeConfig {
    /// Load defaults, then overlay a TOML file if `path` is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn family_configs(&self, platform_instance: &str) -> Vec<FamilyConfig> {
        self.pool
            .iter()
            .map(|f| FamilyConfig {
                platform_instance: platform_instance.to_string(),
                os_family: f.os_family.clone(),
                template_id: f.template_id.clone(),
                min_spares: f.min_spares,
                max_spares: f.max_spares,
                ip_range_start: f.ip_range_start,
                ip_range_end: f.ip_range_end,
                sizing: VmSizing {
                    cpu_cores: f.cpu_cores,
                    memory_mb: f.memory_mb,
                    disk_gb: f.disk_gb,
                },
                health_check_interval_secs: f.health_check_interval_secs,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_pool_families() {
        let config = GlassdomeConfig::default();
        assert_eq!(config.platform_instance, "01");
        assert!(config.pool.is_empty());
    }

    #[test]
    fn parses_a_minimal_toml_file() {
        let toml_src = r#"
            platform_instance = "east-1"

            [[pool]]
            os_family = "ubuntu"
            template_id = "tmpl-9000"
            ip_range_start = "10.1.3.10"
            ip_range_end = "10.1.3.50"
        "#;
        let config: GlassdomeConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.platform_instance, "east-1");
        assert_eq!(config.pool.len(), 1);
        assert_eq!(config.pool[0].min_spares, 5);
        assert_eq!(config.pool[0].max_spares, 8);

        let families = config.family_configs(&config.platform_instance);
        assert_eq!(families[0].platform_instance, "east-1");
        assert_eq!(families[0].sizing.cpu_cores, 2);
    }
}
