use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Isolated,
    Nat,
    Bridged,
    Routed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub id: String,
    pub name: String,
    pub cidr: String,
    pub vlan_id: Option<u16>,
    pub gateway: Ipv4Addr,
    pub network_type: NetworkType,
    pub dhcp_enabled: bool,
    pub dhcp_range_start: Option<Ipv4Addr>,
    pub dhcp_range_end: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lab_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformNetworkMapping {
    pub id: String,
    pub network_id: String,
    pub platform: String,
    pub platform_instance: String,
    pub platform_config: serde_json::Value,
    pub provisioned: bool,
    pub provision_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Deployed,
    Migrating,
    Stopped,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployedVm {
    pub id: String,
    pub lab_id: String,
    pub name: String,
    pub vm_id: String,
    pub platform: String,
    pub platform_instance: String,
    pub os_type: String,
    pub template_id: String,
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub status: VmStatus,
    pub ip_address: Option<Ipv4Addr>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpMethod {
    Dhcp,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInterfaceRow {
    pub id: String,
    pub vm_id: String,
    pub platform: String,
    pub platform_instance: String,
    pub interface_index: u32,
    pub interface_name: Option<String>,
    pub mac_address: String,
    pub ip_address: Option<Ipv4Addr>,
    pub ip_method: IpMethod,
    pub subnet_mask: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    pub platform_config: serde_json::Value,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpareStatus {
    Provisioning,
    Booting,
    Ready,
    InUse,
    Resetting,
    Failed,
    Destroying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotSpare {
    pub id: String,
    pub vm_id: String,
    pub name: String,
    pub platform: String,
    pub platform_instance: String,
    pub node: String,
    pub os_type: String,
    pub template_id: String,
    pub ip_address: Option<Ipv4Addr>,
    pub status: SpareStatus,
    pub assigned_to_mission: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_check_failures: u32,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub assigned_at: Option<DateTime<Utc>>,
}
