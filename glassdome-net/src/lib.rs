//! Deterministic, non-overlapping IP address planning for lab networks.
//!
//! Pure bookkeeping - no platform I/O. Ported from Glassdome's
//! `NetworkAddressAllocator`. Single-writer: callers that share an
//! allocator across tasks should guard it with their own lock (see
//! `glassdome-orchestrator`, which wraps it in a `tokio::sync::Mutex`).

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("maximum number of concurrent labs (254) reached")]
    PoolExhausted,
    #[error("no {0:?} subnet in lab {1}")]
    NoSuchSubnet(SubnetRole, String),
}

pub type Result<T> = std::result::Result<T, AllocatorError>;

/// Roles a lab subnet can play. Order mirrors the source enum; values are
/// lowercase to match the data the original stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetRole {
    Public,
    Attack,
    Dmz,
    Internal,
    Management,
}

impl SubnetRole {
    /// Third-octet offset within the lab's /16 VPC.
    fn offset(self) -> u8 {
        match self {
            SubnetRole::Public => 0,
            SubnetRole::Dmz => 1,
            SubnetRole::Internal => 2,
            SubnetRole::Management => 3,
            SubnetRole::Attack => 100,
        }
    }

    /// Default set of subnets a full lab allocation requests.
    pub fn standard_set() -> Vec<SubnetRole> {
        vec![
            SubnetRole::Public,
            SubnetRole::Attack,
            SubnetRole::Dmz,
            SubnetRole::Internal,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetAllocation {
    pub role: SubnetRole,
    pub cidr: String,
    pub gateway: Ipv4Addr,
    pub dhcp_start: Ipv4Addr,
    pub dhcp_end: Ipv4Addr,
    pub is_public: bool,
    // first three octets of the /24, kept to compute VM addresses cheaply
    net_a: u8,
    net_b: u8,
    net_c: u8,
}

impl SubnetAllocation {
    fn new(net_a: u8, net_b: u8, net_c: u8, role: SubnetRole) -> Self {
        Self {
            role,
            cidr: format!("{net_a}.{net_b}.{net_c}.0/24"),
            gateway: Ipv4Addr::new(net_a, net_b, net_c, 1),
            dhcp_start: Ipv4Addr::new(net_a, net_b, net_c, 100),
            dhcp_end: Ipv4Addr::new(net_a, net_b, net_c, 200),
            is_public: role == SubnetRole::Public,
            net_a,
            net_b,
            net_c,
        }
    }

    /// IP address for the VM at `index` within this subnet. `.1`-`.9` are
    /// reserved for infrastructure; VMs start at `.10`.
    pub fn vm_ip(&self, index: u8) -> Ipv4Addr {
        Ipv4Addr::new(self.net_a, self.net_b, self.net_c, 10 + index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabNetworkAllocation {
    pub lab_id: String,
    pub lab_number: u8,
    pub vpc_cidr: String,
    pub subnets: HashMap<SubnetRole, SubnetAllocation>,
}

impl LabNetworkAllocation {
    pub fn subnet(&self, role: SubnetRole) -> Option<&SubnetAllocation> {
        self.subnets.get(&role)
    }

    pub fn vm_ip(&self, role: SubnetRole, index: u8) -> Result<Ipv4Addr> {
        self.subnets
            .get(&role)
            .map(|s| s.vm_ip(index))
            .ok_or_else(|| AllocatorError::NoSuchSubnet(role, self.lab_id.clone()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocatorStatistics {
    pub total_allocations: usize,
    pub used_lab_numbers: Vec<u8>,
    pub available_slots: usize,
}

/// Allocates non-overlapping `10.0.0.0/8` address space to labs.
///
/// Address scheme: VPC `10.<lab_number>.0.0/16`; subnets
/// `10.<lab_number>.<offset>.0/24` with offsets public=0, dmz=1,
/// internal=2, management=3, attack=100. Allows up to 254 concurrent
/// labs.
#[derive(Default)]
pub struct NetworkAllocator {
    allocations: HashMap<String, LabNetworkAllocation>,
    used_lab_numbers: HashSet<u8>,
    next_lab_number: u8,
}

impl NetworkAllocator {
    pub fn new() -> Self {
        Self {
            allocations: HashMap::new(),
            used_lab_numbers: HashSet::new(),
            next_lab_number: 1,
        }
    }

    /// Allocate (or return the existing) network set for a lab. Idempotent
    /// per `lab_id`.
    pub fn allocate_lab_networks(
        &mut self,
        lab_id: impl Into<String>,
        roles: &[SubnetRole],
    ) -> Result<LabNetworkAllocation> {
        let lab_id = lab_id.into();
        if let Some(existing) = self.allocations.get(&lab_id) {
            tracing::info!(lab_id = %lab_id, "returning existing network allocation");
            return Ok(existing.clone());
        }

        let lab_number = self.next_lab_number()?;
        let vpc_cidr = format!("10.{lab_number}.0.0/16");

        let roles = if roles.is_empty() {
            SubnetRole::standard_set()
        } else {
            roles.to_vec()
        };

        let mut subnets = HashMap::new();
        for role in roles {
            let offset = role.offset();
            subnets.insert(role, SubnetAllocation::new(10, lab_number, offset, role));
        }

        let allocation = LabNetworkAllocation {
            lab_id: lab_id.clone(),
            lab_number,
            vpc_cidr,
            subnets,
        };

        tracing::info!(lab_id = %lab_id, vpc_cidr = %allocation.vpc_cidr, "allocated lab networks");
        self.used_lab_numbers.insert(lab_number);
        self.allocations.insert(lab_id, allocation.clone());
        Ok(allocation)
    }

    /// Simpler single-/24 scheme for Proxmox-style VLAN labs: the VLAN id
    /// becomes the second octet directly.
    pub fn allocate_vlan_network(
        &mut self,
        lab_id: impl Into<String>,
        vlan_id: u8,
    ) -> Result<LabNetworkAllocation> {
        let lab_id = lab_id.into();
        if let Some(existing) = self.allocations.get(&lab_id) {
            return Ok(existing.clone());
        }

        let vpc_cidr = format!("10.{vlan_id}.0.0/24");
        let mut subnets = HashMap::new();
        subnets.insert(
            SubnetRole::Internal,
            SubnetAllocation::new(10, vlan_id, 0, SubnetRole::Internal),
        );

        let allocation = LabNetworkAllocation {
            lab_id: lab_id.clone(),
            lab_number: vlan_id,
            vpc_cidr,
            subnets,
        };

        tracing::info!(lab_id = %lab_id, vlan_id, "allocated proxmox vlan network");
        self.used_lab_numbers.insert(vlan_id);
        self.allocations.insert(lab_id, allocation.clone());
        Ok(allocation)
    }

    pub fn get_allocation(&self, lab_id: &str) -> Option<&LabNetworkAllocation> {
        self.allocations.get(lab_id)
    }

    pub fn release_lab_networks(&mut self, lab_id: &str) -> bool {
        match self.allocations.remove(lab_id) {
            Some(allocation) => {
                self.used_lab_numbers.remove(&allocation.lab_number);
                tracing::info!(lab_id = %lab_id, "released network allocation");
                true
            }
            None => false,
        }
    }

    fn next_lab_number(&mut self) -> Result<u8> {
        if self.used_lab_numbers.len() >= 254 {
            return Err(AllocatorError::PoolExhausted);
        }

        // next_lab_number is 1-based; search forward, wrapping once.
        let start = self.next_lab_number;
        loop {
            if !self.used_lab_numbers.contains(&self.next_lab_number) {
                let assigned = self.next_lab_number;
                self.next_lab_number = if assigned == 254 { 1 } else { assigned + 1 };
                return Ok(assigned);
            }
            self.next_lab_number = if self.next_lab_number == 254 {
                1
            } else {
                self.next_lab_number + 1
            };
            if self.next_lab_number == start {
                return Err(AllocatorError::PoolExhausted);
            }
        }
    }

    pub fn statistics(&self) -> AllocatorStatistics {
        let mut used: Vec<u8> = self.used_lab_numbers.iter().copied().collect();
        used.sort_unstable();
        AllocatorStatistics {
            total_allocations: self.allocations.len(),
            available_slots: 254usize.saturating_sub(used.len()),
            used_lab_numbers: used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_allocates_expected_cidrs_and_vm_ip() {
        let mut allocator = NetworkAllocator::new();
        let roles = [
            SubnetRole::Public,
            SubnetRole::Attack,
            SubnetRole::Dmz,
            SubnetRole::Internal,
        ];
        let allocation = allocator.allocate_lab_networks("L1", &roles).unwrap();

        assert_eq!(allocation.lab_number, 1);
        assert_eq!(allocation.vpc_cidr, "10.1.0.0/16");
        assert_eq!(allocation.subnet(SubnetRole::Public).unwrap().cidr, "10.1.0.0/24");
        assert_eq!(allocation.subnet(SubnetRole::Attack).unwrap().cidr, "10.1.100.0/24");
        assert_eq!(allocation.subnet(SubnetRole::Dmz).unwrap().cidr, "10.1.1.0/24");
        assert_eq!(allocation.subnet(SubnetRole::Internal).unwrap().cidr, "10.1.2.0/24");

        let vm_ip = allocation.vm_ip(SubnetRole::Attack, 0).unwrap();
        assert_eq!(vm_ip, Ipv4Addr::new(10, 1, 100, 10));
    }

    #[test]
    fn allocation_is_idempotent_per_lab() {
        let mut allocator = NetworkAllocator::new();
        let first = allocator
            .allocate_lab_networks("L1", &SubnetRole::standard_set())
            .unwrap();
        let second = allocator
            .allocate_lab_networks("L1", &SubnetRole::standard_set())
            .unwrap();
        assert_eq!(first.lab_number, second.lab_number);
        assert_eq!(first.vpc_cidr, second.vpc_cidr);
    }

    #[test]
    fn distinct_labs_get_disjoint_vpcs() {
        let mut allocator = NetworkAllocator::new();
        let a = allocator
            .allocate_lab_networks("A", &SubnetRole::standard_set())
            .unwrap();
        let b = allocator
            .allocate_lab_networks("B", &SubnetRole::standard_set())
            .unwrap();
        assert_ne!(a.lab_number, b.lab_number);
        assert_ne!(a.vpc_cidr, b.vpc_cidr);
    }

    #[test]
    fn release_frees_the_lab_number_for_reuse() {
        let mut allocator = NetworkAllocator::new();
        let a = allocator
            .allocate_lab_networks("A", &SubnetRole::standard_set())
            .unwrap();
        assert!(allocator.release_lab_networks("A"));
        assert!(!allocator.release_lab_networks("A"));

        let b = allocator
            .allocate_lab_networks("B", &SubnetRole::standard_set())
            .unwrap();
        assert_eq!(b.lab_number, a.lab_number);
    }

    #[test]
    fn exhausts_after_254_concurrent_labs() {
        let mut allocator = NetworkAllocator::new();
        for i in 0..254 {
            allocator
                .allocate_lab_networks(format!("lab-{i}"), &[SubnetRole::Public])
                .unwrap();
        }
        let err = allocator
            .allocate_lab_networks("lab-overflow", &[SubnetRole::Public])
            .unwrap_err();
        assert!(matches!(err, AllocatorError::PoolExhausted));
    }

    #[test]
    fn proxmox_vlan_scheme_uses_single_subnet() {
        let mut allocator = NetworkAllocator::new();
        let allocation = allocator.allocate_vlan_network("L2", 150).unwrap();
        assert_eq!(allocation.vpc_cidr, "10.150.0.0/24");
        assert_eq!(allocation.subnets.len(), 1);
        let subnet = allocation.subnet(SubnetRole::Internal).unwrap();
        assert_eq!(subnet.gateway, Ipv4Addr::new(10, 150, 0, 1));
    }
}
