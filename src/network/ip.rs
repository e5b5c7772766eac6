//! IP address management for VPC subnets
//!
//! Provides:
//! - The `AddressAllocator` seam the resolver draws addresses from
//! - Subnet pools that reserve the gateway and track allocated addresses
//! - A static allocator backed by the VPC and VM definitions in `vmnet.toml`
//! - The IPv4 to IPv6 mapping of a VPC

use crate::error::{Error, Result};
use crate::manifest::{VmnetConfig, VpcDef};
use ipnet::{Ipv4Net, Ipv6Net};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Source of VPC networks and per-VM addresses
pub trait AddressAllocator {
    /// IPv4 network of a VPC
    fn network(&self, vpc: &str) -> Result<Ipv4Net>;

    /// Address and gateway allocated to a VM in a subnet
    fn ip(&self, vpc: &str, subnet: &str, vm_id: &str) -> Result<(Ipv4Addr, Ipv4Addr)>;

    /// IPv6 counterpart of an IPv4 address inside a VPC
    fn ip6(&self, vpc: &str, addr: Ipv4Addr) -> Result<Ipv6Addr>;
}

/// Map an IPv4 address into a VPC /64 by placing its octets in the low 32 bits
pub fn map_ip6(network6: &Ipv6Net, addr: Ipv4Addr) -> Ipv6Addr {
    let mut octets = network6.network().octets();
    octets[8..12].fill(0);
    octets[12..].copy_from_slice(&addr.octets());
    Ipv6Addr::from(octets)
}

/// Whether `addr` is a usable host of `net`
///
/// Network and broadcast addresses are excluded except in /31 and /32
/// networks, which have neither.
pub fn is_host(net: &Ipv4Net, addr: Ipv4Addr) -> bool {
    net.contains(&addr)
        && (net.prefix_len() >= 31 || (addr != net.network() && addr != net.broadcast()))
}

/// IP address pool for a subnet
#[derive(Debug, Clone)]
pub struct IpPool {
    /// Subnet
    subnet: Ipv4Net,
    /// Gateway address (usually first usable in subnet)
    gateway: Ipv4Addr,
    /// Set of allocated addresses
    allocated: HashSet<Ipv4Addr>,
}

impl IpPool {
    /// Create a new IP pool from a subnet
    ///
    /// The gateway is automatically set to the first usable address.
    pub fn new(subnet: Ipv4Net) -> Result<Self> {
        let gateway = subnet
            .hosts()
            .next()
            .ok_or_else(|| Error::Allocation(format!("Subnet {} too small for gateway", subnet)))?;
        Self::with_gateway(subnet, gateway)
    }

    /// Create a new IP pool with a specific gateway
    pub fn with_gateway(subnet: Ipv4Net, gateway: Ipv4Addr) -> Result<Self> {
        if !is_host(&subnet, gateway) {
            return Err(Error::Allocation(format!(
                "Gateway {} is not a host address of subnet {}",
                gateway, subnet
            )));
        }

        let mut allocated = HashSet::new();
        allocated.insert(gateway);

        Ok(Self {
            subnet,
            gateway,
            allocated,
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Allocate the next available IP address
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        // hosts() skips network and broadcast
        for addr in self.subnet.hosts() {
            if self.allocated.insert(addr) {
                return Ok(addr);
            }
        }

        Err(Error::Allocation(format!(
            "No available addresses in {}",
            self.subnet
        )))
    }

    /// Allocate a specific IP address
    pub fn allocate_specific(&mut self, addr: Ipv4Addr) -> Result<()> {
        if !is_host(&self.subnet, addr) {
            return Err(Error::Allocation(format!(
                "Address {} is not a host address of subnet {}",
                addr, self.subnet
            )));
        }

        if !self.allocated.insert(addr) {
            return Err(Error::Allocation(format!(
                "Address {} is already allocated",
                addr
            )));
        }

        Ok(())
    }

    #[cfg(test)]
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

type AdapterKey = (String, String, String);

/// Allocator backed by the VPC layout in the host configuration
///
/// Static addresses are reserved first, then VMs without one receive the
/// next free host of their subnet in configuration order.
#[derive(Debug, Default)]
pub struct StaticAllocator {
    vpcs: HashMap<String, VpcDef>,
    gateways: HashMap<(String, String), Ipv4Addr>,
    /// (vpc, subnet, vm) -> address
    addresses: HashMap<AdapterKey, Ipv4Addr>,
}

impl StaticAllocator {
    /// Build the allocator from a validated configuration
    pub fn from_config(config: &VmnetConfig) -> Result<Self> {
        let mut pools: HashMap<(String, String), IpPool> = HashMap::new();
        for vpc in &config.vpcs {
            for subnet in &vpc.subnets {
                let pool = match subnet.gateway {
                    Some(gateway) => IpPool::with_gateway(subnet.network, gateway)?,
                    None => IpPool::new(subnet.network)?,
                };
                pools.insert((vpc.id.clone(), subnet.id.clone()), pool);
            }
        }

        let mut addresses = HashMap::new();

        // Reserve static addresses before handing out dynamic ones
        for vm in &config.vms {
            for adapter in &vm.adapters {
                if let Some(addr) = adapter.address {
                    let pool = pools
                        .get_mut(&(adapter.vpc.clone(), adapter.subnet.clone()))
                        .ok_or_else(|| Error::SubnetNotFound {
                            vpc: adapter.vpc.clone(),
                            subnet: adapter.subnet.clone(),
                        })?;
                    pool.allocate_specific(addr)?;
                    addresses.insert(
                        (adapter.vpc.clone(), adapter.subnet.clone(), vm.id.clone()),
                        addr,
                    );
                }
            }
        }

        for vm in &config.vms {
            for adapter in vm.adapters.iter().filter(|a| a.address.is_none()) {
                let key = (adapter.vpc.clone(), adapter.subnet.clone(), vm.id.clone());
                if addresses.contains_key(&key) {
                    continue;
                }
                let pool = pools
                    .get_mut(&(adapter.vpc.clone(), adapter.subnet.clone()))
                    .ok_or_else(|| Error::SubnetNotFound {
                        vpc: adapter.vpc.clone(),
                        subnet: adapter.subnet.clone(),
                    })?;
                let addr = pool.allocate()?;
                addresses.insert(key, addr);
            }
        }

        Ok(Self {
            vpcs: config
                .vpcs
                .iter()
                .map(|v| (v.id.clone(), v.clone()))
                .collect(),
            gateways: pools
                .iter()
                .map(|(k, p)| (k.clone(), p.gateway()))
                .collect(),
            addresses,
        })
    }

    fn vpc(&self, id: &str) -> Result<&VpcDef> {
        self.vpcs
            .get(id)
            .ok_or_else(|| Error::VpcNotFound(id.to_string()))
    }
}

impl AddressAllocator for StaticAllocator {
    fn network(&self, vpc: &str) -> Result<Ipv4Net> {
        Ok(self.vpc(vpc)?.network)
    }

    fn ip(&self, vpc: &str, subnet: &str, vm_id: &str) -> Result<(Ipv4Addr, Ipv4Addr)> {
        let gateway = self
            .gateways
            .get(&(vpc.to_string(), subnet.to_string()))
            .copied()
            .ok_or_else(|| Error::SubnetNotFound {
                vpc: vpc.to_string(),
                subnet: subnet.to_string(),
            })?;

        let addr = self
            .addresses
            .get(&(vpc.to_string(), subnet.to_string(), vm_id.to_string()))
            .copied()
            .ok_or_else(|| {
                Error::Allocation(format!(
                    "No address allocated for VM '{}' in {}/{}",
                    vm_id, vpc, subnet
                ))
            })?;

        Ok((addr, gateway))
    }

    fn ip6(&self, vpc: &str, addr: Ipv4Addr) -> Result<Ipv6Addr> {
        Ok(map_ip6(&self.vpc(vpc)?.network6, addr))
    }
}
