//! Network parameter resolution
//!
//! Turns a VM's primary adapter binding plus node/zone state into the
//! immutable `NetworkContext` every service of that VM is configured from.

use crate::error::{Error, Result};
use crate::manifest::{NetworkMode, VXLAN_OVERHEAD, VmDef, VmnetConfig};
use crate::network::ip::AddressAllocator;
use crate::network::naming::{vm_iface, vm_namespace};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// Prefix length handed to IPv6 clients
pub const IPV6_PREFIX_LEN: u8 = 64;

/// Lease and router lifetime in seconds
pub const LEASE_LIFETIME: u32 = 60;

/// Node, zone and hypervisor state the resolver depends on
///
/// Passed in explicitly so resolution stays a pure function of its inputs.
#[derive(Debug, Clone)]
pub struct HostContext {
    pub jumbo_frames: bool,
    pub jumbo_frames_internal: bool,
    pub network_mode: NetworkMode,
    pub normal_mtu: u32,
    pub jumbo_mtu: u32,
    pub dns_servers: [Ipv4Addr; 2],
    pub dns_servers6: [Ipv6Addr; 2],
    /// Bridge inside the namespace the responders bind to
    pub namespace_bridge: String,
}

impl HostContext {
    /// Build the context from host configuration
    pub fn from_config(config: &VmnetConfig) -> Self {
        let hv = &config.hypervisor;
        Self {
            jumbo_frames: config.node.jumbo_frames,
            jumbo_frames_internal: config.node.jumbo_frames_internal,
            network_mode: config.zone.network_mode,
            normal_mtu: hv.normal_mtu,
            jumbo_mtu: hv.jumbo_mtu,
            dns_servers: [hv.dns_server_primary, hv.dns_server_secondary],
            dns_servers6: [hv.dns_server_primary6, hv.dns_server_secondary6],
            namespace_bridge: hv.namespace_bridge.clone(),
        }
    }

    /// MTU advertised to VMs, 0 meaning "leave the system default"
    pub fn mtu(&self) -> u32 {
        let jumbo_external = self.jumbo_frames;
        let jumbo_internal = self.jumbo_frames || self.jumbo_frames_internal;
        let vxlan = self.network_mode.is_overlay();

        if !(jumbo_external || jumbo_internal || vxlan) {
            return 0;
        }

        let mut mtu = if jumbo_internal {
            self.jumbo_mtu
        } else {
            self.normal_mtu
        };

        if vxlan {
            mtu = mtu.saturating_sub(VXLAN_OVERHEAD);
        }

        mtu
    }
}

/// Resolved network parameters of one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    pub vm_id: String,
    pub namespace: String,
    /// Host-side interface of the VM; the only legitimate egress for replies
    pub vm_iface: String,
    /// Bridge inside the namespace the responders listen on
    pub bridge_iface: String,
    pub ipv4_addr: Ipv4Addr,
    pub ipv4_gateway: Ipv4Addr,
    pub ipv4_prefix_len: u8,
    pub ipv6_addr: Ipv6Addr,
    pub ipv6_gateway: Ipv6Addr,
    pub ipv6_prefix_len: u8,
    pub dns_servers: [Ipv4Addr; 2],
    pub dns_servers6: [Ipv6Addr; 2],
    pub mtu: u32,
    pub lease_lifetime: u32,
}

/// Resolves `NetworkContext`s from an allocator and host state
pub struct Resolver<'a, A: AddressAllocator> {
    host: &'a HostContext,
    allocator: &'a A,
}

impl<'a, A: AddressAllocator> Resolver<'a, A> {
    pub fn new(host: &'a HostContext, allocator: &'a A) -> Self {
        Self { host, allocator }
    }

    /// Resolve the network parameters of a VM's primary adapter
    pub fn resolve(&self, vm: &VmDef) -> Result<NetworkContext> {
        let adapter = vm
            .adapters
            .first()
            .ok_or_else(|| Error::MissingNetworkAdapter(vm.id.clone()))?;

        let vpc_net = self.allocator.network(&adapter.vpc)?;
        let (addr, gateway) = self.allocator.ip(&adapter.vpc, &adapter.subnet, &vm.id)?;
        let addr6 = self.allocator.ip6(&adapter.vpc, addr)?;
        let gateway6 = self.allocator.ip6(&adapter.vpc, gateway)?;

        let ctx = NetworkContext {
            vm_id: vm.id.clone(),
            namespace: vm_namespace(&vm.id, 0),
            vm_iface: vm_iface(&vm.id, 0),
            bridge_iface: self.host.namespace_bridge.clone(),
            ipv4_addr: addr,
            ipv4_gateway: gateway,
            ipv4_prefix_len: vpc_net.prefix_len(),
            ipv6_addr: addr6,
            ipv6_gateway: gateway6,
            ipv6_prefix_len: IPV6_PREFIX_LEN,
            dns_servers: self.host.dns_servers,
            dns_servers6: self.host.dns_servers6,
            mtu: self.host.mtu(),
            lease_lifetime: LEASE_LIFETIME,
        };

        debug!(
            vm = %ctx.vm_id,
            namespace = %ctx.namespace,
            addr = %ctx.ipv4_addr,
            addr6 = %ctx.ipv6_addr,
            mtu = ctx.mtu,
            "resolved network"
        );

        Ok(ctx)
    }
}

/// Context matching a VM at 10.0.0.5/24 in an overlay zone with jumbo frames
#[cfg(test)]
pub(crate) fn sample_context() -> NetworkContext {
    NetworkContext {
        vm_id: "65f1c2a9e4b0a1d2c3e4f5a6".to_string(),
        namespace: vm_namespace("65f1c2a9e4b0a1d2c3e4f5a6", 0),
        vm_iface: vm_iface("65f1c2a9e4b0a1d2c3e4f5a6", 0),
        bridge_iface: "br0".to_string(),
        ipv4_addr: Ipv4Addr::new(10, 0, 0, 5),
        ipv4_gateway: Ipv4Addr::new(10, 0, 0, 1),
        ipv4_prefix_len: 24,
        ipv6_addr: "fd00::a00:5".parse().unwrap(),
        ipv6_gateway: "fd00::a00:1".parse().unwrap(),
        ipv6_prefix_len: IPV6_PREFIX_LEN,
        dns_servers: [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
        dns_servers6: [
            "2001:4860:4860::8888".parse().unwrap(),
            "2001:4860:4860::8844".parse().unwrap(),
        ],
        mtu: 8946,
        lease_lifetime: LEASE_LIFETIME,
    }
}
