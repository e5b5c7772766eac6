//! Configuration file parsing for vmnet
//!
//! Parses `vmnet.toml` host configuration files using serde. The file carries
//! the node and zone network state, hypervisor-wide settings, the VPC layout
//! used by the static address allocator and the VMs provisioned on this host.

use crate::error::{Error, Result};
use crate::network::ip::is_host;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// Bytes of VXLAN encapsulation subtracted from the MTU in overlay zones
pub const VXLAN_OVERHEAD: u32 = 54;

/// Load configuration from a file
pub fn load(path: &Path) -> Result<VmnetConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: VmnetConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmnetConfig {
    /// Jumbo frame settings of this node
    #[serde(default)]
    pub node: NodeConfig,

    /// Zone this node belongs to
    #[serde(default)]
    pub zone: ZoneConfig,

    /// Hypervisor-wide network settings
    #[serde(default)]
    pub hypervisor: HypervisorSettings,

    /// Filesystem and tool locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Anti-spoofing rule installation
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// VPC definitions
    #[serde(default)]
    pub vpcs: Vec<VpcDef>,

    /// VM definitions
    #[serde(default)]
    pub vms: Vec<VmDef>,
}

impl VmnetConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut vpc_ids = HashSet::new();
        for vpc in &self.vpcs {
            if !vpc_ids.insert(vpc.id.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate VPC id: {}",
                    vpc.id
                )));
            }
            vpc.validate()?;
        }

        let mut vm_ids = HashSet::new();
        // (vpc, address) -> VM holding it
        let mut static_addrs: HashMap<(&str, Ipv4Addr), &str> = HashMap::new();
        for vm in &self.vms {
            validate_vm_id(&vm.id)?;
            if !vm_ids.insert(vm.id.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate VM id: {}",
                    vm.id
                )));
            }

            for adapter in &vm.adapters {
                let vpc = self.get_vpc(&adapter.vpc).ok_or_else(|| {
                    Error::ConfigValidation(format!(
                        "VM '{}' references unknown VPC '{}'",
                        vm.id, adapter.vpc
                    ))
                })?;
                let subnet = vpc.get_subnet(&adapter.subnet).ok_or_else(|| {
                    Error::ConfigValidation(format!(
                        "VM '{}' references unknown subnet '{}' in VPC '{}'",
                        vm.id, adapter.subnet, adapter.vpc
                    ))
                })?;

                if let Some(addr) = adapter.address {
                    if !subnet.network.contains(&addr) {
                        return Err(Error::ConfigValidation(format!(
                            "VM '{}' address {} is not in subnet {}",
                            vm.id, addr, subnet.network
                        )));
                    }
                    if !is_host(&subnet.network, addr) {
                        return Err(Error::ConfigValidation(format!(
                            "VM '{}' address {} is the network or broadcast address of {}",
                            vm.id, addr, subnet.network
                        )));
                    }
                    if subnet.effective_gateway() == Some(addr) {
                        return Err(Error::ConfigValidation(format!(
                            "VM '{}' address {} is the gateway of subnet '{}'",
                            vm.id, addr, subnet.id
                        )));
                    }
                    if let Some(owner) = static_addrs.insert((adapter.vpc.as_str(), addr), vm.id.as_str()) {
                        return Err(Error::ConfigValidation(format!(
                            "VM '{}' address {} is already assigned to VM '{}'",
                            vm.id, addr, owner
                        )));
                    }
                }
            }
        }

        if self.zone.network_mode.is_overlay() {
            for (name, mtu) in [
                ("normal_mtu", self.hypervisor.normal_mtu),
                ("jumbo_mtu", self.hypervisor.jumbo_mtu),
            ] {
                if mtu <= VXLAN_OVERHEAD {
                    return Err(Error::ConfigValidation(format!(
                        "{} {} is too small for VXLAN overhead of {} bytes",
                        name, mtu, VXLAN_OVERHEAD
                    )));
                }
            }
        }

        if self.hypervisor.namespace_bridge.is_empty() {
            return Err(Error::ConfigValidation(
                "hypervisor.namespace_bridge must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Get a VM definition by id
    pub fn get_vm(&self, id: &str) -> Option<&VmDef> {
        self.vms.iter().find(|v| v.id == id)
    }

    /// Get a VPC definition by id
    pub fn get_vpc(&self, id: &str) -> Option<&VpcDef> {
        self.vpcs.iter().find(|v| v.id == id)
    }
}

/// VM ids end up in unit names and file paths
fn validate_vm_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::ConfigValidation("VM id must not be empty".into()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::ConfigValidation(format!(
            "VM id '{}' may only contain letters, digits, '-' and '_'",
            id
        )));
    }
    Ok(())
}

/// Node-level jumbo frame settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    /// Jumbo frames on the external path (implies internal)
    #[serde(default)]
    pub jumbo_frames: bool,

    /// Jumbo frames on the internal path only
    #[serde(default)]
    pub jumbo_frames_internal: bool,
}

/// Zone network mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    #[default]
    Default,
    /// VXLAN overlay between nodes
    VxlanVlan,
}

impl NetworkMode {
    pub fn is_overlay(&self) -> bool {
        matches!(self, NetworkMode::VxlanVlan)
    }
}

/// Zone configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZoneConfig {
    #[serde(default)]
    pub network_mode: NetworkMode,
}

fn default_normal_mtu() -> u32 {
    1500
}

fn default_jumbo_mtu() -> u32 {
    9000
}

fn default_dns_primary() -> Ipv4Addr {
    Ipv4Addr::new(8, 8, 8, 8)
}

fn default_dns_secondary() -> Ipv4Addr {
    Ipv4Addr::new(8, 8, 4, 4)
}

fn default_dns_primary6() -> Ipv6Addr {
    Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)
}

fn default_dns_secondary6() -> Ipv6Addr {
    Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8844)
}

fn default_namespace_bridge() -> String {
    "br0".into()
}

/// Hypervisor-wide network settings
#[derive(Debug, Clone, Deserialize)]
pub struct HypervisorSettings {
    /// Internal MTU without jumbo frames
    #[serde(default = "default_normal_mtu")]
    pub normal_mtu: u32,

    /// Internal MTU with jumbo frames
    #[serde(default = "default_jumbo_mtu")]
    pub jumbo_mtu: u32,

    #[serde(default = "default_dns_primary")]
    pub dns_server_primary: Ipv4Addr,

    #[serde(default = "default_dns_secondary")]
    pub dns_server_secondary: Ipv4Addr,

    #[serde(default = "default_dns_primary6")]
    pub dns_server_primary6: Ipv6Addr,

    #[serde(default = "default_dns_secondary6")]
    pub dns_server_secondary6: Ipv6Addr,

    /// Bridge inside each VM namespace the responders listen on
    #[serde(default = "default_namespace_bridge")]
    pub namespace_bridge: String,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            normal_mtu: default_normal_mtu(),
            jumbo_mtu: default_jumbo_mtu(),
            dns_server_primary: default_dns_primary(),
            dns_server_secondary: default_dns_secondary(),
            dns_server_primary6: default_dns_primary6(),
            dns_server_secondary6: default_dns_secondary6(),
            namespace_bridge: default_namespace_bridge(),
        }
    }
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_netns_dir() -> PathBuf {
    PathBuf::from("/var/run/netns")
}

fn default_ip_command() -> String {
    "/usr/sbin/ip".into()
}

fn default_systemctl() -> String {
    "systemctl".into()
}

fn default_unit_prefix() -> String {
    "vmnet".into()
}

/// Filesystem and tool locations
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory unit files are written to
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,

    /// Directory holding named network namespaces
    #[serde(default = "default_netns_dir")]
    pub netns_dir: PathBuf,

    /// iproute2 binary used for `ip netns exec`
    #[serde(default = "default_ip_command")]
    pub ip_command: String,

    /// systemctl binary
    #[serde(default = "default_systemctl")]
    pub systemctl: String,

    /// Prefix of generated unit names
    #[serde(default = "default_unit_prefix")]
    pub unit_prefix: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            unit_dir: default_unit_dir(),
            netns_dir: default_netns_dir(),
            ip_command: default_ip_command(),
            systemctl: default_systemctl(),
            unit_prefix: default_unit_prefix(),
        }
    }
}

fn default_purge_existing() -> bool {
    true
}

fn default_ebtables() -> String {
    "ebtables".into()
}

/// Anti-spoofing rule installation settings
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallConfig {
    /// Trim copies of the rules left by earlier runs once all are installed
    #[serde(default = "default_purge_existing")]
    pub purge_existing: bool,

    /// ebtables binary run inside the namespace
    #[serde(default = "default_ebtables")]
    pub ebtables: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            purge_existing: default_purge_existing(),
            ebtables: default_ebtables(),
        }
    }
}

/// VPC definition
#[derive(Debug, Clone, Deserialize)]
pub struct VpcDef {
    pub id: String,

    /// IPv4 network of the VPC (e.g., "10.0.0.0/16")
    pub network: Ipv4Net,

    /// IPv6 /64 prefix IPv4 addresses are mapped into
    pub network6: Ipv6Net,

    #[serde(default)]
    pub subnets: Vec<SubnetDef>,
}

impl VpcDef {
    fn validate(&self) -> Result<()> {
        if self.network6.prefix_len() != 64 {
            return Err(Error::ConfigValidation(format!(
                "VPC '{}' network6 {} must be a /64",
                self.id, self.network6
            )));
        }

        let mut subnet_ids = HashSet::new();
        for subnet in &self.subnets {
            if !subnet_ids.insert(subnet.id.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate subnet id '{}' in VPC '{}'",
                    subnet.id, self.id
                )));
            }

            if !self.network.contains(&subnet.network) {
                return Err(Error::ConfigValidation(format!(
                    "Subnet {} is not inside VPC '{}' network {}",
                    subnet.network, self.id, self.network
                )));
            }

            if let Some(gateway) = subnet.gateway {
                if !is_host(&subnet.network, gateway) {
                    return Err(Error::ConfigValidation(format!(
                        "Gateway {} is not a host address of subnet {}",
                        gateway, subnet.network
                    )));
                }
            }
        }

        Ok(())
    }

    /// Get a subnet by id
    pub fn get_subnet(&self, id: &str) -> Option<&SubnetDef> {
        self.subnets.iter().find(|s| s.id == id)
    }
}

/// Subnet inside a VPC
#[derive(Debug, Clone, Deserialize)]
pub struct SubnetDef {
    pub id: String,

    /// Subnet in CIDR notation (e.g., "10.0.0.0/24")
    pub network: Ipv4Net,

    /// Gateway address (first usable address if not specified)
    pub gateway: Option<Ipv4Addr>,
}

impl SubnetDef {
    /// Configured gateway, or the first usable host of the subnet
    pub fn effective_gateway(&self) -> Option<Ipv4Addr> {
        self.gateway.or_else(|| self.network.hosts().next())
    }
}

/// VM definition from config file
#[derive(Debug, Clone, Deserialize)]
pub struct VmDef {
    /// Unique VM id
    pub id: String,

    /// Network adapters; the first one is the primary
    #[serde(default)]
    pub adapters: Vec<AdapterDef>,
}

/// Network adapter binding of a VM
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterDef {
    pub vpc: String,
    pub subnet: String,

    /// Static address
    ///
    /// Without one, the adapter gets the next free host of the subnet in
    /// configuration order, so adding a VM ahead of others renumbers them.
    /// Set it for VMs whose address must stay stable.
    pub address: Option<Ipv4Addr>,
}
