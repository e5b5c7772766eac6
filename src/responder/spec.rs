//! Responder service configurations
//!
//! The JSON form of these types is the `CONFIG` payload handed to each
//! responder process, so field names and order are part of the interface.

use crate::error::{Error, Result};
use crate::network::NetworkContext;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Seconds the NDP responder waits between router advertisements
pub const NDP_DELAY: u32 = 3;

/// Responder protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Dhcp4,
    Dhcp6,
    Ndp,
}

impl Protocol {
    /// Start order of the services
    pub const ALL: [Protocol; 3] = [Protocol::Dhcp4, Protocol::Dhcp6, Protocol::Ndp];

    /// Argument the agent is re-invoked with to run this responder
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Dhcp4 => "dhcp4-server",
            Protocol::Dhcp6 => "dhcp6-server",
            Protocol::Ndp => "ndp-server",
        }
    }

    /// Short name used in unit names
    pub fn kind(&self) -> &'static str {
        match self {
            Protocol::Dhcp4 => "dhcp4",
            Protocol::Dhcp6 => "dhcp6",
            Protocol::Ndp => "ndp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dhcp4" | "dhcp4-server" => Ok(Protocol::Dhcp4),
            "dhcp6" | "dhcp6-server" => Ok(Protocol::Dhcp6),
            "ndp" | "ndp-server" => Ok(Protocol::Ndp),
            _ => Err(Error::ServiceConfig(format!("Unknown protocol '{}'", s))),
        }
    }
}

/// DHCPv4 responder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dhcp4Spec {
    pub iface: String,
    pub client_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub dns_servers: Vec<Ipv4Addr>,
    pub mtu: u32,
    pub lifetime: u32,
}

/// DHCPv6 responder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dhcp6Spec {
    pub iface: String,
    pub client_ip: Ipv6Addr,
    pub gateway_ip: Ipv6Addr,
    pub prefix_len: u8,
    pub dns_servers: Vec<Ipv6Addr>,
    pub mtu: u32,
    pub lifetime: u32,
}

/// NDP responder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NdpSpec {
    pub iface: String,
    pub client_ip: Ipv6Addr,
    pub gateway_ip: Ipv6Addr,
    pub prefix_len: u8,
    pub dns_servers: Vec<Ipv6Addr>,
    pub mtu: u32,
    pub lifetime: u32,
    /// Router advertisement delay in seconds
    pub delay: u32,
}

/// Configuration of one responder service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSpec {
    Dhcp4(Dhcp4Spec),
    Dhcp6(Dhcp6Spec),
    Ndp(NdpSpec),
}

impl ServiceSpec {
    /// The three responder configurations of a VM, in start order
    pub fn for_context(ctx: &NetworkContext) -> [ServiceSpec; 3] {
        let dhcp4 = Dhcp4Spec {
            iface: ctx.bridge_iface.clone(),
            client_ip: ctx.ipv4_addr,
            gateway_ip: ctx.ipv4_gateway,
            prefix_len: ctx.ipv4_prefix_len,
            dns_servers: ctx.dns_servers.to_vec(),
            mtu: ctx.mtu,
            lifetime: ctx.lease_lifetime,
        };
        let dhcp6 = Dhcp6Spec {
            iface: ctx.bridge_iface.clone(),
            client_ip: ctx.ipv6_addr,
            gateway_ip: ctx.ipv6_gateway,
            prefix_len: ctx.ipv6_prefix_len,
            dns_servers: ctx.dns_servers6.to_vec(),
            mtu: ctx.mtu,
            lifetime: ctx.lease_lifetime,
        };
        let ndp = NdpSpec {
            iface: ctx.bridge_iface.clone(),
            client_ip: ctx.ipv6_addr,
            gateway_ip: ctx.ipv6_gateway,
            prefix_len: ctx.ipv6_prefix_len,
            dns_servers: ctx.dns_servers6.to_vec(),
            mtu: ctx.mtu,
            lifetime: ctx.lease_lifetime,
            delay: NDP_DELAY,
        };

        [
            ServiceSpec::Dhcp4(dhcp4),
            ServiceSpec::Dhcp6(dhcp6),
            ServiceSpec::Ndp(ndp),
        ]
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ServiceSpec::Dhcp4(_) => Protocol::Dhcp4,
            ServiceSpec::Dhcp6(_) => Protocol::Dhcp6,
            ServiceSpec::Ndp(_) => Protocol::Ndp,
        }
    }

    /// Serialize to the `CONFIG` payload
    pub fn to_json(&self) -> Result<String> {
        let result = match self {
            ServiceSpec::Dhcp4(s) => serde_json::to_string(s),
            ServiceSpec::Dhcp6(s) => serde_json::to_string(s),
            ServiceSpec::Ndp(s) => serde_json::to_string(s),
        };
        result.map_err(|e| Error::Marshal {
            what: format!("{} config", self.protocol()),
            source: e,
        })
    }

    /// Decode a `CONFIG` payload for the given protocol and validate it
    pub fn from_json(protocol: Protocol, json: &str) -> Result<Self> {
        let parse_err = |e: serde_json::Error| {
            Error::ServiceConfig(format!("Failed to parse {} config: {}", protocol, e))
        };

        let spec = match protocol {
            Protocol::Dhcp4 => ServiceSpec::Dhcp4(serde_json::from_str(json).map_err(parse_err)?),
            Protocol::Dhcp6 => ServiceSpec::Dhcp6(serde_json::from_str(json).map_err(parse_err)?),
            Protocol::Ndp => ServiceSpec::Ndp(serde_json::from_str(json).map_err(parse_err)?),
        };
        spec.validate()?;

        Ok(spec)
    }

    /// Check the values a responder cannot work without
    pub fn validate(&self) -> Result<()> {
        let (iface, prefix_len, max_prefix, lifetime) = match self {
            ServiceSpec::Dhcp4(s) => (&s.iface, s.prefix_len, 32, s.lifetime),
            ServiceSpec::Dhcp6(s) => (&s.iface, s.prefix_len, 128, s.lifetime),
            ServiceSpec::Ndp(s) => (&s.iface, s.prefix_len, 128, s.lifetime),
        };

        if iface.is_empty() {
            return Err(Error::ServiceConfig(format!(
                "{} config has no interface",
                self.protocol()
            )));
        }
        if prefix_len == 0 || prefix_len > max_prefix {
            return Err(Error::ServiceConfig(format!(
                "{} prefix length {} out of range",
                self.protocol(),
                prefix_len
            )));
        }
        if lifetime == 0 {
            return Err(Error::ServiceConfig(format!(
                "{} lifetime must be positive",
                self.protocol()
            )));
        }

        Ok(())
    }
}
