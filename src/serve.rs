//! Responder entry point
//!
//! Units start `vmnet <tag>` inside the VM namespace. The configuration is
//! decoded and checked here, then the process is replaced by the protocol
//! responder with `CONFIG` passed through unchanged.

use crate::error::{Error, Result};
use crate::exec::display_command;
use crate::responder::{Protocol, ServiceSpec};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

/// Environment variable carrying the responder configuration
pub const CONFIG_VAR: &str = "CONFIG";

/// Directory holding the protocol responders
pub const RESPONDER_DIR: &str = "/usr/libexec/vmnet";

/// Default responder binary of a protocol
pub fn default_responder(protocol: Protocol) -> PathBuf {
    Path::new(RESPONDER_DIR).join(protocol.tag())
}

/// Decode the configuration value of a responder
pub fn decode_config(protocol: Protocol, value: Option<&str>) -> Result<ServiceSpec> {
    let value = value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::ServiceConfig(format!("{} is not set", CONFIG_VAR)))?;
    ServiceSpec::from_json(protocol, value)
}

fn log_spec(spec: &ServiceSpec) {
    match spec {
        ServiceSpec::Dhcp4(s) => info!(
            iface = %s.iface,
            client = %s.client_ip,
            gateway = %s.gateway_ip,
            prefix_len = s.prefix_len,
            mtu = s.mtu,
            lifetime = s.lifetime,
            "dhcp4 config"
        ),
        ServiceSpec::Dhcp6(s) => info!(
            iface = %s.iface,
            client = %s.client_ip,
            gateway = %s.gateway_ip,
            prefix_len = s.prefix_len,
            mtu = s.mtu,
            lifetime = s.lifetime,
            "dhcp6 config"
        ),
        ServiceSpec::Ndp(s) => info!(
            iface = %s.iface,
            client = %s.client_ip,
            gateway = %s.gateway_ip,
            prefix_len = s.prefix_len,
            mtu = s.mtu,
            delay = s.delay,
            "ndp config"
        ),
    }
}

/// Validate the environment and replace this process with the responder
///
/// Only returns on failure.
pub fn serve(protocol: Protocol, responder: Option<PathBuf>) -> Result<()> {
    let value = std::env::var(CONFIG_VAR).ok();
    let spec = decode_config(protocol, value.as_deref())?;
    log_spec(&spec);

    let responder = responder.unwrap_or_else(|| default_responder(protocol));
    let config = spec.to_json()?;
    let program = responder.display().to_string();
    info!(responder = %program, "starting {}", protocol.tag());

    let err = Command::new(&responder).env(CONFIG_VAR, config).exec();
    Err(Error::CommandSpawn {
        command: display_command(&program, &[]),
        source: err,
    })
}
