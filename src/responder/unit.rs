//! systemd units for responder services
//!
//! Each responder runs as the vmnet binary re-invoked with the protocol tag,
//! inside the VM's network namespace, with its configuration passed through
//! the `CONFIG` environment variable.

use crate::error::{Error, Result};
use crate::manifest::PathsConfig;
use crate::responder::spec::{Protocol, ServiceSpec};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Mode of written unit files
const UNIT_MODE: u32 = 0o644;

/// A rendered unit for one responder of one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub vm_id: String,
    pub protocol: Protocol,
    pub namespace: String,
    pub name: String,
    pub path: PathBuf,
    pub content: String,
}

/// Renders and writes responder units
#[derive(Debug, Clone)]
pub struct UnitWriter {
    unit_dir: PathBuf,
    unit_prefix: String,
    ip_command: String,
    netns_dir: PathBuf,
    /// Executable the units re-invoke
    exe: PathBuf,
}

impl UnitWriter {
    pub fn new(paths: &PathsConfig, exe: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: paths.unit_dir.clone(),
            unit_prefix: paths.unit_prefix.clone(),
            ip_command: paths.ip_command.clone(),
            netns_dir: paths.netns_dir.clone(),
            exe: exe.into(),
        }
    }

    /// Writer re-invoking the currently running executable
    pub fn for_current_exe(paths: &PathsConfig) -> Result<Self> {
        let exe = std::env::current_exe().map_err(Error::ExecutablePath)?;
        Ok(Self::new(paths, exe))
    }

    /// Unit name of a responder (e.g., "vmnet-dhcp4-<vm>.service")
    pub fn unit_name(&self, protocol: Protocol, vm_id: &str) -> String {
        unit_name(&self.unit_prefix, protocol, vm_id)
    }

    /// Path the unit of a responder is written to
    pub fn unit_path(&self, protocol: Protocol, vm_id: &str) -> PathBuf {
        self.unit_dir.join(self.unit_name(protocol, vm_id))
    }

    /// Render the unit of a responder without touching the filesystem
    pub fn render(&self, vm_id: &str, namespace: &str, spec: &ServiceSpec) -> Result<ServiceUnit> {
        let protocol = spec.protocol();
        let config = spec.to_json()?;
        let tag = protocol.tag();

        let mut content = String::new();
        content.push_str("[Unit]\n");
        content.push_str(&format!("Description=vmnet {}\n", tag));
        content.push_str("After=network.target\n");
        content.push('\n');
        content.push_str("[Service]\n");
        content.push_str(&format!("Environment=\"CONFIG={}\"\n", escape_value(&config)));
        content.push_str("Type=simple\n");
        content.push_str("User=root\n");
        let exe = self.exe.to_string_lossy();
        let exec = [self.ip_command.as_str(), "netns", "exec", namespace, exe.as_ref(), tag]
            .iter()
            .map(|arg| exec_arg(arg))
            .collect::<Vec<_>>()
            .join(" ");
        content.push_str(&format!("ExecStart={}\n", exec));
        content.push_str("PrivateTmp=true\n");
        content.push_str("ProtectHome=true\n");
        content.push_str("ProtectSystem=full\n");
        content.push_str("ProtectHostname=true\n");
        content.push_str("ProtectKernelTunables=true\n");
        content.push_str(&format!(
            "NetworkNamespacePath={}\n",
            self.netns_dir
                .join(namespace)
                .to_string_lossy()
                .replace('%', "%%")
        ));
        content.push_str("AmbientCapabilities=CAP_NET_BIND_SERVICE\n");

        Ok(ServiceUnit {
            vm_id: vm_id.to_string(),
            protocol,
            namespace: namespace.to_string(),
            name: self.unit_name(protocol, vm_id),
            path: self.unit_path(protocol, vm_id),
            content,
        })
    }

    /// Render the unit of a responder and replace its file atomically
    pub fn write(&self, vm_id: &str, namespace: &str, spec: &ServiceSpec) -> Result<ServiceUnit> {
        let unit = self.render(vm_id, namespace, spec)?;
        write_atomic(&unit.path, unit.content.as_bytes(), UNIT_MODE)?;
        debug!(unit = %unit.name, path = %unit.path.display(), "wrote unit");
        Ok(unit)
    }
}

/// Unit name of a responder under a prefix
pub fn unit_name(prefix: &str, protocol: Protocol, vm_id: &str) -> String {
    format!("{}-{}-{}.service", prefix, protocol.kind(), vm_id)
}

/// Escape a value for a double-quoted systemd assignment
///
/// Backslash and quote are C-escaped, `%` is doubled to stop specifier
/// expansion.
fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 16);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '%' => out.push_str("%%"),
            _ => out.push(c),
        }
    }
    out
}

/// Quote one word of an `ExecStart=` command line
///
/// `$` is doubled so systemd does not substitute variables. Words holding
/// whitespace, quotes, backslashes or `;` are double-quoted, and `%` is
/// doubled in every word.
fn exec_arg(arg: &str) -> String {
    let arg = arg.replace('$', "$$");
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));

    if needs_quotes {
        format!("\"{}\"", escape_value(&arg))
    } else {
        arg.replace('%', "%%")
    }
}

/// Write a file through a sibling temporary file and rename it into place
///
/// A concurrent reader sees either the old or the new content, never a
/// partial write.
pub fn write_atomic(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp", file_name));

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::resolve::sample_context;

    fn writer(unit_dir: &Path) -> UnitWriter {
        let paths = PathsConfig {
            unit_dir: unit_dir.to_path_buf(),
            ..PathsConfig::default()
        };
        UnitWriter::new(&paths, "/usr/bin/vmnet")
    }

    #[test]
    fn test_render_dhcp4_unit() {
        let ctx = sample_context();
        let [dhcp4, _, _] = ServiceSpec::for_context(&ctx);
        let unit = writer(Path::new("/etc/systemd/system"))
            .render(&ctx.vm_id, "ns1", &dhcp4)
            .unwrap();

        let expected = "[Unit]
Description=vmnet dhcp4-server
After=network.target

[Service]
Environment=\"CONFIG={\\\"Iface\\\":\\\"br0\\\",\\\"ClientIp\\\":\\\"10.0.0.5\\\",\\\"GatewayIp\\\":\\\"10.0.0.1\\\",\\\"PrefixLen\\\":24,\\\"DnsServers\\\":[\\\"8.8.8.8\\\",\\\"8.8.4.4\\\"],\\\"Mtu\\\":8946,\\\"Lifetime\\\":60}\"
Type=simple
User=root
ExecStart=/usr/sbin/ip netns exec ns1 /usr/bin/vmnet dhcp4-server
PrivateTmp=true
ProtectHome=true
ProtectSystem=full
ProtectHostname=true
ProtectKernelTunables=true
NetworkNamespacePath=/var/run/netns/ns1
AmbientCapabilities=CAP_NET_BIND_SERVICE
";
        assert_eq!(unit.content, expected);
        assert_eq!(unit.name, "vmnet-dhcp4-65f1c2a9e4b0a1d2c3e4f5a6.service");
        assert_eq!(
            unit.path,
            PathBuf::from("/etc/systemd/system/vmnet-dhcp4-65f1c2a9e4b0a1d2c3e4f5a6.service")
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let ctx = sample_context();
        let w = writer(Path::new("/etc/systemd/system"));

        for spec in ServiceSpec::for_context(&ctx) {
            let a = w.render(&ctx.vm_id, &ctx.namespace, &spec).unwrap();
            let b = w.render(&ctx.vm_id, &ctx.namespace, &spec).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_unit_names_distinct_per_protocol() {
        let w = writer(Path::new("/units"));
        let names: Vec<String> = Protocol::ALL
            .iter()
            .map(|p| w.unit_name(*p, "vm1"))
            .collect();

        assert_eq!(
            names,
            vec![
                "vmnet-dhcp4-vm1.service",
                "vmnet-dhcp6-vm1.service",
                "vmnet-ndp-vm1.service"
            ]
        );
    }

    #[test]
    fn test_escape_value() {
        assert_eq!(escape_value(r#"{"a":"b\c"}"#), r#"{\"a\":\"b\\c\"}"#);
        assert_eq!(escape_value("50%"), "50%%");
    }

    #[test]
    fn test_exec_start_quotes_paths() {
        let paths = PathsConfig {
            ip_command: "/opt/ip tools/ip".to_string(),
            netns_dir: PathBuf::from("/run/net%ns"),
            ..PathsConfig::default()
        };
        let w = UnitWriter::new(&paths, "/opt/vm net/vm%net$1");
        let ctx = sample_context();
        let [dhcp4, _, _] = ServiceSpec::for_context(&ctx);

        let unit = w.render(&ctx.vm_id, "ns1", &dhcp4).unwrap();
        assert!(unit.content.contains(
            "ExecStart=\"/opt/ip tools/ip\" netns exec ns1 \"/opt/vm net/vm%%net$$1\" dhcp4-server\n"
        ));
        assert!(unit.content.contains("NetworkNamespacePath=/run/net%%ns/ns1\n"));
    }

    #[test]
    fn test_exec_arg() {
        assert_eq!(exec_arg("/usr/sbin/ip"), "/usr/sbin/ip");
        assert_eq!(exec_arg("50%"), "50%%");
        assert_eq!(exec_arg("$HOME"), "$$HOME");
        assert_eq!(exec_arg("a b"), "\"a b\"");
        assert_eq!(exec_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(exec_arg(""), "\"\"");
    }

    #[test]
    fn test_write_overwrites_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = sample_context();
        let w = writer(dir.path());
        let [_, _, ndp] = ServiceSpec::for_context(&ctx);

        let path = w.unit_path(Protocol::Ndp, &ctx.vm_id);
        fs::write(&path, "stale").unwrap();

        let unit = w.write(&ctx.vm_id, &ctx.namespace, &ndp).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, unit.content);
        assert!(written.contains("ndp-server"));

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        // No temporary file left behind
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_write_atomic_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("unit.service");

        write_atomic(&path, b"content", 0o644).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "content");
    }
}
