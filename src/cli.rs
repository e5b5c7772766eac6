//! Command-line interface for vmnet
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// vmnet - per-VM network namespace control plane
#[derive(Parser)]
#[command(name = "vmnet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "vmnet.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Log filter (e.g. "debug", "vmnet=trace"); RUST_LOG overrides it
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Install anti-spoofing rules and (re)start the responders of VMs
    Provision {
        /// VM to provision
        vm: Option<String>,

        /// Provision every VM in the configuration
        #[arg(long, conflicts_with = "vm")]
        all: bool,

        /// Show what would be done without making changes
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the unit of one responder of a VM
    Render {
        /// VM id
        vm: String,

        /// Responder protocol (dhcp4, dhcp6 or ndp)
        protocol: String,
    },

    /// Validate configuration file
    Check,

    /// Run the DHCPv4 responder (invoked by generated units)
    #[command(name = "dhcp4-server")]
    Dhcp4Server {
        /// Responder binary to hand the configuration to
        #[arg(long)]
        responder: Option<PathBuf>,
    },

    /// Run the DHCPv6 responder (invoked by generated units)
    #[command(name = "dhcp6-server")]
    Dhcp6Server {
        /// Responder binary to hand the configuration to
        #[arg(long)]
        responder: Option<PathBuf>,
    },

    /// Run the NDP responder (invoked by generated units)
    #[command(name = "ndp-server")]
    NdpServer {
        /// Responder binary to hand the configuration to
        #[arg(long)]
        responder: Option<PathBuf>,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "vmnet", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_provision() {
        let cli = Cli::try_parse_from(["vmnet", "-c", "/etc/vmnet.toml", "provision", "vm1", "--dry-run"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/vmnet.toml"));
        match cli.command {
            Commands::Provision { vm, all, dry_run } => {
                assert_eq!(vm.as_deref(), Some("vm1"));
                assert!(!all);
                assert!(dry_run);
            }
            _ => panic!("expected provision"),
        }
    }

    #[test]
    fn test_provision_vm_conflicts_with_all() {
        assert!(Cli::try_parse_from(["vmnet", "provision", "vm1", "--all"]).is_err());
    }

    #[test]
    fn test_parse_server_tag() {
        let cli = Cli::try_parse_from(["vmnet", "ndp-server", "--responder", "/opt/ndp"]).unwrap();
        match cli.command {
            Commands::NdpServer { responder } => {
                assert_eq!(responder, Some(PathBuf::from("/opt/ndp")));
            }
            _ => panic!("expected ndp-server"),
        }
    }
}
