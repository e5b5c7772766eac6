//! Anti-spoofing bridge filter rules for VM namespaces
//!
//! Each VM namespace runs its own DHCPv4, DHCPv6 and NDP responders. Their
//! replies may only leave through the VM's own interface, so for every
//! responder an ACCEPT rule bound to that interface is inserted at the head
//! of the ebtables OUTPUT chain and a catch-all DROP for the same traffic is
//! appended at its tail. The ordering is the whole security property.

use crate::error::Result;
use crate::exec::{CommandRunner, display_command};
use crate::manifest::FirewallConfig;
use std::fmt;
use tracing::{debug, info};

/// Upper bound on deletions per rule when trimming earlier copies
const MAX_TRIM: usize = 16;

/// Chain all rules live in
const CHAIN: &str = "OUTPUT";

/// Ethernet protocol of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherProto {
    IPv4,
    IPv6,
}

impl fmt::Display for EtherProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtherProto::IPv4 => write!(f, "IPv4"),
            EtherProto::IPv6 => write!(f, "IPv6"),
        }
    }
}

/// Transport filter of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// UDP over IPv4 from a source port
    UdpSport4(u16),
    /// UDP over IPv6 from a source port
    UdpSport6(u16),
    /// ICMPv6 of a given type
    Icmp6Type(u8),
}

impl Filter {
    pub fn proto(&self) -> EtherProto {
        match self {
            Filter::UdpSport4(_) => EtherProto::IPv4,
            Filter::UdpSport6(_) | Filter::Icmp6Type(_) => EtherProto::IPv6,
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.proto().to_string()];
        match self {
            Filter::UdpSport4(port) => args.extend([
                "--ip-protocol".to_string(),
                "udp".to_string(),
                "--ip-sport".to_string(),
                port.to_string(),
            ]),
            Filter::UdpSport6(port) => args.extend([
                "--ip6-protocol".to_string(),
                "udp".to_string(),
                "--ip6-sport".to_string(),
                port.to_string(),
            ]),
            Filter::Icmp6Type(kind) => args.extend([
                "--ip6-protocol".to_string(),
                "ipv6-icmp".to_string(),
                "--ip6-icmp-type".to_string(),
                kind.to_string(),
            ]),
        }
        args
    }
}

/// Rule target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Drop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Accept => write!(f, "ACCEPT"),
            Action::Drop => write!(f, "DROP"),
        }
    }
}

/// Where a rule lands in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Chain head (`-I`)
    Head,
    /// Chain tail (`-A`)
    Tail,
}

/// A single OUTPUT chain rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub position: Position,
    /// Output interface the rule is restricted to
    pub out_iface: Option<String>,
    pub filter: Filter,
    pub action: Action,
}

impl Rule {
    /// Match and target arguments, shared by insert and delete
    fn spec_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(iface) = &self.out_iface {
            args.push("-o".to_string());
            args.push(iface.clone());
        }
        args.extend(self.filter.args());
        args.push("-j".to_string());
        args.push(self.action.to_string());
        args
    }

    /// ebtables arguments installing this rule
    pub fn install_args(&self) -> Vec<String> {
        let op = match self.position {
            Position::Head => "-I",
            Position::Tail => "-A",
        };
        let mut args = vec![op.to_string(), CHAIN.to_string()];
        args.extend(self.spec_args());
        args
    }

    /// ebtables arguments deleting one copy of this rule
    pub fn delete_args(&self) -> Vec<String> {
        let mut args = vec!["-D".to_string(), CHAIN.to_string()];
        args.extend(self.spec_args());
        args
    }

    /// Whether a line of `ebtables -L` output is a copy of this rule
    ///
    /// Listings abbreviate option names, print protocols by name or number
    /// and reorder options, so the line is compared by flag values.
    pub fn matches_listing(&self, line: &str) -> bool {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let value = |flags: &[&str]| {
            tokens
                .windows(2)
                .find(|pair| flags.contains(&pair[0]))
                .map(|pair| pair[1])
        };

        let action = self.action.to_string();
        if value(&["-j", "--jump"]) != Some(action.as_str()) {
            return false;
        }

        let proto_matches = value(&["-p", "--protocol"]).is_some_and(|p| match self.filter.proto() {
            EtherProto::IPv4 => p.eq_ignore_ascii_case("IPv4") || p.eq_ignore_ascii_case("0x0800"),
            EtherProto::IPv6 => p.eq_ignore_ascii_case("IPv6") || p.eq_ignore_ascii_case("0x86dd"),
        });
        if !proto_matches {
            return false;
        }

        if value(&["-o", "--out-interface", "--out-if"]) != self.out_iface.as_deref() {
            return false;
        }

        match self.filter {
            Filter::UdpSport4(port) => {
                value(&["--ip-sport", "--ip-source-port"]) == Some(port.to_string().as_str())
            }
            Filter::UdpSport6(port) => {
                value(&["--ip6-sport", "--ip6-source-port"]) == Some(port.to_string().as_str())
            }
            Filter::Icmp6Type(kind) => value(&["--ip6-icmp-type"]).is_some_and(|t| {
                t == kind.to_string() || (kind == 134 && t == "router-advertisement")
            }),
        }
    }
}

/// Ordered rules scoped to one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    pub namespace: String,
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// ACCEPT-on-interface / DROP-elsewhere pairs for DHCPv4, DHCPv6 and
    /// router advertisements
    pub fn anti_spoofing(namespace: &str, vm_iface: &str) -> Self {
        let filters = [
            Filter::UdpSport4(67),
            Filter::UdpSport6(547),
            Filter::Icmp6Type(134),
        ];

        let mut rules = Vec::with_capacity(filters.len() * 2);
        for filter in filters {
            rules.push(Rule {
                position: Position::Head,
                out_iface: Some(vm_iface.to_string()),
                filter,
                action: Action::Accept,
            });
            rules.push(Rule {
                position: Position::Tail,
                out_iface: None,
                filter,
                action: Action::Drop,
            });
        }

        Self {
            namespace: namespace.to_string(),
            rules,
        }
    }

    /// Rules in chain evaluation order once installed on an empty chain
    ///
    /// Head inserts land in reverse install order ahead of every tail append.
    pub fn evaluation_order(&self) -> Vec<&Rule> {
        let mut heads: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|r| r.position == Position::Head)
            .collect();
        heads.reverse();
        heads.extend(self.rules.iter().filter(|r| r.position == Position::Tail));
        heads
    }
}

/// Installs rule sets inside namespaces via `ip netns exec <ns> ebtables`
pub struct BulkheadManager<'a> {
    runner: &'a dyn CommandRunner,
    ip_command: String,
    ebtables: String,
    purge_existing: bool,
}

impl<'a> BulkheadManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner, ip_command: &str, config: &FirewallConfig) -> Self {
        Self {
            runner,
            ip_command: ip_command.to_string(),
            ebtables: config.ebtables.clone(),
            purge_existing: config.purge_existing,
        }
    }

    fn argv(&self, namespace: &str, args: Vec<String>) -> Vec<String> {
        let mut argv = vec![
            "netns".to_string(),
            "exec".to_string(),
            namespace.to_string(),
            self.ebtables.clone(),
        ];
        argv.extend(args);
        argv
    }

    fn ebtables(&self, namespace: &str, args: Vec<String>) -> Result<String> {
        self.runner.run(&self.ip_command, &self.argv(namespace, args))
    }

    /// Install commands of a rule set as they would be run, trim excluded
    pub fn commands(&self, set: &RuleSet) -> Vec<String> {
        set.rules
            .iter()
            .map(|rule| display_command(&self.ip_command, &self.argv(&set.namespace, rule.install_args())))
            .collect()
    }

    /// Install every rule in order, stopping at the first failure
    ///
    /// Rules already applied stay in place when a later one fails and
    /// nothing is deleted. Surplus copies left by earlier runs are trimmed
    /// only once the whole set is installed.
    pub fn install(&self, set: &RuleSet) -> Result<()> {
        for rule in &set.rules {
            self.ebtables(&set.namespace, rule.install_args())?;
        }

        if self.purge_existing {
            self.trim(set);
        }

        info!(
            namespace = %set.namespace,
            rules = set.rules.len(),
            "installed anti-spoofing rules"
        );
        Ok(())
    }

    /// Delete surplus copies of the rules, keeping one of each
    ///
    /// Copies of a rule are interchangeable, so deleting the first match
    /// never leaves the chain without it. Failures end the trim quietly.
    fn trim(&self, set: &RuleSet) {
        let listing = match self.ebtables(&set.namespace, vec!["-L".to_string(), CHAIN.to_string()]) {
            Ok(listing) => listing,
            Err(e) => {
                debug!(namespace = %set.namespace, error = %e, "chain listing failed, not trimming");
                return;
            }
        };

        for rule in &set.rules {
            let copies = listing.lines().filter(|line| rule.matches_listing(line)).count();
            let surplus = copies.saturating_sub(1).min(MAX_TRIM);

            let mut removed = 0;
            while removed < surplus {
                if let Err(e) = self.ebtables(&set.namespace, rule.delete_args()) {
                    debug!(namespace = %set.namespace, error = %e, "trim stopped");
                    break;
                }
                removed += 1;
            }
            if removed > 0 {
                debug!(
                    namespace = %set.namespace,
                    removed,
                    rule = %rule.delete_args().join(" "),
                    "trimmed stale rule copies"
                );
            }
        }
    }
}
