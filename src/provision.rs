//! VM network provisioning
//!
//! Provides:
//! - The ordered provisioning sequence: resolve, install rules, stop old
//!   responders, write units, reload, start
//! - Dry-run planning that renders everything without side effects

pub mod state;

pub use state::{ProvisionRun, ProvisionState};

use crate::bulkhead::{BulkheadManager, RuleSet};
use crate::error::{Error, Result, Stage};
use crate::manifest::VmDef;
use crate::network::{AddressAllocator, NetworkContext, Resolver};
use crate::responder::{Protocol, ServiceSpec, ServiceUnit, UnitWriter};
use crate::systemd::Supervisor;
use tracing::{debug, info, warn};

/// Outcome of a successful provisioning call
#[derive(Debug)]
pub struct Provisioned {
    pub context: NetworkContext,
    /// Written units in start order
    pub units: Vec<ServiceUnit>,
}

/// Everything a provisioning call would do, rendered without side effects
#[derive(Debug)]
pub struct Plan {
    pub context: NetworkContext,
    pub rules: RuleSet,
    /// Rule install commands in execution order
    pub commands: Vec<String>,
    pub units: Vec<ServiceUnit>,
}

impl Plan {
    pub fn unit(&self, protocol: Protocol) -> Option<&ServiceUnit> {
        self.units.iter().find(|u| u.protocol == protocol)
    }
}

/// Sequences network setup and responder services for VMs
pub struct Provisioner<'a, A: AddressAllocator> {
    resolver: Resolver<'a, A>,
    firewall: BulkheadManager<'a>,
    units: &'a UnitWriter,
    supervisor: &'a dyn Supervisor,
}

impl<'a, A: AddressAllocator> Provisioner<'a, A> {
    pub fn new(
        resolver: Resolver<'a, A>,
        firewall: BulkheadManager<'a>,
        units: &'a UnitWriter,
        supervisor: &'a dyn Supervisor,
    ) -> Self {
        Self {
            resolver,
            firewall,
            units,
            supervisor,
        }
    }

    /// Provision a VM from scratch
    pub fn provision(&self, vm: &VmDef) -> Result<Provisioned> {
        let mut run = ProvisionRun::new();
        self.run(vm, &mut run)
    }

    /// Provision a VM, recording progress in `run`
    ///
    /// `run` must be Idle; any other state is rejected before anything is
    /// resolved or executed, and `run` is left as it was.
    ///
    /// The first failure moves `run` to Failed and is returned wrapped with
    /// its stage. Steps already done are not undone.
    pub fn run(&self, vm: &VmDef, run: &mut ProvisionRun) -> Result<Provisioned> {
        if run.state() != ProvisionState::Idle {
            return Err(Error::Transition(format!(
                "cannot provision '{}' from state {}",
                vm.id,
                run.state_name()
            )));
        }

        match self.steps(vm, run) {
            Ok(provisioned) => {
                info!(vm = %vm.id, state = run.state_name(), "provisioned");
                Ok(provisioned)
            }
            Err(e) => {
                let at = run.state_name().to_string();
                if let Err(t) = run.fail() {
                    debug!(vm = %vm.id, error = ?t, "fail transition rejected");
                }
                warn!(vm = %vm.id, at = %at, error = %e, "provisioning failed");
                Err(e)
            }
        }
    }

    fn steps(&self, vm: &VmDef, run: &mut ProvisionRun) -> Result<Provisioned> {
        // Nothing external runs before the parameters are known
        let ctx = self.resolver.resolve(vm).map_err(|e| e.at(Stage::Resolve))?;
        let specs = ServiceSpec::for_context(&ctx);

        let rules = RuleSet::anti_spoofing(&ctx.namespace, &ctx.vm_iface);
        self.firewall
            .install(&rules)
            .map_err(|e| e.at(Stage::Firewall))?;
        run.install()?;
        info!(vm = %ctx.vm_id, state = run.state_name(), "rules installed");

        for protocol in Protocol::ALL {
            let unit = self.units.unit_name(protocol, &ctx.vm_id);
            if let Err(e) = self.supervisor.stop(&unit) {
                debug!(unit = %unit, error = %e, "stop failed, continuing");
            }
        }

        let mut units = Vec::with_capacity(specs.len());
        for spec in &specs {
            let unit = self
                .units
                .write(&ctx.vm_id, &ctx.namespace, spec)
                .map_err(|e| e.at(Stage::Write))?;
            units.push(unit);
        }
        run.write()?;
        info!(vm = %ctx.vm_id, state = run.state_name(), units = units.len(), "units written");

        self.supervisor.reload().map_err(|e| e.at(Stage::Reload))?;
        run.reload()?;

        for unit in &units {
            self.supervisor
                .start(&unit.name)
                .map_err(|e| e.at(Stage::Start))?;
            debug!(unit = %unit.name, "started");
        }
        run.start()?;

        Ok(Provisioned {
            context: ctx,
            units,
        })
    }

    /// Render what provisioning a VM would do
    pub fn plan(&self, vm: &VmDef) -> Result<Plan> {
        let ctx = self.resolver.resolve(vm).map_err(|e| e.at(Stage::Resolve))?;
        let rules = RuleSet::anti_spoofing(&ctx.namespace, &ctx.vm_iface);
        let commands = self.firewall.commands(&rules);

        let units = ServiceSpec::for_context(&ctx)
            .iter()
            .map(|spec| self.units.render(&ctx.vm_id, &ctx.namespace, spec))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| e.at(Stage::Write))?;

        Ok(Plan {
            context: ctx,
            rules,
            commands,
            units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::exec::testing::RecordingRunner;
    use crate::manifest::{FirewallConfig, PathsConfig, VmnetConfig};
    use crate::network::{HostContext, StaticAllocator};
    use crate::systemd::Systemctl;
    use std::path::{Path, PathBuf};

    const VM: &str = "65f1c2a9e4b0a1d2c3e4f5a6";

    const CONFIG: &str = r#"
[node]
jumbo_frames = true

[zone]
network_mode = "vxlan_vlan"

[[vpcs]]
id = "vpc1"
network = "10.0.0.0/24"
network6 = "fd00::/64"

[[vpcs.subnets]]
id = "primary"
network = "10.0.0.0/24"
gateway = "10.0.0.1"

[[vms]]
id = "65f1c2a9e4b0a1d2c3e4f5a6"

[[vms.adapters]]
vpc = "vpc1"
subnet = "primary"
address = "10.0.0.5"

[[vms]]
id = "detached"
"#;

    struct Fixture {
        config: VmnetConfig,
        host: HostContext,
        allocator: StaticAllocator,
        writer: UnitWriter,
        _dir: tempfile::TempDir,
        unit_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let config: VmnetConfig = toml::from_str(CONFIG).unwrap();
            config.validate().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let paths = PathsConfig {
                unit_dir: dir.path().to_path_buf(),
                ..PathsConfig::default()
            };
            Self {
                host: HostContext::from_config(&config),
                allocator: StaticAllocator::from_config(&config).unwrap(),
                writer: UnitWriter::new(&paths, "/usr/bin/vmnet"),
                unit_dir: dir.path().to_path_buf(),
                _dir: dir,
                config,
            }
        }

        fn vm(&self, id: &str) -> &VmDef {
            self.config.get_vm(id).unwrap()
        }

        fn provisioner<'a>(
            &'a self,
            runner: &'a RecordingRunner,
            systemctl: &'a Systemctl<'a>,
        ) -> Provisioner<'a, StaticAllocator> {
            let firewall = FirewallConfig {
                purge_existing: false,
                ..FirewallConfig::default()
            };
            Provisioner::new(
                Resolver::new(&self.host, &self.allocator),
                BulkheadManager::new(runner, "ip", &firewall),
                &self.writer,
                systemctl,
            )
        }
    }

    fn unit_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|x| x == "service"))
                    .count()
            })
            .unwrap_or(0)
    }

    fn position(lines: &[String], needle: &str) -> usize {
        lines.iter().position(|l| l.contains(needle)).unwrap()
    }

    #[test]
    fn test_provision_sequence() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new();
        let systemctl = Systemctl::new(&runner, "systemctl");
        let provisioner = fixture.provisioner(&runner, &systemctl);

        let mut run = ProvisionRun::new();
        let provisioned = provisioner.run(fixture.vm(VM), &mut run).unwrap();
        assert_eq!(run.state(), ProvisionState::Running);

        let lines = runner.lines();
        assert_eq!(lines.len(), 6 + 3 + 1 + 3);
        assert!(lines[..6].iter().all(|l| l.starts_with("ip netns exec")));
        assert_eq!(
            lines[6..],
            [
                format!("systemctl stop vmnet-dhcp4-{}.service", VM),
                format!("systemctl stop vmnet-dhcp6-{}.service", VM),
                format!("systemctl stop vmnet-ndp-{}.service", VM),
                "systemctl daemon-reload".to_string(),
                format!("systemctl start vmnet-dhcp4-{}.service", VM),
                format!("systemctl start vmnet-dhcp6-{}.service", VM),
                format!("systemctl start vmnet-ndp-{}.service", VM),
            ]
        );

        assert_eq!(provisioned.units.len(), 3);
        assert_eq!(unit_files(&fixture.unit_dir), 3);
    }

    #[test]
    fn test_scenario_parameters() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new();
        let systemctl = Systemctl::new(&runner, "systemctl");

        let provisioned = fixture
            .provisioner(&runner, &systemctl)
            .provision(fixture.vm(VM))
            .unwrap();

        let ctx = &provisioned.context;
        assert_eq!(ctx.mtu, 8946);
        assert_eq!(ctx.ipv4_prefix_len, 24);

        let dhcp4 = &provisioned.units[0];
        assert_eq!(dhcp4.protocol, Protocol::Dhcp4);
        assert!(dhcp4.content.contains(
            r#"\"ClientIp\":\"10.0.0.5\",\"GatewayIp\":\"10.0.0.1\",\"PrefixLen\":24"#
        ));
        assert!(dhcp4.content.contains(r#"\"Mtu\":8946,\"Lifetime\":60"#));
    }

    #[test]
    fn test_reload_only_after_all_units_written() {
        let fixture = Fixture::new();
        let unit_dir = fixture.unit_dir.clone();
        // daemon-reload fails unless every unit is already on disk
        let runner = RecordingRunner::new()
            .fail_when(move |argv| argv[1] == "daemon-reload" && unit_files(&unit_dir) != 3);
        let systemctl = Systemctl::new(&runner, "systemctl");

        assert!(
            fixture
                .provisioner(&runner, &systemctl)
                .provision(fixture.vm(VM))
                .is_ok()
        );

        let lines = runner.lines();
        let reload = position(&lines, "daemon-reload");
        assert!(position(&lines, "start") > reload);
        assert!(lines.iter().rposition(|l| l.contains(" stop ")).unwrap() < reload);
    }

    #[test]
    fn test_missing_adapter_has_no_side_effects() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new();
        let systemctl = Systemctl::new(&runner, "systemctl");

        let mut run = ProvisionRun::new();
        let err = fixture
            .provisioner(&runner, &systemctl)
            .run(fixture.vm("detached"), &mut run)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.stage(), Some(Stage::Resolve));
        assert_eq!(run.state(), ProvisionState::Failed);
        assert!(runner.calls().is_empty());
        assert_eq!(unit_files(&fixture.unit_dir), 0);
    }

    #[test]
    fn test_run_must_start_idle() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new();
        let systemctl = Systemctl::new(&runner, "systemctl");
        let provisioner = fixture.provisioner(&runner, &systemctl);

        let mut failed = ProvisionRun::new();
        failed.fail().unwrap();
        let err = provisioner.run(fixture.vm(VM), &mut failed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lifecycle);
        assert_eq!(failed.state(), ProvisionState::Failed);

        let mut running = ProvisionRun::new();
        provisioner.run(fixture.vm(VM), &mut running).unwrap();
        let calls = runner.calls().len();
        assert!(provisioner.run(fixture.vm(VM), &mut running).is_err());
        assert_eq!(running.state(), ProvisionState::Running);

        // The rejected runs touched nothing
        assert_eq!(runner.calls().len(), calls);
        assert_eq!(calls, 6 + 3 + 1 + 3);
    }

    #[test]
    fn test_stop_failures_are_ignored() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new().fail_when(|argv| argv[1] == "stop");
        let systemctl = Systemctl::new(&runner, "systemctl");

        let mut run = ProvisionRun::new();
        assert!(
            fixture
                .provisioner(&runner, &systemctl)
                .run(fixture.vm(VM), &mut run)
                .is_ok()
        );
        assert_eq!(run.state(), ProvisionState::Running);
    }

    #[test]
    fn test_firewall_failure_aborts_before_units() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new().fail_when(|argv| argv.iter().any(|a| a == "547"));
        let systemctl = Systemctl::new(&runner, "systemctl");

        let mut run = ProvisionRun::new();
        let err = fixture
            .provisioner(&runner, &systemctl)
            .run(fixture.vm(VM), &mut run)
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Firewall));
        assert_eq!(err.kind(), ErrorKind::ExternalTool);
        assert!(
            err.to_string()
                .starts_with("vmnet: Failed to install ebtables rules: ")
        );
        assert_eq!(run.state(), ProvisionState::Failed);
        // Two IPv4 rules applied, then the IPv6 ACCEPT failed
        assert_eq!(runner.calls().len(), 3);
        assert_eq!(unit_files(&fixture.unit_dir), 0);
    }

    #[test]
    fn test_reload_failure_starts_nothing() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new().fail_when(|argv| argv[1] == "daemon-reload");
        let systemctl = Systemctl::new(&runner, "systemctl");

        let mut run = ProvisionRun::new();
        let err = fixture
            .provisioner(&runner, &systemctl)
            .run(fixture.vm(VM), &mut run)
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Reload));
        assert_eq!(run.state(), ProvisionState::Failed);
        assert!(!runner.lines().iter().any(|l| l.contains(" start ")));
        // Units stay written
        assert_eq!(unit_files(&fixture.unit_dir), 3);
    }

    #[test]
    fn test_start_failure_stops_sequence() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new()
            .fail_when(|argv| argv[1] == "start" && argv[2].contains("-dhcp6-"));
        let systemctl = Systemctl::new(&runner, "systemctl");

        let err = fixture
            .provisioner(&runner, &systemctl)
            .provision(fixture.vm(VM))
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Start));
        let lines = runner.lines();
        assert!(lines.last().unwrap().contains("vmnet-dhcp6-"));
        assert!(!lines.iter().any(|l| l.contains("start vmnet-ndp-")));
    }

    #[test]
    fn test_write_failure() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new();
        let systemctl = Systemctl::new(&runner, "systemctl");

        // A regular file where the unit directory should be
        let blocker = fixture.unit_dir.join("blocked");
        std::fs::write(&blocker, "").unwrap();
        let paths = PathsConfig {
            unit_dir: blocker,
            ..PathsConfig::default()
        };
        let writer = UnitWriter::new(&paths, "/usr/bin/vmnet");
        let firewall = FirewallConfig {
            purge_existing: false,
            ..FirewallConfig::default()
        };
        let provisioner = Provisioner::new(
            Resolver::new(&fixture.host, &fixture.allocator),
            BulkheadManager::new(&runner, "ip", &firewall),
            &writer,
            &systemctl,
        );

        let mut run = ProvisionRun::new();
        let err = provisioner.run(fixture.vm(VM), &mut run).unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Write));
        assert_eq!(run.state(), ProvisionState::Failed);
        assert!(!runner.lines().iter().any(|l| l.contains("daemon-reload")));
    }

    #[test]
    fn test_plan_has_no_side_effects() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new();
        let systemctl = Systemctl::new(&runner, "systemctl");
        let provisioner = fixture.provisioner(&runner, &systemctl);

        let plan = provisioner.plan(fixture.vm(VM)).unwrap();
        assert!(runner.calls().is_empty());
        assert_eq!(unit_files(&fixture.unit_dir), 0);
        assert_eq!(plan.commands.len(), 6);
        assert_eq!(plan.rules.rules.len(), 6);

        let provisioned = provisioner.provision(fixture.vm(VM)).unwrap();
        assert_eq!(plan.units, provisioned.units);
        assert_eq!(plan.unit(Protocol::Ndp), provisioned.units.last());
    }
}
