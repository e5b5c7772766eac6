//! vmnet - per-VM network namespace control plane
//!
//! Installs anti-spoofing rules in VM network namespaces and runs the
//! DHCPv4, DHCPv6 and NDP responders of each VM as systemd services.

mod bulkhead;
mod cli;
mod error;
mod exec;
mod logging;
mod manifest;
mod network;
mod provision;
mod responder;
mod serve;
mod systemd;

use bulkhead::BulkheadManager;
use cli::{Cli, Commands};
use error::{Error, Result, Stage};
use exec::SystemRunner;
use manifest::{VmDef, VmnetConfig};
use network::{HostContext, Resolver, StaticAllocator};
use provision::{Plan, Provisioner};
use responder::{Protocol, UnitWriter};
use systemd::Systemctl;

fn main() {
    if let Err(e) = run() {
        tracing::debug!(kind = ?e.kind(), stage = ?e.stage(), "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();
    logging::init_logging(logging::level_for(cli.verbose, cli.log_level.as_deref()));

    // Commands that don't require config
    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            return Ok(());
        }
        Commands::Dhcp4Server { responder } => return serve::serve(Protocol::Dhcp4, responder),
        Commands::Dhcp6Server { responder } => return serve::serve(Protocol::Dhcp6, responder),
        Commands::NdpServer { responder } => return serve::serve(Protocol::Ndp, responder),
        _ => {}
    }

    let config = manifest::load(&cli.config)?;

    match cli.command {
        Commands::Provision { vm, all, dry_run } => {
            // Require either VM id or --all
            if vm.is_none() && !all {
                eprintln!("Error: specify a VM id or use --all to provision all VMs");
                std::process::exit(1);
            }
            provision(&config, vm.as_deref(), dry_run)?;
        }
        Commands::Render { vm, protocol } => {
            let protocol: Protocol = protocol.parse()?;
            render(&config, &vm, protocol)?;
        }
        Commands::Check => {
            check(&config)?;
        }
        // Already handled above
        Commands::Completion { .. }
        | Commands::Dhcp4Server { .. }
        | Commands::Dhcp6Server { .. }
        | Commands::NdpServer { .. } => unreachable!(),
    }

    Ok(())
}

fn select_vms<'c>(config: &'c VmnetConfig, vm: Option<&str>) -> Result<Vec<&'c VmDef>> {
    match vm {
        Some(id) => {
            let vm = config
                .get_vm(id)
                .ok_or_else(|| Error::VmNotFound(id.to_string()))?;
            Ok(vec![vm])
        }
        None => Ok(config.vms.iter().collect()),
    }
}

/// Wire a provisioner against the host and run `f` with it
fn with_provisioner<T>(
    config: &VmnetConfig,
    f: impl FnOnce(&Provisioner<'_, StaticAllocator>) -> Result<T>,
) -> Result<T> {
    let host = HostContext::from_config(config);
    let allocator = StaticAllocator::from_config(config)?;
    let runner = SystemRunner;
    let writer = UnitWriter::for_current_exe(&config.paths).map_err(|e| e.at(Stage::Write))?;
    let systemctl = Systemctl::new(&runner, &config.paths.systemctl);
    let provisioner = Provisioner::new(
        Resolver::new(&host, &allocator),
        BulkheadManager::new(&runner, &config.paths.ip_command, &config.firewall),
        &writer,
        &systemctl,
    );

    f(&provisioner)
}

fn provision(config: &VmnetConfig, vm: Option<&str>, dry_run: bool) -> Result<()> {
    let vms = select_vms(config, vm)?;

    with_provisioner(config, |provisioner| {
        if dry_run {
            println!("=== DRY RUN - No changes will be made ===\n");
            for vm in &vms {
                print_plan(&provisioner.plan(vm)?);
            }
            return Ok(());
        }

        for vm in &vms {
            let provisioned = provisioner.provision(vm)?;
            let ctx = &provisioned.context;
            println!(
                "Provisioned {} (namespace {}, {}/{}, mtu {})",
                ctx.vm_id, ctx.namespace, ctx.ipv4_addr, ctx.ipv4_prefix_len, ctx.mtu
            );
            for unit in &provisioned.units {
                println!("  started {}", unit.name);
            }
        }

        Ok(())
    })
}

fn print_plan(plan: &Plan) {
    let ctx = &plan.context;
    println!("  [PROVISION] {}", ctx.vm_id);
    println!("          Namespace: {}", ctx.namespace);
    println!("          IPv4: {}/{} via {}", ctx.ipv4_addr, ctx.ipv4_prefix_len, ctx.ipv4_gateway);
    println!("          IPv6: {}/{} via {}", ctx.ipv6_addr, ctx.ipv6_prefix_len, ctx.ipv6_gateway);
    println!("          MTU: {}", ctx.mtu);
    println!("          Rules:");
    for command in &plan.commands {
        println!("            {}", command);
    }
    println!("          Units:");
    for unit in &plan.units {
        println!("            {}", unit.path.display());
    }
    println!();
}

fn render(config: &VmnetConfig, vm: &str, protocol: Protocol) -> Result<()> {
    let vm = config
        .get_vm(vm)
        .ok_or_else(|| Error::VmNotFound(vm.to_string()))?;

    with_provisioner(config, |provisioner| {
        let plan = provisioner.plan(vm)?;
        if let Some(unit) = plan.unit(protocol) {
            println!("# {}", unit.path.display());
            print!("{}", unit.content);
        }
        Ok(())
    })
}

fn check(config: &VmnetConfig) -> Result<()> {
    // Configuration was already validated on load
    println!("Configuration is valid.");

    let host = HostContext::from_config(config);
    let allocator = StaticAllocator::from_config(config)?;
    let resolver = Resolver::new(&host, &allocator);

    println!("\nMTU: {}", host.mtu());
    println!("\nVMs:");
    for vm in &config.vms {
        match resolver.resolve(vm) {
            Ok(ctx) => println!(
                "  {}: {} {}/{} {}",
                vm.id, ctx.namespace, ctx.ipv4_addr, ctx.ipv4_prefix_len, ctx.ipv6_addr
            ),
            Err(e) => println!("  {}: {}", vm.id, e),
        }
    }

    Ok(())
}
