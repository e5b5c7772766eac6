//! Service supervisor control through systemctl

use crate::error::Result;
use crate::exec::CommandRunner;
use tracing::debug;

/// Controls responder units
pub trait Supervisor {
    fn stop(&self, unit: &str) -> Result<()>;
    /// Re-read unit files from disk
    fn reload(&self) -> Result<()>;
    fn start(&self, unit: &str) -> Result<()>;
}

/// `systemctl` driven through a command runner
pub struct Systemctl<'a> {
    runner: &'a dyn CommandRunner,
    program: String,
}

impl<'a> Systemctl<'a> {
    pub fn new(runner: &'a dyn CommandRunner, program: &str) -> Self {
        Self {
            runner,
            program: program.to_string(),
        }
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self.runner.run(&self.program, &args)?;
        if !output.trim().is_empty() {
            debug!(output = %output.trim(), "systemctl output");
        }
        Ok(())
    }
}

impl Supervisor for Systemctl<'_> {
    fn stop(&self, unit: &str) -> Result<()> {
        self.systemctl(&["stop", unit])
    }

    fn reload(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"])
    }

    fn start(&self, unit: &str) -> Result<()> {
        self.systemctl(&["start", unit])
    }
}
