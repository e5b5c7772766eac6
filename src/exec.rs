//! External command execution
//!
//! Every side effect on the host (ebtables, systemctl) goes through a
//! `CommandRunner`, so the provisioning sequence can be exercised against a
//! recording runner in tests.

use crate::error::{Error, Result};
use std::process::Command;
use tracing::debug;

/// Runs an external program to completion
pub trait CommandRunner {
    /// Run `program` with `args`, returning combined stdout and stderr
    ///
    /// A non-zero exit is an `Error::CommandFailed` carrying the output.
    fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Render an argument vector for logs and error messages
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Runner spawning real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let command = display_command(program, args);
        debug!(command = %command, "exec");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::CommandSpawn {
                command: command.clone(),
                source: e,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stdout.is_empty() {
            stderr.into_owned()
        } else if stderr.is_empty() {
            stdout.into_owned()
        } else {
            format!("{}\n{}", stdout, stderr)
        };

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| format!(" (exit {})", c))
                .unwrap_or_default();
            return Err(Error::CommandFailed {
                command,
                output: format!("{}{}", combined.trim(), code),
            });
        }

        Ok(combined)
    }
}
