//! Unified error types for vmnet

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for vmnet operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("VM '{0}' has no network adapter")]
    MissingNetworkAdapter(String),

    // Address allocation errors
    #[error("VPC '{0}' not found")]
    VpcNotFound(String),

    #[error("Subnet '{subnet}' not found in VPC '{vpc}'")]
    SubnetNotFound { vpc: String, subnet: String },

    #[error("Address allocation failed: {0}")]
    Allocation(String),

    // Parse errors
    #[error("Failed to marshal {what}: {source}")]
    Marshal {
        what: String,
        source: serde_json::Error,
    },

    #[error("Failed to get executable path: {0}")]
    ExecutablePath(io::Error),

    #[error("Invalid service config: {0}")]
    ServiceConfig(String),

    // External tool errors
    #[error("Command '{command}' failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("Failed to run '{command}': {source}")]
    CommandSpawn { command: String, source: io::Error },

    // Lifecycle errors
    #[error("Invalid lifecycle transition: {0}")]
    Transition(String),

    #[error("{stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

/// Provisioning stage a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Firewall,
    Write,
    Reload,
    Start,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Resolve => "vmnet: Failed to resolve network",
            Stage::Firewall => "vmnet: Failed to install ebtables rules",
            Stage::Write => "vmnet: Failed to write service",
            Stage::Reload => "vmnet: Failed to reload systemd",
            Stage::Start => "vmnet: Failed to start service",
        };
        write!(f, "{}", s)
    }
}

/// Coarse classification used by callers deciding whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing configuration; retrying will not help
    Configuration,
    /// Payload or path could not be produced
    Parse,
    /// An external command exited non-zero or could not be spawned
    ExternalTool,
    Io,
    Lifecycle,
}

impl Error {
    /// Wrap an error with the stage it happened in
    pub fn at(self, stage: Stage) -> Self {
        Error::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Classify this error, looking through stage context
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Stage { source, .. } => source.kind(),
            Error::ConfigRead { .. }
            | Error::ConfigParse(_)
            | Error::ConfigValidation(_)
            | Error::VmNotFound(_)
            | Error::MissingNetworkAdapter(_)
            | Error::VpcNotFound(_)
            | Error::SubnetNotFound { .. }
            | Error::Allocation(_) => ErrorKind::Configuration,
            Error::Marshal { .. } | Error::ExecutablePath(_) | Error::ServiceConfig(_) => {
                ErrorKind::Parse
            }
            Error::CommandFailed { .. } | Error::CommandSpawn { .. } => ErrorKind::ExternalTool,
            Error::Io(_) => ErrorKind::Io,
            Error::Transition(_) => ErrorKind::Lifecycle,
        }
    }

    /// Stage the error was raised in, if it carries one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<state_machines::DynamicError> for Error {
    fn from(e: state_machines::DynamicError) -> Self {
        Error::Transition(format!("{:?}", e))
    }
}

/// Result type alias for vmnet operations
pub type Result<T> = std::result::Result<T, Error>;
