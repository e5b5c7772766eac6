//! Provisioning state machine
//!
//! Tracks how far a provisioning call got. Uses the dynamic dispatch mode of
//! the state-machines crate since events are driven by external command
//! results.

use state_machines::state_machine;

state_machine! {
    name: ProvisionMachine,
    dynamic: true,
    initial: Idle,
    states: [Idle, RulesInstalled, DescriptorsWritten, Reloaded, Running, Failed],
    events {
        install {
            transition: { from: Idle, to: RulesInstalled }
        }
        write {
            transition: { from: RulesInstalled, to: DescriptorsWritten }
        }
        reload {
            transition: { from: DescriptorsWritten, to: Reloaded }
        }
        start {
            transition: { from: Reloaded, to: Running }
        }
        fail {
            transition: { from: [Idle, RulesInstalled, DescriptorsWritten, Reloaded], to: Failed }
        }
    }
}

/// Provisioning progress of one VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Idle,
    RulesInstalled,
    DescriptorsWritten,
    Reloaded,
    Running,
    Failed,
}

impl ProvisionState {
    /// Parse a state name reported by the machine
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "Idle" => Some(ProvisionState::Idle),
            "RulesInstalled" => Some(ProvisionState::RulesInstalled),
            "DescriptorsWritten" => Some(ProvisionState::DescriptorsWritten),
            "Reloaded" => Some(ProvisionState::Reloaded),
            "Running" => Some(ProvisionState::Running),
            "Failed" => Some(ProvisionState::Failed),
            _ => None,
        }
    }
}

/// State of a single provisioning call
pub struct ProvisionRun {
    machine: DynamicProvisionMachine<()>,
}

impl Default for ProvisionRun {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisionRun {
    pub fn new() -> Self {
        Self {
            machine: ProvisionMachine::new(()).into_dynamic(),
        }
    }

    pub fn state_name(&self) -> &str {
        self.machine.current_state()
    }

    pub fn state(&self) -> ProvisionState {
        ProvisionState::from_name(self.machine.current_state()).unwrap_or(ProvisionState::Failed)
    }

    pub fn install(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(ProvisionMachineEvent::Install)
    }

    pub fn write(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(ProvisionMachineEvent::Write)
    }

    pub fn reload(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(ProvisionMachineEvent::Reload)
    }

    pub fn start(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(ProvisionMachineEvent::Start)
    }

    /// Abort the run; allowed from any state short of Running
    pub fn fail(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(ProvisionMachineEvent::Fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let run = ProvisionRun::new();
        assert_eq!(run.state(), ProvisionState::Idle);
        assert_eq!(run.state_name(), "Idle");
    }

    #[test]
    fn test_full_sequence() {
        let mut run = ProvisionRun::new();

        run.install().unwrap();
        assert_eq!(run.state(), ProvisionState::RulesInstalled);

        run.write().unwrap();
        assert_eq!(run.state(), ProvisionState::DescriptorsWritten);

        run.reload().unwrap();
        assert_eq!(run.state(), ProvisionState::Reloaded);

        run.start().unwrap();
        assert_eq!(run.state(), ProvisionState::Running);
    }

    #[test]
    fn test_start_requires_reload() {
        let mut run = ProvisionRun::new();
        run.install().unwrap();
        run.write().unwrap();

        assert!(run.start().is_err());
        assert_eq!(run.state(), ProvisionState::DescriptorsWritten);
    }

    #[test]
    fn test_reload_requires_descriptors() {
        let mut run = ProvisionRun::new();
        run.install().unwrap();
        assert!(run.reload().is_err());
    }

    #[test]
    fn test_fail_from_each_step() {
        let mut run = ProvisionRun::new();
        run.fail().unwrap();
        assert_eq!(run.state(), ProvisionState::Failed);

        let mut run = ProvisionRun::new();
        run.install().unwrap();
        run.write().unwrap();
        run.reload().unwrap();
        run.fail().unwrap();
        assert_eq!(run.state(), ProvisionState::Failed);
    }

    #[test]
    fn test_failed_and_running_are_terminal() {
        let mut run = ProvisionRun::new();
        run.fail().unwrap();
        assert!(run.install().is_err());
        assert!(run.fail().is_err());

        let mut run = ProvisionRun::new();
        run.install().unwrap();
        run.write().unwrap();
        run.reload().unwrap();
        run.start().unwrap();
        assert!(run.fail().is_err());
    }
}
