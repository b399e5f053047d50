use crate::error::CommandError;
use crate::exec::{Cmd, CommandRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Enable,
    Start,
    /// `enable --now`
    EnableNow,
    Restart,
    /// Enable at boot and restart so new configuration is picked up.
    EnableAndRestart,
}

/// A systemd unit to bring into the wanted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAction {
    pub unit: String,
    pub activation: Activation,
}

impl ServiceAction {
    pub fn new(unit: impl Into<String>, activation: Activation) -> Self {
        Self {
            unit: unit.into(),
            activation,
        }
    }

    pub fn commands(&self) -> Vec<Cmd> {
        let systemctl = |verb: &[&str]| {
            Cmd::new("systemctl")
                .args(verb.iter().copied())
                .arg(&self.unit)
                .elevated()
        };
        match self.activation {
            Activation::Enable => vec![systemctl(&["enable"])],
            Activation::Start => vec![systemctl(&["start"])],
            Activation::EnableNow => vec![systemctl(&["enable", "--now"])],
            Activation::Restart => vec![systemctl(&["restart"])],
            Activation::EnableAndRestart => {
                vec![systemctl(&["enable"]), systemctl(&["restart"])]
            }
        }
    }
}

pub fn valid_unit_name(unit: &str) -> bool {
    !unit.is_empty()
        && unit
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '@')
}

/// Run the systemctl calls for `action`, stopping at the first failure.
pub fn activate(runner: &dyn CommandRunner, action: &ServiceAction) -> Result<(), CommandError> {
    if !valid_unit_name(&action.unit) {
        return Err(CommandError::ExecutionFailed {
            command: format!("systemctl {}", action.unit),
            exit_code: -1,
            stderr: format!("invalid unit name: {}", action.unit),
        });
    }
    for cmd in action.commands() {
        runner.run(&cmd)?;
    }
    tracing::info!(unit = %action.unit, activation = ?action.activation, "service activated");
    Ok(())
}

pub fn daemon_reload(runner: &dyn CommandRunner) -> Result<(), CommandError> {
    runner
        .run(&Cmd::new("systemctl").arg("daemon-reload").elevated())
        .map(|_| ())
}
