//! The resumable phase state machine.
//!
//! ```text
//!            state file?
//!   no ──► Initial ──(reboot needed)──► RebootPending ──► ticket, process ends
//!             │                                   (OS reboots, login hook fires)
//!             │ no reboot needed
//!             ▼
//!   yes ─► Continuation ─► always-run phase ─► Done | Failed
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use appliance_config::ApplianceConfig;

use crate::console::Console;
use crate::continuation::{ContinuationState, LoginHook, StateStore};
use crate::environment::Environment;
use crate::error::ProvisionError;
use crate::exec::CommandRunner;
use crate::installer::{InstallOutcome, Installer, Resource};
use crate::reboot::{self, RebootScheduler, RebootTicket};
use crate::report::{Aggregator, Summary};
use crate::template::{Bindings, Placeholder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Initial,
    RebootPending,
    Continuation,
    Done,
    Failed,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initial => "initial",
            Self::RebootPending => "reboot-pending",
            Self::Continuation => "continuation",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

/// How this process was started.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Started by the login hook (`--continue`).
    pub resume: bool,
    /// Directory the hook re-enters.
    pub working_dir: PathBuf,
    /// Command line the hook runs, already shell-quoted.
    pub command: String,
}

#[must_use]
#[derive(Debug)]
pub enum RunOutcome {
    Finished { state: PhaseState, summary: Summary },
    Reboot(RebootTicket),
    /// Started by the hook, but there was no pending continuation.
    NothingToResume,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Finished {
                state: PhaseState::Failed,
                ..
            } => 1,
            _ => 0,
        }
    }
}

/// Snapshot for the `status` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub phase: PhaseState,
    pub pending: Option<ContinuationState>,
    pub hook_installed: bool,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "next run:      {}", self.phase)?;
        match &self.pending {
            Some(state) => {
                writeln!(f, "scheduled at:  {}", state.scheduled_at.to_rfc3339())?;
                writeln!(f, "reason:        {}", state.reason)?;
                writeln!(f, "carried:       {} failure(s)", state.carried_failures.len())?;
                if state.as_root {
                    writeln!(f, "resumes with:  sudo")?;
                }
            }
            None => writeln!(f, "scheduled at:  -")?,
        }
        write!(
            f,
            "login hook:    {}",
            if self.hook_installed { "installed" } else { "absent" }
        )
    }
}

pub struct Orchestrator<'a> {
    pub(crate) config: &'a ApplianceConfig,
    pub(crate) env: &'a Environment,
    pub(crate) runner: &'a dyn CommandRunner,
    pub(crate) console: &'a Console,
    pub(crate) errors: Aggregator,
    state: PhaseState,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a ApplianceConfig,
        env: &'a Environment,
        runner: &'a dyn CommandRunner,
        console: &'a Console,
    ) -> Self {
        Self {
            config,
            env,
            runner,
            console,
            errors: Aggregator::new(),
            state: PhaseState::Initial,
        }
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn errors(&self) -> &Aggregator {
        &self.errors
    }

    /// `Continuation` when a continuation is pending, else `Initial`.
    pub fn detect(&self) -> PhaseState {
        if StateStore::new(&self.env.state_file).exists() {
            PhaseState::Continuation
        } else {
            PhaseState::Initial
        }
    }

    pub fn status(&self) -> Result<Status, ProvisionError> {
        let pending = StateStore::new(&self.env.state_file).load()?;
        Ok(Status {
            phase: self.detect(),
            pending,
            hook_installed: LoginHook::new(&self.env.startup_file).is_installed()?,
        })
    }

    /// Forget any pending continuation and put the normal login back.
    /// The next run starts from `Initial`.
    pub fn reset(&self) -> Result<(), ProvisionError> {
        let cleared = StateStore::new(&self.env.state_file).clear()?;
        let removed = LoginHook::new(&self.env.startup_file).remove()?;
        reboot::set_boot_behaviour(self.runner, self.config.install.restore_behaviour)?;
        tracing::info!(cleared, removed, "continuation reset");
        self.console.success(format!(
            "Reset: state file {}, {removed} hook line(s) removed",
            if cleared { "removed" } else { "absent" }
        ));
        Ok(())
    }

    pub fn run(&mut self, invocation: &Invocation) -> Result<RunOutcome, ProvisionError> {
        let store = StateStore::new(&self.env.state_file);
        let pending = match store.load() {
            Ok(pending) => pending,
            Err(e) if invocation.resume => {
                // Otherwise every login runs into the same error.
                let removed = LoginHook::new(&self.env.startup_file).remove().unwrap_or(0);
                tracing::warn!(error = %e, removed, "unreadable continuation state");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        match pending {
            Some(state) => {
                self.transition(PhaseState::Continuation);
                self.resume(&store, state.carried_failures, &state.reason);
            }
            None if invocation.resume => {
                let stale = LoginHook::new(&self.env.startup_file).remove()?;
                tracing::info!(stale, "started by login hook without pending continuation");
                self.console.progress("Nothing to resume");
                return Ok(RunOutcome::NothingToResume);
            }
            None => {
                self.transition(PhaseState::Initial);
                if let Some(reason) = self.run_one_time()? {
                    self.transition(PhaseState::RebootPending);
                    let ticket = self.schedule_reboot(invocation, &reason)?;
                    return Ok(RunOutcome::Reboot(ticket));
                }
            }
        }

        self.run_always();
        Ok(self.finish())
    }

    fn resume(
        &mut self,
        store: &StateStore,
        carried: Vec<crate::report::StepFailure>,
        reason: &str,
    ) {
        self.console.heading("Resuming after reboot");
        self.console.progress(format!("Reboot was needed because {reason}"));

        // Independent: a state file that will not go away must not keep
        // the hook firing on every login, and vice versa.
        self.step("Continuation state", |_| store.clear());
        self.step("Login hook", |o| LoginHook::new(&o.env.startup_file).remove());

        let restore = self.config.install.restore_behaviour;
        if self
            .step("Boot behaviour", |o| reboot::set_boot_behaviour(o.runner, restore))
            .is_some()
        {
            self.console.success("Normal login restored");
        }

        if !carried.is_empty() {
            self.console.warning(format!(
                "{} error(s) carried over from before the reboot",
                carried.len()
            ));
            self.errors.absorb(carried);
        }
    }

    fn schedule_reboot(
        &mut self,
        invocation: &Invocation,
        reason: &str,
    ) -> Result<RebootTicket, ProvisionError> {
        self.console.heading("Reboot");
        self.console
            .warning(format!("A reboot is required because {reason}"));
        let scheduler = RebootScheduler::new(
            self.env,
            self.runner,
            self.console,
            self.config.install.autologin_behaviour,
            Duration::from_secs(self.config.install.reboot_settle_secs),
        );
        scheduler.schedule(
            &invocation.working_dir,
            &invocation.command,
            reason,
            self.errors.failures(),
        )
    }

    fn finish(&mut self) -> RunOutcome {
        let summary = self.errors.summarize();
        self.console.heading("Summary");
        if summary.passed() {
            self.transition(PhaseState::Done);
            self.console.success(summary.to_string());
        } else {
            self.transition(PhaseState::Failed);
            self.console.error(summary.to_string());
        }
        RunOutcome::Finished {
            state: self.state,
            summary,
        }
    }

    pub(crate) fn transition(&mut self, to: PhaseState) {
        tracing::info!(from = %self.state, to = %to, "phase transition");
        self.state = to;
    }

    /// Run one step; a failure is recorded and the phase moves on.
    pub(crate) fn step<T, E: fmt::Display>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Option<T> {
        match f(self) {
            Ok(value) => Some(value),
            Err(e) => {
                self.console.error(format!("{name}: {e}"));
                self.errors.mark_error(name, e);
                None
            }
        }
    }

    pub(crate) fn install(
        &mut self,
        step: &str,
        resource: &Resource,
        bindings: &Bindings,
    ) -> Option<InstallOutcome> {
        let installer = Installer::new(self.env, self.runner, self.console);
        self.step(step, |_| installer.install(resource, bindings))
    }

    /// Base bindings plus the appliance's own identity.
    pub(crate) fn bindings(&self) -> Bindings {
        self.env
            .bindings()
            .with(Placeholder::Hostname, &self.config.install.hostname)
            .with(Placeholder::Appliance, &self.config.appliance.name)
    }

    pub(crate) fn phase_end(&self, phase: &str) {
        let count = self.errors.failures().len();
        if self.errors.has_errors() {
            self.console
                .warning(format!("{phase} phase finished with {count} error(s) so far"));
        } else {
            self.console.success(format!("{phase} phase finished"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::HOOK_SENTINEL;
    use crate::environment::{Identity, Privilege};
    use crate::exec::RecordingRunner;
    use tempfile::TempDir;

    fn env(tmp: &TempDir) -> Environment {
        let home = tmp.path().join("home/pi");
        std::fs::create_dir_all(&home).unwrap();
        Environment::new(
            &tmp.path().join("opt/tonebox"),
            &home,
            Identity::new("pi", "pi"),
            Privilege::Direct,
        )
    }

    #[test]
    fn test_stuck_state_file_does_not_keep_the_hook() {
        let tmp = TempDir::new().unwrap();
        let env = env(&tmp);
        let config = ApplianceConfig::new("tonebox", "1.0.0");
        let runner = RecordingRunner::new();
        let console = Console::in_memory();
        LoginHook::new(&env.startup_file)
            .install(&env.install_root, "./appliance-provision --continue")
            .unwrap();
        // remove_file cannot delete a directory.
        std::fs::create_dir_all(&env.state_file).unwrap();
        let store = StateStore::new(&env.state_file);

        let mut orchestrator = Orchestrator::new(&config, &env, &runner, &console);
        orchestrator.resume(&store, Vec::new(), "the boot configuration changed");

        let bashrc = std::fs::read_to_string(&env.startup_file).unwrap();
        assert!(!bashrc.contains(HOOK_SENTINEL));
        let steps: Vec<&str> = orchestrator
            .errors()
            .failures()
            .iter()
            .map(|f| f.step.as_str())
            .collect();
        assert_eq!(steps, vec!["Continuation state"]);
        assert!(runner.ran("raspi-config nonint do_boot_behaviour"));
    }

    #[test]
    fn test_exit_codes() {
        let done = RunOutcome::Finished {
            state: PhaseState::Done,
            summary: Aggregator::new().summarize(),
        };
        assert_eq!(done.exit_code(), 0);
        let mut agg = Aggregator::new();
        agg.mark_error("Audio", "failed");
        let failed = RunOutcome::Finished {
            state: PhaseState::Failed,
            summary: agg.summarize(),
        };
        assert_eq!(failed.exit_code(), 1);
        assert_eq!(RunOutcome::NothingToResume.exit_code(), 0);
    }

    #[test]
    fn test_phase_state_display() {
        assert_eq!(PhaseState::RebootPending.to_string(), "reboot-pending");
        assert_eq!(PhaseState::Continuation.to_string(), "continuation");
    }
}
