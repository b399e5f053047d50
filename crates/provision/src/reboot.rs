//! Scheduling the reboot that ends the one-time phase.

use std::path::Path;
use std::time::Duration;

use appliance_config::BootBehaviour;
use chrono::Utc;

use crate::console::Console;
use crate::continuation::{ContinuationState, LoginHook, StateStore};
use crate::environment::Environment;
use crate::error::{CommandError, ProvisionError};
use crate::exec::{Cmd, CommandRunner};
use crate::report::StepFailure;

/// Switch what the board boots into (console/desktop, with or without
/// auto-login).
pub fn set_boot_behaviour(
    runner: &dyn CommandRunner,
    behaviour: BootBehaviour,
) -> Result<(), CommandError> {
    runner
        .run(
            &Cmd::new("raspi-config")
                .args(["nonint", "do_boot_behaviour", behaviour.code()])
                .elevated(),
        )
        .map(|_| ())
}

/// Proof that the continuation is durable. The only way to reboot.
#[must_use = "a scheduled reboot does nothing until triggered"]
#[derive(Debug)]
pub struct RebootTicket {
    settle: Duration,
}

impl RebootTicket {
    /// Flush output, give logging a moment, and reboot. On a real system
    /// this does not come back.
    pub fn trigger(self, runner: &dyn CommandRunner, console: &Console) -> Result<(), CommandError> {
        console.warning("Rebooting now; provisioning resumes on the next login");
        console.flush();
        std::thread::sleep(self.settle);
        runner
            .run(&Cmd::new("systemctl").arg("reboot").elevated())
            .map(|_| ())
    }
}

pub struct RebootScheduler<'a> {
    env: &'a Environment,
    runner: &'a dyn CommandRunner,
    console: &'a Console,
    autologin: BootBehaviour,
    settle: Duration,
}

impl<'a> RebootScheduler<'a> {
    pub fn new(
        env: &'a Environment,
        runner: &'a dyn CommandRunner,
        console: &'a Console,
        autologin: BootBehaviour,
        settle: Duration,
    ) -> Self {
        Self {
            env,
            runner,
            console,
            autologin,
            settle,
        }
    }

    /// Persist the continuation, arm the login hook and switch to
    /// auto-login. Everything durable happens here, before the ticket
    /// exists.
    pub fn schedule(
        &self,
        working_dir: &Path,
        command: &str,
        reason: &str,
        carried: &[StepFailure],
    ) -> Result<RebootTicket, ProvisionError> {
        let as_root = self.env.continuation_needs_sudo();
        let command = if as_root {
            format!("sudo {command}")
        } else {
            command.to_string()
        };
        let state = ContinuationState {
            scheduled_at: Utc::now(),
            working_dir: working_dir.to_path_buf(),
            command: command.clone(),
            reason: reason.to_string(),
            carried_failures: carried.to_vec(),
            as_root,
        };
        StateStore::new(&self.env.state_file).save(&state)?;

        let hook = LoginHook::new(&self.env.startup_file);
        if hook.install(working_dir, &command)? {
            self.console.progress(format!(
                "Added continuation to {}",
                self.env.startup_file.display()
            ));
        } else {
            self.console.progress("Continuation already scheduled");
        }

        match set_boot_behaviour(self.runner, self.autologin) {
            Ok(()) => self.console.progress("Console auto-login enabled"),
            // The hook still fires on a manual login.
            Err(e) => self.console.warning(format!(
                "Could not enable auto-login ({e}); log in manually after the reboot"
            )),
        }

        tracing::info!(reason, as_root, "reboot scheduled");
        Ok(RebootTicket {
            settle: self.settle,
        })
    }
}
