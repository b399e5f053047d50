use std::time::Duration;

use crate::controller::Orchestrator;
use crate::error::ProvisionError;
use crate::os_release;
use crate::packages::Apt;
use crate::runtime::PythonRuntime;

impl Orchestrator<'_> {
    /// Version gate, packages, Python runtime and boot configuration.
    ///
    /// Returns why a reboot is needed, if it is. Only the version gate is
    /// fatal; every other failure is recorded and the phase carries on.
    pub(crate) fn run_one_time(&mut self) -> Result<Option<String>, ProvisionError> {
        let (config, env, runner) = (self.config, self.env, self.runner);

        self.console.heading("System check");
        let os = os_release::gate(env, &config.os)?;
        self.console.success(format!("Running on {}", os.describe()));

        self.console.heading("System packages");
        let apt = Apt::new(env, runner);
        let max_age = Duration::from_secs(config.install.index_max_age_hours * 3600);
        match self.step("Package index", |_| apt.refresh_if_stale(max_age)) {
            Some(true) => self.console.success("Package index refreshed"),
            Some(false) => self.console.progress("Package index is recent"),
            None => {}
        }

        let system = &config.packages.system;
        let packages_changed = self
            .step("System packages", |_| apt.ensure(system))
            .unwrap_or(false);
        if packages_changed {
            self.console.success("System packages updated");
        } else {
            self.console.progress("System packages already current");
        }

        self.console.heading("Python runtime");
        let runtime = PythonRuntime::new(&env.python_root, runner);
        let python = &config.packages.python;
        let rebuilt = self.step("Python runtime", |_| runtime.ensure(packages_changed, python));
        if let Some(rebuilt) = rebuilt {
            if rebuilt {
                self.console.success("Python runtime rebuilt");
            } else {
                self.console.progress("Python runtime kept");
            }
        }

        self.console.heading("Boot configuration");
        let boot = super::boot_config(config);
        let bindings = self.bindings();
        let boot_changed = self
            .install(super::BOOT_CONFIG, &boot, &bindings)
            .is_some_and(|outcome| outcome.changed());
        if !boot_changed {
            self.console.progress("Boot configuration unchanged");
        }

        self.phase_end("One-time");

        let reason = if boot_changed {
            Some("the boot configuration changed".to_string())
        } else if apt.reboot_required() {
            Some("the package manager requested it".to_string())
        } else {
            None
        };
        Ok(reason)
    }
}
