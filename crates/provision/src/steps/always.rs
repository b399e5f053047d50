use std::io::Write;

use chrono::Local;

use crate::controller::Orchestrator;
use crate::error::{CommandError, ProvisionError};
use crate::exec::Cmd;
use crate::installer::Resource;
use crate::os_release::OsRelease;
use crate::runtime::PythonRuntime;
use crate::template::Bindings;

impl Orchestrator<'_> {
    /// Steps that run on every invocation. All of them are idempotent.
    pub(crate) fn run_always(&mut self) {
        let config = self.config;
        let bindings = self.bindings();

        self.console.heading("Hostname");
        if let Some(true) = self.step("Hostname", |o| o.ensure_hostname()) {
            self.console
                .success(format!("Hostname set to {}", config.install.hostname));
        }
        self.install_all("Hostname", &super::mdns(config), &bindings);

        self.console.heading("USB automount");
        if config.features.usb_automount {
            self.install_all("USB automount", &super::usb_automount(config), &bindings);
        } else {
            self.console.progress("USB automount disabled, skipping");
        }

        self.console.heading("Hardware interfaces");
        let interfaces = config.interfaces.enabled();
        if interfaces.is_empty() {
            self.console.progress("No hardware interfaces requested");
        }
        for iface in interfaces {
            match self.step("Hardware interfaces", |o| o.enable_interface(iface)) {
                Some(true) => self.console.success(format!("Enabled {iface}")),
                Some(false) => self.console.progress(format!("{iface} already enabled")),
                None => {}
            }
        }

        self.console.heading("Version log");
        self.step("Version log", |o| o.append_version_log());

        self.console.heading("Audio");
        if config.audio.enabled {
            self.install_all("Audio", &super::audio(config), &bindings);
            if let Some(volume) = config.audio.volume_percent {
                let control = &config.audio.mixer_control;
                if self.step("Audio", |o| o.set_volume(control, volume)).is_some() {
                    self.console.progress(format!("{control} volume at {volume}%"));
                }
            }
        } else {
            self.console.progress("Audio disabled, skipping");
        }

        self.console.heading("Spotify bridge");
        if config.features.spotify {
            let resources = super::spotify(config, self.env);
            self.install_all("Spotify bridge", &resources, &bindings);
        } else {
            self.console.progress("Spotify bridge disabled, skipping");
        }

        self.console.heading("Autostart");
        if config.features.autostart {
            self.install_all("Autostart", &[super::autostart(config)], &bindings);
        } else {
            self.console.progress("Autostart disabled, skipping");
        }

        self.phase_end("Always-run");
    }

    /// Each resource is independent: one failing does not skip the rest.
    fn install_all(&mut self, step: &str, resources: &[Resource], bindings: &Bindings) {
        for resource in resources {
            if let Some(outcome) = self.install(step, resource, bindings) {
                if !outcome.changed() {
                    self.console.progress(format!("{}: up to date", resource.name));
                }
            }
        }
    }

    fn ensure_hostname(&self) -> Result<bool, CommandError> {
        let wanted = &self.config.install.hostname;
        let current = std::fs::read_to_string(self.env.host_path("/etc/hostname"))
            .unwrap_or_default();
        if current.trim() == wanted {
            return Ok(false);
        }
        self.runner.run(
            &Cmd::new("hostnamectl")
                .args(["set-hostname", wanted.as_str()])
                .elevated(),
        )?;
        Ok(true)
    }

    /// raspi-config reports 0 for an enabled interface.
    fn enable_interface(&self, iface: &str) -> Result<bool, CommandError> {
        let state = self.runner.run(
            &Cmd::new("raspi-config")
                .arg("nonint")
                .arg(format!("get_{iface}"))
                .elevated()
                .quiet(),
        )?;
        if state.stdout_text().trim() == "0" {
            return Ok(false);
        }
        self.runner.run(
            &Cmd::new("raspi-config")
                .arg("nonint")
                .arg(format!("do_{iface}"))
                .arg("0")
                .elevated(),
        )?;
        Ok(true)
    }

    fn set_volume(&self, control: &str, percent: u8) -> Result<(), CommandError> {
        self.runner
            .run(
                &Cmd::new("amixer")
                    .args(["-q", "sset", control])
                    .arg(format!("{percent}%")),
            )
            .map(|_| ())
    }

    /// One line per run: what was provisioned onto what.
    fn append_version_log(&self) -> Result<(), ProvisionError> {
        let os = OsRelease::load(&self.env.host_path("/etc/os-release"))
            .map(|os| os.describe())
            .unwrap_or_else(|_| "unknown".into());
        let kernel = self
            .runner
            .run(&Cmd::new("uname").arg("-r").quiet())
            .map(|out| out.stdout_text().trim().to_string())
            .unwrap_or_else(|_| "unknown".into());
        let python = PythonRuntime::new(&self.env.python_root, self.runner)
            .version()
            .unwrap_or_else(|| "none".into());

        let line = format!(
            "{} {} {} | os: {os} | kernel: {kernel} | python: {python}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.config.appliance.name,
            self.config.appliance.version,
        );

        let path = self.env.log_file("versions.log");
        std::fs::create_dir_all(&self.env.log_dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(line.as_bytes())?;
        tracing::info!(path = %path.display(), "version recorded");
        self.console.success(format!("Recorded version {}", self.config.appliance.version));
        Ok(())
    }
}
