//! End-to-end runs of the orchestrator.
//!
//! Every test builds a throwaway install root and system root under a temp
//! dir and answers commands with a `RecordingRunner`, so nothing here needs
//! root or touches the host.
//!
//! ```
//! cargo test --manifest-path crates/provision/Cargo.toml
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use appliance_config::ApplianceConfig;
use appliance_provision::console::Console;
use appliance_provision::continuation::{LoginHook, StateStore, HOOK_SENTINEL};
use appliance_provision::controller::{Invocation, Orchestrator, PhaseState, RunOutcome};
use appliance_provision::environment::{Environment, Identity, Privilege};
use appliance_provision::error::ProvisionError;
use appliance_provision::exec::{CommandOutput, RecordingRunner};

const BOOKWORM: &str = "PRETTY_NAME=\"Raspbian GNU/Linux 12 (bookworm)\"\n\
                        ID=raspbian\nID_LIKE=debian\nVERSION_CODENAME=bookworm\n";

const BOOT_CONFIG: &str = "dtparam=audio=on\ndtparam=i2c_arm=on\n";

// ── Fixture ──────────────────────────────────────────────────────────────────

struct Board {
    _tmp: TempDir,
    env: Environment,
    config: ApplianceConfig,
}

impl Board {
    /// A freshly imaged board: supported OS, nothing provisioned yet.
    fn fresh() -> Self {
        let tmp = TempDir::new().unwrap();
        let install_root = tmp.path().join("opt/tonebox");
        let home = tmp.path().join("home/pi");
        fs::create_dir_all(&home).unwrap();

        let env = Environment::new(
            &install_root,
            &home,
            Identity::new("pi", "audio"),
            Privilege::Direct,
        )
        .with_system_root(tmp.path().join("sysroot"));

        let mut config = ApplianceConfig::new("tonebox", "1.4.0");
        config.install.hostname = "tonebox".into();
        config.install.reboot_settle_secs = 0;

        let board = Self {
            _tmp: tmp,
            env,
            config,
        };
        board.write_system("/etc/os-release", BOOKWORM);
        board.write_templates();
        board
    }

    /// Already past the one-time phase: boot config current, hostname set.
    fn provisioned() -> Self {
        let board = Self::fresh();
        board.write_system("/boot/firmware/config.txt", BOOT_CONFIG);
        board.write_system("/etc/hostname", "tonebox\n");
        board
    }

    fn write_templates(&self) {
        let templates = [
            ("boot/config.txt", BOOT_CONFIG),
            ("network/hosts.template", "127.0.1.1\t__HOSTNAME__\n"),
            (
                "network/avahi.service",
                "<service-group><name>__HOSTNAME__</name></service-group>\n",
            ),
            ("usb/automount.sh", "#!/bin/sh\nmount \"$1\" /media/__USER__\n"),
            (
                "usb/automount@.service",
                "[Service]\nExecStart=/usr/local/bin/__APPLIANCE__-automount %i\n",
            ),
            (
                "usb/automount.rules",
                "ACTION==\"add\", RUN+=\"/bin/systemctl start __APPLIANCE__-automount@%k\"\n",
            ),
            ("audio/asound.conf", "defaults.pcm.card 0\n"),
            (
                "audio/audio.service",
                "[Service]\nUser=__USER__\nExecStart=__PYTHON_ROOT__/bin/python -m audio\n\
                 StandardOutput=append:__AUDIO_LOG__\n",
            ),
            ("spotify/spotifyd.conf", "[global]\ncache_path = \"__SPOTIFY_ROOT__/cache\"\n"),
            (
                "spotify/spotify.service",
                "[Service]\nUser=__USER__\nExecStart=/usr/bin/spotifyd --config-path __SPOTIFY_ROOT__/spotifyd.conf\n",
            ),
            (
                "autostart/autostart.service",
                "[Service]\nUser=__USER__\nWorkingDirectory=__INSTALL_ROOT__\n\
                 ExecStart=__PYTHON_ROOT__/bin/python app.py\n",
            ),
        ];
        for (rel, body) in templates {
            let path = self.env.resource_root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
    }

    fn system(&self, path: &str) -> PathBuf {
        self.env.host_path(path)
    }

    fn write_system(&self, path: &str, content: &str) {
        let p = self.system(path);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, content).unwrap();
    }

    fn invocation(&self, resume: bool) -> Invocation {
        Invocation {
            resume,
            working_dir: self.env.install_root.clone(),
            command: "./appliance-provision --continue".into(),
        }
    }

    fn run(
        &self,
        runner: &RecordingRunner,
        resume: bool,
    ) -> (Result<RunOutcome, ProvisionError>, PhaseState, Console) {
        let console = Console::in_memory();
        let mut orchestrator = Orchestrator::new(&self.config, &self.env, runner, &console);
        let outcome = orchestrator.run(&self.invocation(resume));
        let state = orchestrator.state();
        (outcome, state, console)
    }

    fn hook_lines(&self) -> usize {
        fs::read_to_string(&self.env.startup_file)
            .unwrap_or_default()
            .matches(HOOK_SENTINEL)
            .count()
    }
}

/// Every configured system package reported installed and current.
fn packages_current(runner: &RecordingRunner, config: &ApplianceConfig) {
    let status: String = config
        .packages
        .system
        .iter()
        .map(|p| format!("{p} installed\n"))
        .collect();
    runner.respond("dpkg-query", CommandOutput::ok(status));
}

fn failure_steps(outcome: &RunOutcome) -> Vec<String> {
    match outcome {
        RunOutcome::Finished { summary, .. } => {
            summary.failures.iter().map(|f| f.step.clone()).collect()
        }
        other => panic!("expected a finished run, got {other:?}"),
    }
}

fn exists(p: &Path) -> bool {
    p.is_file()
}

// ── Reboot and continuation ──────────────────────────────────────────────────

/// Fresh board, boot configuration differs → reboot pending with exactly one
/// hook line; the continuation then finishes the always-run phase.
#[test]
fn test_fresh_install_reboots_then_resumes_to_done() {
    let board = Board::fresh();

    let runner = RecordingRunner::new();
    let (outcome, state, _console) = board.run(&runner, false);
    let ticket = match outcome.unwrap() {
        RunOutcome::Reboot(ticket) => ticket,
        other => panic!("expected a reboot, got {other:?}"),
    };
    assert_eq!(state, PhaseState::RebootPending);
    assert_eq!(
        fs::read_to_string(board.system("/boot/firmware/config.txt")).unwrap(),
        BOOT_CONFIG
    );
    assert!(StateStore::new(&board.env.state_file).exists());
    assert_eq!(board.hook_lines(), 1);
    assert!(runner.ran("raspi-config nonint do_boot_behaviour B2"));
    assert!(!runner.ran("systemctl reboot"));
    // The always-run phase waits for the continuation.
    assert!(!exists(&board.system("/etc/systemd/system/tonebox.service")));

    ticket.trigger(&runner, &Console::in_memory()).unwrap();
    assert!(runner.ran("systemctl reboot"));

    let runner = RecordingRunner::new();
    let (outcome, state, _console) = board.run(&runner, true);
    let outcome = outcome.unwrap();
    assert_eq!(state, PhaseState::Done);
    assert_eq!(outcome.exit_code(), 0);
    assert!(failure_steps(&outcome).is_empty());

    assert!(!StateStore::new(&board.env.state_file).exists());
    assert_eq!(board.hook_lines(), 0);
    assert!(runner.ran("raspi-config nonint do_boot_behaviour B1"));
    assert!(exists(&board.system("/etc/hosts")));
    assert!(exists(&board.system("/etc/avahi/services/tonebox.service")));
    assert!(exists(&board.system("/usr/local/bin/tonebox-automount")));
    assert!(exists(&board.system("/etc/asound.conf")));
    assert!(exists(&board.system("/etc/systemd/system/tonebox.service")));
    assert!(runner.ran("systemctl enable tonebox.service"));
}

/// The continuation must never re-run the one-time phase.
#[test]
fn test_continuation_skips_one_time_phase() {
    let board = Board::fresh();
    let (outcome, _, _) = board.run(&RecordingRunner::new(), false);
    assert!(matches!(outcome.unwrap(), RunOutcome::Reboot(_)));

    let runner = RecordingRunner::new();
    let (outcome, _, _) = board.run(&runner, true);
    assert!(outcome.is_ok());

    assert!(!runner.ran("apt-get"));
    assert!(!runner.ran("dpkg-query"));
    assert!(!runner.ran("python3 -m venv"));
    assert!(!runner.ran("raspi-config nonint do_boot_behaviour B2"));
}

#[test]
fn test_continue_without_pending_state_does_nothing() {
    let board = Board::provisioned();
    let stale = LoginHook::line(&board.env.install_root, "./appliance-provision --continue");
    fs::write(
        &board.env.startup_file,
        format!("export PATH=$PATH:~/bin\n{stale}\n{stale}\n"),
    )
    .unwrap();

    let runner = RecordingRunner::new();
    let (outcome, state, _) = board.run(&runner, true);

    assert!(matches!(outcome.unwrap(), RunOutcome::NothingToResume));
    assert_eq!(state, PhaseState::Initial);
    assert!(runner.calls().is_empty());
    assert_eq!(board.hook_lines(), 0);
    assert_eq!(
        fs::read_to_string(&board.env.startup_file).unwrap(),
        "export PATH=$PATH:~/bin\n"
    );
}

#[test]
fn test_package_manager_reboot_flag_schedules_reboot() {
    let board = Board::provisioned();
    board.write_system("/var/run/reboot-required", "*** System restart required ***\n");

    let (outcome, state, _) = board.run(&RecordingRunner::new(), false);

    assert!(matches!(outcome.unwrap(), RunOutcome::Reboot(_)));
    assert_eq!(state, PhaseState::RebootPending);
    let pending = StateStore::new(&board.env.state_file).load().unwrap().unwrap();
    assert!(pending.reason.contains("package manager"));
}

/// Failures from before the reboot still fail the final run.
#[test]
fn test_one_time_failures_survive_the_reboot() {
    let board = Board::fresh();
    let runner = RecordingRunner::new();
    runner.respond("apt-get update", CommandOutput::failed(100, "Temporary failure resolving"));

    let (outcome, _, _) = board.run(&runner, false);
    assert!(matches!(outcome.unwrap(), RunOutcome::Reboot(_)));

    let (outcome, state, _) = board.run(&RecordingRunner::new(), true);
    let outcome = outcome.unwrap();
    assert_eq!(state, PhaseState::Failed);
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(failure_steps(&outcome), vec!["Package index"]);
}

/// Started with sudo: the user's login hook has to come back through sudo,
/// since the state it resumes from is root-owned.
#[test]
fn test_root_run_resumes_through_sudo() {
    let mut board = Board::fresh();
    board.env = board.env.clone().with_started_as_root(true);

    let (outcome, _, _) = board.run(&RecordingRunner::new(), false);
    assert!(matches!(outcome.unwrap(), RunOutcome::Reboot(_)));

    let bashrc = fs::read_to_string(&board.env.startup_file).unwrap();
    assert!(bashrc.contains("&& sudo ./appliance-provision --continue"));
    let pending = StateStore::new(&board.env.state_file).load().unwrap().unwrap();
    assert!(pending.as_root);

    let (outcome, state, _) = board.run(&RecordingRunner::new(), true);
    assert_eq!(outcome.unwrap().exit_code(), 0);
    assert_eq!(state, PhaseState::Done);
    assert_eq!(board.hook_lines(), 0);
    assert!(!StateStore::new(&board.env.state_file).exists());
}

/// Not root: system files go through `sudo install`, the continuation
/// still lives in user-owned files.
#[test]
fn test_sudo_privilege_reboots_and_resumes() {
    let mut board = Board::fresh();
    board.env.privilege = Privilege::Sudo;

    let runner = RecordingRunner::new();
    let (outcome, state, _) = board.run(&runner, false);
    assert!(matches!(outcome.unwrap(), RunOutcome::Reboot(_)));
    assert_eq!(state, PhaseState::RebootPending);
    let install = runner
        .calls()
        .into_iter()
        .find(|c| c.program == "install")
        .expect("boot config installed through sudo");
    assert!(install.elevated);
    assert!(install.args.last().unwrap().ends_with("boot/firmware/config.txt"));
    assert_eq!(board.hook_lines(), 1);

    let runner = RecordingRunner::new();
    let (outcome, state, _) = board.run(&runner, true);
    let outcome = outcome.unwrap();
    assert_eq!(state, PhaseState::Done);
    assert!(failure_steps(&outcome).is_empty());
    assert_eq!(board.hook_lines(), 0);
    assert!(!StateStore::new(&board.env.state_file).exists());
    let restore = runner
        .calls()
        .into_iter()
        .find(|c| c.display() == "raspi-config nonint do_boot_behaviour B1")
        .expect("normal login restored");
    assert!(restore.elevated);
    assert!(runner
        .calls()
        .iter()
        .filter(|c| c.program == "install")
        .all(|c| c.elevated));
}

/// A state file that cannot be read must not leave the hook behind to
/// fail again on every login.
#[test]
fn test_unreadable_state_on_continue_removes_hook() {
    let board = Board::provisioned();
    LoginHook::new(&board.env.startup_file)
        .install(&board.env.install_root, "./appliance-provision --continue")
        .unwrap();
    fs::create_dir_all(&board.env.state_file).unwrap();

    let runner = RecordingRunner::new();
    let (outcome, _, _) = board.run(&runner, true);

    assert!(matches!(outcome, Err(ProvisionError::State { .. })));
    assert_eq!(board.hook_lines(), 0);
    assert!(runner.calls().is_empty());
}

// ── Version gate ─────────────────────────────────────────────────────────────

#[test]
fn test_unsupported_os_stops_before_any_change() {
    let board = Board::fresh();
    board.write_system(
        "/etc/os-release",
        &BOOKWORM.replace("bookworm", "bullseye"),
    );

    let runner = RecordingRunner::new();
    let (outcome, _, _) = board.run(&runner, false);

    let err = outcome.unwrap_err();
    assert!(matches!(err, ProvisionError::UnsupportedOs { .. }));
    assert_eq!(err.exit_code(), 3);
    assert!(runner.calls().is_empty());
    assert!(!exists(&board.system("/boot/firmware/config.txt")));
    assert!(!StateStore::new(&board.env.state_file).exists());
    assert_eq!(board.hook_lines(), 0);
}

// ── Failure isolation and idempotence ────────────────────────────────────────

/// The mDNS follow-up fails; later resources are still installed and the
/// run ends Failed with a non-zero exit.
#[test]
fn test_failed_follow_up_does_not_stop_later_steps() {
    let board = Board::provisioned();
    let runner = RecordingRunner::new();
    runner.respond(
        "systemctl restart avahi-daemon",
        CommandOutput::failed(1, "Unit avahi-daemon.service not found."),
    );

    let (outcome, state, console) = board.run(&runner, false);
    let outcome = outcome.unwrap();

    assert_eq!(state, PhaseState::Failed);
    assert_ne!(outcome.exit_code(), 0);
    assert_eq!(failure_steps(&outcome), vec!["Hostname"]);
    // The failing resource's own target stays written.
    assert!(exists(&board.system("/etc/avahi/services/tonebox.service")));
    assert!(exists(&board.system("/usr/local/bin/tonebox-automount")));
    assert!(exists(&board.system("/etc/systemd/system/tonebox.service")));
    assert!(console
        .lines()
        .iter()
        .any(|l| l.contains("Provisioning finished with 1 error(s)")));
}

#[test]
fn test_second_run_changes_nothing() {
    let board = Board::provisioned();

    let first = RecordingRunner::new();
    packages_current(&first, &board.config);
    let (outcome, state, _) = board.run(&first, false);
    assert!(outcome.is_ok());
    assert_eq!(state, PhaseState::Done);
    assert!(first.ran("systemctl daemon-reload"));

    let automount = board.system("/usr/local/bin/tonebox-automount");
    let before = fs::metadata(&automount).unwrap().modified().unwrap();

    let second = RecordingRunner::new();
    packages_current(&second, &board.config);
    let (outcome, state, _) = board.run(&second, false);
    assert!(outcome.is_ok());
    assert_eq!(state, PhaseState::Done);

    assert!(!second.ran("systemctl"));
    assert!(!second.ran("udevadm"));
    assert!(!second.ran("apt-get install"));
    assert!(!second.ran("hostnamectl"));
    assert_eq!(fs::metadata(&automount).unwrap().modified().unwrap(), before);
}

#[test]
fn test_missing_template_is_recorded_and_run_continues() {
    let board = Board::provisioned();
    fs::remove_file(board.env.resource_root.join("audio/asound.conf")).unwrap();

    let runner = RecordingRunner::new();
    let (outcome, state, _) = board.run(&runner, false);
    let outcome = outcome.unwrap();

    assert_eq!(state, PhaseState::Failed);
    assert_eq!(failure_steps(&outcome), vec!["Audio"]);
    assert!(exists(&board.system("/etc/systemd/system/tonebox-audio.service")));
    assert!(exists(&board.system("/etc/systemd/system/tonebox.service")));
}

#[test]
fn test_disabled_features_are_skipped() {
    let mut board = Board::provisioned();
    board.config.features.usb_automount = false;
    board.config.features.autostart = false;
    board.config.audio.enabled = false;

    let (outcome, state, _) = board.run(&RecordingRunner::new(), false);
    assert!(outcome.is_ok());
    assert_eq!(state, PhaseState::Done);

    assert!(!exists(&board.system("/usr/local/bin/tonebox-automount")));
    assert!(!exists(&board.system("/etc/asound.conf")));
    assert!(!exists(&board.system("/etc/systemd/system/tonebox.service")));
    assert!(exists(&board.system("/etc/hosts")));
}

#[test]
fn test_spotify_bridge_and_volume() {
    let mut board = Board::provisioned();
    board.config.features.spotify = true;
    board.config.audio.volume_percent = Some(70);
    board.config.audio.mixer_control = "Digital".into();

    let runner = RecordingRunner::new();
    let (outcome, _, _) = board.run(&runner, false);
    assert!(outcome.is_ok());

    let conf = board.env.spotify_root.join("spotifyd.conf");
    let body = fs::read_to_string(&conf).unwrap();
    assert!(body.contains(&board.env.spotify_root.display().to_string()));
    assert!(exists(&board.system("/etc/systemd/system/tonebox-spotify.service")));
    assert!(runner.ran("systemctl enable tonebox-spotify.service"));
    assert!(runner.ran("amixer -q sset Digital 70%"));
}

#[test]
fn test_hardware_interfaces_enabled_only_when_off() {
    let mut board = Board::provisioned();
    board.config.interfaces.i2c = true;
    board.config.interfaces.spi = true;

    let runner = RecordingRunner::new();
    runner
        .respond("raspi-config nonint get_i2c", CommandOutput::ok("0\n"))
        .respond("raspi-config nonint get_spi", CommandOutput::ok("1\n"));

    let (outcome, _, _) = board.run(&runner, false);
    assert!(outcome.is_ok());

    assert!(!runner.ran("raspi-config nonint do_i2c"));
    assert!(runner.ran("raspi-config nonint do_spi 0"));
}

#[test]
fn test_version_log_appends_one_line_per_run() {
    let board = Board::provisioned();
    let runner = RecordingRunner::new();
    runner.respond("uname -r", CommandOutput::ok("6.6.31+rpt-rpi-v8\n"));

    let (first, _, _) = board.run(&runner, false);
    let (second, _, _) = board.run(&runner, false);
    assert!(first.is_ok() && second.is_ok());

    let log = fs::read_to_string(board.env.log_file("versions.log")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("tonebox 1.4.0"));
    assert!(lines[0].contains("Raspbian GNU/Linux 12 (bookworm)"));
    assert!(lines[0].contains("kernel: 6.6.31+rpt-rpi-v8"));
}

// ── status / reset ───────────────────────────────────────────────────────────

#[test]
fn test_reset_clears_pending_continuation() {
    let board = Board::fresh();
    let (outcome, _, _) = board.run(&RecordingRunner::new(), false);
    assert!(matches!(outcome.unwrap(), RunOutcome::Reboot(_)));

    let runner = RecordingRunner::new();
    let console = Console::in_memory();
    let orchestrator = Orchestrator::new(&board.config, &board.env, &runner, &console);
    let status = orchestrator.status().unwrap();
    assert_eq!(status.phase, PhaseState::Continuation);
    assert!(status.hook_installed);

    orchestrator.reset().unwrap();

    let status = orchestrator.status().unwrap();
    assert_eq!(status.phase, PhaseState::Initial);
    assert!(status.pending.is_none());
    assert!(!status.hook_installed);
    assert_eq!(runner.commands(), vec!["raspi-config nonint do_boot_behaviour B1"]);
}
