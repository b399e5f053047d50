//! apt package currency for the one-time phase.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::environment::Environment;
use crate::error::CommandError;
use crate::exec::{Cmd, CommandRunner};

/// Touched by every successful `apt-get update`.
const INDEX_STAMP: &str = "/var/cache/apt/pkgcache.bin";
const REBOOT_REQUIRED: &str = "/var/run/reboot-required";

pub struct Apt<'a> {
    runner: &'a dyn CommandRunner,
    index_stamp: PathBuf,
    reboot_flag: PathBuf,
}

impl<'a> Apt<'a> {
    pub fn new(env: &Environment, runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            index_stamp: env.host_path(INDEX_STAMP),
            reboot_flag: env.host_path(REBOOT_REQUIRED),
        }
    }

    /// Age of the package index; `None` when it was never fetched.
    pub fn index_age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(&self.index_stamp).ok()?.modified().ok()?;
        Some(SystemTime::now().duration_since(modified).unwrap_or_default())
    }

    /// `apt-get update` unless the index is younger than `max_age`.
    /// Returns whether a refresh ran.
    pub fn refresh_if_stale(&self, max_age: Duration) -> Result<bool, CommandError> {
        if let Some(age) = self.index_age() {
            if age < max_age {
                tracing::debug!(age_secs = age.as_secs(), "package index fresh");
                return Ok(false);
            }
        }
        self.runner.run(&apt_get(&["update"]))?;
        Ok(true)
    }

    /// Packages from `wanted` that are missing or have an upgrade pending.
    pub fn pending(&self, wanted: &[String]) -> Result<Vec<String>, CommandError> {
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        // dpkg-query exits 1 when some names are unknown; the output is still valid.
        let status = self.runner.execute(
            &Cmd::new("dpkg-query")
                .args(["-W", "-f=${Package} ${db:Status-Status}\\n"])
                .args(wanted.iter().cloned())
                .quiet(),
        )?;
        let status = status.stdout_text();
        let installed = parse_installed(&status);

        let upgradable = self
            .runner
            .run(&Cmd::new("apt").args(["list", "--upgradable"]).quiet())?;
        let upgradable = upgradable.stdout_text();
        let upgradable = parse_upgradable(&upgradable);

        Ok(wanted
            .iter()
            .filter(|p| {
                let name = base_name(p);
                !installed.contains(name) || upgradable.contains(name)
            })
            .cloned()
            .collect())
    }

    pub fn install(&self, pkgs: &[String]) -> Result<(), CommandError> {
        if pkgs.is_empty() {
            return Ok(());
        }
        let mut args = vec!["install", "-y", "--no-install-recommends"];
        args.extend(pkgs.iter().map(String::as_str));
        self.runner.run(&apt_get(&args)).map(|_| ())
    }

    /// Bring `wanted` up to date. Returns whether anything was installed or
    /// upgraded.
    pub fn ensure(&self, wanted: &[String]) -> Result<bool, CommandError> {
        let pending = self.pending(wanted)?;
        if pending.is_empty() {
            return Ok(false);
        }
        tracing::info!(count = pending.len(), "installing packages");
        self.install(&pending)?;
        Ok(true)
    }

    /// The package manager asked for a reboot (kernel or firmware update).
    pub fn reboot_required(&self) -> bool {
        self.reboot_flag.exists()
    }
}

fn apt_get(args: &[&str]) -> Cmd {
    Cmd::new("apt-get")
        .args(args.iter().copied())
        .env("DEBIAN_FRONTEND", "noninteractive")
        .elevated()
}

/// `foo=1.2` and `foo:armhf` both refer to package `foo`.
fn base_name(pkg: &str) -> &str {
    let end = pkg.find(['=', ':']).unwrap_or(pkg.len());
    &pkg[..end]
}

fn parse_installed(output: &str) -> BTreeSet<&str> {
    output
        .lines()
        .filter_map(|l| l.split_once(' '))
        .filter(|(_, status)| status.trim() == "installed")
        .map(|(name, _)| base_name(name))
        .collect()
}

/// Names from `apt list --upgradable`, e.g.
/// `alsa-utils/stable 1.2.8-1+rpt1 arm64 [upgradable from: 1.2.8-1]`.
fn parse_upgradable(output: &str) -> BTreeSet<&str> {
    output
        .lines()
        .filter(|l| l.contains("[upgradable from:"))
        .filter_map(|l| l.split_once('/'))
        .map(|(name, _)| name)
        .collect()
}
