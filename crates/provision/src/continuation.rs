//! Durable state that survives the reboot.
//!
//! The state file is the only thing the orchestrator trusts when deciding
//! whether a run is a continuation. The login hook is its translation into
//! "run again on the next interactive login": one sentinel-tagged line in
//! the user's shell startup file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;
use crate::report::StepFailure;

/// Tags hook lines so they can be found and removed again.
pub const HOOK_SENTINEL: &str = "# appliance-provision:continue";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationState {
    pub scheduled_at: DateTime<Utc>,
    pub working_dir: PathBuf,
    pub command: String,
    pub reason: String,
    /// Failures from the one-time phase, reported at the end of the
    /// continuation run.
    #[serde(default)]
    pub carried_failures: Vec<StepFailure>,
    /// The scheduling run was root; `command` goes through `sudo`.
    #[serde(default)]
    pub as_root: bool,
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<Option<ContinuationState>, ProvisionError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ProvisionError::StateParse {
                path: self.path.display().to_string(),
                source,
            })
    }

    /// Write atomically: a reboot may follow immediately.
    pub fn save(&self, state: &ContinuationState) -> Result<(), ProvisionError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;
        let json = serde_json::to_vec_pretty(state).map_err(|source| ProvisionError::StateParse {
            path: self.path.display().to_string(),
            source,
        })?;
        let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        staged.write_all(&json).map_err(|e| self.io_error(e))?;
        staged.as_file().sync_all().map_err(|e| self.io_error(e))?;
        staged
            .persist(&self.path)
            .map_err(|e| self.io_error(e.error))?;
        Ok(())
    }

    /// Remove the state file. Returns whether one was present.
    pub fn clear(&self) -> Result<bool, ProvisionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> ProvisionError {
        ProvisionError::State {
            path: self.path.display().to_string(),
            source,
        }
    }
}

pub struct LoginHook {
    startup_file: PathBuf,
}

impl LoginHook {
    pub fn new(startup_file: impl Into<PathBuf>) -> Self {
        Self {
            startup_file: startup_file.into(),
        }
    }

    /// The shell line that re-enters `working_dir` and runs `command`, only
    /// for interactive shells.
    pub fn line(working_dir: &Path, command: &str) -> String {
        format!(
            "[ -t 0 ] && cd {} && {command} {HOOK_SENTINEL}",
            shell_quote(&working_dir.display().to_string())
        )
    }

    pub fn is_installed(&self) -> Result<bool, ProvisionError> {
        Ok(self.read()?.lines().any(|l| l.contains(HOOK_SENTINEL)))
    }

    /// Ensure exactly one hook line for `working_dir`/`command`.
    ///
    /// Returns `true` when the file was modified. Stale or duplicated hook
    /// lines are dropped so at most one continuation runs per login.
    pub fn install(&self, working_dir: &Path, command: &str) -> Result<bool, ProvisionError> {
        let wanted = Self::line(working_dir, command);
        let existing = self.read()?;
        let hooks: Vec<&str> = existing
            .lines()
            .filter(|l| l.contains(HOOK_SENTINEL))
            .collect();
        if hooks.len() == 1 && hooks[0] == wanted {
            return Ok(false);
        }

        let mut content = strip_hooks(&existing);
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&wanted);
        content.push('\n');
        self.write(&content)?;
        tracing::info!(file = %self.startup_file.display(), "continuation hook installed");
        Ok(true)
    }

    /// Remove every hook line. Returns how many were removed.
    pub fn remove(&self) -> Result<usize, ProvisionError> {
        let existing = self.read()?;
        let count = existing.lines().filter(|l| l.contains(HOOK_SENTINEL)).count();
        if count > 0 {
            self.write(&strip_hooks(&existing))?;
            tracing::info!(file = %self.startup_file.display(), count, "continuation hook removed");
        }
        Ok(count)
    }

    fn read(&self) -> Result<String, ProvisionError> {
        match std::fs::read_to_string(&self.startup_file) {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(ProvisionError::State {
                path: self.startup_file.display().to_string(),
                source,
            }),
        }
    }

    fn write(&self, content: &str) -> Result<(), ProvisionError> {
        std::fs::write(&self.startup_file, content).map_err(|source| ProvisionError::State {
            path: self.startup_file.display().to_string(),
            source,
        })
    }
}

fn strip_hooks(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines().filter(|l| !l.contains(HOOK_SENTINEL)) {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Single-quote `s` for sh.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state() -> ContinuationState {
        ContinuationState {
            scheduled_at: Utc::now(),
            working_dir: PathBuf::from("/opt/tonebox"),
            command: "./appliance-provision --continue".into(),
            reason: "boot configuration changed".into(),
            carried_failures: vec![],
            as_root: false,
        }
    }

    #[test]
    fn test_state_round_trip_and_clear() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path().join("data/continuation.json"));
        assert_eq!(store.load().unwrap(), None);

        store.save(&state()).unwrap();
        assert!(store.exists());
        assert_eq!(store.load().unwrap().unwrap().reason, "boot configuration changed");

        assert!(store.clear().unwrap());
        assert!(!store.clear().unwrap());
        assert!(!store.exists());
    }

    #[test]
    fn test_state_written_before_root_flag_existed_loads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("continuation.json");
        std::fs::write(
            &path,
            r#"{"scheduled_at":"2026-01-05T10:00:00Z","working_dir":"/opt/tonebox","command":"./run --continue","reason":"boot"}"#,
        )
        .unwrap();
        let state = StateStore::new(&path).load().unwrap().unwrap();
        assert!(!state.as_root);
        assert!(state.carried_failures.is_empty());
    }

    #[test]
    fn test_corrupt_state_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("continuation.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = StateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, ProvisionError::StateParse { .. }));
    }

    #[test]
    fn test_hook_installed_once() {
        let tmp = TempDir::new().unwrap();
        let bashrc = tmp.path().join(".bashrc");
        std::fs::write(&bashrc, "alias ll='ls -l'").unwrap();
        let hook = LoginHook::new(&bashrc);
        let wd = Path::new("/opt/tonebox");

        assert!(hook.install(wd, "./appliance-provision --continue").unwrap());
        assert!(!hook.install(wd, "./appliance-provision --continue").unwrap());

        let content = std::fs::read_to_string(&bashrc).unwrap();
        assert_eq!(content.matches(HOOK_SENTINEL).count(), 1);
        assert!(content.starts_with("alias ll='ls -l'\n"));
        assert!(hook.is_installed().unwrap());
    }

    #[test]
    fn test_duplicate_hooks_are_collapsed() {
        let tmp = TempDir::new().unwrap();
        let bashrc = tmp.path().join(".bashrc");
        let line = LoginHook::line(Path::new("/opt/tonebox"), "./run");
        std::fs::write(&bashrc, format!("export A=1\n{line}\n{line}\n")).unwrap();
        let hook = LoginHook::new(&bashrc);

        assert!(hook.install(Path::new("/opt/tonebox"), "./run").unwrap());
        let content = std::fs::read_to_string(&bashrc).unwrap();
        assert_eq!(content, format!("export A=1\n{line}\n"));
    }

    #[test]
    fn test_remove_strips_all_hook_lines() {
        let tmp = TempDir::new().unwrap();
        let bashrc = tmp.path().join(".bashrc");
        let hook = LoginHook::new(&bashrc);
        assert_eq!(hook.remove().unwrap(), 0);
        assert!(!bashrc.exists());

        std::fs::write(
            &bashrc,
            format!("export A=1\nold {HOOK_SENTINEL}\nexport B=2\nnew {HOOK_SENTINEL}\n"),
        )
        .unwrap();
        assert_eq!(hook.remove().unwrap(), 2);
        assert_eq!(std::fs::read_to_string(&bashrc).unwrap(), "export A=1\nexport B=2\n");
        assert!(!hook.is_installed().unwrap());
    }

    #[test]
    fn test_hook_line_quotes_working_dir() {
        let line = LoginHook::line(Path::new("/home/pi/it's here"), "./run --continue");
        assert_eq!(
            line,
            format!("[ -t 0 ] && cd '/home/pi/it'\\''s here' && ./run --continue {HOOK_SENTINEL}")
        );
    }
}
