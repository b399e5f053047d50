use std::path::{Path, PathBuf};

use crate::error::CommandError;
use crate::exec::{Cmd, CommandRunner};

/// The Python virtualenv the appliance's own services run from.
pub struct PythonRuntime<'a> {
    root: PathBuf,
    runner: &'a dyn CommandRunner,
}

impl<'a> PythonRuntime<'a> {
    pub fn new(root: &Path, runner: &'a dyn CommandRunner) -> Self {
        Self {
            root: root.to_path_buf(),
            runner,
        }
    }

    pub fn interpreter(&self) -> PathBuf {
        self.root.join("bin/python")
    }

    pub fn exists(&self) -> bool {
        self.interpreter().exists()
    }

    /// Recreate the venv from the system interpreter.
    pub fn rebuild(&self) -> Result<(), CommandError> {
        self.runner
            .run(
                &Cmd::new("python3")
                    .args(["-m", "venv", "--clear"])
                    .arg(self.root.display().to_string()),
            )
            .map(|_| ())
    }

    pub fn install_packages(&self, pkgs: &[String]) -> Result<(), CommandError> {
        if pkgs.is_empty() {
            return Ok(());
        }
        self.runner
            .run(
                &Cmd::new(self.root.join("bin/pip").display().to_string())
                    .args(["install", "--upgrade", "--disable-pip-version-check"])
                    .args(pkgs.iter().cloned()),
            )
            .map(|_| ())
    }

    /// Rebuild when asked to or when the venv is missing, then install the
    /// package set. Returns whether the venv was rebuilt.
    pub fn ensure(&self, force_rebuild: bool, pkgs: &[String]) -> Result<bool, CommandError> {
        let rebuild = force_rebuild || !self.exists();
        if rebuild {
            tracing::info!(root = %self.root.display(), force_rebuild, "rebuilding venv");
            self.rebuild()?;
        }
        self.install_packages(pkgs)?;
        Ok(rebuild)
    }

    pub fn version(&self) -> Option<String> {
        let out = self
            .runner
            .run(&Cmd::new(self.interpreter().display().to_string()).arg("--version").quiet())
            .ok()?;
        let text = out.stdout_text();
        let v = text.trim();
        (!v.is_empty()).then(|| v.to_string())
    }
}
