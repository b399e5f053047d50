//! Idempotent resource installation.
//!
//! A resource is rendered from its template and compared byte-for-byte with
//! the installed target. Only a difference causes a write, and only a write
//! causes follow-up actions to run.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::console::Console;
use crate::environment::{Environment, Privilege};
use crate::error::{CommandError, InstallError};
use crate::exec::{Cmd, CommandRunner};
use crate::services::{self, ServiceAction};
use crate::template::{render, Bindings, Placeholder};

pub const TEMPLATE_SUFFIX: &str = ".template";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Absolute OS path, written with elevated privilege when needed.
    System,
    /// Path owned by the invoking user (data and log directories).
    User,
}

/// Runs only when the resource's target actually changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    DaemonReload,
    Service(ServiceAction),
    Run(Cmd),
}

impl FollowUp {
    fn execute(&self, runner: &dyn CommandRunner) -> Result<(), CommandError> {
        match self {
            Self::DaemonReload => services::daemon_reload(runner),
            Self::Service(action) => services::activate(runner, action),
            Self::Run(cmd) => runner.run(cmd).map(|_| ()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    /// Relative paths are looked up under the resource root.
    pub template: PathBuf,
    pub target: PathBuf,
    pub scope: Scope,
    pub mode: u32,
    /// Placeholders that must be bound; everything else is optional.
    pub required: Vec<Placeholder>,
    pub follow_ups: Vec<FollowUp>,
}

impl Resource {
    pub fn new(
        name: impl Into<String>,
        template: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            target: target.into(),
            scope: Scope::System,
            mode: 0o644,
            required: Vec::new(),
            follow_ups: Vec::new(),
        }
    }

    pub fn user_owned(mut self) -> Self {
        self.scope = Scope::User;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn require(mut self, placeholders: &[Placeholder]) -> Self {
        self.required.extend_from_slice(placeholders);
        self
    }

    pub fn then(mut self, follow_up: FollowUp) -> Self {
        self.follow_ups.push(follow_up);
        self
    }

    pub fn validate(&self) -> Result<(), InstallError> {
        if self.name.trim().is_empty() {
            return Err(InstallError::Usage("resource name is empty".into()));
        }
        if self.template.as_os_str().is_empty() {
            return Err(InstallError::Usage(format!(
                "{}: no template given",
                self.name
            )));
        }
        if self.target.as_os_str().is_empty() {
            return Err(InstallError::Usage(format!("{}: no target given", self.name)));
        }
        if self.scope == Scope::System && !self.target.is_absolute() {
            return Err(InstallError::Usage(format!(
                "{}: system target {} is not absolute",
                self.name,
                self.target.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Changed,
    Unchanged,
}

impl InstallOutcome {
    pub fn changed(self) -> bool {
        self == Self::Changed
    }
}

pub struct Installer<'a> {
    env: &'a Environment,
    runner: &'a dyn CommandRunner,
    console: &'a Console,
}

impl<'a> Installer<'a> {
    pub fn new(env: &'a Environment, runner: &'a dyn CommandRunner, console: &'a Console) -> Self {
        Self {
            env,
            runner,
            console,
        }
    }

    pub fn install(
        &self,
        resource: &Resource,
        bindings: &Bindings,
    ) -> Result<InstallOutcome, InstallError> {
        resource.validate()?;
        let template = self.locate_template(resource)?;

        if let Some(missing) = resource.required.iter().find(|p| !bindings.contains(**p)) {
            return Err(InstallError::Configuration {
                resource: resource.name.clone(),
                reason: format!("required placeholder {missing} has no binding"),
            });
        }

        let body = std::fs::read(&template).map_err(|source| InstallError::Io {
            path: template.display().to_string(),
            source,
        })?;
        let body = String::from_utf8(body).map_err(|_| InstallError::Configuration {
            resource: resource.name.clone(),
            reason: format!("template {} is not valid UTF-8", template.display()),
        })?;

        let rendered = render(&body, bindings);
        if !rendered.unresolved.is_empty() {
            let tokens: Vec<&str> = rendered.unresolved.iter().map(String::as_str).collect();
            self.console.warning(format!(
                "{}: leaving unbound placeholders {}",
                resource.name,
                tokens.join(", ")
            ));
        }

        let target = self.target_path(resource);
        if self.installed_content(resource, &target)?.as_deref() == Some(rendered.text.as_bytes()) {
            tracing::debug!(resource = %resource.name, target = %target.display(), "unchanged");
            return Ok(InstallOutcome::Unchanged);
        }

        self.write(resource, &target, rendered.text.as_bytes())?;
        self.console
            .success(format!("{}: installed {}", resource.name, target.display()));
        tracing::info!(resource = %resource.name, target = %target.display(), "changed");

        for follow_up in &resource.follow_ups {
            follow_up
                .execute(self.runner)
                .map_err(|source| InstallError::FollowUp {
                    resource: resource.name.clone(),
                    source,
                })?;
        }

        Ok(InstallOutcome::Changed)
    }

    fn locate_template(&self, resource: &Resource) -> Result<PathBuf, InstallError> {
        let base = if resource.template.is_absolute() {
            resource.template.clone()
        } else {
            self.env.resource_root.join(&resource.template)
        };
        if base.is_file() {
            return Ok(base);
        }
        let mut suffixed = base.as_os_str().to_owned();
        suffixed.push(TEMPLATE_SUFFIX);
        let suffixed = PathBuf::from(suffixed);
        if suffixed.is_file() {
            return Ok(suffixed);
        }
        Err(InstallError::Configuration {
            resource: resource.name.clone(),
            reason: format!(
                "template not found: {} (or {})",
                base.display(),
                suffixed.display()
            ),
        })
    }

    fn target_path(&self, resource: &Resource) -> PathBuf {
        match resource.scope {
            Scope::System => self.env.host_path(&resource.target),
            Scope::User => resource.target.clone(),
        }
    }

    fn elevated(&self, resource: &Resource) -> bool {
        resource.scope == Scope::System && self.env.privilege == Privilege::Sudo
    }

    /// Current bytes of the target, `None` when it does not exist.
    fn installed_content(
        &self,
        resource: &Resource,
        target: &Path,
    ) -> Result<Option<Vec<u8>>, InstallError> {
        self.settle_read(resource, target, std::fs::read(target))
    }

    /// Falls back to an elevated `cat` when a sudo run cannot read a
    /// root-only target directly.
    fn settle_read(
        &self,
        resource: &Resource,
        target: &Path,
        direct: std::io::Result<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, InstallError> {
        match direct {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && self.elevated(resource) => {
                let cmd = Cmd::new("cat").arg(target.display().to_string()).elevated().quiet();
                let out = self.runner.run(&cmd)?;
                Ok(Some(out.stdout))
            }
            Err(source) => Err(InstallError::Io {
                path: target.display().to_string(),
                source,
            }),
        }
    }

    fn write(&self, resource: &Resource, target: &Path, content: &[u8]) -> Result<(), InstallError> {
        let io_err = |source| InstallError::Io {
            path: target.display().to_string(),
            source,
        };

        if self.elevated(resource) {
            let mut staged = tempfile::NamedTempFile::new().map_err(io_err)?;
            staged.write_all(content).map_err(io_err)?;
            staged.flush().map_err(io_err)?;
            let cmd = Cmd::new("install")
                .args(["-D", "-m"])
                .arg(format!("{:04o}", resource.mode))
                .arg(staged.path().display().to_string())
                .arg(target.display().to_string())
                .elevated()
                .quiet();
            self.runner.run(&cmd)?;
            return Ok(());
        }

        let parent = target.parent().unwrap_or_else(|| Path::new("/"));
        std::fs::create_dir_all(parent).map_err(io_err)?;
        // Stage next to the target so the rename is atomic.
        let mut staged = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        staged.write_all(content).map_err(io_err)?;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(resource.mode))
            .map_err(io_err)?;
        staged
            .persist(target)
            .map_err(|e| io_err(e.error))?;
        Ok(())
    }
}
