//! Paths and identity for one provisioning run.
//!
//! Everything is derived from the install root so the appliance bundle can
//! live anywhere on disk. Built once in `main` and passed by reference.

use std::path::{Path, PathBuf};

use nix::unistd::{getuid, Group, User};

use crate::error::ProvisionError;
use crate::template::{Bindings, Placeholder};

/// How files under the system root get written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// The process can write system paths itself (running as root, or tests).
    Direct,
    /// Stage to a temp file and `sudo install` it into place.
    Sudo,
}

impl Privilege {
    pub fn detect() -> Self {
        if nix::unistd::geteuid().is_root() {
            Self::Direct
        } else {
            Self::Sudo
        }
    }
}

/// The account services are configured to run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub group: String,
}

impl Identity {
    pub fn new(user: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            group: group.into(),
        }
    }

    /// The invoking user; when run through sudo, the account that ran sudo.
    pub fn current() -> Result<Self, ProvisionError> {
        let user = match std::env::var("SUDO_USER") {
            Ok(name) if !name.is_empty() && name != "root" => User::from_name(&name)
                .map_err(|e| ProvisionError::Environment(format!("lookup user {name}: {e}")))?,
            _ => User::from_uid(getuid())
                .map_err(|e| ProvisionError::Environment(format!("lookup current user: {e}")))?,
        }
        .ok_or_else(|| ProvisionError::Environment("invoking user has no passwd entry".into()))?;

        let group = Group::from_gid(user.gid)
            .map_err(|e| ProvisionError::Environment(format!("lookup group {}: {e}", user.gid)))?
            .map(|g| g.name)
            .unwrap_or_else(|| user.gid.to_string());

        Ok(Self {
            user: user.name,
            group,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Environment {
    pub install_root: PathBuf,
    pub resource_root: PathBuf,
    pub python_root: PathBuf,
    pub data_root: PathBuf,
    pub spotify_root: PathBuf,
    pub log_dir: PathBuf,
    pub state_file: PathBuf,
    pub startup_file: PathBuf,
    pub identity: Identity,
    pub privilege: Privilege,
    /// Prefix for absolute OS paths; `/` outside of tests.
    pub system_root: PathBuf,
    /// The process runs with euid 0, usually through `sudo`. Files it
    /// creates under the install root are root-owned.
    pub started_as_root: bool,
}

impl Environment {
    /// Resolve everything from the live system.
    pub fn resolve(install_root: &Path) -> Result<Self, ProvisionError> {
        let install_root = std::fs::canonicalize(install_root).map_err(|e| {
            ProvisionError::Environment(format!("install root {}: {e}", install_root.display()))
        })?;
        let identity = Identity::current()?;
        // Under sudo $HOME may be root's; the hook belongs to the invoking user.
        let home = User::from_name(&identity.user)
            .ok()
            .flatten()
            .map(|u| u.dir)
            .or_else(dirs::home_dir)
            .ok_or_else(|| ProvisionError::Environment("cannot determine home directory".into()))?;
        Ok(Self::new(&install_root, &home, identity, Privilege::detect())
            .with_started_as_root(nix::unistd::geteuid().is_root()))
    }

    pub fn new(install_root: &Path, home: &Path, identity: Identity, privilege: Privilege) -> Self {
        let data_root = install_root.join("data");
        Self {
            install_root: install_root.to_path_buf(),
            resource_root: install_root.join("resources"),
            python_root: install_root.join("venv"),
            spotify_root: data_root.join("spotify"),
            log_dir: install_root.join("logs"),
            state_file: data_root.join("continuation.json"),
            data_root,
            startup_file: home.join(".bashrc"),
            identity,
            privilege,
            system_root: PathBuf::from("/"),
            started_as_root: false,
        }
    }

    pub fn with_started_as_root(mut self, as_root: bool) -> Self {
        self.started_as_root = as_root;
        self
    }

    /// A root run leaves root-owned state behind, but the login hook fires
    /// in the user's own shell; the continuation has to go back through
    /// `sudo` to read and clear it.
    pub fn continuation_needs_sudo(&self) -> bool {
        self.started_as_root && self.identity.user != "root"
    }

    pub fn with_system_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.system_root = root.into();
        self
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.log_dir.join(name)
    }

    pub fn install_log(&self) -> PathBuf {
        self.log_file("install.log")
    }

    pub fn trace_log(&self) -> PathBuf {
        self.log_file("trace.log")
    }

    /// Where an absolute OS path lives for this run.
    pub fn host_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if self.system_root == Path::new("/") {
            return path.to_path_buf();
        }
        self.system_root
            .join(path.strip_prefix("/").unwrap_or(path))
    }

    pub fn bindings(&self) -> Bindings {
        let mut b = Bindings::new();
        b.bind(Placeholder::User, &self.identity.user)
            .bind(Placeholder::Group, &self.identity.group)
            .bind(Placeholder::InstallRoot, path_str(&self.install_root))
            .bind(Placeholder::PythonRoot, path_str(&self.python_root))
            .bind(Placeholder::DataRoot, path_str(&self.data_root))
            .bind(Placeholder::SpotifyRoot, path_str(&self.spotify_root))
            .bind(Placeholder::LogDir, path_str(&self.log_dir))
            .bind(Placeholder::InstallLog, path_str(&self.install_log()))
            .bind(Placeholder::TraceLog, path_str(&self.trace_log()))
            .bind(Placeholder::AudioLog, path_str(&self.log_file("audio.log")))
            .bind(Placeholder::SpotifyLog, path_str(&self.log_file("spotify.log")))
            .bind(
                Placeholder::AutostartLog,
                path_str(&self.log_file("autostart.log")),
            );
        b
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}
