use std::collections::HashMap;
use std::path::Path;

use appliance_config::OsTarget;

use crate::environment::Environment;
use crate::error::ProvisionError;

/// Read the host's os-release and refuse anything but `target`.
///
/// Touches nothing on disk, so it can run before any log file is opened.
pub fn gate(env: &Environment, target: &OsTarget) -> Result<OsRelease, ProvisionError> {
    let os = OsRelease::load(&env.host_path("/etc/os-release"))?;
    os.check_supported(target)?;
    Ok(os)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub version_codename: String,
    pub pretty_name: String,
}

impl OsRelease {
    pub fn load(path: &Path) -> Result<Self, ProvisionError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Environment(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(Self::parse(&content))
    }

    /// Parse os-release(5) `KEY=value` lines.
    pub fn parse(content: &str) -> Self {
        let fields: HashMap<&str, String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim(), unquote(v.trim())))
            .collect();
        let get = |key: &str| fields.get(key).cloned().unwrap_or_default();
        Self {
            id: get("ID"),
            version_codename: get("VERSION_CODENAME"),
            pretty_name: get("PRETTY_NAME"),
        }
    }

    pub fn describe(&self) -> String {
        if self.pretty_name.is_empty() {
            format!("{} {}", self.id, self.version_codename)
        } else {
            self.pretty_name.clone()
        }
    }

    /// Fail unless this is the one release the appliance supports.
    pub fn check_supported(&self, target: &OsTarget) -> Result<(), ProvisionError> {
        let id_ok = target.ids.iter().any(|id| id == &self.id);
        if id_ok && self.version_codename == target.codename {
            return Ok(());
        }
        Err(ProvisionError::UnsupportedOs {
            expected: format!("{} {}", target.ids.join("/"), target.codename),
            found: format!("{} {}", self.id, self.version_codename),
        })
    }
}

fn unquote(v: &str) -> String {
    let v = v
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(v);
    v.replace("\\\"", "\"")
}
