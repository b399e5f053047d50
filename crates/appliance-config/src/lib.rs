use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Root configuration — mirrors appliance.toml structure exactly.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplianceConfig {
    pub appliance: ApplianceMeta,
    #[serde(default)]
    pub os: OsTarget,
    #[serde(default)]
    pub install: Install,
    #[serde(default)]
    pub packages: Packages,
    #[serde(default)]
    pub interfaces: Interfaces,
    #[serde(default)]
    pub audio: Audio,
    #[serde(default)]
    pub features: Features,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplianceMeta {
    pub name: String,
    pub version: String,
}

/// The one distribution release the appliance is built against.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OsTarget {
    /// Accepted `ID=` values from /etc/os-release.
    pub ids: Vec<String>,
    /// Required `VERSION_CODENAME=`.
    pub codename: String,
}

impl Default for OsTarget {
    fn default() -> Self {
        Self {
            ids: vec!["raspbian".into(), "debian".into()],
            codename: "bookworm".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Install {
    pub hostname: String,
    /// Refresh the apt index only when it is older than this.
    pub index_max_age_hours: u64,
    /// Seconds to let output settle before the reboot is issued.
    pub reboot_settle_secs: u64,
    pub boot_config: PathBuf,
    pub autologin_behaviour: BootBehaviour,
    pub restore_behaviour: BootBehaviour,
}

impl Default for Install {
    fn default() -> Self {
        Self {
            hostname: "appliance".into(),
            index_max_age_hours: 24,
            reboot_settle_secs: 3,
            boot_config: PathBuf::from("/boot/firmware/config.txt"),
            autologin_behaviour: BootBehaviour::ConsoleAutologin,
            restore_behaviour: BootBehaviour::Console,
        }
    }
}

/// raspi-config boot behaviour (B1..B4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootBehaviour {
    Console,
    ConsoleAutologin,
    Desktop,
    DesktopAutologin,
}

impl BootBehaviour {
    pub fn code(self) -> &'static str {
        match self {
            Self::Console => "B1",
            Self::ConsoleAutologin => "B2",
            Self::Desktop => "B3",
            Self::DesktopAutologin => "B4",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Packages {
    /// Debian packages installed or upgraded in the one-time phase.
    pub system: Vec<String>,
    /// pip requirements installed into the runtime venv.
    pub python: Vec<String>,
}

impl Default for Packages {
    fn default() -> Self {
        Self {
            system: [
                "python3",
                "python3-venv",
                "python3-pip",
                "avahi-daemon",
                "alsa-utils",
                "i2c-tools",
                "udisks2",
            ]
            .map(str::to_string)
            .to_vec(),
            python: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Interfaces {
    pub i2c: bool,
    pub spi: bool,
    pub serial: bool,
    pub onewire: bool,
}

impl Interfaces {
    /// raspi-config interface names that should end up enabled.
    pub fn enabled(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.i2c {
            names.push("i2c");
        }
        if self.spi {
            names.push("spi");
        }
        if self.serial {
            names.push("serial_hw");
        }
        if self.onewire {
            names.push("onewire");
        }
        names
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Audio {
    pub enabled: bool,
    pub mixer_control: String,
    pub volume_percent: Option<u8>,
}

impl Default for Audio {
    fn default() -> Self {
        Self {
            enabled: true,
            mixer_control: "Master".into(),
            volume_percent: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Features {
    pub usb_automount: bool,
    pub spotify: bool,
    pub autostart: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            usb_automount: true,
            spotify: false,
            autostart: true,
        }
    }
}

impl ApplianceConfig {
    /// A config with every optional section at its default.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            appliance: ApplianceMeta {
                name: name.into(),
                version: version.into(),
            },
            os: OsTarget::default(),
            install: Install::default(),
            packages: Packages::default(),
            interfaces: Interfaces::default(),
            audio: Audio::default(),
            features: Features::default(),
        }
    }

    /// Load config from a TOML file path and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: ApplianceConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.appliance.name.trim().is_empty() {
            return Err(invalid("appliance.name", "must not be empty"));
        }
        if !valid_hostname(&self.install.hostname) {
            return Err(invalid(
                "install.hostname",
                "expected 1-63 chars of [a-z0-9-], not starting or ending with '-'",
            ));
        }
        if self.os.ids.is_empty() || self.os.codename.is_empty() {
            return Err(invalid("os", "ids and codename are required"));
        }
        if let Some(v) = self.audio.volume_percent {
            if v > 100 {
                return Err(invalid("audio.volume_percent", "must be 0-100"));
            }
        }
        if self.audio.enabled && self.audio.mixer_control.trim().is_empty() {
            return Err(invalid("audio.mixer_control", "must not be empty"));
        }
        if !self.install.boot_config.is_absolute() {
            return Err(invalid("install.boot_config", "must be an absolute path"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

fn valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
