//! Placeholder rendering for resource templates.
//!
//! Templates carry `__NAME__` tokens. Rendering replaces every bound token
//! and leaves the rest verbatim; callers decide whether leftovers matter.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Tokens the orchestrator itself knows how to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Placeholder {
    User,
    Group,
    InstallRoot,
    PythonRoot,
    DataRoot,
    SpotifyRoot,
    LogDir,
    InstallLog,
    TraceLog,
    AudioLog,
    SpotifyLog,
    AutostartLog,
    Hostname,
    Appliance,
}

impl Placeholder {
    pub fn token(self) -> &'static str {
        match self {
            Self::User => "__USER__",
            Self::Group => "__GROUP__",
            Self::InstallRoot => "__INSTALL_ROOT__",
            Self::PythonRoot => "__PYTHON_ROOT__",
            Self::DataRoot => "__DATA_ROOT__",
            Self::SpotifyRoot => "__SPOTIFY_ROOT__",
            Self::LogDir => "__LOG_DIR__",
            Self::InstallLog => "__INSTALL_LOG__",
            Self::TraceLog => "__TRACE_LOG__",
            Self::AudioLog => "__AUDIO_LOG__",
            Self::SpotifyLog => "__SPOTIFY_LOG__",
            Self::AutostartLog => "__AUTOSTART_LOG__",
            Self::Hostname => "__HOSTNAME__",
            Self::Appliance => "__APPLIANCE__",
        }
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Token → value map used to render templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    values: BTreeMap<String, String>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, placeholder: Placeholder, value: impl Into<String>) -> &mut Self {
        self.values.insert(placeholder.token().to_string(), value.into());
        self
    }

    /// A copy with `placeholder` bound on top.
    pub fn with(&self, placeholder: Placeholder, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.bind(placeholder, value);
        next
    }

    pub fn get(&self, placeholder: Placeholder) -> Option<&str> {
        self.values.get(placeholder.token()).map(String::as_str)
    }

    pub fn contains(&self, placeholder: Placeholder) -> bool {
        self.values.contains_key(placeholder.token())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// Template tokens that had no binding and were left as they are.
    pub unresolved: BTreeSet<String>,
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"__[A-Z][A-Z0-9]*(?:_[A-Z0-9]+)*__").expect("valid regex")
    })
}

/// Substitute in a single pass over the template: a bound value is never
/// scanned for tokens itself.
pub fn render(template: &str, bindings: &Bindings) -> Rendered {
    let mut unresolved = BTreeSet::new();
    let text = token_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let token = &caps[0];
            match bindings.values.get(token) {
                Some(value) => value.clone(),
                None => {
                    unresolved.insert(token.to_string());
                    token.to_string()
                }
            }
        })
        .into_owned();
    Rendered { text, unresolved }
}
