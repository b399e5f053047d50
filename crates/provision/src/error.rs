use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Unsupported OS: expected {expected}, found {found}")]
    UnsupportedOs { expected: String, found: String },

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Config error: {0}")]
    Config(#[from] appliance_config::ConfigError),

    #[error("Failed to access state file {path}: {source}")]
    State {
        path: String,
        source: std::io::Error,
    },

    #[error("Corrupt state file {path}: {source}")]
    StateParse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Process exit status for a run that stopped on this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::UnsupportedOs { .. } => 3,
            _ => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Invalid install request: {0}")]
    Usage(String),

    #[error("Resource {resource}: {reason}")]
    Configuration { resource: String, reason: String },

    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Resource {resource} installed but follow-up failed: {source}")]
    FollowUp {
        resource: String,
        source: CommandError,
    },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Command `{command}` failed (exit {exit_code}): {stderr}")]
    ExecutionFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
}
