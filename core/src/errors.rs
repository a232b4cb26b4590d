/// Error types for the Warden sidecar supervisor.
use thiserror::Error;

/// Failure to get an agent process running.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Agent binary not found: {0}")]
    Resolve(String),

    #[error("Agent spawn failed: {0}")]
    Spawn(String),

    #[error("Agent spawn failed (bundled: {bundled}; path: {path})")]
    BothFailed {
        bundled: Box<LaunchError>,
        path: Box<LaunchError>,
    },

    #[error("Agent {0} pipe was not captured")]
    MissingPipe(&'static str),
}

/// Result type for launch operations.
pub type LaunchResult<T> = Result<T, LaunchError>;

/// Preflight did not allow the launch.
#[derive(Error, Debug)]
pub enum PreflightError {
    #[error("Preflight failed: {}", failed.join(", "))]
    Failed { failed: Vec<String> },
}

/// Errors loading, saving, or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Config directory could not be determined")]
    NoConfigDir,

    #[error("Secret store error: {0}")]
    Secret(#[from] SecretError),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors from secret storage backends.
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Secret I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Secret encoding error: {0}")]
    Encoding(String),

    #[error("Secret store is read-only")]
    ReadOnly,
}

/// Result type for secret operations.
pub type SecretResult<T> = Result<T, SecretError>;

/// Errors talking to the agent's HTTP endpoint.
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("Agent request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Agent returned HTTP {0}")]
    Status(u16),

    #[error("Invalid agent response: {0}")]
    Decode(String),
}

/// Result type for health and metrics requests.
pub type HealthResult<T> = Result<T, HealthError>;

/// Top-level supervisor error.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Preflight(#[from] PreflightError),
}

/// Result type for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;
