// Warden: sidecar supervisor for a local inference agent
// Core library providing the launcher, output capture, health polling and lifecycle

pub mod config;
pub mod errors;
pub mod events;
pub mod health;
pub mod launcher;
pub mod logs;
pub mod monitor;
pub mod preflight;
pub mod secrets;
pub mod state;
pub mod stream;
pub mod supervisor;

// Re-export commonly used types
pub use errors::{
    ConfigError, ConfigResult, HealthError, HealthResult, LaunchError, LaunchResult,
    PreflightError, SecretError, SecretResult, SupervisorError, SupervisorResult,
};

pub use config::{default_config_dir, AgentConfig, ConfigStore, SupervisorSettings};

pub use events::{EventBus, EventBusStats, RuntimeBridge, Subscription, SupervisorEvent};

pub use health::{
    AgentHealth, AgentMetrics, HealthPoller, HealthProbe, HttpHealthProbe, PollObserver,
    PollSummary,
};

pub use launcher::{
    AgentProcessHandle, LocalProcessLauncher, ProcessLauncher, ResolutionStrategy, SpawnedAgent,
};

pub use logs::{LogBuffer, LogEntry, LogLevel};

pub use monitor::{ChildProcess, ProcessExit, Termination, TerminationMonitor};

pub use preflight::{CheckOutcome, PreflightCheck, PreflightReport, PreflightValidator};

pub use secrets::{
    EncryptedFileSecretStore, EnvSecretStore, MemorySecretStore, PrivateKey, SecretStore,
};

pub use state::{transition, AgentStatus, LifecycleEvent};

pub use stream::{LoadingPhase, LoadingProgress, OutputItem, OutputLine, StreamOrigin};

pub use supervisor::{CommandOutcome, ProbeFactory, Supervisor, SupervisorBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
