/// Agent binary resolution and spawning.
///
/// Resolution tries the bundled `<name>-<target triple>` binary first and falls back to
/// `<name>` on `PATH`. Configuration reaches the agent only through its environment.
use crate::config::{AgentConfig, SECRET_ENV_KEYS};
use crate::errors::{LaunchError, LaunchResult};
use crate::monitor::{ChildProcess, TokioChild};
use crate::secrets::mask_sensitive_data;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

/// How the agent binary was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    Bundled,
    Path,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStrategy::Bundled => write!(f, "bundled"),
            ResolutionStrategy::Path => write!(f, "PATH"),
        }
    }
}

/// Metadata for one live agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProcessHandle {
    pub run_id: Uuid,
    pub pid: Option<u32>,
    pub binary: PathBuf,
    pub strategy: ResolutionStrategy,
    /// Injected environment with secret values masked
    pub env: BTreeMap<String, String>,
    pub spawned_at: DateTime<Utc>,
}

pub type AgentPipe = Box<dyn AsyncRead + Send + Unpin>;

/// A freshly spawned agent: metadata, both output pipes, and the process itself.
pub struct SpawnedAgent {
    pub handle: AgentProcessHandle,
    pub stdout: AgentPipe,
    pub stderr: AgentPipe,
    pub child: Box<dyn ChildProcess>,
}

impl fmt::Debug for SpawnedAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedAgent")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Starts agent processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn exactly one agent process for `config`.
    async fn launch(
        &self,
        config: &AgentConfig,
        env_overrides: &BTreeMap<String, String>,
    ) -> LaunchResult<SpawnedAgent>;
}

/// Target triple of the running build, in the form bundlers use for sidecar names.
pub fn target_triple() -> String {
    let arch = std::env::consts::ARCH;
    let os = if cfg!(target_os = "macos") {
        "apple-darwin"
    } else if cfg!(target_os = "windows") {
        if cfg!(target_env = "gnu") {
            "pc-windows-gnu"
        } else {
            "pc-windows-msvc"
        }
    } else if cfg!(target_env = "musl") {
        "unknown-linux-musl"
    } else {
        "unknown-linux-gnu"
    };
    format!("{}-{}", arch, os)
}

/// Environment snapshot safe to keep in a handle or print.
pub fn mask_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let value = if SECRET_ENV_KEYS.contains(&k.as_str()) {
                "****".to_string()
            } else {
                mask_sensitive_data(v)
            };
            (k.clone(), value)
        })
        .collect()
}

/// Launcher for real processes.
#[derive(Debug, Clone)]
pub struct LocalProcessLauncher {
    binary_name: String,
    bundled_dir: Option<PathBuf>,
    models_dir: Option<PathBuf>,
    host: String,
    /// Overrides `PATH` for the fallback lookup
    search_path: Option<OsString>,
}

impl LocalProcessLauncher {
    pub fn new(binary_name: impl Into<String>) -> Self {
        Self {
            binary_name: binary_name.into(),
            bundled_dir: None,
            models_dir: None,
            host: "127.0.0.1".to_string(),
            search_path: None,
        }
    }

    pub fn with_bundled_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.bundled_dir = dir;
        self
    }

    pub fn with_models_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.models_dir = dir;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    /// File name of the bundled binary for this platform.
    pub fn bundled_binary_name(&self) -> String {
        format!(
            "{}-{}{}",
            self.binary_name,
            target_triple(),
            std::env::consts::EXE_SUFFIX
        )
    }

    pub fn resolve_bundled(&self) -> LaunchResult<PathBuf> {
        let dir = self.bundled_dir.as_ref().ok_or_else(|| {
            LaunchError::Resolve("no bundled binary directory available".to_string())
        })?;

        let candidate = dir.join(self.bundled_binary_name());
        if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(LaunchError::Resolve(format!(
                "{} does not exist",
                candidate.display()
            )))
        }
    }

    pub fn resolve_on_path(&self) -> LaunchResult<PathBuf> {
        let found = match &self.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                which::which_in(&self.binary_name, Some(paths), cwd)
            }
            None => which::which(&self.binary_name),
        };

        found.map_err(|e| {
            LaunchError::Resolve(format!("{} not found on PATH: {}", self.binary_name, e))
        })
    }

    /// Build the command for `binary`. No arguments; everything goes through `env`.
    fn build_command(&self, binary: &Path, env: &BTreeMap<String, String>) -> Command {
        let mut command = Command::new(binary);

        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        // Bundled runtimes ship their shared libraries next to the binary
        if let Some(dir) = binary.parent() {
            command.current_dir(dir);
        }

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        command.envs(env);
        command
    }

    fn spawn(
        &self,
        binary: PathBuf,
        strategy: ResolutionStrategy,
        env: &BTreeMap<String, String>,
    ) -> LaunchResult<SpawnedAgent> {
        let mut child = self.build_command(&binary, env).spawn().map_err(|e| {
            LaunchError::Spawn(format!("Failed to spawn {}: {}", binary.display(), e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(LaunchError::MissingPipe("stderr"))?;

        let handle = AgentProcessHandle {
            run_id: Uuid::new_v4(),
            pid: child.id(),
            binary,
            strategy,
            env: mask_env(env),
            spawned_at: Utc::now(),
        };

        info!(
            "Spawned agent {} (pid {:?}, {})",
            handle.binary.display(),
            handle.pid,
            strategy
        );

        Ok(SpawnedAgent {
            handle,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            child: Box::new(TokioChild::new(child)),
        })
    }
}

#[async_trait]
impl ProcessLauncher for LocalProcessLauncher {
    async fn launch(
        &self,
        config: &AgentConfig,
        env_overrides: &BTreeMap<String, String>,
    ) -> LaunchResult<SpawnedAgent> {
        let mut env = config.to_env(&self.host, self.models_dir.as_deref());
        env.extend(env_overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let bundled_err = match self.resolve_bundled() {
            Ok(binary) => match self.spawn(binary, ResolutionStrategy::Bundled, &env) {
                Ok(agent) => return Ok(agent),
                Err(e) => e,
            },
            Err(e) => e,
        };

        warn!("Bundled agent unavailable ({}), trying PATH", bundled_err);

        let path_err = match self.resolve_on_path() {
            Ok(binary) => match self.spawn(binary, ResolutionStrategy::Path, &env) {
                Ok(agent) => return Ok(agent),
                Err(e) => e,
            },
            Err(e) => e,
        };

        Err(LaunchError::BothFailed {
            bundled: Box::new(bundled_err),
            path: Box::new(path_err),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn test_target_triple_shape() {
        let triple = target_triple();
        assert!(triple.starts_with(std::env::consts::ARCH));
        assert!(triple.matches('-').count() >= 2);
    }

    #[test]
    fn test_bundled_name_uses_triple() {
        let launcher = LocalProcessLauncher::new("llama-server");
        let name = launcher.bundled_binary_name();
        assert!(name.starts_with("llama-server-"));
        assert!(name.contains(&target_triple()));
    }

    #[test]
    fn test_mask_env_hides_key() {
        let config = AgentConfig {
            private_key: crate::secrets::PrivateKey::new(KEY),
            ..Default::default()
        };
        let masked = mask_env(&config.to_env("127.0.0.1", None));
        assert_eq!(masked["PLUMISE_PRIVATE_KEY"], "****");
        assert_eq!(masked["HTTP_PORT"], "18920");
    }

    #[test]
    fn test_resolve_bundled_without_dir() {
        let launcher = LocalProcessLauncher::new("llama-server");
        assert!(matches!(
            launcher.resolve_bundled(),
            Err(LaunchError::Resolve(_))
        ));
    }

    #[tokio::test]
    async fn test_both_strategies_fail() {
        let empty = tempfile::tempdir().unwrap();
        let launcher = LocalProcessLauncher::new("warden-no-such-agent")
            .with_bundled_dir(Some(empty.path().to_path_buf()))
            .with_search_path(empty.path().as_os_str());

        let err = launcher
            .launch(&AgentConfig::default(), &BTreeMap::new())
            .await
            .unwrap_err();

        match err {
            LaunchError::BothFailed { bundled, path } => {
                assert!(bundled.to_string().contains("does not exist"));
                assert!(path.to_string().contains("not found on PATH"));
            }
            other => panic!("expected BothFailed, got {:?}", other),
        }
    }
}
