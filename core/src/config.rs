/// Agent and supervisor configuration.
///
/// `AgentConfig` is the per-launch value the UI hands to `start`; it persists as camelCase
/// JSON without the private key. `SupervisorSettings` is the supervisor's own TOML file.
use crate::errors::{ConfigError, ConfigResult};
use crate::secrets::{PrivateKey, SecretStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// File name of the persisted agent config.
pub const CONFIG_FILE_NAME: &str = "agent-config.json";

/// File name of the supervisor settings.
pub const SETTINGS_FILE_NAME: &str = "warden.toml";

/// Encrypted wallet key, next to the config file.
pub const KEY_FILE_NAME: &str = "wallet.key";

/// Minimum context tokens each parallel slot needs.
pub const MIN_CTX_PER_SLOT: u32 = 4096;

const LEGACY_HTTP_PORT: u16 = 8080;
const LEGACY_CTX_SIZE: u32 = 8192;

/// Devices the agent accepts.
pub const DEVICES: &[&str] = &["auto", "cuda", "cpu"];

/// Launch parameters for one agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Wallet key; see [`ConfigStore`] for how it is persisted.
    pub private_key: PrivateKey,
    pub model_file: String,
    /// `auto`, `cuda`, or `cpu`
    pub device: String,
    pub oracle_url: String,
    pub chain_rpc_url: String,
    pub http_port: u16,
    pub gpu_layers: u32,
    pub ctx_size: u32,
    pub parallel_slots: u32,
    /// 0 means no limit
    pub ram_limit_gb: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            private_key: PrivateKey::default(),
            model_file: "Qwen3-32B-Q4_K_M.gguf".to_string(),
            device: "auto".to_string(),
            oracle_url: "https://plug.plumise.com/oracle".to_string(),
            chain_rpc_url: "https://plug.plumise.com/rpc/plumise".to_string(),
            http_port: 18920,
            gpu_layers: 99,
            ctx_size: 32768,
            parallel_slots: 1,
            ram_limit_gb: 0,
        }
    }
}

impl AgentConfig {
    /// Rewrite values left behind by older releases. Returns true if anything changed.
    pub fn migrate(&mut self) -> bool {
        let defaults = AgentConfig::default();
        let mut changed = false;

        if self.http_port == LEGACY_HTTP_PORT {
            info!(
                "Migrating http_port {} -> {}",
                LEGACY_HTTP_PORT, defaults.http_port
            );
            self.http_port = defaults.http_port;
            changed = true;
        }

        if self.ctx_size == LEGACY_CTX_SIZE {
            info!("Migrating ctx_size {} -> {}", LEGACY_CTX_SIZE, defaults.ctx_size);
            self.ctx_size = defaults.ctx_size;
            changed = true;
        }

        changed
    }

    /// Slot count actually handed to the agent.
    ///
    /// Each slot gets `ctx_size / slots` tokens; below [`MIN_CTX_PER_SLOT`] the count is
    /// reduced to what the context can hold.
    pub fn effective_parallel_slots(&self) -> u32 {
        let slots = self.parallel_slots.max(1);
        if self.ctx_size / slots < MIN_CTX_PER_SLOT {
            (self.ctx_size / MIN_CTX_PER_SLOT).max(1)
        } else {
            slots
        }
    }

    /// Base URL of the agent's local HTTP endpoint.
    pub fn agent_base_url(&self, host: &str) -> String {
        format!("http://{}:{}", host, self.http_port)
    }

    /// Model file location. Relative names resolve against `models_dir` when one is set.
    pub fn model_path(&self, models_dir: Option<&Path>) -> PathBuf {
        let file = Path::new(&self.model_file);
        match models_dir {
            Some(dir) if file.is_relative() => dir.join(file),
            _ => file.to_path_buf(),
        }
    }

    /// Environment injected into the agent process.
    ///
    /// Carries both the agent's own variables and the `LLAMA_ARG_*` set llama-server reads
    /// in place of its command-line flags.
    pub fn to_env(&self, host: &str, models_dir: Option<&Path>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "PLUMISE_PRIVATE_KEY".to_string(),
            self.private_key.expose().to_string(),
        );
        env.insert("ORACLE_API_URL".to_string(), self.oracle_url.clone());
        env.insert("PLUMISE_RPC_URL".to_string(), self.chain_rpc_url.clone());
        env.insert("MODEL_FILE".to_string(), self.model_file.clone());
        env.insert("DEVICE".to_string(), self.device.clone());
        env.insert("AGENT_HOST".to_string(), host.to_string());
        env.insert("HTTP_PORT".to_string(), self.http_port.to_string());
        env.insert("GPU_LAYERS".to_string(), self.gpu_layers.to_string());
        env.insert("CTX_SIZE".to_string(), self.ctx_size.to_string());
        env.insert(
            "PARALLEL_SLOTS".to_string(),
            self.effective_parallel_slots().to_string(),
        );
        env.insert("RAM_LIMIT_GB".to_string(), self.ram_limit_gb.to_string());

        let gpu_layers = if self.device == "cpu" { 0 } else { self.gpu_layers };
        let llama = [
            (
                "LLAMA_ARG_MODEL",
                self.model_path(models_dir).to_string_lossy().into_owned(),
            ),
            ("LLAMA_ARG_HOST", host.to_string()),
            ("LLAMA_ARG_PORT", self.http_port.to_string()),
            ("LLAMA_ARG_N_GPU_LAYERS", gpu_layers.to_string()),
            ("LLAMA_ARG_CTX_SIZE", self.ctx_size.to_string()),
            (
                "LLAMA_ARG_N_PARALLEL",
                self.effective_parallel_slots().to_string(),
            ),
            ("LLAMA_ARG_ENDPOINT_METRICS", "1".to_string()),
            ("LLAMA_ARG_JINJA", "1".to_string()),
        ];
        for (key, value) in llama {
            env.insert(key.to_string(), value);
        }
        env
    }
}

/// Names of injected variables whose values are masked in snapshots.
pub const SECRET_ENV_KEYS: &[&str] = &["PLUMISE_PRIVATE_KEY"];

/// Persists [`AgentConfig`] as JSON, routing the key through a [`SecretStore`].
pub struct ConfigStore {
    path: PathBuf,
    secrets: Arc<dyn SecretStore>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            path: path.into(),
            secrets,
        }
    }

    /// Store rooted at the platform config directory (`~/.config/warden` on Linux).
    pub fn in_default_dir(secrets: Arc<dyn SecretStore>) -> ConfigResult<Self> {
        Ok(Self::new(default_config_dir()?.join(CONFIG_FILE_NAME), secrets))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config, falling back to defaults when the file is missing or corrupt.
    ///
    /// Legacy values are migrated and written back.
    pub fn load(&self) -> ConfigResult<AgentConfig> {
        let mut config = match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<AgentConfig>(&raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        "Ignoring unreadable config {}: {}",
                        self.path.display(),
                        e
                    );
                    AgentConfig::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentConfig::default(),
            Err(e) => return Err(e.into()),
        };

        if config.migrate() {
            self.write_public(&config)?;
        }

        if let Some(key) = self.secrets.load_private_key()? {
            config.private_key = key;
        }

        Ok(config)
    }

    /// Save the config. The key goes to the secret store, never into the JSON file.
    pub fn save(&self, config: &AgentConfig) -> ConfigResult<()> {
        if config.private_key.is_empty() {
            self.secrets.delete_private_key()?;
        } else {
            self.secrets.store_private_key(&config.private_key)?;
        }
        self.write_public(config)
    }

    /// Write a default config file. Returns false if one exists and `overwrite` is unset.
    pub fn write_defaults(&self, overwrite: bool) -> ConfigResult<bool> {
        if self.path.exists() && !overwrite {
            return Ok(false);
        }
        self.write_public(&AgentConfig::default())?;
        Ok(true)
    }

    fn write_public(&self, config: &AgentConfig) -> ConfigResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut public = config.clone();
        public.private_key = PrivateKey::default();
        let json = serde_json::to_string_pretty(&public)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(&self.path, json)?;
        info!(
            "Saved agent config to {} (key via {} store)",
            self.path.display(),
            self.secrets.name()
        );
        Ok(())
    }
}

/// `<platform config dir>/warden`
pub fn default_config_dir() -> ConfigResult<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("warden"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Supervisor tuning, loaded from `warden.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Base name of the agent executable
    pub binary_name: String,
    /// Directory holding bundled `<binary_name>-<triple>` binaries
    pub bundled_dir: Option<PathBuf>,
    /// Directory relative model file names resolve against
    pub models_dir: Option<PathBuf>,
    /// Host the agent listens on
    pub host: String,
    /// Health poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Per-request timeout for health and metrics polls
    pub poll_request_timeout_ms: u64,
    /// Consecutive failed polls before a warning is logged
    pub readiness_warn_after: u32,
    /// Seconds to wait for exit before force-killing
    pub shutdown_timeout_secs: u64,
    /// Timeout for the `POST /shutdown` request
    pub shutdown_request_timeout_ms: u64,
    /// Timeout for preflight network probes
    pub probe_timeout_secs: u64,
    /// Log entries retained
    pub log_capacity: usize,
    /// Require a visible GPU (NVIDIA, or Metal on macOS) when gpu_layers > 0
    pub check_gpu: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            binary_name: "llama-server".to_string(),
            bundled_dir: None,
            models_dir: None,
            host: "127.0.0.1".to_string(),
            poll_interval_ms: 3000,
            poll_request_timeout_ms: 3000,
            readiness_warn_after: 20,
            shutdown_timeout_secs: 5,
            shutdown_request_timeout_ms: 2000,
            probe_timeout_secs: 5,
            log_capacity: 500,
            check_gpu: false,
        }
    }
}

impl SupervisorSettings {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let settings: SupervisorSettings =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from TOML file or use defaults
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.binary_name.trim().is_empty() {
            return Err(ConfigError::Invalid("binary_name must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than 0".into(),
            ));
        }
        if self.poll_request_timeout_ms == 0 || self.probe_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request timeouts must be greater than 0".into(),
            ));
        }
        if self.log_capacity == 0 {
            return Err(ConfigError::Invalid(
                "log_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_request_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn shutdown_request_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecretStore;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn sample() -> AgentConfig {
        AgentConfig {
            private_key: PrivateKey::new(KEY),
            model_file: "Llama-3-8B-Q4.gguf".into(),
            device: "cuda".into(),
            http_port: 19000,
            gpu_layers: 40,
            ctx_size: 16384,
            parallel_slots: 2,
            ram_limit_gb: 24,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = sample();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"modelFile\""));
        assert!(json.contains("\"ramLimitGb\""));

        let back: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: AgentConfig = serde_json::from_str(r#"{"device":"cpu"}"#).unwrap();
        assert_eq!(config.device, "cpu");
        assert_eq!(config.http_port, 18920);
        assert_eq!(config.ctx_size, 32768);
    }

    #[test]
    fn test_migrate_legacy_values() {
        let mut config = AgentConfig {
            http_port: 8080,
            ctx_size: 8192,
            ..Default::default()
        };
        assert!(config.migrate());
        assert_eq!(config.http_port, 18920);
        assert_eq!(config.ctx_size, 32768);
        assert!(!config.migrate());
    }

    #[test]
    fn test_effective_parallel_slots() {
        let mut config = AgentConfig::default();
        config.ctx_size = 32768;
        config.parallel_slots = 4;
        assert_eq!(config.effective_parallel_slots(), 4);

        config.parallel_slots = 16;
        assert_eq!(config.effective_parallel_slots(), 8);

        config.ctx_size = 2048;
        config.parallel_slots = 2;
        assert_eq!(config.effective_parallel_slots(), 1);

        config.parallel_slots = 0;
        config.ctx_size = 32768;
        assert_eq!(config.effective_parallel_slots(), 1);
    }

    #[test]
    fn test_to_env_carries_full_config() {
        let env = sample().to_env("127.0.0.1", None);
        assert_eq!(env["PLUMISE_PRIVATE_KEY"], KEY);
        assert_eq!(env["MODEL_FILE"], "Llama-3-8B-Q4.gguf");
        assert_eq!(env["DEVICE"], "cuda");
        assert_eq!(env["HTTP_PORT"], "19000");
        assert_eq!(env["GPU_LAYERS"], "40");
        assert_eq!(env["CTX_SIZE"], "16384");
        assert_eq!(env["PARALLEL_SLOTS"], "2");
        assert_eq!(env["RAM_LIMIT_GB"], "24");
        assert_eq!(env["AGENT_HOST"], "127.0.0.1");

        assert_eq!(env["LLAMA_ARG_MODEL"], "Llama-3-8B-Q4.gguf");
        assert_eq!(env["LLAMA_ARG_HOST"], "127.0.0.1");
        assert_eq!(env["LLAMA_ARG_PORT"], "19000");
        assert_eq!(env["LLAMA_ARG_N_GPU_LAYERS"], "40");
        assert_eq!(env["LLAMA_ARG_CTX_SIZE"], "16384");
        assert_eq!(env["LLAMA_ARG_N_PARALLEL"], "2");
        assert_eq!(env["LLAMA_ARG_ENDPOINT_METRICS"], "1");
        assert_eq!(env["LLAMA_ARG_JINJA"], "1");
    }

    #[test]
    fn test_to_env_resolves_model_and_cpu_layers() {
        let mut config = sample();
        config.device = "cpu".into();
        config.parallel_slots = 8;

        let models = Path::new("/var/lib/warden/models");
        let env = config.to_env("0.0.0.0", Some(models));
        assert_eq!(
            env["LLAMA_ARG_MODEL"],
            models.join("Llama-3-8B-Q4.gguf").to_string_lossy()
        );
        assert_eq!(env["LLAMA_ARG_N_GPU_LAYERS"], "0");
        assert_eq!(env["LLAMA_ARG_N_PARALLEL"], "4");
        assert_eq!(env["LLAMA_ARG_HOST"], "0.0.0.0");

        config.model_file = "/opt/models/custom.gguf".into();
        assert_eq!(
            config.to_env("127.0.0.1", Some(models))["LLAMA_ARG_MODEL"],
            "/opt/models/custom.gguf"
        );
    }

    #[test]
    fn test_store_keeps_key_out_of_json() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(MemorySecretStore::new());
        let store = ConfigStore::new(dir.path().join(CONFIG_FILE_NAME), secrets.clone());

        let config = sample();
        store.save(&config).unwrap();

        let on_disk = std::fs::read_to_string(store.path()).unwrap();
        assert!(!on_disk.contains(&KEY[2..]));
        assert_eq!(
            secrets.load_private_key().unwrap(),
            Some(PrivateKey::new(KEY))
        );

        let loaded = store.load().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_store_load_missing_or_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let store = ConfigStore::new(&path, Arc::new(MemorySecretStore::new()));

        assert_eq!(store.load().unwrap(), AgentConfig::default());

        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(store.load().unwrap(), AgentConfig::default());
    }

    #[test]
    fn test_store_load_writes_back_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"httpPort":8080,"ctxSize":8192}"#).unwrap();

        let store = ConfigStore::new(&path, Arc::new(MemorySecretStore::new()));
        let config = store.load().unwrap();
        assert_eq!(config.http_port, 18920);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("18920"));
        assert!(raw.contains("32768"));
    }

    #[test]
    fn test_write_defaults_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(
            dir.path().join("nested").join(CONFIG_FILE_NAME),
            Arc::new(crate::secrets::EnvSecretStore),
        );

        assert!(store.write_defaults(false).unwrap());
        std::fs::write(store.path(), r#"{"device":"cpu"}"#).unwrap();
        assert!(!store.write_defaults(false).unwrap());
        assert!(std::fs::read_to_string(store.path()).unwrap().contains("cpu"));

        assert!(store.write_defaults(true).unwrap());
        assert!(std::fs::read_to_string(store.path())
            .unwrap()
            .contains("\"device\": \"auto\""));
    }

    #[test]
    fn test_settings_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            "binary_name = \"my-server\"\npoll_interval_ms = 500\nbundled_dir = \"/opt/warden/bin\"\n",
        )
        .unwrap();

        let settings = SupervisorSettings::load(&path).unwrap();
        assert_eq!(settings.binary_name, "my-server");
        assert_eq!(settings.poll_interval(), Duration::from_millis(500));
        assert_eq!(settings.bundled_dir, Some(PathBuf::from("/opt/warden/bin")));
        assert_eq!(settings.log_capacity, 500);

        let text = SupervisorSettings::default().to_toml().unwrap();
        let parsed: SupervisorSettings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, SupervisorSettings::default());
    }

    #[test]
    fn test_settings_validate() {
        let settings = SupervisorSettings {
            log_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let settings = SupervisorSettings {
            binary_name: " ".into(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
