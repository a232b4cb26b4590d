/// Config directory layout shared by all commands.
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use warden_core::config::{CONFIG_FILE_NAME, KEY_FILE_NAME, SETTINGS_FILE_NAME};
use warden_core::{
    default_config_dir, ConfigStore, EncryptedFileSecretStore, EnvSecretStore, SecretStore,
    SupervisorSettings,
};

pub struct Context {
    dir: PathBuf,
}

impl Context {
    /// Use `dir`, or the platform config directory when not given.
    pub fn resolve(dir: Option<&Path>) -> Result<Self> {
        let dir = match dir {
            Some(d) => d.to_path_buf(),
            None => default_config_dir()?,
        };
        debug!("Config directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE_NAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE_NAME)
    }

    /// `warden.toml` if present, defaults otherwise. Models default to `<dir>/models`.
    pub fn settings(&self) -> Result<SupervisorSettings> {
        let path = self.settings_path();
        let mut settings = if path.exists() {
            SupervisorSettings::load(&path)?
        } else {
            SupervisorSettings::default()
        };
        if settings.models_dir.is_none() {
            settings.models_dir = Some(self.dir.join("models"));
        }
        Ok(settings)
    }

    /// Encrypted key file when a passphrase is set, otherwise the environment.
    pub fn secret_store(&self) -> Arc<dyn SecretStore> {
        match EncryptedFileSecretStore::from_env(self.key_path()) {
            Some(store) => Arc::new(store),
            None => Arc::new(EnvSecretStore),
        }
    }

    pub fn config_store(&self) -> ConfigStore {
        ConfigStore::new(self.dir.join(CONFIG_FILE_NAME), self.secret_store())
    }
}
