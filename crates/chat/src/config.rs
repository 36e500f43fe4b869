use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_llm::{ChatProvider, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use super::settings::GenerationSettings;

pub const CONFIG_DIRECTORY_NAME: &str = "parley";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the persisted chat sessions.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Settings given to every new session.
    #[serde(default)]
    pub default_settings: GenerationSettings,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            default_settings: GenerationSettings::default(),
            providers: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the JSON file at `path`, then `PARLEY_*` variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn extract(figment: &Figment) -> ConfigResult<Self> {
        let config: Self = figment.extract().context(ExtractSnafu {
            stage: "extract-config",
        })?;
        Ok(config.normalized())
    }

    pub fn provider(&self, provider: ChatProvider) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|config| config.provider == provider)
    }

    pub fn normalized(mut self) -> Self {
        if self.data_dir.as_os_str().is_empty() {
            self.data_dir = default_data_dir();
        }
        self.default_settings = self.default_settings.normalized();

        // Later entries for the same provider win.
        let mut providers: Vec<ProviderConfig> = Vec::new();
        for config in self.providers {
            let config = ProviderConfig::new(config.provider, config.api_key, config.base_url);
            providers.retain(|existing| existing.provider != config.provider);
            providers.push(config);
        }
        self.providers = providers;
        self
    }
}

/// Live application config with atomic on-disk updates.
pub struct ConfigStore {
    config: Arc<ArcSwap<AppConfig>>,
    config_path: PathBuf,
}

impl ConfigStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let config = Self::load_from_disk(&config_path);
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config(&self) -> Arc<AppConfig> {
        self.config.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, config: AppConfig) -> ConfigResult<()> {
        let normalized = config.normalized();
        self.persist(&normalized)?;
        self.config.store(Arc::new(normalized));
        Ok(())
    }

    /// Replaces the settings used for new sessions.
    pub fn update_default_settings(&self, settings: GenerationSettings) -> ConfigResult<()> {
        let mut config = AppConfig::clone(&self.config());
        config.default_settings = settings;
        self.update(config)
    }

    fn load_from_disk(path: &Path) -> AppConfig {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults and environment");
        }

        match AppConfig::extract(&AppConfig::figment(path)) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse config, using defaults"
                );
                AppConfig::default()
            }
        }
    }

    fn persist(&self, config: &AppConfig) -> ConfigResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-config-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(config).context(SerializeConfigSnafu {
            stage: "serialize-config-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-config-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-config-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved config");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read config on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
    #[snafu(display("failed to create config directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize config on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write config file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace config file from {from:?} to {to:?} on `{stage}`: {source}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(CONFIG_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".parley").join("data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{SettingsPatch, Temperature};

    #[test]
    fn missing_file_yields_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(directory.path().join("config.json"));

        let config = store.config();
        assert_eq!(config.default_settings, GenerationSettings::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "data_dir": "/tmp/parley-data",
                "default_settings": {
                    "provider": "OpenAI",
                    "model": "  ",
                    "temperature": 1.0,
                    "systemPrompt": "Be terse."
                },
                "providers": [
                    { "provider": "OpenAI", "api_key": " old " },
                    { "provider": "OpenAI", "api_key": " sk-test " }
                ]
            }"#,
        )
        .unwrap();

        let config = ConfigStore::new(path).config();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/parley-data"));
        assert_eq!(config.default_settings.provider, ChatProvider::OpenAI);
        assert_eq!(config.default_settings.model, "gpt-4");
        assert_eq!(config.default_settings.temperature, Temperature::Creative);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(
            config.provider(ChatProvider::OpenAI).unwrap().api_key,
            "sk-test"
        );
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("config.json");
        std::fs::write(&path, r#"{ "default_settings": { "temperature": 0.9 } }"#).unwrap();

        let config = ConfigStore::new(path).config();

        assert_eq!(config.default_settings.temperature, Temperature::Balanced);
    }

    #[test]
    fn updates_are_persisted_and_reloaded() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join("config.json");
        let store = ConfigStore::new(path.clone());

        let mut settings = GenerationSettings::default();
        settings.apply(SettingsPatch::default().temperature(Temperature::Precise));
        store.update_default_settings(settings.clone()).unwrap();

        assert_eq!(store.config().default_settings, settings);
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(ConfigStore::new(path).config().default_settings, settings);
    }
}
