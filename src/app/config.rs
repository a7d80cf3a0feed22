use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::ProviderId;
use crate::platform::AppPaths;

const ENV_PREFIX: &str = "RELAYCHAT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub augmentation: AugmentationConfig,
    pub streaming: StreamingConfig,
    pub usage: UsageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub default_model: Option<String>,
    pub api_endpoint: Option<String>,
    pub timeout_seconds: u64,
    pub priority: i32, // Higher number = tried first for defaults and fallback
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_model: None,
            api_endpoint: None,
            timeout_seconds: 60,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub top_k: usize,
    pub min_score: f32,
    pub context_turns: usize,
    pub embedding_model: String,
    pub embedding_endpoint: Option<String>,
    pub vector_store_host: Option<String>,
    pub vector_store_namespace: Option<String>,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 5000,
            top_k: 5,
            min_score: 0.7,
            context_turns: 3,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_endpoint: None,
            vector_store_host: None,
            vector_store_namespace: None,
        }
    }
}

impl AugmentationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub timeout_ms: u64,
    pub channel_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            channel_capacity: 64,
        }
    }
}

impl StreamingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub track_usage: bool,
    pub database_file: String,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            track_usage: true,
            database_file: "relaychat.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();

        providers.insert(
            ProviderId::OpenAI.to_string(),
            ProviderConfig {
                priority: 100,
                ..ProviderConfig::default()
            },
        );
        providers.insert(
            ProviderId::Anthropic.to_string(),
            ProviderConfig {
                timeout_seconds: 120,
                priority: 90,
                ..ProviderConfig::default()
            },
        );

        Self {
            providers,
            augmentation: AugmentationConfig::default(),
            streaming: StreamingConfig::default(),
            usage: UsageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads `config.toml` (written with defaults on first run), then applies
    /// `RELAYCHAT__SECTION__KEY` environment overrides.
    pub async fn load(paths: &AppPaths) -> Result<Self> {
        let config_file = paths.config_file();

        if !config_file.exists() {
            info!("Config file not found, creating default configuration");
            Self::default().save(paths).await?;
        }

        info!("Loading configuration from: {:?}", config_file);
        let config = Self::from_sources(&config_file)?;
        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub fn from_sources(config_file: &Path) -> Result<Self> {
        let config: AppConfig = config::Config::builder()
            .add_source(config::File::from(config_file).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub async fn save(&self, paths: &AppPaths) -> Result<()> {
        let config_file = paths.config_file();
        info!("Saving configuration to: {:?}", config_file);

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        fs::create_dir_all(paths.config_dir()).await?;
        fs::write(&config_file, config_content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, provider) in &self.providers {
            name.parse::<ProviderId>()
                .map_err(|_| Error::validation(format!("Unknown provider in configuration: {}", name)))?;
            if provider.timeout_seconds == 0 {
                return Err(Error::validation(format!("Provider {} has a zero timeout", name)));
            }
            if matches!(&provider.default_model, Some(model) if model.trim().is_empty()) {
                return Err(Error::validation(format!("Provider {} has empty default_model", name)));
            }
        }

        let augmentation = &self.augmentation;
        if augmentation.timeout_ms == 0 {
            return Err(Error::validation("Augmentation timeout must be positive"));
        }
        if !(0.0..=1.0).contains(&augmentation.min_score) {
            return Err(Error::validation("Augmentation min_score must be between 0 and 1"));
        }
        if augmentation.top_k == 0 || augmentation.context_turns == 0 {
            return Err(Error::validation("Augmentation top_k and context_turns must be positive"));
        }

        if self.streaming.timeout_ms == 0 {
            return Err(Error::validation("Streaming timeout must be positive"));
        }
        if self.streaming.channel_capacity == 0 {
            return Err(Error::validation("Streaming channel capacity must be positive"));
        }

        Ok(())
    }

    /// Settings for one provider; defaults when the section is missing.
    pub fn provider(&self, provider: ProviderId) -> ProviderConfig {
        self.providers
            .get(provider.as_str())
            .cloned()
            .unwrap_or_default()
    }
}
