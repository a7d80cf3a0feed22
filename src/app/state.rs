use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::config::AppConfig;
use crate::chat::{ChatOrchestrator, ChatService, ChatServiceConfig};
use crate::error::Result;
use crate::memory::{
    AugmentationSettings, ContextAugmenter, MemoryServices, OpenAiEmbeddingClient, PineconeVectorStore,
};
use crate::models::{ProviderId, ProviderRegistry};
use crate::platform::{
    AppPaths, ChainedCredentialStore, CredentialStore, EnvCredentialStore, KeyringCredentialStore,
};
use crate::storage::{Database, InMemoryUsageSink, MemoryRepository, PersistenceSink, UsageRepository, UsageTracker};

const VECTOR_STORE_KEY_VAR: &str = "PINECONE_API_KEY";
const USAGE_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub provider: ProviderId,
    pub enabled: bool,
    pub has_credentials: bool,
    pub configured: bool,
}

/// Everything a running process needs, wired once at startup.
pub struct AppState {
    config: Arc<RwLock<AppConfig>>,
    paths: AppPaths,
    keyring: KeyringCredentialStore,
    credentials: ChainedCredentialStore,
    database: Database,
    usage_repo: Arc<UsageRepository>,
    registry: Arc<ProviderRegistry>,
    chat_service: ChatService,
}

impl AppState {
    pub async fn new(config: AppConfig, paths: AppPaths) -> Result<Self> {
        info!("Initializing application state");

        let credentials = ChainedCredentialStore::new(vec![
            Box::new(EnvCredentialStore),
            Box::new(KeyringCredentialStore::new()),
        ]);

        let database = Database::open(&paths, &config.usage.database_file).await?;
        let pool = database.get_pool();
        let usage_repo = Arc::new(UsageRepository::new(pool.clone()));

        let registry = Arc::new(ProviderRegistry::from_config(&config, &credentials).await?);

        let sink: Arc<dyn PersistenceSink> = if config.usage.track_usage {
            usage_repo.clone()
        } else {
            debug!("Usage persistence disabled, keeping usage in memory");
            Arc::new(InMemoryUsageSink::new())
        };
        let tracker = UsageTracker::new(registry.clone(), sink);

        let services = build_memory_services(&config, &credentials, &database).await;
        let augmenter = Arc::new(ContextAugmenter::new(
            services,
            AugmentationSettings::from(&config.augmentation),
        ));
        let orchestrator = Arc::new(ChatOrchestrator::with_stream_timeout(
            registry.clone(),
            config.streaming.timeout(),
        ));

        let chat_service = ChatService::new(
            augmenter,
            orchestrator,
            tracker,
            ChatServiceConfig {
                augment: config.augmentation.enabled,
                track_usage: true,
                channel_capacity: config.streaming.channel_capacity,
            },
        );

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            paths,
            keyring: KeyringCredentialStore::new(),
            credentials,
            database,
            usage_repo,
            registry,
            chat_service,
        })
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub async fn update_config<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        debug!("Updating application configuration");

        let config = {
            let mut config = self.config.write();
            updater(&mut config);
            config.validate()?;
            config.clone()
        };
        config.save(&self.paths).await?;

        info!("Configuration updated and saved");
        Ok(())
    }

    /// Stores a key in the OS keychain and enables the provider. Takes effect
    /// for the registry on the next start.
    pub async fn set_api_key(&self, provider: ProviderId, api_key: &str) -> Result<()> {
        self.keyring.store_api_key(provider, api_key).await?;
        self.update_config(|config| {
            config.providers.entry(provider.to_string()).or_default().enabled = true;
        })
        .await?;
        info!("Enabled model provider: {}", provider);
        Ok(())
    }

    pub async fn remove_api_key(&self, provider: ProviderId) -> Result<()> {
        self.keyring.delete_api_key(provider).await?;
        self.update_config(|config| {
            if let Some(provider_config) = config.providers.get_mut(provider.as_str()) {
                provider_config.enabled = false;
            }
        })
        .await?;
        info!("Disabled model provider: {}", provider);
        Ok(())
    }

    pub async fn get_provider_status(&self, provider: ProviderId) -> ProviderStatus {
        let enabled = self.config.read().provider(provider).enabled;
        ProviderStatus {
            provider,
            enabled,
            has_credentials: self.credentials.get(provider).await.is_some(),
            configured: self.registry.is_configured(provider),
        }
    }

    pub fn get_paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn get_database(&self) -> &Database {
        &self.database
    }

    pub fn get_usage_repo(&self) -> &UsageRepository {
        &self.usage_repo
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn chat_service(&self) -> &ChatService {
        &self.chat_service
    }

    /// Lets background usage writes land, then closes the database.
    pub async fn shutdown(&self) {
        if !self.chat_service.shutdown(USAGE_FLUSH_TIMEOUT).await {
            warn!("Shutting down with usage records still pending");
        }
        self.database.close().await;
    }
}

/// Memory retrieval needs an embedding key, a vector index host and its key;
/// any missing piece leaves augmentation unconfigured.
async fn build_memory_services(
    config: &AppConfig,
    credentials: &dyn CredentialStore,
    database: &Database,
) -> Option<MemoryServices> {
    let augmentation = &config.augmentation;
    if !augmentation.enabled {
        debug!("Memory augmentation disabled in configuration");
        return None;
    }

    let host = augmentation.vector_store_host.clone()?;
    let Some(embedding_key) = credentials.get(ProviderId::OpenAI).await else {
        debug!("No embedding credentials, memory augmentation unconfigured");
        return None;
    };
    let Some(index_key) = std::env::var(VECTOR_STORE_KEY_VAR).ok().filter(|k| !k.is_empty()) else {
        debug!("{} not set, memory augmentation unconfigured", VECTOR_STORE_KEY_VAR);
        return None;
    };

    let embedder = OpenAiEmbeddingClient::new(
        embedding_key,
        augmentation.embedding_model.clone(),
        augmentation.embedding_endpoint.clone(),
    );
    let vector_store = PineconeVectorStore::new(host, index_key, augmentation.vector_store_namespace.clone());

    match (embedder, vector_store) {
        (Ok(embedder), Ok(vector_store)) => {
            info!("Memory augmentation configured");
            Some(MemoryServices {
                embedder: Arc::new(embedder),
                vector_store: Arc::new(vector_store),
                memory_store: Arc::new(MemoryRepository::new(database.get_pool())),
            })
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to set up memory services: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::StaticCredentialStore;

    #[tokio::test]
    async fn test_memory_services_need_vector_host() {
        let db = Database::in_memory().await.unwrap();
        let credentials = StaticCredentialStore::new().with_key(ProviderId::OpenAI, "sk-test");

        let config = AppConfig::default();
        assert!(build_memory_services(&config, &credentials, &db).await.is_none());

        let mut disabled = AppConfig::default();
        disabled.augmentation.enabled = false;
        disabled.augmentation.vector_store_host = Some("https://index.example".to_string());
        assert!(build_memory_services(&disabled, &credentials, &db).await.is_none());
    }
}
