use std::collections::HashMap;

use async_trait::async_trait;
use keyring::Entry;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::ProviderId;

const KEYRING_SERVICE: &str = "dev.relaychat.api_keys";

/// Source of vendor API keys. `None` means the vendor is not configured.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, provider: ProviderId) -> Option<String>;
}

/// API keys kept in the OS keychain.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub async fn store_api_key(&self, provider: ProviderId, key: &str) -> Result<()> {
        debug!("Storing API key for provider: {}", provider);
        let entry = Entry::new(&self.service, provider.as_str())?;
        entry.set_password(key).map_err(|e| {
            warn!("Failed to store API key for provider: {}", provider);
            Error::SecureStorage(e)
        })
    }

    pub async fn retrieve_api_key(&self, provider: ProviderId) -> Result<Option<String>> {
        let entry = Entry::new(&self.service, provider.as_str())?;
        match entry.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::SecureStorage(e)),
        }
    }

    pub async fn delete_api_key(&self, provider: ProviderId) -> Result<()> {
        debug!("Deleting API key for provider: {}", provider);
        let entry = Entry::new(&self.service, provider.as_str())?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Error::SecureStorage(e)),
        }
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for KeyringCredentialStore {
    async fn get(&self, provider: ProviderId) -> Option<String> {
        match self.retrieve_api_key(provider).await {
            Ok(key) => key,
            Err(e) => {
                warn!("Keychain lookup failed for provider {}: {}", provider, e);
                None
            }
        }
    }
}

/// `ANTHROPIC_API_KEY` / `OPENAI_API_KEY` style environment variables.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialStore;

impl EnvCredentialStore {
    pub fn variable_name(provider: ProviderId) -> String {
        format!("{}_API_KEY", provider.as_str().to_ascii_uppercase())
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn get(&self, provider: ProviderId) -> Option<String> {
        std::env::var(Self::variable_name(provider))
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

/// Fixed keys, for embedding hosts that resolve credentials themselves.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialStore {
    keys: HashMap<ProviderId, String>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, provider: ProviderId, key: impl Into<String>) -> Self {
        self.keys.insert(provider, key.into());
        self
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn get(&self, provider: ProviderId) -> Option<String> {
        self.keys.get(&provider).cloned()
    }
}

/// Asks each store in turn; the first key found wins.
pub struct ChainedCredentialStore {
    stores: Vec<Box<dyn CredentialStore>>,
}

impl ChainedCredentialStore {
    pub fn new(stores: Vec<Box<dyn CredentialStore>>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl CredentialStore for ChainedCredentialStore {
    async fn get(&self, provider: ProviderId) -> Option<String> {
        for store in &self.stores {
            if let Some(key) = store.get(provider).await {
                return Some(key);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_store() {
        let store = StaticCredentialStore::new().with_key(ProviderId::OpenAI, "sk-test");
        assert_eq!(store.get(ProviderId::OpenAI).await.as_deref(), Some("sk-test"));
        assert_eq!(store.get(ProviderId::Anthropic).await, None);
    }

    #[tokio::test]
    async fn test_chain_prefers_first_store() {
        let chain = ChainedCredentialStore::new(vec![
            Box::new(StaticCredentialStore::new().with_key(ProviderId::OpenAI, "first")),
            Box::new(
                StaticCredentialStore::new()
                    .with_key(ProviderId::OpenAI, "second")
                    .with_key(ProviderId::Anthropic, "ant"),
            ),
        ]);

        assert_eq!(chain.get(ProviderId::OpenAI).await.as_deref(), Some("first"));
        assert_eq!(chain.get(ProviderId::Anthropic).await.as_deref(), Some("ant"));
    }

    #[test]
    fn test_env_variable_names() {
        assert_eq!(EnvCredentialStore::variable_name(ProviderId::Anthropic), "ANTHROPIC_API_KEY");
        assert_eq!(EnvCredentialStore::variable_name(ProviderId::OpenAI), "OPENAI_API_KEY");
    }
}
