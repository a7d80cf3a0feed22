use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::config::{AppConfig, ProviderConfig};
use crate::error::{Error, Result};
use crate::models::anthropic::AnthropicAdapter;
use crate::models::openai::OpenAIAdapter;
use crate::models::pricing::{self, ModelPricing};
use crate::models::provider::{ProviderAdapter, ProviderId};
use crate::platform::CredentialStore;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub name: String,
    pub available_models: Vec<String>,
    pub default_model: String,
    pub pricing: BTreeMap<String, ModelPricing>,
    pub priority: i32,
}

impl ProviderDescriptor {
    fn for_adapter(adapter: &dyn ProviderAdapter, priority: i32, default_model: Option<String>) -> Self {
        let id = adapter.id();
        let available_models = adapter.list_models();
        let pricing = available_models
            .iter()
            .filter_map(|model| pricing::lookup(id, model).map(|p| (model.clone(), p)))
            .collect();

        Self {
            id,
            name: id.display_name().to_string(),
            available_models,
            default_model: default_model.unwrap_or_else(|| pricing::default_model(id).to_string()),
            pricing,
            priority,
        }
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.available_models.iter().any(|m| m == model)
    }
}

struct RegisteredProvider {
    descriptor: ProviderDescriptor,
    adapter: Arc<dyn ProviderAdapter>,
}

/// Configured vendors, populated once at startup and read-only afterwards.
///
/// Only providers with credentials are ever registered, so lookups here never
/// need to touch the network.
pub struct ProviderRegistry {
    providers: Vec<RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Builds adapters for every enabled provider whose credentials resolve.
    pub async fn from_config(config: &AppConfig, credentials: &dyn CredentialStore) -> Result<Self> {
        let mut builder = Self::builder();

        for id in ProviderId::ALL {
            let provider_config = config.provider(id);
            if !provider_config.enabled {
                debug!("Provider {} disabled in configuration", id);
                continue;
            }

            let api_key = match credentials.get(id).await {
                Some(key) if !key.trim().is_empty() => key,
                _ => {
                    debug!("No credentials for provider {}, leaving it unconfigured", id);
                    continue;
                }
            };

            let adapter = build_adapter(id, api_key, &provider_config)?;
            builder = builder.register_with(
                adapter,
                provider_config.priority,
                provider_config.default_model.clone(),
            );
        }

        let registry = builder.build();
        info!(
            "Initialized {} model providers: {:?}",
            registry.providers.len(),
            registry.providers.iter().map(|p| p.descriptor.id).collect::<Vec<_>>()
        );
        Ok(registry)
    }

    /// Providers with credentials, highest priority first.
    pub fn get_available_providers(&self) -> Vec<&ProviderDescriptor> {
        self.providers.iter().map(|p| &p.descriptor).collect()
    }

    pub fn is_configured(&self, provider: ProviderId) -> bool {
        self.find(provider).is_some()
    }

    pub fn descriptor(&self, provider: ProviderId) -> Option<&ProviderDescriptor> {
        self.find(provider).map(|p| &p.descriptor)
    }

    pub fn get_default_model(&self, provider: ProviderId) -> String {
        match self.find(provider) {
            Some(registered) => registered.descriptor.default_model.clone(),
            None => pricing::default_model(provider).to_string(),
        }
    }

    /// The highest-priority configured provider, used when a request names none.
    pub fn default_provider(&self) -> Option<ProviderId> {
        self.providers.first().map(|p| p.descriptor.id)
    }

    pub fn resolve_adapter(&self, provider: ProviderId) -> Result<Arc<dyn ProviderAdapter>> {
        self.find(provider)
            .map(|p| Arc::clone(&p.adapter))
            .ok_or(Error::ProviderNotConfigured { provider })
    }

    pub fn next_available(&self, excluding: ProviderId) -> Option<ProviderId> {
        self.providers
            .iter()
            .map(|p| p.descriptor.id)
            .find(|id| *id != excluding)
    }

    pub fn calculate_cost(
        &self,
        provider: ProviderId,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Decimal {
        match self.find(provider) {
            Some(registered) => registered
                .adapter
                .calculate_cost(model, input_tokens, output_tokens),
            None => pricing::calculate_cost(provider, model, input_tokens, output_tokens),
        }
    }

    fn find(&self, provider: ProviderId) -> Option<&RegisteredProvider> {
        self.providers.iter().find(|p| p.descriptor.id == provider)
    }
}

fn build_adapter(
    id: ProviderId,
    api_key: String,
    config: &ProviderConfig,
) -> Result<Arc<dyn ProviderAdapter>> {
    let timeout = Duration::from_secs(config.timeout_seconds);
    let adapter: Arc<dyn ProviderAdapter> = match (id, config.api_endpoint.clone()) {
        (ProviderId::Anthropic, Some(endpoint)) => {
            Arc::new(AnthropicAdapter::with_base_url(api_key, endpoint, timeout)?)
        }
        (ProviderId::Anthropic, None) => Arc::new(AnthropicAdapter::new(api_key)?),
        (ProviderId::OpenAI, Some(endpoint)) => {
            Arc::new(OpenAIAdapter::with_base_url(api_key, endpoint, timeout)?)
        }
        (ProviderId::OpenAI, None) => Arc::new(OpenAIAdapter::new(api_key)?),
    };
    Ok(adapter)
}

#[derive(Default)]
pub struct ProviderRegistryBuilder {
    providers: Vec<RegisteredProvider>,
}

impl ProviderRegistryBuilder {
    pub fn register(self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        let priority = -(self.providers.len() as i32);
        self.register_with(adapter, priority, None)
    }

    pub fn register_with(
        mut self,
        adapter: Arc<dyn ProviderAdapter>,
        priority: i32,
        default_model: Option<String>,
    ) -> Self {
        let descriptor = ProviderDescriptor::for_adapter(adapter.as_ref(), priority, default_model);
        if let Some(existing) = self.providers.iter_mut().find(|p| p.descriptor.id == descriptor.id) {
            warn!("Provider {} registered twice, replacing previous adapter", descriptor.id);
            existing.descriptor = descriptor;
            existing.adapter = adapter;
        } else {
            self.providers.push(RegisteredProvider { descriptor, adapter });
        }
        self
    }

    pub fn build(mut self) -> ProviderRegistry {
        // Stable sort keeps registration order among equal priorities.
        self.providers
            .sort_by(|a, b| b.descriptor.priority.cmp(&a.descriptor.priority));
        ProviderRegistry {
            providers: self.providers,
        }
    }
}
