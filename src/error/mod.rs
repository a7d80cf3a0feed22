use thiserror::Error;

use crate::models::ProviderId;

pub type Result<T> = std::result::Result<T, Error>;

/// Uniform wrapper for anything that went wrong talking to a vendor.
///
/// `message` is already sanitized: adapters log raw response bodies and only
/// keep the status line here.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{provider} request failed: {message}")]
pub struct ProviderError {
    pub provider: ProviderId,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: ProviderId, message: impl Into<String>) -> Self {
        Self {
            provider,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Provider not configured: {provider}")]
    ProviderNotConfigured { provider: ProviderId },

    #[error(transparent)]
    Upstream(#[from] ProviderError),

    #[error("Memory retrieval timed out after {timeout_ms}ms")]
    AugmentationTimeout { timeout_ms: u64 },

    #[error("Memory retrieval unavailable: {0}")]
    AugmentationUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Secure storage error: {0}")]
    SecureStorage(#[from] keyring::Error),

    #[error("Platform error: {0}")]
    Platform(String),
}

impl Error {
    pub fn upstream(provider: ProviderId, msg: impl Into<String>) -> Self {
        Error::Upstream(ProviderError::new(provider, msg))
    }

    pub fn augmentation_unavailable(msg: impl Into<String>) -> Self {
        Error::AugmentationUnavailable(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Error::Persistence(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    /// Whether the error kind is meant for callers; everything else is
    /// reported generically.
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            Error::ProviderNotConfigured { .. } | Error::Upstream(_) | Error::Validation(_)
        )
    }

    /// Message safe to put on the wire: no bodies, paths or driver detail.
    pub fn public_message(&self) -> String {
        match self {
            Error::ProviderNotConfigured { provider } => {
                format!("Provider {} is not configured", provider)
            }
            Error::Upstream(err) => format!("The {} provider failed to respond", err.provider),
            Error::Validation(msg) => format!("Invalid request: {}", msg),
            _ => "Internal error while generating a response".to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Error::Validation(errors.to_string())
    }
}
