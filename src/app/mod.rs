pub mod config;
pub mod logging;
pub mod state;

pub use config::{AppConfig, AugmentationConfig, LoggingConfig, ProviderConfig, StreamingConfig, UsageConfig};
pub use state::{AppState, ProviderStatus};
