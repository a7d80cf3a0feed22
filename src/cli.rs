use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "relaychat")]
#[command(about = "Multi-provider AI chat with memory augmentation and usage tracking")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Keep config and data under this directory instead of the platform defaults
    #[arg(short, long)]
    pub root: Option<String>,

    /// User the requests and usage are attributed to
    #[arg(short, long, default_value = "local")]
    pub user: String,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send one message and print the reply
    Chat {
        /// Message text
        #[arg(required = true)]
        message: Vec<String>,

        /// Use specific model provider (anthropic, openai)
        #[arg(short, long)]
        provider: Option<String>,

        /// Use specific model
        #[arg(short, long)]
        model: Option<String>,

        /// Attribute usage to this conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// System instructions
        #[arg(long)]
        system: Option<String>,

        /// Sampling temperature (0-2)
        #[arg(long)]
        temperature: Option<f32>,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Print tokens as they arrive
        #[arg(short, long, conflicts_with = "fallback")]
        stream: bool,

        /// Retry once on another provider if the first one fails
        #[arg(short, long)]
        fallback: bool,

        /// Provider to fall back to (defaults to the next configured one)
        #[arg(long, requires = "fallback")]
        fallback_provider: Option<String>,
    },

    /// List configured providers, their models and pricing
    Providers,

    /// Manage API keys
    ApiKey {
        /// Provider name (anthropic, openai)
        provider: String,

        /// Set API key for provider
        #[arg(short, long)]
        set: Option<String>,

        /// Remove API key for provider
        #[arg(short, long)]
        remove: bool,
    },

    /// Show recorded usage
    Usage {
        /// Show totals for one conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// Number of recent records to show
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
}
