use std::io::Write;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;

use relaychat::app::{logging, AppConfig, AppState};
use relaychat::chat::{ChatRequest, StreamEvent};
use relaychat::models::{ChatMessage, ChatOptions, ProviderId};
use relaychat::platform::AppPaths;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match &cli.root {
        Some(root) => AppPaths::with_root(root),
        None => AppPaths::new()?,
    };
    paths.ensure_dirs_exist().context("failed to create application directories")?;

    let config = AppConfig::load(&paths).await.context("failed to load configuration")?;
    let _log_guard = logging::init_logging(&config.logging, &paths, cli.debug);
    info!("Starting RelayChat {}", env!("CARGO_PKG_VERSION"));

    let state = AppState::new(config, paths).await?;
    let outcome = run_command(cli, &state).await;
    state.shutdown().await;
    outcome
}

async fn run_command(cli: Cli, state: &AppState) -> anyhow::Result<()> {
    match cli.command {
        Commands::Chat {
            message,
            provider,
            model,
            conversation,
            system,
            temperature,
            max_tokens,
            stream,
            fallback,
            fallback_provider,
        } => {
            let mut request = ChatRequest::new(vec![ChatMessage::user(message.join(" "))]).with_options(
                ChatOptions {
                    temperature,
                    max_tokens,
                    system,
                },
            );
            request.provider = provider.map(|p| p.parse::<ProviderId>()).transpose()?;
            request.model = model;
            request.conversation_id = conversation;

            if stream {
                run_stream(state, &cli.user, request).await?;
            } else {
                let service = state.chat_service();
                let reply = if fallback {
                    let fallback_provider = fallback_provider
                        .map(|p| p.parse::<ProviderId>())
                        .transpose()?;
                    service
                        .send_message_with_fallback(&cli.user, request, fallback_provider)
                        .await?
                } else {
                    service.send_message(&cli.user, request).await?
                };

                println!("{}", reply.response.content);
                eprintln!(
                    "[{} / {} | {} in, {} out | {} memories | {}ms{}]",
                    reply.response.provider,
                    reply.response.model,
                    reply.response.usage.input_tokens,
                    reply.response.usage.output_tokens,
                    reply.memories_used,
                    reply.response.duration_ms,
                    if reply.fallback_used { " | fallback" } else { "" }
                );
            }
        }

        Commands::Providers => {
            let providers = state.registry().get_available_providers();
            if providers.is_empty() {
                println!("No providers configured. Set ANTHROPIC_API_KEY / OPENAI_API_KEY or use `relaychat api-key`.");
            }
            for descriptor in providers {
                println!(
                    "{} ({}), priority {}, default model {}",
                    descriptor.name, descriptor.id, descriptor.priority, descriptor.default_model
                );
                for (model, pricing) in &descriptor.pricing {
                    println!(
                        "  {:<32} ${} in / ${} out per 1M tokens",
                        model, pricing.input_per_1m, pricing.output_per_1m
                    );
                }
            }
        }

        Commands::ApiKey {
            provider,
            set,
            remove,
        } => {
            let provider: ProviderId = provider.parse()?;
            match (set, remove) {
                (Some(_), true) => bail!("--set and --remove cannot be combined"),
                (Some(key), false) => {
                    state.set_api_key(provider, &key).await?;
                    println!("API key stored for {}", provider);
                }
                (None, true) => {
                    state.remove_api_key(provider).await?;
                    println!("API key removed for {}", provider);
                }
                (None, false) => {
                    let status = state.get_provider_status(provider).await;
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
            }
        }

        Commands::Usage {
            conversation,
            limit,
        } => {
            let repo = state.get_usage_repo();
            match conversation {
                Some(conversation_id) => match repo.conversation_totals(&conversation_id).await? {
                    Some(totals) => println!(
                        "{}: {} requests, {} tokens, ${}",
                        totals.conversation_id, totals.request_count, totals.total_tokens, totals.total_cost
                    ),
                    None => println!("No usage recorded for conversation {}", conversation_id),
                },
                None => {
                    for record in repo.usage_for_user(&cli.user, limit).await? {
                        println!(
                            "{} {:<10} {:<28} {:>7} tok ${}",
                            record.timestamp.format("%Y-%m-%d %H:%M"),
                            record.provider,
                            record.model,
                            record.total_tokens(),
                            record.cost
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

async fn run_stream(state: &AppState, user_id: &str, request: ChatRequest) -> anyhow::Result<()> {
    let mut events = state.chat_service().stream_message(user_id, request);
    let mut stdout = std::io::stdout();
    let mut failure = None;

    // Drain to the end: the channel closes only after usage has been queued.
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Chunk { content } => {
                write!(stdout, "{}", content)?;
                stdout.flush()?;
            }
            StreamEvent::Done {
                usage,
                provider,
                model,
                memories_used,
                finish_reason,
            } => {
                writeln!(stdout)?;
                eprintln!(
                    "[{} / {} | {} in, {} out | {} memories | {:?}]",
                    provider, model, usage.input_tokens, usage.output_tokens, memories_used, finish_reason
                );
            }
            StreamEvent::Error { error } => {
                writeln!(stdout)?;
                failure = Some(error);
            }
        }
    }

    match failure {
        Some(error) => bail!(error),
        None => Ok(()),
    }
}
