use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chatbridge_core::{
    client::ChatCompletionClient,
    config::Config,
    fetch::NativeFetch,
    http_client::HttpClient,
    model::{ChatCompletionRequest, ConversationMessage, MessageStatus, TokenDelta},
    session::{ChatSession, PromptOutcome},
    telemetry::{TracingTelemetrySink, set_telemetry_sink},
    tokenizer::TokenizerRegistry,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Streaming chat completion client", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream one prompt; Ctrl-C aborts the turn
    Chat {
        #[arg(long)]
        model: Option<String>,
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
    /// Interactive session; history is kept, `/reset` clears it, `/quit` exits
    Repl {
        #[arg(long)]
        model: Option<String>,
    },
    /// Print the token count and ids for a text
    Tokens {
        #[arg(long)]
        model: Option<String>,
        #[arg(short, long)]
        text: String,
    },
    /// Send one non-streaming completion request
    Complete {
        #[arg(long)]
        model: Option<String>,
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    set_telemetry_sink(Arc::new(TracingTelemetrySink));
}

fn print_delta(_: &str, delta: TokenDelta) {
    match delta.message_type {
        MessageStatus::Success => {
            print!("{}", delta.content);
            io::stdout().flush().ok();
        }
        MessageStatus::Error => eprint!("{}", delta.content),
    }
}

fn open_session(cfg: &Config, model: String) -> anyhow::Result<ChatSession> {
    let provider = cfg.provider.resolve()?;
    let transport = Arc::new(HttpClient::from_cfg(&cfg.http)?);
    let registry = TokenizerRegistry::with_rules(&cfg.tokenizers)?;
    let session = ChatSession::with_tokenizers(
        model,
        provider,
        Arc::new(NativeFetch::streaming(transport)),
        &registry,
    )?;
    Ok(session)
}

fn report(outcome: &PromptOutcome) {
    println!();
    match outcome {
        PromptOutcome::Completed { stop_reason, .. } => {
            if let Some(reason) = stop_reason {
                eprintln!("[stop: {reason:?}]");
            }
        }
        PromptOutcome::Aborted { .. } => eprintln!("[aborted]"),
        PromptOutcome::Failed { .. } => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    tracing::debug!(
        path = ?cli.config,
        model = %cfg.model,
        api_url = %cfg.provider.api_url,
        "configuration loaded"
    );

    match cli.command {
        Commands::Chat { model, message } => {
            let session = open_session(&cfg, model.unwrap_or_else(|| cfg.model.clone()))?;
            let abort = session.abort_handle();
            let watcher = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    abort.abort();
                }
            });
            let outcome = session.run_prompt(&message, &print_delta, false).await?;
            watcher.abort();
            report(&outcome);
            if matches!(outcome, PromptOutcome::Failed { .. }) {
                std::process::exit(1);
            }
        }
        Commands::Repl { model } => {
            let session = open_session(&cfg, model.unwrap_or_else(|| cfg.model.clone()))?;
            let abort = session.abort_handle();
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    abort.abort();
                }
            });

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                eprint!("> ");
                io::stderr().flush().ok();
                let Some(line) = lines.next_line().await? else {
                    break;
                };
                match line.trim() {
                    "" => continue,
                    "/quit" | "/exit" => break,
                    "/reset" => {
                        session.clear_history();
                        eprintln!("[history cleared]");
                    }
                    prompt => {
                        let outcome = session.run_prompt(prompt, &print_delta, false).await?;
                        report(&outcome);
                    }
                }
            }
        }
        Commands::Tokens { model, text } => {
            let model = model.unwrap_or_else(|| cfg.model.clone());
            let tokenizer = TokenizerRegistry::with_rules(&cfg.tokenizers)?.tokenizer_for(&model)?;
            let ids = tokenizer.encode(&text);
            println!("{} tokens ({:?})", ids.len(), tokenizer.kind());
            println!("{ids:?}");
        }
        Commands::Complete { model, message } => {
            let provider = cfg.provider.resolve()?;
            let transport = Arc::new(HttpClient::from_cfg(&cfg.http)?);
            let client =
                ChatCompletionClient::new(Arc::new(NativeFetch::buffered(transport)), &provider);
            let req = ChatCompletionRequest::new(
                model.unwrap_or_else(|| cfg.model.clone()),
                vec![ConversationMessage::user(message).to_wire()],
            );
            let resp = client.create(req).await?;
            println!("{}", resp.text());
            if let Some(reason) = resp.stop_reason() {
                eprintln!("[stop: {reason:?}]");
            }
            if let Some(usage) = resp.usage {
                eprintln!(
                    "[usage: prompt={} completion={}]",
                    usage.prompt_tokens, usage.completion_tokens
                );
            }
        }
    }

    Ok(())
}
