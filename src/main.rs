use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gemini_chat::printer::{turn_notice, ReplyPrinter};
use gemini_chat::{
    logging, ui, Config, ConversationStore, FailurePolicy, GeminiConfig, GeminiSession, SendCoordinator, SendMode,
    SendOutcome, SessionSlot,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gemchat")]
#[command(version)]
#[command(about = "Chat with Gemini from your terminal", long_about = None)]
struct Cli {
    /// Model to chat with (overrides the config file)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Wait for complete replies instead of streaming them
    #[arg(long, global = true)]
    atomic: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the interactive chat screen (default)
    Chat,
    /// Send a single message and print the reply
    Ask {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Write the default config file if missing and print its path
    Config,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(model) = cli.model {
        config.model = model;
    }
    if cli.atomic {
        config.send_mode = SendMode::Atomic;
    }

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => {
            let _guard = logging::init(&config)?;
            run_chat(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ask { text } => {
            let _guard = logging::init(&config)?;
            ask(config, text.join(" ")).await
        }
        Commands::Config => {
            let path = config.config_path();
            if !path.exists() {
                config.save()?;
                println!("Wrote default config to {}", path.display());
            } else {
                println!("{}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Start session initialization in the background and build the coordinator around it
fn start(config: &Config) -> (SendCoordinator, tokio::task::JoinHandle<()>) {
    if !config.has_api_key() {
        tracing::warn!("no API key configured; set GEMINI_API_KEY or api_key in the config file");
    }

    let store = Arc::new(ConversationStore::new());
    let slot = SessionSlot::new();
    let init = slot.spawn_init(
        GeminiSession::connect(GeminiConfig::from(config)),
        Duration::from_secs(config.init_timeout_secs),
    );
    let coordinator = SendCoordinator::from_config(config, store, slot);
    tracing::info!(model = %config.model, mode = %coordinator.mode(), "chat started");

    (coordinator, init)
}

async fn run_chat(config: Config) -> Result<()> {
    let (coordinator, _init) = start(&config);
    let app = ui::ChatApp::new(Arc::new(coordinator), config.ui.title.clone(), config.model.clone(), config.ui.show_timestamps);
    ui::run(app).await
}

async fn ask(config: Config, text: String) -> Result<ExitCode> {
    let (coordinator, init) = start(&config);
    // Keep stdout for the reply itself; notices go to stderr
    let coordinator = coordinator.with_failure_policy(FailurePolicy::AppendNotice);
    init.await.context("session initialization task failed")?;

    let store = coordinator.store().clone();
    let first = store.len();
    let mut rx = store.subscribe();
    let mut printer = ReplyPrinter::new(std::io::stdout());

    let send = coordinator.send(text);
    tokio::pin!(send);

    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome?,
            Ok(()) = rx.changed() => {
                let snapshot = rx.borrow_and_update().clone();
                printer.update(&snapshot[first.min(snapshot.len())..])?;
            }
        }
    };

    let turn = store.messages().split_off(first);
    printer.update(&turn)?;
    printer.finish()?;

    match outcome {
        SendOutcome::Completed => Ok(ExitCode::SUCCESS),
        SendOutcome::SessionUnavailable | SendOutcome::Failed => {
            if let Some(notice) = turn_notice(&turn) {
                eprintln!("{}", notice.content);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
