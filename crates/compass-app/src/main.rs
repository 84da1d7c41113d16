//! Compass application binary - composition root.
//!
//! `compass serve` (the default):
//! 1. Load configuration from TOML and apply CLI/env overrides
//! 2. Install the prompt library once for the whole process
//! 3. Open SQLite storage and start the background refresh worker
//! 4. Build the chat pipeline over the configured model backend
//! 5. Start the axum API server until Ctrl-C
//!
//! `compass chat` is a terminal client for a running server.

mod cli;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use compass_api::auth::load_or_generate_token;
use compass_api::{start_server, AppState, TokenTable};
use compass_chat::{backend_from_config, prompts, ChatPipeline, ModelBackend};
use compass_client::{ChatSession, HttpTransport, SessionUpdate};
use compass_core::config::CompassConfig;
use compass_core::types::UserId;
use compass_insight::{AnalysisRunner, DeadLetterLog, RefreshQueue, RefreshWorker, SynthesisCache};
use compass_storage::Database;

use cli::{CliArgs, Command};

/// User that the generated local token authenticates as.
const LOCAL_USER: &str = "local";
const TOKEN_FILE: &str = "api_token";

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    match data_dir.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(rest)
        }
        None => PathBuf::from(data_dir),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn serve(config: CompassConfig) -> AppResult<()> {
    let data_dir = resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let library = prompts::init(config.prompts.library_path.as_deref().map(Path::new));
    info!(domains = library.domains.len(), "Prompt library ready");

    let db_path = data_dir.join("compass.db");
    let db = Arc::new(Database::new(&db_path)?);
    info!(path = %db_path.display(), "SQLite database opened");

    // Background analyses, fully decoupled from requests.
    let (queue, receiver) = RefreshQueue::channel();
    let dead_letters = DeadLetterLog::new();
    let worker = RefreshWorker::new(
        receiver,
        AnalysisRunner::new(Arc::clone(&db)),
        dead_letters.clone(),
    );
    let worker_shutdown = worker.shutdown_handle();
    let worker_task = tokio::spawn(worker.run());

    let cache = Arc::new(SynthesisCache::new(
        Arc::clone(&db),
        &config.synthesis,
        queue.clone(),
    ));
    let backend: Arc<dyn ModelBackend> = Arc::from(backend_from_config(&config.model)?);
    info!(backend = backend.name(), model = %config.model.model, "Model backend ready");

    let pipeline = ChatPipeline::new(db, cache, queue.clone(), backend, &config);

    let mut tokens = TokenTable::from_config(&config.auth);
    if tokens.is_empty() {
        let token = load_or_generate_token(&data_dir.join(TOKEN_FILE));
        tokens.insert(token, UserId::new(LOCAL_USER));
        info!(user_id = LOCAL_USER, "No auth tokens configured, using the local API token");
    } else {
        info!(tokens = tokens.len(), "Auth tokens loaded");
    }

    let state = AppState::new(
        config.clone(),
        pipeline,
        Arc::new(tokens),
        queue,
        dead_letters,
    );

    let served = start_server(&config, state, shutdown_signal()).await;

    worker_shutdown.shutdown();
    if let Err(e) = worker_task.await {
        warn!(error = %e, "Refresh worker task failed");
    }

    if let Err(e) = served {
        error!(port = config.general.port, error = %e, "API server failed, is another instance running?");
        return Err(e.into());
    }
    Ok(())
}

/// Print one stream's updates to stdout.
async fn render(mut updates: mpsc::UnboundedReceiver<SessionUpdate>) {
    let mut stdout = std::io::stdout();
    while let Some(update) = updates.recv().await {
        match update {
            SessionUpdate::Text(text) => {
                let _ = write!(stdout, "{}", text);
                let _ = stdout.flush();
            }
            SessionUpdate::Completed { .. } => {
                let _ = writeln!(stdout);
                break;
            }
            SessionUpdate::Interrupted {
                message, retryable, ..
            } => {
                let _ = writeln!(stdout, "\n{}", message);
                if retryable {
                    let _ = writeln!(stdout, "(type /retry to try again)");
                }
                break;
            }
            SessionUpdate::State(_) | SessionUpdate::Signal(_) => {}
        }
    }
}

async fn chat(
    config: CompassConfig,
    token: Option<String>,
    conversation: Option<Uuid>,
) -> AppResult<()> {
    let token = match token {
        Some(token) => token,
        None => {
            let path = resolve_data_dir(&config.general.data_dir).join(TOKEN_FILE);
            std::fs::read_to_string(&path)
                .map(|t| t.trim().to_string())
                .map_err(|e| format!("No --token given and {} is unreadable: {}", path.display(), e))?
        }
    };

    let transport = Arc::new(HttpTransport::new(&config.client, token)?);
    let mut session = match conversation {
        Some(id) => ChatSession::resume(transport, id, &config.client).await?,
        None => ChatSession::new(transport, Uuid::new_v4(), &config.client),
    };

    println!("Conversation {}", session.conversation_id());
    for turn in session.history() {
        println!("{}: {}", turn.role.as_str(), turn.text);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let updates = match line {
            "" => continue,
            "/quit" => break,
            "/retry" => session.retry(),
            message => session.send(message),
        };
        match updates {
            Ok(updates) => render(updates).await,
            Err(e) => println!("{}", e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let mut config = CompassConfig::load_or_default(&config_file);
    if let Some(data_dir) = args.resolve_data_dir() {
        config.general.data_dir = data_dir;
    }
    if let Some(level) = args.resolve_log_level() {
        config.general.log_level = level;
    }
    config.general.port = args.resolve_port(config.general.port);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    info!("Starting Compass v{}", env!("CARGO_PKG_VERSION"));
    info!(path = %config_file.display(), port = config.general.port, "Configuration resolved");

    match args.command() {
        Command::Serve => serve(config).await,
        Command::Chat {
            token,
            conversation,
        } => chat(config, token, conversation).await,
    }
}
