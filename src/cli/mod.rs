mod commands;
pub mod error;
pub mod utils;


use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::api::{ApiClient, HttpSyncServer};
use crate::cli::commands::run::RunOptions;
use crate::cli::error::{CliError, CliResult};
use crate::config::Config;
use crate::db::{Database, SqliteDatabase};
use crate::sync::{ConflictStrategy, PendingChangeQueue};

#[derive(Parser)]
#[command(name = "msync")]
#[command(author, version, about = "Offline-first sync for maintenance records", long_about = None)]
pub struct Cli {
    /// Override the server URL (default: MSYNC_SERVER_URL env or http://localhost:3737)
    #[arg(long, global = true)]
    pub server_url: Option<String>,

    /// Queue database path (default: MSYNC_DB env or ~/.local/share/maintsync/queue.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync engine until interrupted
    Run {
        /// Conflict strategy: server_wins, client_wins, newest_wins or manual
        #[arg(long)]
        strategy: Option<String>,
        /// Realtime endpoint (default: derived from the server URL)
        #[arg(long)]
        ws_url: Option<String>,
        /// Do not open the realtime channel
        #[arg(long)]
        no_realtime: bool,
        /// Exit after the first finished sync
        #[arg(long)]
        once: bool,
        /// Seconds `--once` waits for a sync to finish
        #[arg(long, default_value = "60")]
        timeout: u64,
    },
    /// Show local queue and server status
    Status {
        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Pending change queue commands
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Show recent sync sessions
    History {
        /// Number of sessions to show
        #[arg(long, default_value = "10")]
        limit: usize,
        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Ask the server to reconcile now
    Trigger,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued changes
    List {
        /// Filter by status (pending, in_flight, failed, needs_attention)
        #[arg(long)]
        status: Option<String>,
        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Queue a change
    Add {
        /// create, update or delete
        method: String,
        /// Resource path, e.g. /api/parts/12
        resource: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// Requeue a failed or held change
    Retry { id: String },
    /// Drop a change without sending it
    Discard { id: String },
    /// Settle a held conflict
    Resolve {
        id: String,
        /// Which side to keep: local or server
        #[arg(long)]
        keep: String,
    },
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::new();
        if let Some(url) = &self.server_url {
            config = config.with_server_url(url.clone());
        }
        if let Some(db) = &self.db {
            config = config.with_db_path(db.clone());
        }
        config
    }
}

async fn open_db(config: &Config) -> CliResult<SqliteDatabase> {
    match config.db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)?,
        _ => {}
    }
    let db = SqliteDatabase::open(&config.db_path).await?;
    db.migrate().await?;
    Ok(db)
}

fn http_server(config: &Config) -> CliResult<HttpSyncServer> {
    let client = ApiClient::new(config.server_url.clone(), config.flush.request_timeout)?;
    Ok(HttpSyncServer::new(client))
}

pub async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let config = cli.config();

    let output = match cli.command {
        Some(Commands::Run {
            strategy,
            ws_url,
            no_realtime,
            once,
            timeout,
        }) => {
            let mut config = config;
            if let Some(strategy) = strategy {
                let strategy: ConflictStrategy = strategy
                    .parse()
                    .map_err(|e: String| CliError::invalid("strategy", e))?;
                config = config.with_conflict_strategy(strategy);
            }
            if let Some(url) = ws_url {
                config = config.with_ws_url(url);
            }
            let options = RunOptions {
                realtime: !no_realtime,
                once,
                timeout: Duration::from_secs(timeout),
            };
            commands::run::run(config, options).await?
        }
        Some(Commands::Status { format }) => {
            let db = Arc::new(open_db(&config).await?);
            let queue = PendingChangeQueue::new(db.clone());
            let server = http_server(&config)?;
            commands::status::show(db.as_ref(), &queue, &server, &format).await?
        }
        Some(Commands::Queue { command }) => {
            let queue = PendingChangeQueue::new(Arc::new(open_db(&config).await?));
            match command {
                QueueCommands::List { status, format } => {
                    commands::queue::list(&queue, status.as_deref(), &format).await?
                }
                QueueCommands::Add {
                    method,
                    resource,
                    payload,
                } => commands::queue::add(&queue, &method, &resource, payload.as_deref()).await?,
                QueueCommands::Retry { id } => commands::queue::retry(&queue, &id).await?,
                QueueCommands::Discard { id } => commands::queue::discard(&queue, &id).await?,
                QueueCommands::Resolve { id, keep } => {
                    commands::queue::resolve(&queue, &id, &keep).await?
                }
            }
        }
        Some(Commands::History { limit, format }) => {
            let db = open_db(&config).await?;
            commands::history::list(&db, limit, &format).await?
        }
        Some(Commands::Trigger) => {
            let server = http_server(&config)?;
            commands::trigger::trigger(&server).await?
        }
        None => {
            // Show help when no command provided
            let _ = Cli::parse_from(["msync", "--help"]);
            return Ok(());
        }
    };

    println!("{}", output);
    Ok(())
}
