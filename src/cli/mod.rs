pub mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::cli::config::VaultflowConfig;
use crate::engine::types::{FlowStatus, StepStatus};
use crate::storage::json_store::JsonStore;
use crate::storage::sqlite_store::SqliteStore;
use crate::storage::{FlowFilter, FlowStore, Pagination};

#[derive(Parser)]
#[command(name = "vaultflow", version, about = "Durable flow engine")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a vaultflow.yaml config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List persisted flows
    List {
        /// Filter by status (initializing, ready, running, paused, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by flow type
        #[arg(long)]
        flow_type: Option<String>,

        /// Filter by correlation id
        #[arg(long)]
        correlation: Option<String>,

        /// Flow store directory
        #[arg(long, default_value = "data/flows", env = "VAULTFLOW_STORE_DIR")]
        store_dir: PathBuf,

        /// SQLite database URL (takes precedence over --store-dir)
        #[arg(long, env = "VAULTFLOW_DATABASE_URL")]
        db: Option<String>,

        /// Page size
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Inspect a specific flow
    Inspect {
        /// Flow ID
        flow_id: String,

        /// Flow store directory
        #[arg(long, default_value = "data/flows", env = "VAULTFLOW_STORE_DIR")]
        store_dir: PathBuf,

        /// SQLite database URL (takes precedence over --store-dir)
        #[arg(long, env = "VAULTFLOW_DATABASE_URL")]
        db: Option<String>,
    },

    /// Show flow counts per status
    Stats {
        /// Flow store directory
        #[arg(long, default_value = "data/flows", env = "VAULTFLOW_STORE_DIR")]
        store_dir: PathBuf,

        /// SQLite database URL (takes precedence over --store-dir)
        #[arg(long, env = "VAULTFLOW_DATABASE_URL")]
        db: Option<String>,
    },

    /// Delete terminal flows older than the given age
    Purge {
        /// Age threshold in days
        #[arg(long, default_value = "30")]
        days: i64,

        /// Flow store directory
        #[arg(long, default_value = "data/flows", env = "VAULTFLOW_STORE_DIR")]
        store_dir: PathBuf,

        /// SQLite database URL (takes precedence over --store-dir)
        #[arg(long, env = "VAULTFLOW_DATABASE_URL")]
        db: Option<String>,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    load_dotenv(cli.dotenv.as_deref());
    let config = VaultflowConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::List {
            status,
            flow_type,
            correlation,
            store_dir,
            db,
            limit,
            format,
        } => {
            let store = open_store(&config, store_dir, db).await?;
            cmd_list(store, status, flow_type, correlation, limit, format).await
        }
        Commands::Inspect {
            flow_id,
            store_dir,
            db,
        } => {
            let store = open_store(&config, store_dir, db).await?;
            cmd_inspect(store, &flow_id).await
        }
        Commands::Stats { store_dir, db } => {
            let store = open_store(&config, store_dir, db).await?;
            cmd_stats(store).await
        }
        Commands::Purge {
            days,
            store_dir,
            db,
        } => {
            let store = open_store(&config, store_dir, db).await?;
            cmd_purge(store, days).await
        }
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory.
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {
                // No .env file found — that's fine, silently skip
            }
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn open_store(
    config: &VaultflowConfig,
    store_dir: PathBuf,
    db: Option<String>,
) -> Result<Arc<dyn FlowStore>> {
    if let Some(url) = db.or_else(|| config.database_url.clone()) {
        let store = SqliteStore::connect(&url)
            .await
            .with_context(|| format!("Failed to open database: {}", url))?;
        return Ok(Arc::new(store));
    }
    let dir = config
        .store_dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or(store_dir);
    Ok(Arc::new(JsonStore::new(dir)))
}

async fn cmd_list(
    store: Arc<dyn FlowStore>,
    status: Option<String>,
    flow_type: Option<String>,
    correlation: Option<String>,
    limit: usize,
    format: String,
) -> Result<()> {
    let status = match status {
        Some(s) => Some(
            s.parse::<FlowStatus>()
                .map_err(|e| anyhow::anyhow!("{}", e))?,
        ),
        None => None,
    };

    let filter = FlowFilter {
        status,
        flow_type,
        correlation_id: correlation,
        ..Default::default()
    };
    let page = store
        .list(&filter, &Pagination { offset: 0, limit })
        .await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    if page.items.is_empty() {
        println!("No flows found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<12} {:>5}/{:<5} {:<20}",
        "FLOW ID", "TYPE", "STATUS", "STEP", "TOTAL", "CREATED"
    );
    for flow in &page.items {
        println!(
            "{:<38} {:<20} {:<12} {:>5}/{:<5} {:<20}",
            flow.flow_id,
            flow.flow_type,
            flow.status.to_string(),
            flow.current_step_index,
            flow.total_steps,
            flow.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    println!("\n{} of {} flow(s)", page.items.len(), page.total);
    Ok(())
}

async fn cmd_inspect(store: Arc<dyn FlowStore>, flow_id: &str) -> Result<()> {
    let flow = store
        .load(flow_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", flow_id))?;

    println!("Flow: {} ({})", flow.flow_id, flow.flow_type);
    println!("Status: {} (version {})", flow.status, flow.version);
    if let Some(ref correlation) = flow.correlation_id {
        println!("Correlation: {}", correlation);
    }
    if let Some(ref user) = flow.user_id {
        println!("User: {}", user);
    }
    if let Some(ref parent) = flow.triggered_by {
        println!(
            "Triggered by: {} (step '{}')",
            parent.flow_id, parent.triggered_by_step
        );
    }
    if let Some(reason) = flow.pause_reason {
        println!(
            "Paused: {}{}",
            reason,
            flow.pause_message
                .as_deref()
                .map(|m| format!(" — {}", m))
                .unwrap_or_default()
        );
    }
    if let Some(ref error) = flow.last_error {
        println!("Last error: {}", error);
    }

    println!("\nSteps:");
    for step in &flow.steps {
        let status_icon = match step.status {
            StepStatus::Completed => "✓",
            StepStatus::Failed => "✗",
            StepStatus::Skipped => "⊘",
            StepStatus::InProgress => "⟳",
            StepStatus::Paused => "⏸",
            StepStatus::Pending => "○",
        };
        println!(
            "  {} {} [{}] (attempt {})",
            status_icon, step.name, step.status, step.attempts
        );
        if let Some(ref branch) = step.selected_branch {
            println!("    Branch: {}", branch);
        }
        if let Some(ref error) = step.error {
            println!("    Error: {}", error.message);
        }
        for child in &step.triggered_flows {
            println!(
                "    Triggered: {} ({})",
                child.flow_id.as_deref().unwrap_or("?"),
                child.flow_type
            );
        }
    }

    if !flow.data.is_empty() {
        println!("\nData context:");
        println!("{}", serde_json::to_string_pretty(&flow.data)?);
    }

    if !flow.events.is_empty() {
        println!("\nRecent events:");
        for event in &flow.events {
            println!(
                "  {} {:?}: {}",
                event.timestamp.format("%H:%M:%S%.3f"),
                event.event_type,
                event.description
            );
        }
    }
    Ok(())
}

async fn cmd_stats(store: Arc<dyn FlowStore>) -> Result<()> {
    let counts = store.counts_by_status().await?;
    let total: u64 = counts.values().sum();

    println!("{:<14} {:>8}", "STATUS", "COUNT");
    for (status, count) in &counts {
        println!("{:<14} {:>8}", status.to_string(), count);
    }
    println!("{:<14} {:>8}", "total", total);
    Ok(())
}

async fn cmd_purge(store: Arc<dyn FlowStore>, days: i64) -> Result<()> {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
    let removed = store.purge_terminal_before(cutoff).await?;
    println!("Purged {} flow(s) older than {} day(s).", removed, days);
    Ok(())
}
