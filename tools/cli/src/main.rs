//! erpsync CLI - drive and inspect the offline-first sync core.
//!
//! Runs the sync engine against a seeded in-memory gateway so the
//! pull/push/conflict machinery can be exercised end to end without a
//! live server, and inspects the local SQLite store and offline queue.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use erpsync_common::{EntityType, Record, RecordId};
use erpsync_gateway::MemoryGateway;
use erpsync_store::{LocalStore, MutationOp};
use erpsync_sync::{
    Connectivity, EntityConfig, SyncConfig, SyncEngine, SyncStrategy,
};

#[derive(Parser)]
#[command(name = "erpsync")]
#[command(about = "erpsync - Offline-first ERP sync core")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the local sync database.
    #[arg(long, default_value = "erpsync.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync against the demo gateway.
    Sync {
        /// Force a full pull, ignoring checkpoints.
        #[arg(long)]
        full: bool,

        /// Comma-separated entity types (default: all configured).
        #[arg(short, long, value_delimiter = ',')]
        types: Vec<String>,
    },

    /// Show per-type checkpoints and record counts.
    Status,

    /// Inspect records stored for an entity type.
    List {
        /// Entity type, e.g. "res.partner".
        entity: String,
    },

    /// Queue a local mutation for the next sync.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Drop all local data for an entity type.
    Reset {
        /// Entity type to clear.
        entity: String,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Show queued mutations.
    List,

    /// Show queue counters.
    Stats,

    /// Enqueue a mutation.
    Add {
        /// Entity type, e.g. "res.partner".
        #[arg(short, long)]
        entity: String,

        /// Operation: "create", "update", or "delete".
        #[arg(short, long)]
        op: String,

        /// Target record id (update/delete).
        #[arg(short, long)]
        id: Option<RecordId>,

        /// Field values as a JSON object.
        #[arg(short, long, default_value = "{}")]
        data: String,
    },

    /// Put a failed mutation back in the queue.
    Retry {
        /// Queued mutation id.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Sync { full, types } => cmd_sync(&cli.db, full, &types).await,

        Commands::Status => cmd_status(&cli.db),

        Commands::List { entity } => cmd_list(&cli.db, &entity),

        Commands::Queue { command } => match command {
            QueueCommands::List => cmd_queue_list(&cli.db),
            QueueCommands::Stats => cmd_queue_stats(&cli.db),
            QueueCommands::Add {
                entity,
                op,
                id,
                data,
            } => cmd_queue_add(&cli.db, &entity, &op, id, &data),
            QueueCommands::Retry { id } => cmd_queue_retry(&cli.db, &id),
        },

        Commands::Reset { entity } => cmd_reset(&cli.db, &entity),
    }
}

fn open_store(db: &PathBuf) -> Result<Arc<LocalStore>> {
    let store = LocalStore::open(db).context("Failed to open local database")?;
    Ok(Arc::new(store))
}

fn parse_entity(name: &str) -> Result<EntityType> {
    EntityType::new(name).context("Invalid entity type")
}

/// The demo gateway: a handful of contacts and products with
/// server-assigned write_dates.
fn fixture_gateway() -> Arc<MemoryGateway> {
    let gateway = Arc::new(MemoryGateway::new());
    let contact = EntityType::new("res.partner").expect("static entity type");
    let product = EntityType::new("product.product").expect("static entity type");

    let contacts = ["Azure Interior", "Deco Addict", "Gemini Furniture"]
        .iter()
        .map(|name| {
            let mut r = Record::new();
            r.set("name", serde_json::json!(name));
            r.set("is_company", serde_json::json!(true));
            r
        })
        .collect();
    gateway.seed(&contact, contacts);

    let products = [("Office Chair", 120.5), ("Desk Lamp", 40.0)]
        .iter()
        .map(|(name, price)| {
            let mut r = Record::new();
            r.set("name", serde_json::json!(name));
            r.set("list_price", serde_json::json!(price));
            r
        })
        .collect();
    gateway.seed(&product, products);
    gateway
}

fn demo_config() -> SyncConfig {
    SyncConfig::default()
        .with_entity(
            EntityConfig::new(EntityType::new("res.partner").expect("static entity type"))
                .with_strategy(SyncStrategy::All)
                .with_priority(1),
        )
        .with_entity(
            EntityConfig::new(EntityType::new("product.product").expect("static entity type"))
                .with_strategy(SyncStrategy::All)
                .with_priority(2),
        )
}

fn build_engine(db: &PathBuf) -> Result<SyncEngine<MemoryGateway>> {
    let store = open_store(db)?;
    Ok(SyncEngine::new(
        fixture_gateway(),
        store,
        Connectivity::online(),
        demo_config(),
    ))
}

/// Run a sync and print its report.
async fn cmd_sync(db: &PathBuf, full: bool, types: &[String]) -> Result<()> {
    let engine = build_engine(db)?;

    let report = if types.is_empty() {
        info!("Syncing all configured entity types");
        engine.sync_all(full).await?
    } else {
        let entity_types = types
            .iter()
            .map(|t| parse_entity(t))
            .collect::<Result<Vec<_>>>()?;
        engine.sync_types(&entity_types, full).await?
    };

    println!("Sync finished in {:.2?}", report.duration);
    for result in &report.results {
        let flag = if result.skipped {
            " (skipped)"
        } else if !result.is_success() {
            " (errors)"
        } else {
            ""
        };
        println!(
            "  {:<24} pulled {:>4}  pushed {:>3}  conflicts {:>2}{}",
            result.entity_type.as_str(),
            result.pulled,
            result.pushed,
            result.conflicts.len(),
            flag
        );
        for error in &result.errors {
            println!("    error: {}", error);
        }
    }

    Ok(())
}

/// Show checkpoints.
fn cmd_status(db: &PathBuf) -> Result<()> {
    let store = open_store(db)?;
    let checkpoints = store.all_checkpoints()?;

    if checkpoints.is_empty() {
        println!("No entity types have synced yet.");
        return Ok(());
    }

    println!("Sync status:");
    for cp in checkpoints {
        let mark = cp
            .last_sync_write_date
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = if cp.enabled { "enabled" } else { "disabled" };
        println!(
            "  {:<24} {:>6} records  checkpoint {}  runs {}  {}",
            cp.entity_type.as_str(),
            cp.total_records,
            mark,
            cp.sync_count,
            state
        );
        if let Some(error) = cp.last_error {
            println!("    last error: {}", error);
        }
    }

    Ok(())
}

/// Dump stored records for one type.
fn cmd_list(db: &PathBuf, entity: &str) -> Result<()> {
    let store = open_store(db)?;
    let entity_type = parse_entity(entity)?;
    let records = store.list_records(&entity_type)?;

    if records.is_empty() {
        println!("No local records for {}.", entity);
        return Ok(());
    }

    println!("{} record(s) for {}:", records.len(), entity);
    for record in records {
        let id = record.id().map_or_else(|| "?".to_string(), |i| i.to_string());
        let name = record
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("(unnamed)");
        let stamp = record
            .write_date()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  [{:>5}] {:<32} write_date {}", id, name, stamp);
    }

    Ok(())
}

/// Show queued mutations.
fn cmd_queue_list(db: &PathBuf) -> Result<()> {
    let store = open_store(db)?;
    let mutations = store.load_all_mutations()?;

    if mutations.is_empty() {
        println!("Offline queue is empty.");
        return Ok(());
    }

    println!("{} queued mutation(s):", mutations.len());
    for m in mutations {
        println!(
            "  {:<10} {:<8} {:<24} retries {}/{}  {}",
            format!("{:?}", m.status).to_lowercase(),
            m.operation.as_str(),
            m.entity_type.as_str(),
            m.retry_count,
            m.max_retries,
            m.id
        );
        if let Some(error) = m.last_error {
            println!("    last error: {}", error);
        }
    }

    Ok(())
}

/// Show queue counters.
fn cmd_queue_stats(db: &PathBuf) -> Result<()> {
    let store = open_store(db)?;
    let stats = store.queue_stats()?;

    println!("Offline queue:");
    println!("  Pending:    {}", stats.pending);
    println!("  Processing: {}", stats.processing);
    println!("  Completed:  {}", stats.completed);
    println!("  Failed:     {}", stats.failed);
    println!("  Total:      {}", stats.total);

    Ok(())
}

/// Enqueue a mutation for the next sync.
fn cmd_queue_add(
    db: &PathBuf,
    entity: &str,
    op: &str,
    id: Option<RecordId>,
    data: &str,
) -> Result<()> {
    let operation = match op {
        "create" => MutationOp::Create,
        "update" => MutationOp::Update,
        "delete" => MutationOp::Delete,
        _ => anyhow::bail!("Invalid operation. Use: create, update, or delete"),
    };
    let entity_type = parse_entity(entity)?;
    let payload: Record =
        serde_json::from_str(data).context("Payload must be a JSON object")?;

    let engine = build_engine(db)?;
    let mutation_id = engine
        .queue()
        .enqueue(operation, entity_type, id, payload)
        .context("Failed to enqueue mutation")?;

    println!("Queued: {}", mutation_id);
    println!("It will push on the next `erpsync sync`.");

    Ok(())
}

/// Reset a failed mutation for another attempt.
fn cmd_queue_retry(db: &PathBuf, id: &str) -> Result<()> {
    let engine = build_engine(db)?;
    engine.queue().retry(id).context("Failed to retry mutation")?;
    println!("Mutation {} is pending again.", id);
    Ok(())
}

/// Drop all local data for a type.
fn cmd_reset(db: &PathBuf, entity: &str) -> Result<()> {
    let store = open_store(db)?;
    let entity_type = parse_entity(entity)?;
    store.clear_entity(&entity_type)?;
    println!("Cleared local data and checkpoint for {}.", entity);
    Ok(())
}
