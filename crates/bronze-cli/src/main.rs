use std::sync::Arc;

use anyhow::Result;
use bronze_pipeline::{connect_postgres, LandingConfig, LandingPipeline, RunSummary};
use bronze_storage::{MemoryStore, Store};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bronze-cli")]
#[command(about = "Land synthetic orders into the bronze raw and hashed layers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Rows to generate for the raw layer (overrides ROW_COUNT).
    #[arg(long, global = true)]
    rows: Option<usize>,

    /// Raw table name; the hashed table gets a `_hash` suffix (overrides TABLE_NAME).
    #[arg(long, global = true)]
    table: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = StoreKind::Postgres)]
    store: StoreKind,

    /// Print results as JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// init + populate + hash
    Run,
    /// Create the schema
    Init,
    /// Append generated rows to the raw table
    Populate,
    /// Hash the raw table into the hashed table
    Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Postgres,
    Memory,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = LandingConfig::from_env()?;
    if let Some(rows) = cli.rows {
        config.row_count = rows;
    }
    if let Some(table) = cli.table.clone() {
        config.table_name = table;
    }
    debug!(?config, "loaded configuration");

    let store: Arc<dyn Store> = match cli.store {
        StoreKind::Postgres => connect_postgres(&config).await?,
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    };
    let pipeline = LandingPipeline::new(config, store);
    let raw_table = pipeline.config().raw_table();
    let hashed_table = pipeline.config().hashed_table();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = pipeline.run_once().await?;
            print_summary(&summary, cli.json)?;
        }
        Commands::Init => {
            pipeline.create_namespace().await?;
            if cli.json {
                println!("{}", json!({ "schema": pipeline.config().schema }));
            } else {
                println!("schema {} ready", pipeline.config().schema);
            }
        }
        Commands::Populate => {
            let rows = pipeline.populate_raw().await?;
            if cli.json {
                println!("{}", json!({ "table": raw_table.to_string(), "rows": rows }));
            } else {
                println!("{raw_table}: +{rows} rows");
            }
        }
        Commands::Hash => {
            let report = pipeline.build_hashed().await?;
            if cli.json {
                println!(
                    "{}",
                    json!({
                        "table": hashed_table.to_string(),
                        "processed": report.processed,
                        "inserted": report.inserted,
                    })
                );
            } else {
                println!("{hashed_table}: +{} rows", report.processed);
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!("{}: +{} rows", summary.raw_table, summary.raw_rows);
        println!(
            "{}: +{} rows ({} new)",
            summary.hashed_table, summary.hashed_processed, summary.hashed_inserted
        );
    }
    Ok(())
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}
