use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tco_core::{AllocationPolicy, ComponentFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use tco_calculator::api::{self, AppState, SecurityConfig};
use tco_calculator::config::Config;
use tco_calculator::db::Database;
use tco_calculator::ingest::{self, IngestOptions};
use tco_calculator::models::RolloverInput;

#[derive(Parser)]
#[command(name = "tco")]
#[command(about = "Total cost of ownership tracking and ADO effort cost allocation")]
struct Cli {
    /// Database file (defaults to TCO_DB_PATH, then the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Port for HTTP API (defaults to TCO_PORT, then 3000)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Apply pending database migrations
    Migrate,
    /// Import an ADO feature export (XLSX/XLS/XLSB or CSV)
    Import {
        file: PathBuf,

        /// Worksheet to read from a workbook (defaults to the first)
        #[arg(long)]
        sheet: Option<String>,

        /// Effort values use ',' as decimal separator
        #[arg(long)]
        comma_decimal: bool,
    },
    /// Print the cost allocation as JSON
    Costs {
        /// proportional or even (defaults to TCO_ALLOCATION_POLICY)
        #[arg(long)]
        policy: Option<AllocationPolicy>,

        /// Only print cohort summaries
        #[arg(long, conflicts_with = "components")]
        summary: bool,

        /// Print effort and cost components per year, iteration, program, team and group
        #[arg(long)]
        components: bool,
    },
    /// Copy recurring invoices into the next fiscal year
    Rollover {
        #[arg(long)]
        from: i32,

        #[arg(long)]
        to: i32,

        /// Recorded in the rollover log
        #[arg(long, env = "USER")]
        by: Option<String>,
    },
    /// Undo a rollover batch
    Rollback { batch: Uuid },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "tco_calculator=debug,tower_http=debug".into()),
    );

    // stderr keeps stdout clean for JSON output
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_database(config: &Config) -> anyhow::Result<Database> {
    let db = match &config.db_path {
        Some(path) => Database::open(path.clone())?,
        None => Database::open_default()?,
    };
    db.migrate()?;
    Ok(db)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let db = open_database(&config)?;
    let security = SecurityConfig::from_env();
    if security.api_key.is_some() {
        tracing::info!("API key authentication enabled");
    }

    if let Some(limiter) = security.rate_limiter.clone() {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.window());
            loop {
                interval.tick().await;
                let clients = limiter.cleanup();
                tracing::debug!(clients, "Rate limiter cleanup");
            }
        });
    }

    let app = api::create_router(AppState::new(db, &config), security);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", config.port)).await?;
    tracing::info!(
        policy = %config.allocation_policy,
        "TCO server listening on http://127.0.0.1:{}",
        config.port
    );

    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = Config::from_env()?;
    if let Some(path) = cli.db {
        config.db_path = Some(path);
    }

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await?;
        }
        Commands::Migrate => {
            open_database(&config)?;
            tracing::info!("Database is up to date");
        }
        Commands::Import {
            file,
            sheet,
            comma_decimal,
        } => {
            let db = open_database(&config)?;
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let options = IngestOptions {
                file_name: file.file_name().map(|n| n.to_string_lossy().into_owned()),
                sheet,
                comma_decimal,
            };
            let report = ingest::import_ado_export(&db, &bytes, &options)?;
            print_json(&report)?;
        }
        Commands::Costs {
            policy,
            summary,
            components,
        } => {
            let db = open_database(&config)?;
            let policy = policy.unwrap_or(config.allocation_policy);
            if components {
                print_json(&db.cost_components(policy, &ComponentFilter::default())?)?;
                return Ok(());
            }
            let report = db.compute_allocation(policy)?;
            if summary {
                print_json(&report.cohorts)?;
            } else {
                print_json(&report)?;
            }
        }
        Commands::Rollover { from, to, by } => {
            let db = open_database(&config)?;
            let result = db.rollover_invoices(RolloverInput {
                from_year: from,
                to_year: to,
                created_by: by,
            })?;
            print_json(&result)?;
        }
        Commands::Rollback { batch } => {
            let db = open_database(&config)?;
            let result = db.rollback_rollover(batch)?;
            print_json(&result)?;
        }
    }

    Ok(())
}
