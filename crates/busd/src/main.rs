//! Operator binary for the business event bus.
//!
//! Runs the dispatcher loop for one tenant, or executes a single maintenance
//! operation against the configured store and exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

use rentaldesk_core::id::parse_tenant_id;
use rentaldesk_events::{EventType, FixedTenant, SubscriptionSpec, handler_fn};
use rentaldesk_infra::event_store::EventRecordStore;
use rentaldesk_infra::{BusConfig, EventBus, InMemoryEventStore, PostgresEventStore};

/// RentalDesk business event bus daemon
#[derive(Parser)]
#[command(name = "rentaldesk-busd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Postgres connection string; the in-memory store is used when absent
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Tenant whose events this process dispatches
    #[arg(long, env = "EVENT_BUS_TENANT_ID", global = true)]
    tenant: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher loop until Ctrl-C
    Run,

    /// Print bus statistics as JSON
    Stats,

    /// Make failed events eligible for dispatch again
    RetryFailed,

    /// Delete processed events older than the given age
    Cleanup {
        /// Age threshold in days
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    rentaldesk_observability::init();

    let cli = Cli::parse();
    let tenant_id = parse_tenant_id(&cli.tenant).context("invalid EVENT_BUS_TENANT_ID")?;
    let config = BusConfig::from_env().context("invalid event bus configuration")?;
    let store = open_store(cli.database_url.as_deref()).await?;

    let bus = EventBus::builder(store, Arc::new(FixedTenant(tenant_id)))
        .config(config)
        .build()?;

    match cli.command {
        Commands::Run => run(&bus).await?,
        Commands::Stats => {
            let stats = bus.get_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::RetryFailed => {
            let report = bus.retry_failed_events().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Cleanup { days } => {
            let report = bus.cleanup_old_events(days).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn open_store(database_url: Option<&str>) -> Result<Arc<dyn EventRecordStore>> {
    let Some(url) = database_url else {
        tracing::warn!("DATABASE_URL not set; using in-memory event store");
        return Ok(Arc::new(InMemoryEventStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresEventStore::new(pool);
    store.ensure_schema().await.context("failed to prepare schema")?;
    Ok(Arc::new(store))
}

async fn run(bus: &EventBus) -> Result<()> {
    // Audit trail for every event kind; domain modules register their own
    // handlers when they embed the bus in-process.
    bus.subscribe(
        SubscriptionSpec::new("audit-log")
            .event_types(EventType::ALL.iter().copied())
            .handler(handler_fn(|event| {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    source = %event.source,
                    priority = event.priority.as_str(),
                    "business event"
                );
                async { Ok(()) }
            })),
    )?;

    bus.start()?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested");
    bus.stop().await;
    Ok(())
}
