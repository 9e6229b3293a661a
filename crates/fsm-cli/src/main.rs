use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fsm-cli")]
#[command(about = "FSM maintenance command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one deduplication pass and print the summary.
    Dedup,
    /// Apply embedded database migrations.
    Migrate,
    /// Run the cron-driven dedup loop until ctrl-c.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Dedup) {
        Commands::Dedup => {
            let summary = fsm_maintenance::run_dedup_once_from_env().await?;
            println!(
                "dedup complete: run_id={} slots={} duplicate_groups={} deleted={} realigned={} failed_deletes={}",
                summary.run_id,
                summary.distinct_slots,
                summary.duplicate_groups,
                summary.deleted_orders,
                summary.realigned_schedules,
                summary.failed_deletes.len()
            );
        }
        Commands::Migrate => {
            let config = fsm_maintenance::MaintenanceConfig::from_env();
            let store = fsm_storage::PgServiceStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Watch => {
            fsm_maintenance::run_scheduler_from_env().await?;
        }
    }

    Ok(())
}
