use anyhow::Result;
use clap::{Parser, Subcommand};
use rsnw_browser::{ChromiumFactory, DriverConfig};
use rsnw_pipeline::{run_ingest, run_submit, run_supervised, WatcherConfig};
use rsnw_storage::{DbConfig, MySqlStore};
use tracing::info;
use tracing_subscriber::{fmt as tfmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rsnw")]
#[command(about = "Router security news watcher: harvest, store, transcribe")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingestion then submission under the deadline supervisor (default).
    Run,
    /// Harvest and store candidates only.
    Ingest,
    /// Submit pending items only.
    Submit,
    /// Database connectivity diagnostic: probe insert + readback.
    CheckDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt().with_env_filter(filter).with_target(true).init();

    let cli = Cli::parse();
    let config = WatcherConfig::from_env();
    let store = MySqlStore::new(&DbConfig::from_env());
    let factory = ChromiumFactory::new(DriverConfig::default());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            store.ensure_schema().await?;
            let summary = run_supervised(&config, &factory, &store).await;
            let (harvested, inserted) = summary
                .ingest
                .map(|r| (r.harvested, r.inserted))
                .unwrap_or((0, 0));
            let (submitted, failed) = summary
                .submit
                .map(|r| (r.submitted, r.failed))
                .unwrap_or((0, 0));
            println!(
                "run complete: state={:?} harvested={harvested} inserted={inserted} submitted={submitted} failed={failed}",
                summary.state
            );
        }
        Commands::Ingest => {
            store.ensure_schema().await?;
            let report = run_ingest(&config, &factory, &store).await?;
            println!(
                "ingest complete: run_id={} harvested={} inserted={}",
                report.run_id, report.harvested, report.inserted
            );
        }
        Commands::Submit => {
            let report = run_submit(&config, &factory, &store).await?;
            println!(
                "submit complete: attempted={} submitted={} failed={}",
                report.attempted, report.submitted, report.failed
            );
        }
        Commands::CheckDb => {
            info!("running database diagnostic");
            store.ensure_schema().await?;
            let report = store.probe().await?;
            println!(
                "check-db: probe_inserted={} readback={}",
                report.inserted, report.readback
            );
        }
    }

    Ok(())
}
