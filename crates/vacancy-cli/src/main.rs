use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vacancy_sync::{Feeder, FeederConfig, PgListingStore};

#[derive(Debug, Parser)]
#[command(name = "vacancy-feeder")]
#[command(about = "Feeds dated vacancy snapshots into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the snapshot store until interrupted (default).
    Run,
    /// Feed every pending snapshot once and print the run summary.
    Once,
    /// Print the current table watermark.
    Watermark,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = FeederConfig::from_env();
    info!(
        database = ?config.database,
        data_dir = %config.data_dir.display(),
        recheck_secs = config.recheck_every.as_secs(),
        "starting feeder"
    );

    let store = PgListingStore::connect_lazy(&config.database);
    let feeder = Feeder::from_config(store, &config);

    let outcome = run(&feeder, cli.command.unwrap_or(Commands::Run)).await;
    feeder.store().close().await;
    outcome
}

async fn run(feeder: &Feeder<PgListingStore>, command: Commands) -> Result<()> {
    match command {
        Commands::Run => {
            tokio::select! {
                _ = feeder.run_forever() => {}
                signal = tokio::signal::ctrl_c() => {
                    signal.context("listening for ctrl-c")?;
                    info!("interrupted, shutting down");
                }
            }
        }
        Commands::Once => {
            let summary = feeder.run_once().await?;
            let json = serde_json::to_string_pretty(&summary).context("serializing run summary")?;
            println!("{json}");
        }
        Commands::Watermark => {
            println!("{}", feeder.current_watermark().await?);
        }
    }
    Ok(())
}
