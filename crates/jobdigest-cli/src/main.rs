use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jobdigest_listing::DEFAULT_DAYS;
use jobdigest_storage::SnapshotStore;
use jobdigest_sync::{SyncConfig, SyncPipeline, MATCHES_FILE, RAW_OFFERS_FILE};
use jobdigest_web::DIGEST_FILE;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobdigest")]
#[command(about = "Fetch recent job offers, filter them against a profile and render a digest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, analyze, consolidate and render the digest
    Run(WindowArgs),
    /// Fetch and store raw offers only
    Fetch {
        #[command(flatten)]
        window: WindowArgs,
        /// Defaults to raw_offers.json inside the data directory
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Re-render the digest from the stored matches
    Render,
    /// Serve the digest viewer
    Serve,
}

#[derive(Debug, Clone, Args)]
struct WindowArgs {
    /// Look-back window in days
    #[arg(long, default_value_t = DEFAULT_DAYS)]
    days: u32,
    /// Stop after this many pages
    #[arg(long)]
    max_pages: Option<u32>,
}

impl Default for WindowArgs {
    fn default() -> Self {
        Self {
            days: DEFAULT_DAYS,
            max_pages: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Run(WindowArgs::default()));
    tracing::info!(?command, "jobdigest starting");

    match command {
        Commands::Run(window) => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            let data_dir = config.data_dir.clone();
            let pipeline = SyncPipeline::new(config).context("building pipeline")?;
            let summary = pipeline.run_once(window.days, window.max_pages).await?;

            let digest_path = data_dir.join(DIGEST_FILE);
            jobdigest_web::write_digest(&digest_path, &summary.matches).await?;
            println!(
                "run complete: run_id={} postings={} batches={} degraded={} matches={} path={} digest={}",
                summary.run_id,
                summary.meta.items_consolidated,
                summary.batches,
                summary.degraded_batches,
                summary.matches.len(),
                summary.matches_path,
                digest_path.display()
            );
        }
        Commands::Fetch { window, output } => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            let offers = jobdigest_sync::fetch_offers(&config, window.days, window.max_pages).await?;
            let path = match output {
                Some(path) => {
                    let bytes = serde_json::to_vec_pretty(&offers)?;
                    jobdigest_storage::replace_atomically(&path, &bytes).await?;
                    path
                }
                None => {
                    SnapshotStore::new(config.data_dir.clone())
                        .write_json(RAW_OFFERS_FILE, &offers)
                        .await?
                }
            };
            println!(
                "fetch complete: pages={} postings={} path={}",
                offers.meta.pages_traversed,
                offers.results.len(),
                path.display()
            );
        }
        Commands::Render => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            let matches = jobdigest_web::load_matches(&config.data_dir.join(MATCHES_FILE)).await?;
            let digest_path = config.data_dir.join(DIGEST_FILE);
            jobdigest_web::write_digest(&digest_path, &matches).await?;
            println!(
                "render complete: matches={} digest={}",
                matches.len(),
                digest_path.display()
            );
        }
        Commands::Serve => {
            jobdigest_web::serve_from_env().await?;
        }
    }

    Ok(())
}
