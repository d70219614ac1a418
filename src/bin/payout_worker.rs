use anyhow::Result;
use clap::Parser;
use payout_engine::config;
use payout_engine::db;
use payout_engine::origin::OriginSync;
use payout_engine::providers::ProviderRegistry;
use payout_engine::scheduler::{self, Dispatch};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Dispatch all batches with pending payouts and exit when none remain"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Keep polling for new pending batches instead of exiting
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let dispatch = Dispatch::new(
        ProviderRegistry::from_config(&cfg)?,
        OriginSync::default(),
        Duration::from_secs(cfg.app.dispatch_timeout_seconds),
    );
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    info!("starting payout worker");
    let mut dispatched_batches = 0usize;
    loop {
        let batches = db::batches_with_pending(&pool).await?;
        if batches.is_empty() {
            if !args.watch {
                info!(dispatched_batches, "no pending payout batches; exiting");
                break;
            }
            tokio::time::sleep(poll_sleep).await;
            continue;
        }

        for batch_id in batches {
            match scheduler::schedule_batch_payout_processing(&pool, &dispatch, &batch_id).await {
                Ok(()) => dispatched_batches += 1,
                Err(err) => {
                    error!(?err, batch_id = %batch_id, "failed to process batch");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    Ok(())
}
