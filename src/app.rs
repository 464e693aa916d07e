use crate::cli::Cli;
use crate::config::MailConfig;
use crate::ingest::{IngestPipeline, ThreadPolicy};
use crate::poller::MailboxPoller;
use crate::scheduler::Scheduler;
use crate::storage::Database;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Long-lived services, built once at startup and passed around explicitly.
pub struct AppContext {
    pub config: MailConfig,
    pub db: Arc<Database>,
    pub poller: Arc<MailboxPoller<Database>>,
    pub scheduler: Scheduler,
}

impl AppContext {
    pub async fn build(config: MailConfig) -> Result<Self> {
        let db = Arc::new(Database::new_default().await?);
        info!(path = %db.path().display(), "Using SQLite store");
        Ok(Self::with_database(config, db))
    }

    pub fn with_database(config: MailConfig, db: Arc<Database>) -> Self {
        let policy = ThreadPolicy {
            lookback: config.thread_lookback,
            max_age_days: config.thread_max_age_days,
        };
        let pipeline = Arc::new(IngestPipeline::new(Arc::clone(&db), policy));
        let poller = Arc::new(MailboxPoller::new(config.clone(), pipeline));
        let scheduler = Scheduler::new(poller.clone(), config.poll_interval());
        Self {
            config,
            db,
            poller,
            scheduler,
        }
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = MailConfig::load()?;
    if let Some(minutes) = cli.interval_minutes {
        config.poll_interval_minutes = minutes;
    }

    let missing = config.missing_credentials();
    if !missing.is_empty() {
        warn!(?missing, "Mailbox credentials incomplete; cycles will be skipped until configured");
    }

    let ctx = AppContext::build(config).await?;

    if cli.once {
        let report = ctx.poller.poll_once().await?;
        info!(?report, "Single cycle finished");
        return Ok(());
    }

    ctx.scheduler.start().await;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutdown requested");
    ctx.scheduler.stop().await;
    Ok(())
}
