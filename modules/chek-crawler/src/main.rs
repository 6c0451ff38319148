use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chek_common::CrawlerConfig;
use chek_crawler::runner;
use content_client::ContentClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Local overrides first; existing process env always wins.
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();

    // Structured JSON log lines are the only operator surface.
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = CrawlerConfig::from_env().context("Invalid configuration")?;
    info!(
        cron = %config.cron,
        run_once = config.run_once,
        use_query_bandit = config.use_query_bandit,
        "CHEK crawler starting"
    );

    let config = Arc::new(config);
    let content = Arc::new(ContentClient::new(
        &config.content_base_url,
        &config.ingest_token,
    ));

    // First run at boot; a failure here is a boot failure.
    let stats = runner::run(&config, content.as_ref()).await?;
    info!("Run complete. {stats}");

    if config.run_once {
        return Ok(());
    }

    let mut scheduler = JobScheduler::new().await?;
    let job_config = config.clone();
    let job_content = content.clone();
    let job = Job::new_async(config.cron.as_str(), move |_uuid, _lock| {
        let config = job_config.clone();
        let content = job_content.clone();
        Box::pin(async move {
            // Scheduled runs never take the process down.
            match runner::run(&config, content.as_ref()).await {
                Ok(stats) => info!("Run complete. {stats}"),
                Err(e) => error!(error = %e, "crawler_run_crash"),
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    info!(cron = %config.cron, "Scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    scheduler.shutdown().await?;
    Ok(())
}
