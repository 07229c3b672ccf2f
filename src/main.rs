//! Process bootstrap: wire the database, browser pool, event bus, image
//! analyzer, and scheduler together, then run until Ctrl-C.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use adscout::scheduler::parse_job_configs;
use adscout::source::KleinanzeigenSource;
use adscout::{
    AppConfig, ContextPool, Database, EventBus, ImageAnalyzer, Scheduler, ScrapePipeline,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    let db = Database::connect(&config.database_url, config.database_echo).await?;

    let pool = ContextPool::new(config.pool.clone());
    pool.start().await?;

    let event_bus = EventBus::new();
    event_bus.start().await;

    let analyzer = ImageAnalyzer::new(db.clone(), Arc::clone(&event_bus), config.analysis.clone())?;
    analyzer.start().await;

    let source = Arc::new(KleinanzeigenSource::new(Arc::clone(&pool)));
    let pipeline = Arc::new(ScrapePipeline::new(
        source,
        Arc::clone(&pool),
        config.pipeline.clone(),
    ));

    let bootstrap_jobs = config
        .scraper_jobs
        .as_deref()
        .map(|raw| parse_job_configs(raw, config.default_interval_seconds as i64))
        .unwrap_or_default();
    let scheduler = Scheduler::new(
        db.clone(),
        pipeline,
        Some(Arc::clone(&event_bus)),
        bootstrap_jobs,
    );
    scheduler.start().await?;

    info!("adscout running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    scheduler.shutdown().await;
    analyzer.stop().await;
    event_bus.stop().await;
    pool.shutdown().await?;
    Ok(())
}
