//! idlewatch - network device inactivity tracker
//!
//! Samples per-device byte counters at a fixed interval and reports devices
//! that stay below a traffic threshold for longer than a time limit.

mod config;
mod db;
mod scheduler;
mod sink;
mod source;
mod tracker;
mod web;

use config::MonitorConfig;
use db::Store;
use scheduler::{RetentionManager, Scheduler};
use sink::{EventRecorder, ReportLog};
use source::{AccountingCounters, ArpTable, HostSampleSource};
use tracker::ActivityLedger;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("idlewatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = MonitorConfig::load()?;
    tracing::info!(
        "Starting idlewatch: check every {}s, threshold {} B/s, limit {}s",
        cfg.check_interval_secs,
        cfg.inactivity_threshold,
        cfg.inactivity_time_limit_secs
    );
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let retention_manager = RetentionManager::new(store.clone(), cfg.event_retention_days);
    retention_manager.start();

    // Sinks
    let report_log = Arc::new(ReportLog::open(&cfg.report_log, cfg.report_log_max_bytes)?);
    tracing::info!("Writing inactivity report to {}", report_log.path().display());
    let (recorder, writer) = EventRecorder::spawn(store.clone());

    // Sample source
    let source = Arc::new(HostSampleSource::new(
        ArpTable::new(&cfg.arp_path),
        AccountingCounters::new(&cfg.accounting_chain),
    ));
    source.install().await;

    // Start scheduler
    let ledger = Arc::new(ActivityLedger::new());
    let scheduler = Arc::new(
        Scheduler::new(source, ledger.clone(), &cfg)
            .with_sink(report_log)
            .with_sink(Arc::new(recorder)),
    );
    let scheduler_handle = scheduler.start();

    // Start web server
    let server = Server::new(cfg, store, ledger, scheduler.status_handle());
    let web_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            tracing::error!("Web server failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    scheduler.stop();
    if let Err(e) = scheduler_handle.await {
        tracing::error!("Scheduler task failed: {}", e);
    }
    retention_manager.stop().await;
    web_handle.abort();

    // Dropping the last recorder handle lets the writer flush and exit.
    drop(scheduler);
    if let Err(e) = writer.await {
        tracing::error!("Event recorder task failed: {}", e);
    }

    Ok(())
}
