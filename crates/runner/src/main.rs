use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use testbench_core::campaign::{CampaignSpec, CampaignStatus};
use testbench_engine::config::EngineConfig;
use testbench_engine::history::MemoryHistoryStore;
use testbench_engine::Orchestrator;
use testbench_events::{EngineEvent, EventBus};
use testbench_executor::api::ExecutorApi;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();

    // --- Configuration ---
    let config = EngineConfig::from_env().context("Invalid engine configuration")?;
    let spec_path =
        std::env::var("CAMPAIGN_SPEC_PATH").context("CAMPAIGN_SPEC_PATH must be set")?;
    let spec = load_campaign(&spec_path)?;
    tracing::info!(
        executor_url = %config.executor_url,
        campaign = %spec.name,
        jobs = spec.jobs.len(),
        "Loaded configuration",
    );

    // --- Engine ---
    let executor = ExecutorApi::new(config.executor_url.clone(), config.request_timeout)
        .context("Failed to build executor client")?;
    let events = Arc::new(EventBus::new(config.event_channel_capacity));
    let engine = Orchestrator::new(
        Arc::new(executor),
        Arc::new(MemoryHistoryStore::new()),
        config.tracker,
        events,
    );
    let logger = tokio::spawn(log_events(engine.subscribe()));

    // --- Run ---
    let id = engine.start_campaign(spec).await?;
    let finished = tokio::select! {
        result = engine.wait_campaign(id) => result?,
        () = shutdown_signal() => {
            engine.cancel_campaign(id).await?;
            engine.wait_campaign(id).await?
        }
    };

    let record = engine.history_record(id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    engine.shutdown().await;
    logger.abort();

    Ok(if finished.status == CampaignStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// `RUST_LOG` filter with a fmt layer, or JSON lines when
/// `LOG_FORMAT=json`.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "testbench_runner=info,testbench_engine=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_campaign(path: &str) -> anyhow::Result<CampaignSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read campaign spec {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("Malformed campaign spec {path}"))
}

async fn log_events(mut rx: broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(EngineEvent::CampaignProgress {
                completed_count,
                total_jobs,
                percent,
                ..
            }) => {
                tracing::info!(completed_count, total_jobs, percent, "Campaign progress");
            }
            Ok(event) => {
                tracing::debug!(
                    event_type = event.event_type(),
                    payload = %event.to_json(),
                    "Engine event",
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), cancelling campaign");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, cancelling campaign");
        }
    }
}
