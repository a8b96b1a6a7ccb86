//! Single-node runq: dispatcher, stalled job watchdog and runner pool in one
//! process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use runq_models::{LiveRtmpHlsTranscodingPayload, OutputResolution, RegistrationToken};
use runq_queue::{Dispatcher, DispatcherConfig, EnqueueJob, Watchdog, WatchdogConfig};
use runq_worker::{JobExecutor, LocalJobServer, RunnerConfig};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting runq-node");

    if let Err(e) = run().await {
        error!("runq-node failed: {:#}", e);
        std::process::exit(1);
    }

    info!("runq-node shutdown complete");
}

/// Colored output for dev, JSON for production.
fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn run() -> anyhow::Result<()> {
    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = addr.parse().context("METRICS_ADDR must be <host>:<port>")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Serving metrics on {}", addr);
    }

    let dispatcher = Arc::new(Dispatcher::in_memory(DispatcherConfig::from_env()));
    let mut config = RunnerConfig::from_env();

    // the local runner registers with its own token
    let token = if config.registration_secret.is_empty() {
        RegistrationToken::generate()
    } else {
        RegistrationToken {
            secret: config.registration_secret.clone(),
            ..RegistrationToken::generate()
        }
    };
    config.registration_secret = token.secret.clone();
    dispatcher.registry().add_registration_token(token).await;

    enqueue_live_inputs(&dispatcher).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watchdog = Watchdog::new(Arc::clone(&dispatcher), WatchdogConfig::from_env());
    let watchdog_rx = shutdown_rx.clone();
    let watchdog_handle = tokio::spawn(async move { watchdog.run(watchdog_rx).await });

    let mut events = dispatcher.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                debug!(target: "runq::events", "{}", json);
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let server = Arc::new(LocalJobServer::new(Arc::clone(&dispatcher)));
    let executor = JobExecutor::with_ffmpeg(config, server);
    executor.run(shutdown_rx).await?;

    if let Err(e) = watchdog_handle.await {
        warn!("Watchdog task ended abnormally: {}", e);
    }

    Ok(())
}

/// Enqueue one live job per URL in `RUNQ_LIVE_INPUTS` (comma separated),
/// transcoded to the heights in `RUNQ_LIVE_RESOLUTIONS` (`0` is audio only).
async fn enqueue_live_inputs(dispatcher: &Dispatcher) -> anyhow::Result<()> {
    let Ok(inputs) = std::env::var("RUNQ_LIVE_INPUTS") else {
        return Ok(());
    };

    let resolutions = std::env::var("RUNQ_LIVE_RESOLUTIONS").unwrap_or_else(|_| "720,480".to_string());
    let outputs = resolutions
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map(|resolution| OutputResolution { resolution, fps: 30 })
                .with_context(|| format!("Invalid resolution '{}' in RUNQ_LIVE_RESOLUTIONS", s))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    for url in inputs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let payload = LiveRtmpHlsTranscodingPayload::new(url, outputs.clone());
        let request = EnqueueJob::live(&payload)
            .map_err(|e| anyhow::anyhow!("Invalid live input '{}': {}", url, e))?;
        let job_id = dispatcher.enqueue(request).await?;
        info!(job_id = %job_id, "Enqueued live transcoding of {}", url);
    }

    Ok(())
}
