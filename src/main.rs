mod assignment;
mod config;
mod controller;
mod models;
mod network;
mod pipeline;
mod sensor;
mod storage;
#[cfg(test)]
mod testing;
mod utils;

use log::{error, info, warn};
use tokio::sync::watch;

use assignment::AssignmentTracker;
use config::AgentConfig;
use controller::{Controller, CycleTiming};
use network::{ConnectivityCache, HttpCollector};
use pipeline::{DeliveryPipeline, DrainPolicy};
use sensor::{RetryPolicy, SensorLink, SerialSettings, TtyOpener};
use storage::DurableQueue;

const STATUS_EVERY_CYCLES: u64 = 12;

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match AgentConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!("Soil sensor agent starting");
    info!("Response length: {} bytes", sensor::frame::RESPONSE_LENGTH);

    let collector = HttpCollector::new(
        config.collector_urls.clone(),
        config.http_timeout,
        config.probe_timeout,
    )?;
    let registry = collector.clone();

    let queue = match DurableQueue::open(&config.queue_path, config.queue_capacity).await {
        Ok(queue) => queue,
        Err(e) => {
            error!("Failed to open offline storage: {}", e);
            return Err(e.into());
        }
    };

    let link = SensorLink::new(
        TtyOpener,
        SerialSettings {
            path: config.serial_port.clone(),
            baud_rate: config.baud_rate,
            read_timeout: config.serial_timeout,
        },
        RetryPolicy {
            max_attempts: config.serial_max_attempts,
            delay: config.serial_retry_delay,
        },
        &config.device_id,
    );
    let pipeline = DeliveryPipeline::new(
        collector,
        queue,
        ConnectivityCache::new(config.connectivity_ttl),
        DrainPolicy {
            interval: config.drain_interval,
            batch_size: config.drain_batch_size,
        },
    );
    let controller = Controller::new(
        &config.device_id,
        link,
        AssignmentTracker::new(&config.device_id, config.assignment_check_interval),
        registry,
        pipeline,
        CycleTiming {
            interval: config.measurement_interval,
            min_sleep: config.min_sleep,
            status_every: STATUS_EVERY_CYCLES,
        },
    );

    // Handle Ctrl+C / SIGTERM gracefully: finish the running cycle, then stop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested, finishing current cycle");
        let _ = shutdown_tx.send(true);
    });

    let summary = controller.run(shutdown_rx).await;

    info!("Final statistics");
    info!("  Cycles completed: {}", summary.cycles);
    info!("  Data points collected: {}", summary.readings_acquired);
    info!("  Offline records: {}", summary.queue_depth);
    info!("Soil sensor agent stopped");

    Ok(())
}
