/// Store-and-forward delivery: direct send with a durable fallback, and
/// ordered replay of the backlog
use log::{error, info, warn};
use std::time::Duration;
use tokio::time::Instant;

use crate::models::Reading;
use crate::network::{Acceptance, Collector, ConnectivityCache, ConnectivityState, Probe};
use crate::storage::{DurableQueue, QueueStats};

#[derive(Debug, Clone, Copy)]
pub struct DrainPolicy {
    /// Minimum time between two drains
    pub interval: Duration,
    pub batch_size: usize,
}

/// What happened to one freshly acquired reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(Acceptance),
    Queued,
    /// Rejected by the collector as unauthorized; intentionally not queued
    Dropped,
    /// Could not be sent nor persisted
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub remaining: usize,
}

pub struct DeliveryPipeline<C> {
    collector: C,
    queue: DurableQueue,
    connectivity: ConnectivityCache,
    drain: DrainPolicy,
    last_drain: Option<Instant>,
}

impl<C: Collector + Probe> DeliveryPipeline<C> {
    pub fn new(
        collector: C,
        queue: DurableQueue,
        connectivity: ConnectivityCache,
        drain: DrainPolicy,
    ) -> Self {
        DeliveryPipeline {
            collector,
            queue,
            connectivity,
            drain,
            last_drain: None,
        }
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Last cached reachability verdict for the collector, if any
    pub fn collector_state(&self) -> Option<ConnectivityState> {
        self.connectivity.state(self.collector.target())
    }

    /// Deliver one reading now if the collector is reachable, otherwise
    /// keep it for later. A successful send is followed by a drain when one
    /// is due.
    pub async fn deliver(&mut self, reading: Reading) -> DeliveryOutcome {
        if !self.connectivity.is_reachable(&self.collector).await {
            info!("No collector connection, storing offline");
            return self.store(reading).await;
        }

        match self.collector.send(&reading).await {
            Ok(acceptance) => {
                info!(
                    "Reading from {} at {} delivered ({:?})",
                    reading.device_id(),
                    reading.captured_at(),
                    acceptance
                );
                if let Some(report) = self.drain_if_due().await {
                    if report.attempted > 0 {
                        info!(
                            "Offline sync: {}/{} records delivered, {} remaining",
                            report.delivered, report.attempted, report.remaining
                        );
                    }
                }
                DeliveryOutcome::Delivered(acceptance)
            }
            Err(e) if !e.is_retryable() => {
                warn!(
                    "Dropping reading from {}: {}",
                    reading.captured_at(),
                    e
                );
                DeliveryOutcome::Dropped
            }
            Err(e) => {
                warn!("Collector send failed ({}), storing offline", e);
                self.store(reading).await
            }
        }
    }

    /// Drain unless one already ran within the drain interval
    pub async fn drain_if_due(&mut self) -> Option<DrainReport> {
        if let Some(last) = self.last_drain {
            if last.elapsed() < self.drain.interval {
                return None;
            }
        }
        Some(self.drain().await)
    }

    /// Replay the oldest batch, one entry at a time, stopping at the first
    /// failure so that nothing is confirmed ahead of an older pending entry
    pub async fn drain(&mut self) -> DrainReport {
        self.last_drain = Some(Instant::now());

        if self.queue.is_empty() {
            info!("No offline data to sync");
            return DrainReport::default();
        }
        let batch = self.queue.peek_batch(self.drain.batch_size);

        info!("Attempting to sync {} offline records", batch.len());
        let mut delivered = 0;
        for entry in &batch {
            match self.collector.send(&entry.reading).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(
                        "Sync stopped at queued record {} ({}): {}",
                        entry.seq,
                        entry.reading.captured_at(),
                        e
                    );
                    break;
                }
            }
        }

        if delivered > 0 {
            if let Err(e) = self.queue.acknowledge(delivered).await {
                error!("Failed to remove synced records: {}", e);
            }
        } else {
            warn!("Could not sync any offline records");
        }

        DrainReport {
            attempted: batch.len(),
            delivered,
            remaining: self.queue.len(),
        }
    }

    async fn store(&mut self, reading: Reading) -> DeliveryOutcome {
        match self.queue.enqueue(reading).await {
            Ok(()) => DeliveryOutcome::Queued,
            Err(e) => {
                error!("Offline save failed, reading lost: {}", e);
                DeliveryOutcome::Lost
            }
        }
    }
}
