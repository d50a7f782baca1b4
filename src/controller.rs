/// Fixed-cadence acquisition loop tying the sensor, assignment and
/// delivery together
use log::{error, info, warn};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::assignment::{AssignmentTracker, AssignmentUpdate};
use crate::network::{Collector, Probe, Registration, Registry};
use crate::pipeline::{DeliveryOutcome, DeliveryPipeline};
use crate::sensor::frame::RESPONSE_LENGTH;
use crate::sensor::link::{PortOpener, SensorLink};
use crate::utils::{cycle_sleep, format_datetime, format_wire_timestamp};

const SENSOR_TYPE: &str = "Soil_Monitor_V1";
const FIRMWARE_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy)]
pub struct CycleTiming {
    pub interval: Duration,
    pub min_sleep: Duration,
    /// Log a status block every this many cycles
    pub status_every: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Device not assigned; the sensor was not polled
    Suppressed,
    /// Link or frame problem; nothing to deliver this cycle
    NoData,
    Acquired(DeliveryOutcome),
}

/// Counters returned on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub readings_acquired: u64,
    pub queue_depth: usize,
}

pub struct Controller<O: PortOpener, C, R> {
    device_id: String,
    link: SensorLink<O>,
    assignment: AssignmentTracker,
    registry: R,
    pipeline: DeliveryPipeline<C>,
    timing: CycleTiming,
    cycles: u64,
    readings_acquired: u64,
}

impl<O, C, R> Controller<O, C, R>
where
    O: PortOpener,
    C: Collector + Probe,
    R: Registry,
{
    pub fn new(
        device_id: &str,
        link: SensorLink<O>,
        assignment: AssignmentTracker,
        registry: R,
        pipeline: DeliveryPipeline<C>,
        timing: CycleTiming,
    ) -> Self {
        Controller {
            device_id: device_id.to_string(),
            link,
            assignment,
            registry,
            pipeline,
            timing,
            cycles: 0,
            readings_acquired: 0,
        }
    }

    /// Best-effort registration plus a forced assignment check
    pub async fn start(&mut self) {
        let now = OffsetDateTime::now_utc();
        let registration = Registration {
            machine_id: self.device_id.clone(),
            connection_timestamp: format_wire_timestamp(&now).unwrap_or_else(|_| now.to_string()),
            sensor_type: SENSOR_TYPE.to_string(),
            firmware_version: FIRMWARE_VERSION.to_string(),
            response_length: RESPONSE_LENGTH,
        };

        info!("Registering sensor {}", self.device_id);
        if let Err(e) = self.registry.register(&registration).await {
            warn!("Registration failed, continuing: {}", e);
        }

        self.assignment.check(&self.registry, true).await;
        if let Err(e) = self.link.connect().await {
            warn!("Sensor not available at startup: {}", e);
        }
    }

    /// One acquisition/delivery cycle
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let previous = self.assignment.current().clone();
        if let AssignmentUpdate::Updated(assignment) =
            self.assignment.check(&self.registry, false).await
        {
            if assignment != previous {
                info!("Assignment changed: {} -> {}", previous, assignment);
            }
        }
        if !self.assignment.current().is_assigned() {
            warn!("Sensor not assigned - skipping data collection");
            return CycleOutcome::Suppressed;
        }

        if !self.link.is_connected() {
            if let Err(e) = self.link.connect().await {
                error!("No serial connection available: {}", e);
                return CycleOutcome::NoData;
            }
        }

        let reading = match self.link.poll(self.assignment.current()).await {
            Ok(reading) => reading,
            Err(e) => {
                warn!("No sensor data collected: {}", e);
                return CycleOutcome::NoData;
            }
        };

        self.readings_acquired += 1;
        info!("Data collected: {} total points", self.readings_acquired);
        CycleOutcome::Acquired(self.pipeline.deliver(reading).await)
    }

    /// Run cycles until `shutdown` flips to true (or its sender goes away)
    ///
    /// The flag is only looked at between cycles; the sleep in between wakes
    /// early on a change.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RunSummary {
        info!(
            "Starting main sensor monitoring loop, interval {}s",
            self.timing.interval.as_secs()
        );
        self.start().await;

        while !*shutdown.borrow() {
            let started = Instant::now();
            info!("Cycle {} starting", self.cycles + 1);

            self.run_cycle().await;
            self.cycles += 1;
            if self.timing.status_every > 0 && self.cycles % self.timing.status_every == 0 {
                self.log_status().await;
            }

            let elapsed = started.elapsed();
            let pause = cycle_sleep(self.timing.interval, elapsed, self.timing.min_sleep);
            info!(
                "Cycle {} completed in {:.1}s, sleeping for {:.1}s",
                self.cycles,
                elapsed.as_secs_f64(),
                pause.as_secs_f64()
            );

            tokio::select! {
                _ = sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            cycles: self.cycles,
            readings_acquired: self.readings_acquired,
            queue_depth: self.pipeline.queue_depth(),
        }
    }

    async fn log_status(&self) {
        info!(
            "Sensor status: link {:?}, {}",
            self.link.state(),
            self.assignment.current()
        );
        if let Some(state) = self.pipeline.collector_state() {
            info!(
                "Collector {}, checked {}s ago",
                if state.reachable { "reachable" } else { "unreachable" },
                state.checked_at.elapsed().as_secs()
            );
        }
        let stats = self.pipeline.queue_stats().await;
        info!(
            "Offline storage: {} records, {:.1} KB",
            stats.count,
            stats.approx_size_bytes as f64 / 1024.0
        );
        if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
            info!(
                "Offline backlog spans {} to {}",
                format_datetime(&oldest),
                format_datetime(&newest)
            );
        }
    }

    fn shutdown(mut self) -> RunSummary {
        info!("Beginning system shutdown");
        self.link.close();
        self.summary()
    }
}
