/// Tracks whether this device is authorized to report, and where
use log::{info, warn};
use std::time::Duration;
use tokio::time::Instant;

use crate::models::Assignment;
use crate::network::{AssignmentReply, Registry};

/// Result of one assignment check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentUpdate {
    /// No fresh answer (skipped or failed); the previous state stands
    Unchanged,
    Updated(Assignment),
}

pub struct AssignmentTracker {
    device_id: String,
    current: Assignment,
    check_interval: Duration,
    last_check: Option<Instant>,
}

impl AssignmentTracker {
    pub fn new(device_id: &str, check_interval: Duration) -> Self {
        AssignmentTracker {
            device_id: device_id.to_string(),
            current: Assignment::Unassigned,
            check_interval,
            last_check: None,
        }
    }

    pub fn current(&self) -> &Assignment {
        &self.current
    }

    /// Ask the registry for the current assignment
    ///
    /// Unless `force` is set, a successful answer younger than the check
    /// interval is reused. Failed queries leave both the state and the
    /// check timestamp alone, so the next cycle asks again.
    pub async fn check<R: Registry + ?Sized>(&mut self, registry: &R, force: bool) -> AssignmentUpdate {
        if !force {
            if let Some(last) = self.last_check {
                if last.elapsed() < self.check_interval {
                    return AssignmentUpdate::Unchanged;
                }
            }
        }

        info!("Checking assignment status for sensor {}", self.device_id);
        let assignment = match registry.assignment(&self.device_id).await {
            Ok(AssignmentReply::Known(assignment)) => assignment,
            Ok(AssignmentReply::UnknownDevice) => {
                warn!("Sensor {} not found in system", self.device_id);
                Assignment::Unassigned
            }
            Err(e) => {
                warn!(
                    "Assignment check failed, keeping previous state ({}): {}",
                    self.current, e
                );
                return AssignmentUpdate::Unchanged;
            }
        };

        if assignment.is_assigned() {
            info!("Sensor assigned to {}", assignment);
        } else {
            info!("Sensor not assigned to any farm");
        }
        self.current = assignment.clone();
        self.last_check = Some(Instant::now());
        AssignmentUpdate::Updated(assignment)
    }
}
