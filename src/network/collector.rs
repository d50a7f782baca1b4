/// Collector and registry contracts shared by the HTTP client and the
/// delivery pipeline
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Assignment, Reading};

/// Positive answers from the collector; all of them count as delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// 200
    Delivered,
    /// 202: accepted, queued on the collector side
    QueuedRemotely,
    /// 503: collector backend offline, reading stored for later
    StoredOffline,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("rejected by collector: device not assigned")]
    Rejected,
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
}

impl DeliveryError {
    /// Authorization rejections are final; everything else may succeed later
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Rejected)
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::Timeout
        } else if e.is_decode() {
            DeliveryError::InvalidResponse(e.to_string())
        } else {
            DeliveryError::Connection(e.to_string())
        }
    }
}

/// Map a `POST /sensor-data` status code to the delivery taxonomy
pub fn classify_send_status(status: u16) -> Result<Acceptance, DeliveryError> {
    match status {
        200 => Ok(Acceptance::Delivered),
        202 => Ok(Acceptance::QueuedRemotely),
        503 => Ok(Acceptance::StoredOffline),
        403 => Err(DeliveryError::Rejected),
        other => Err(DeliveryError::UnexpectedStatus(other)),
    }
}

/// Answer to an assignment query that reached the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentReply {
    Known(Assignment),
    /// 404: the registry has never heard of this device
    UnknownDevice,
}

/// Body of `GET /sensors/{id}/assignment`
#[derive(Debug, Deserialize)]
pub struct AssignmentBody {
    pub assigned: bool,
    #[serde(default, deserialize_with = "crate::utils::string_or_number")]
    pub farm_id: Option<String>,
    #[serde(default, deserialize_with = "crate::utils::string_or_number")]
    pub zone_code: Option<String>,
}

impl From<AssignmentBody> for Assignment {
    fn from(body: AssignmentBody) -> Self {
        if body.assigned {
            Assignment::Assigned {
                farm_id: body.farm_id,
                zone_code: body.zone_code,
            }
        } else {
            Assignment::Unassigned
        }
    }
}

/// Identity and capabilities announced on startup
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub machine_id: String,
    pub connection_timestamp: String,
    pub sensor_type: String,
    pub firmware_version: String,
    pub response_length: usize,
}

/// Remote sink for readings
#[async_trait]
pub trait Collector: Send + Sync {
    async fn send(&self, reading: &Reading) -> Result<Acceptance, DeliveryError>;
}

/// Remote registration/assignment service
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<(), DeliveryError>;
    async fn assignment(&self, device_id: &str) -> Result<AssignmentReply, DeliveryError>;
}
