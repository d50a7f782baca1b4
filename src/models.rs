use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use time::OffsetDateTime;

use crate::sensor::frame::{decode, ValidatedFrame};

/// Fixed-point measurement stored as an integer number of tenths
///
/// The sensor reports every channel as a big-endian u16 scaled by 10.
/// Keeping the raw integer avoids float drift in queue files; the decimal
/// form is only produced on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tenths(u16);

impl Tenths {
    pub const fn from_raw(raw: u16) -> Self {
        Tenths(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub fn value(self) -> f64 {
        f64::from(self.raw()) / 10.0
    }
}

impl fmt::Display for Tenths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0 / 10, self.0 % 10)
    }
}

impl Serialize for Tenths {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.value())
    }
}

impl<'de> Deserialize<'de> for Tenths {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let decimal = f64::deserialize(deserializer)?;
        let scaled = (decimal * 10.0).round();
        if !(0.0..=f64::from(u16::MAX)).contains(&scaled) {
            return Err(D::Error::custom(format!(
                "measurement {} outside fixed-point range",
                decimal
            )));
        }
        Ok(Tenths(scaled as u16))
    }
}

/// The seven soil channels in hardware register order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurements {
    pub moisture: Tenths,
    pub temperature: Tenths,
    pub conductivity: Tenths,
    pub ph: Tenths,
    pub nitrogen: Tenths,
    pub phosphorus: Tenths,
    pub potassium: Tenths,
}

/// Authorization state of this device as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Assignment {
    #[default]
    Unassigned,
    Assigned {
        farm_id: Option<String>,
        zone_code: Option<String>,
    },
}

impl Assignment {
    pub fn is_assigned(&self) -> bool {
        matches!(self, Assignment::Assigned { .. })
    }

    pub fn farm_id(&self) -> Option<&str> {
        match self {
            Assignment::Assigned { farm_id, .. } => farm_id.as_deref(),
            Assignment::Unassigned => None,
        }
    }

    pub fn zone_code(&self) -> Option<&str> {
        match self {
            Assignment::Assigned { zone_code, .. } => zone_code.as_deref(),
            Assignment::Unassigned => None,
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assignment::Unassigned => write!(f, "unassigned"),
            Assignment::Assigned { .. } => write!(
                f,
                "farm {}, zone {}",
                self.farm_id().unwrap_or("-"),
                self.zone_code().unwrap_or("-")
            ),
        }
    }
}

/// One decoded sensor sample, as delivered to the collector and persisted
/// in the offline queue
///
/// A `Reading` can only be built from a [`ValidatedFrame`], so nothing that
/// failed length or CRC checks ever reaches storage or the network. The
/// serde encoding doubles as the collector's JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(rename = "machine_id")]
    device_id: String,
    #[serde(rename = "timestamp", with = "crate::utils::timestamp")]
    captured_at: OffsetDateTime,
    #[serde(default, deserialize_with = "crate::utils::string_or_number")]
    farm_id: Option<String>,
    #[serde(default, deserialize_with = "crate::utils::string_or_number")]
    zone_code: Option<String>,
    #[serde(flatten)]
    measurements: Measurements,
    crc_valid: bool,
    response_bytes: usize,
}

impl Reading {
    pub fn new(
        device_id: &str,
        captured_at: OffsetDateTime,
        assignment: &Assignment,
        frame: &ValidatedFrame,
    ) -> Self {
        Reading {
            device_id: device_id.to_string(),
            captured_at,
            farm_id: assignment.farm_id().map(str::to_string),
            zone_code: assignment.zone_code().map(str::to_string),
            measurements: decode(frame),
            crc_valid: true,
            response_bytes: frame.len(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn captured_at(&self) -> OffsetDateTime {
        self.captured_at
    }

    pub fn farm_id(&self) -> Option<&str> {
        self.farm_id.as_deref()
    }

    pub fn zone_code(&self) -> Option<&str> {
        self.zone_code.as_deref()
    }

    pub fn measurements(&self) -> &Measurements {
        &self.measurements
    }

    pub fn response_bytes(&self) -> usize {
        self.response_bytes
    }
}
