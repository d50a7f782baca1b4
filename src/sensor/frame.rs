/// Modbus RTU framing for the soil sensor: poll command, CRC and decoding
use thiserror::Error;

use crate::models::{Measurements, Tenths};

/// Total length of a holding-register response for seven registers:
/// address + function + byte count + 14 data bytes + 2 CRC bytes
pub const RESPONSE_LENGTH: usize = 19;

// Read holding registers: slave 0x01, function 0x03, start 0x0000, count 0x0007
const POLL_REQUEST: [u8; 6] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x07];

// Byte offsets of the seven big-endian registers, in channel order
const FIELD_OFFSETS: [usize; 7] = [3, 5, 7, 9, 11, 13, 15];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("response length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("CRC mismatch: computed {computed:#06x}, frame carries {received:#06x}")]
    ChecksumMismatch { computed: u16, received: u16 },
}

/// A response frame that passed length and CRC validation
///
/// Only [`validate`] constructs this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedFrame(Vec<u8>);

impl ValidatedFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// CRC-16/MODBUS: reflected polynomial 0xA001, initial value 0xFFFF
///
/// The trailer on the wire is this value in little-endian byte order.
pub fn checksum(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// The poll command sent to the sensor, CRC trailer included
pub fn build_command() -> [u8; 8] {
    let crc = checksum(&POLL_REQUEST).to_le_bytes();
    let mut command = [0u8; 8];
    command[..6].copy_from_slice(&POLL_REQUEST);
    command[6..].copy_from_slice(&crc);
    command
}

/// Check length and CRC of a raw response
pub fn validate(frame: &[u8]) -> Result<ValidatedFrame, FrameError> {
    if frame.len() != RESPONSE_LENGTH {
        return Err(FrameError::LengthMismatch {
            expected: RESPONSE_LENGTH,
            actual: frame.len(),
        });
    }

    let (body, trailer) = frame.split_at(RESPONSE_LENGTH - 2);
    let computed = checksum(body);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    if computed != received {
        return Err(FrameError::ChecksumMismatch { computed, received });
    }

    Ok(ValidatedFrame(frame.to_vec()))
}

/// Extract the seven channels from a validated frame
pub fn decode(frame: &ValidatedFrame) -> Measurements {
    let bytes = frame.as_bytes();
    let field = |index: usize| {
        let offset = FIELD_OFFSETS[index];
        Tenths::from_raw(u16::from_be_bytes([bytes[offset], bytes[offset + 1]]))
    };

    Measurements {
        moisture: field(0),
        temperature: field(1),
        conductivity: field(2),
        ph: field(3),
        nitrogen: field(4),
        phosphorus: field(5),
        potassium: field(6),
    }
}
