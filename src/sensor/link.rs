/// Serial connection lifecycle and the poll exchange with the soil sensor
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::io;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortBuilderExt, StopBits};

use crate::models::{Assignment, Reading};
use crate::sensor::frame::{build_command, validate, FrameError, RESPONSE_LENGTH};

/// Byte stream the link talks over; a real tty or an in-memory pipe in tests
pub trait SerialChannel: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> SerialChannel for T {}

/// Opens the serial channel; separated out so the link can be driven
/// without hardware
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, settings: &SerialSettings) -> io::Result<Box<dyn SerialChannel>>;
}

/// Line parameters: 8 data bits, no parity, 1 stop bit are fixed by the
/// sensor; path, baud rate and read timeout are configurable.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// Opens a real tty through tokio-serial
pub struct TtyOpener;

#[async_trait]
impl PortOpener for TtyOpener {
    async fn open(&self, settings: &SerialSettings) -> io::Result<Box<dyn SerialChannel>> {
        let stream = tokio_serial::new(&settings.path, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(settings.read_timeout)
            .open_native_async()?;
        // Bytes left over from an earlier session would misalign the next frame
        if let Err(e) = stream.clear(ClearBuffer::Input) {
            warn!("Could not clear input buffer of {}: {}", settings.path, e);
        }
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("serial port {port} unavailable after {attempts} attempts")]
    Unavailable {
        port: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("short frame: expected {expected} bytes, received {received}")]
    ShortFrame { expected: usize, received: usize },
    #[error("invalid frame: {0}")]
    Invalid(#[from] FrameError),
    #[error("serial link down: {0}")]
    LinkDown(#[source] io::Error),
}

pub struct SensorLink<O: PortOpener> {
    opener: O,
    settings: SerialSettings,
    retry: RetryPolicy,
    device_id: String,
    port: Option<Box<dyn SerialChannel>>,
    state: LinkState,
}

impl<O: PortOpener> SensorLink<O> {
    pub fn new(opener: O, settings: SerialSettings, retry: RetryPolicy, device_id: &str) -> Self {
        SensorLink {
            opener,
            settings,
            retry,
            device_id: device_id.to_string(),
            port: None,
            state: LinkState::Disconnected,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Open the port, retrying with a fixed delay
    ///
    /// Exhausting the attempts leaves the link `Disconnected`; the caller is
    /// expected to try again on its next cycle.
    pub async fn connect(&mut self) -> Result<(), LinkError> {
        if self.is_connected() {
            return Ok(());
        }

        info!("Initializing serial connection to {}", self.settings.path);
        self.state = LinkState::Connecting;
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.opener.open(&self.settings).await {
                Ok(port) => {
                    self.port = Some(port);
                    self.state = LinkState::Connected;
                    info!(
                        "Serial connected to {} at {} baud",
                        self.settings.path, self.settings.baud_rate
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("Serial attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        sleep(self.retry.delay).await;
                    }
                }
            }
        }

        self.state = LinkState::Disconnected;
        error!(
            "Failed to initialize serial connection after {} attempts",
            attempts
        );
        Err(LinkError::Unavailable {
            port: self.settings.path.clone(),
            attempts,
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no attempt made")),
        })
    }

    /// One request/response exchange with the sensor
    ///
    /// Any failure drops the port, so the next cycle reopens it with an
    /// empty input buffer.
    pub async fn poll(&mut self, assignment: &Assignment) -> Result<Reading, AcquisitionError> {
        let read_timeout = self.settings.read_timeout;
        let port = match self.port.as_mut() {
            Some(port) => port,
            None => {
                return Err(AcquisitionError::LinkDown(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "serial port not open",
                )))
            }
        };

        let result = exchange(&mut **port, read_timeout).await;
        let response = match result {
            Ok(response) => response,
            Err(AcquisitionError::LinkDown(e)) => {
                error!("Serial error: {}", e);
                self.mark_down();
                return Err(AcquisitionError::LinkDown(e));
            }
            Err(e) => {
                // A late tail would prefix the next response; reopen to resync
                warn!("{}", e);
                self.mark_down();
                return Err(e);
            }
        };

        let frame = match validate(&response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Frame rejected: {}", e);
                self.mark_down();
                return Err(AcquisitionError::Invalid(e));
            }
        };

        let reading = Reading::new(
            &self.device_id,
            OffsetDateTime::now_utc(),
            assignment,
            &frame,
        );
        debug!(
            "{} valid bytes from {} (farm {}, zone {})",
            reading.response_bytes(),
            reading.device_id(),
            reading.farm_id().unwrap_or("-"),
            reading.zone_code().unwrap_or("-")
        );
        info!(
            "Sensor data collected: moisture={}%, temperature={}°C",
            reading.measurements().moisture,
            reading.measurements().temperature
        );
        Ok(reading)
    }

    /// Release the port; calling it again is a no-op
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Serial connection closed");
        }
        self.state = LinkState::Disconnected;
    }

    fn mark_down(&mut self) {
        self.port = None;
        self.state = LinkState::Disconnected;
    }
}

async fn exchange(
    port: &mut dyn SerialChannel,
    read_timeout: Duration,
) -> Result<Vec<u8>, AcquisitionError> {
    let command = build_command();
    port.write_all(&command)
        .await
        .map_err(AcquisitionError::LinkDown)?;
    port.flush().await.map_err(AcquisitionError::LinkDown)?;

    let mut response = vec![0u8; RESPONSE_LENGTH];
    let mut received = read_with_deadline(port, &mut response, read_timeout)
        .await
        .map_err(AcquisitionError::LinkDown)?;

    if received < RESPONSE_LENGTH {
        warn!(
            "Response length mismatch. Expected {}, got {}",
            RESPONSE_LENGTH, received
        );
        let additional = read_with_deadline(port, &mut response[received..], read_timeout)
            .await
            .map_err(AcquisitionError::LinkDown)?;
        debug!("Read additional {} bytes", additional);
        received += additional;
    }

    if received < RESPONSE_LENGTH {
        return Err(AcquisitionError::ShortFrame {
            expected: RESPONSE_LENGTH,
            received,
        });
    }

    Ok(response)
}

/// Fill `buf` until it is full or `read_timeout` elapses
///
/// Returns the number of bytes read. A closed stream is an error: serial
/// devices do not signal end-of-file while attached.
async fn read_with_deadline(
    port: &mut dyn SerialChannel,
    buf: &mut [u8],
    read_timeout: Duration,
) -> io::Result<usize> {
    let deadline = Instant::now() + read_timeout;
    let mut filled = 0;

    while filled < buf.len() {
        match timeout_at(deadline, port.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial stream closed",
                ))
            }
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => break,
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => break,
        }
    }

    Ok(filled)
}
