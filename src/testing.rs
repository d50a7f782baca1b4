/// In-memory stand-ins for the serial port, collector and registry
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::macros::datetime;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::models::{Assignment, Reading};
use crate::network::collector::{
    Acceptance, AssignmentReply, Collector, DeliveryError, Registration, Registry,
};
use crate::network::connectivity::Probe;
use crate::sensor::frame::{checksum, validate, ValidatedFrame, RESPONSE_LENGTH};
use crate::sensor::link::{PortOpener, SerialChannel, SerialSettings};

/// Valid response: moisture 50.0, temperature 25.0, conductivity 10.0,
/// pH 6.5, N 3.0, P 1.5, K 4.0
pub const SAMPLE_RESPONSE: [u8; RESPONSE_LENGTH] = [
    0x01, 0x03, 0x0E, 0x01, 0xF4, 0x00, 0xFA, 0x00, 0x64, 0x00, 0x41, 0x00, 0x1E, 0x00, 0x0F,
    0x00, 0x28, 0xD0, 0xA3,
];

/// Build a response frame around seven raw register values
pub fn frame_with_crc(registers: &[u16; 7]) -> [u8; RESPONSE_LENGTH] {
    let mut frame = [0u8; RESPONSE_LENGTH];
    frame[..3].copy_from_slice(&[0x01, 0x03, 0x0E]);
    for (i, value) in registers.iter().enumerate() {
        frame[3 + i * 2..5 + i * 2].copy_from_slice(&value.to_be_bytes());
    }
    let crc = checksum(&frame[..RESPONSE_LENGTH - 2]).to_le_bytes();
    frame[RESPONSE_LENGTH - 2..].copy_from_slice(&crc);
    frame
}

pub fn sample_frame() -> ValidatedFrame {
    validate(&SAMPLE_RESPONSE).unwrap()
}

pub fn sample_reading(device_id: &str) -> Reading {
    Reading::new(
        device_id,
        datetime!(2024-05-01 12:30:00 UTC),
        &Assignment::Unassigned,
        &sample_frame(),
    )
}

/// Reading whose moisture register and capture second both equal `n`
pub fn numbered_reading(n: u16) -> Reading {
    let frame = frame_with_crc(&[n, 250, 100, 65, 30, 15, 40]);
    Reading::new(
        "dev-1",
        datetime!(2024-05-01 12:00:00 UTC) + time::Duration::seconds(i64::from(n)),
        &Assignment::Unassigned,
        &validate(&frame).unwrap(),
    )
}

pub fn assigned() -> Assignment {
    Assignment::Assigned {
        farm_id: Some("7".into()),
        zone_code: Some("B2".into()),
    }
}

#[derive(Default)]
struct CollectorState {
    reachable: bool,
    probes: usize,
    sent: Vec<Reading>,
    script: VecDeque<Result<Acceptance, DeliveryError>>,
}

/// Collector whose reachability and send results are set by the test.
/// Unscripted sends succeed while reachable and fail with a connection
/// error otherwise.
#[derive(Clone)]
pub struct FakeCollector {
    state: Arc<Mutex<CollectorState>>,
}

impl FakeCollector {
    pub fn new() -> Self {
        FakeCollector {
            state: Arc::new(Mutex::new(CollectorState {
                reachable: true,
                ..Default::default()
            })),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    pub fn push_send(&self, result: Result<Acceptance, DeliveryError>) {
        self.state.lock().unwrap().script.push_back(result);
    }

    pub fn probes(&self) -> usize {
        self.state.lock().unwrap().probes
    }

    pub fn sent(&self) -> Vec<Reading> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl Collector for FakeCollector {
    async fn send(&self, reading: &Reading) -> Result<Acceptance, DeliveryError> {
        let mut state = self.state.lock().unwrap();
        let result = match state.script.pop_front() {
            Some(result) => result,
            None if state.reachable => Ok(Acceptance::Delivered),
            None => Err(DeliveryError::Connection("network down".into())),
        };
        if result.is_ok() {
            state.sent.push(reading.clone());
        }
        result
    }
}

#[async_trait]
impl Probe for FakeCollector {
    fn target(&self) -> &str {
        "fake-collector"
    }

    async fn probe(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.probes += 1;
        state.reachable
    }
}

struct RegistryState {
    reply: Result<AssignmentReply, DeliveryError>,
    queries: usize,
    registrations: Vec<Registration>,
}

#[derive(Clone)]
pub struct FakeRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl FakeRegistry {
    pub fn new(reply: Result<AssignmentReply, DeliveryError>) -> Self {
        FakeRegistry {
            state: Arc::new(Mutex::new(RegistryState {
                reply,
                queries: 0,
                registrations: Vec::new(),
            })),
        }
    }

    pub fn set_reply(&self, reply: Result<AssignmentReply, DeliveryError>) {
        self.state.lock().unwrap().reply = reply;
    }

    pub fn queries(&self) -> usize {
        self.state.lock().unwrap().queries
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.state.lock().unwrap().registrations.clone()
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn register(&self, registration: &Registration) -> Result<(), DeliveryError> {
        self.state
            .lock()
            .unwrap()
            .registrations
            .push(registration.clone());
        Ok(())
    }

    async fn assignment(&self, _device_id: &str) -> Result<AssignmentReply, DeliveryError> {
        let mut state = self.state.lock().unwrap();
        state.queries += 1;
        state.reply.clone()
    }
}

/// How the simulated sensor answers one poll command
pub enum SerialReply {
    Frame(Vec<u8>),
    /// Written with a short pause between chunks
    Chunks(Vec<Vec<u8>>),
    /// Drops the device end of the pipe
    Hangup,
}

#[derive(Default)]
struct OpenerState {
    failures_left: usize,
    open_calls: usize,
    replies: VecDeque<SerialReply>,
    commands: Vec<Vec<u8>>,
}

/// Opens in-memory pipes served by a simulated sensor; polls with no
/// scripted reply left get silence
#[derive(Clone, Default)]
pub struct ScriptedOpener {
    state: Arc<Mutex<OpenerState>>,
}

impl ScriptedOpener {
    pub fn failing(failures: usize) -> Self {
        let opener = ScriptedOpener::default();
        opener.state.lock().unwrap().failures_left = failures;
        opener
    }

    pub fn replying(replies: Vec<SerialReply>) -> Self {
        let opener = ScriptedOpener::default();
        opener.state.lock().unwrap().replies = replies.into();
        opener
    }

    pub fn push_reply(&self, reply: SerialReply) {
        self.state.lock().unwrap().replies.push_back(reply);
    }

    pub fn open_calls(&self) -> usize {
        self.state.lock().unwrap().open_calls
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().commands.clone()
    }
}

#[async_trait]
impl PortOpener for ScriptedOpener {
    async fn open(&self, _settings: &SerialSettings) -> io::Result<Box<dyn SerialChannel>> {
        {
            let mut state = self.state.lock().unwrap();
            state.open_calls += 1;
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
            }
        }

        let (host, device) = tokio::io::duplex(256);
        tokio::spawn(serve_sensor(device, self.state.clone()));
        Ok(Box::new(host))
    }
}

async fn serve_sensor(mut device: DuplexStream, state: Arc<Mutex<OpenerState>>) {
    let mut command = [0u8; 8];
    loop {
        if device.read_exact(&mut command).await.is_err() {
            return;
        }
        let reply = {
            let mut state = state.lock().unwrap();
            state.commands.push(command.to_vec());
            state.replies.pop_front()
        };

        match reply {
            Some(SerialReply::Frame(bytes)) => {
                if device.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Some(SerialReply::Chunks(chunks)) => {
                for chunk in chunks {
                    if device.write_all(&chunk).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
            Some(SerialReply::Hangup) => return,
            None => {}
        }
    }
}
