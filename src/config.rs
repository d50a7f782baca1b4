use log::info;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_COLLECTOR_URLS: &str = "http://192.168.1.80:5000/api,http://192.168.1.95:5000/api";
const MIN_MEASUREMENT_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DEVICE_ID not set and /etc/machine-id unreadable")]
    MissingDeviceId,
    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("collector URL '{0}' must start with http:// or https://")]
    BadScheme(String),
    #[error("collector URL '{url}' does not parse: {source}")]
    BadUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("COLLECTOR_URLS lists no endpoints")]
    NoCollectors,
    #[error("MEASUREMENT_INTERVAL_SECS should be at least 30 seconds")]
    IntervalTooShort,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub device_id: String,
    pub serial_port: String,
    pub baud_rate: u32,
    pub serial_timeout: Duration,
    pub serial_max_attempts: u32,
    pub serial_retry_delay: Duration,
    /// Tried in order: gateway first, then the direct database endpoint
    pub collector_urls: Vec<Url>,
    pub http_timeout: Duration,
    pub probe_timeout: Duration,
    pub connectivity_ttl: Duration,
    pub measurement_interval: Duration,
    pub min_sleep: Duration,
    pub assignment_check_interval: Duration,
    pub drain_interval: Duration,
    pub drain_batch_size: usize,
    pub queue_path: PathBuf,
    pub queue_capacity: usize,
}

impl AgentConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        let config = Self::from_lookup(|key| env::var(key).ok())?;
        info!("Machine ID: {}", config.device_id);
        for url in &config.collector_urls {
            info!("Collector endpoint: {}", url);
        }
        Ok(config)
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let device_id = match lookup("DEVICE_ID").filter(|id| !id.trim().is_empty()) {
            Some(id) => id.trim().to_string(),
            None => fs::read_to_string("/etc/machine-id")
                .ok()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .ok_or(ConfigError::MissingDeviceId)?,
        };

        let collector_urls = parse_collector_urls(
            &lookup("COLLECTOR_URLS").unwrap_or_else(|| DEFAULT_COLLECTOR_URLS.to_string()),
        )?;

        let config = AgentConfig {
            device_id,
            serial_port: lookup("SERIAL_PORT").unwrap_or_else(|| "/dev/ttyUSB0".to_string()),
            baud_rate: parse_or(&lookup, "SERIAL_BAUDRATE", 9600)?,
            serial_timeout: Duration::from_millis(parse_or(&lookup, "SERIAL_TIMEOUT_MS", 1000)?),
            serial_max_attempts: parse_or(&lookup, "SERIAL_MAX_ATTEMPTS", 3)?,
            serial_retry_delay: secs(&lookup, "SERIAL_RETRY_DELAY_SECS", 5)?,
            collector_urls,
            http_timeout: secs(&lookup, "HTTP_TIMEOUT_SECS", 10)?,
            probe_timeout: secs(&lookup, "PROBE_TIMEOUT_SECS", 5)?,
            connectivity_ttl: secs(&lookup, "CONNECTIVITY_TTL_SECS", 300)?,
            measurement_interval: secs(&lookup, "MEASUREMENT_INTERVAL_SECS", 300)?,
            min_sleep: secs(&lookup, "MIN_SLEEP_SECS", 1)?,
            assignment_check_interval: secs(&lookup, "ASSIGNMENT_CHECK_INTERVAL_SECS", 14400)?,
            drain_interval: secs(&lookup, "DRAIN_INTERVAL_SECS", 900)?,
            drain_batch_size: parse_or(&lookup, "DRAIN_BATCH_SIZE", 20)?,
            queue_path: lookup("QUEUE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/home/pi/sensor_data/offline_queue.jsonl")),
            queue_capacity: parse_or(&lookup, "QUEUE_CAPACITY", 1000)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.measurement_interval < Duration::from_secs(MIN_MEASUREMENT_INTERVAL_SECS) {
            return Err(ConfigError::IntervalTooShort);
        }
        if self.serial_max_attempts == 0 {
            return Err(ConfigError::Zero("SERIAL_MAX_ATTEMPTS"));
        }
        if self.drain_batch_size == 0 {
            return Err(ConfigError::Zero("DRAIN_BATCH_SIZE"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("QUEUE_CAPACITY"));
        }
        Ok(())
    }
}

fn parse_collector_urls(raw: &str) -> Result<Vec<Url>, ConfigError> {
    let mut urls = Vec::new();
    for candidate in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let url = Url::parse(candidate).map_err(|source| ConfigError::BadUrl {
            url: candidate.to_string(),
            source,
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::BadScheme(candidate.to_string()));
        }
        urls.push(url);
    }

    if urls.is_empty() {
        return Err(ConfigError::NoCollectors);
    }
    Ok(urls)
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => {
            let parsed = value.trim().parse();
            parsed.map_err(|_| ConfigError::Invalid { key, value })
        }
        None => Ok(default),
    }
}

fn secs<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default).map(Duration::from_secs)
}
