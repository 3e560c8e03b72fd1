use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::calendar::LocalCalendar;
use crate::limits::{MAX_SLOT_STEP_MIN, MIN_SLOT_STEP_MIN};
use crate::scheduler::SchedulerSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0}")]
    Timezone(#[from] crate::calendar::CalendarError),
    #[error("SPOT_SLOT_STEP_MINUTES out of range: {0}")]
    SlotStep(u32),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Server settings, read from `SPOT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub calendar: LocalCalendar,
    pub slot_step_min: u32,
    pub admission_timeout: Duration,
    pub notify_queue_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let calendar = match lookup("SPOT_TIMEZONE") {
            Some(name) => LocalCalendar::from_name(&name)?,
            None => LocalCalendar::default(),
        };
        let slot_step_min = parsed(&lookup, "SPOT_SLOT_STEP_MINUTES")?.unwrap_or(30);
        if !(MIN_SLOT_STEP_MIN..=MAX_SLOT_STEP_MIN).contains(&slot_step_min) {
            return Err(ConfigError::SlotStep(slot_step_min));
        }
        let max_connections = parsed(&lookup, "SPOT_MAX_CONNECTIONS")?.unwrap_or(256);
        if max_connections == 0 {
            return Err(ConfigError::Zero("SPOT_MAX_CONNECTIONS"));
        }
        let notify_queue_capacity = parsed(&lookup, "SPOT_NOTIFY_QUEUE_CAPACITY")?.unwrap_or(1024);
        if notify_queue_capacity == 0 {
            return Err(ConfigError::Zero("SPOT_NOTIFY_QUEUE_CAPACITY"));
        }

        Ok(Self {
            bind: lookup("SPOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "SPOT_PORT")?.unwrap_or(5433),
            data_dir: PathBuf::from(lookup("SPOT_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("SPOT_PASSWORD").unwrap_or_else(|| "spot".into()),
            max_connections,
            compact_threshold: parsed(&lookup, "SPOT_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls_cert: lookup("SPOT_TLS_CERT"),
            tls_key: lookup("SPOT_TLS_KEY"),
            metrics_port: parsed(&lookup, "SPOT_METRICS_PORT")?,
            calendar,
            slot_step_min,
            admission_timeout: Duration::from_millis(
                parsed(&lookup, "SPOT_ADMISSION_TIMEOUT_MS")?.unwrap_or(5000),
            ),
            notify_queue_capacity,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("spot.wal")
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            calendar: self.calendar,
            slot_step_min: self.slot_step_min,
            admission_timeout: self.admission_timeout,
        }
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
