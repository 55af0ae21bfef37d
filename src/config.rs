//! Application settings.
//!
//! Built-in defaults are overridden by `MATATU_*` environment variables
//! (a `.env` file is loaded into the environment first by the binary), and
//! the CLI can override both.

use chrono::TimeDelta;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::RuntimeConfig;
use crate::error::ConfigError;

const ENV_PREFIX: &str = "MATATU_";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub application_id: String,
    pub partitions: u32,
    /// Recorded for parity with a broker deployment; the in-memory log ignores it
    pub replication_factor: u16,
    pub concurrency: usize,
    pub speed_threshold_kmh: f64,
    pub off_grid_silence: Duration,
    pub off_grid_check_interval: Duration,
    pub window_size: Duration,
    pub window_grace: Duration,
    pub commit_interval: Duration,
    pub poll_batch: usize,
    pub state_dir: PathBuf,
    pub routes_file: Option<PathBuf>,
    pub fleet_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application_id: "matatu-streams-app".to_string(),
            partitions: 3,
            replication_factor: 1,
            concurrency: 3,
            speed_threshold_kmh: 80.0,
            off_grid_silence: Duration::from_millis(300_000),
            off_grid_check_interval: Duration::from_millis(10_000),
            window_size: Duration::from_millis(60_000),
            window_grace: Duration::from_millis(10_000),
            commit_interval: Duration::from_millis(1_000),
            poll_batch: 500,
            state_dir: PathBuf::from("state"),
            routes_file: None,
            fleet_file: None,
        }
    }
}

impl Settings {
    /// Defaults overridden by `MATATU_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `MATATU_*` variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));
        let mut settings = Self::default();
        let mut concurrency_set = false;

        if let Some(v) = get("APPLICATION_ID") {
            settings.application_id = v;
        }
        if let Some(v) = get("PARTITIONS") {
            settings.partitions = parse("PARTITIONS", &v)?;
        }
        if let Some(v) = get("REPLICATION_FACTOR") {
            settings.replication_factor = parse("REPLICATION_FACTOR", &v)?;
        }
        if let Some(v) = get("CONCURRENCY") {
            settings.concurrency = parse("CONCURRENCY", &v)?;
            concurrency_set = true;
        }
        if let Some(v) = get("SPEED_THRESHOLD_KMH") {
            settings.speed_threshold_kmh = parse("SPEED_THRESHOLD_KMH", &v)?;
        }
        if let Some(v) = get("OFF_GRID_SILENCE_MS") {
            settings.off_grid_silence = millis("OFF_GRID_SILENCE_MS", &v)?;
        }
        if let Some(v) = get("OFF_GRID_CHECK_INTERVAL_MS") {
            settings.off_grid_check_interval = millis("OFF_GRID_CHECK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("WINDOW_SIZE_MS") {
            settings.window_size = millis("WINDOW_SIZE_MS", &v)?;
        }
        if let Some(v) = get("WINDOW_GRACE_MS") {
            settings.window_grace = millis("WINDOW_GRACE_MS", &v)?;
        }
        if let Some(v) = get("COMMIT_INTERVAL_MS") {
            settings.commit_interval = millis("COMMIT_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("POLL_BATCH") {
            settings.poll_batch = parse("POLL_BATCH", &v)?;
        }
        if let Some(v) = get("STATE_DIR") {
            settings.state_dir = PathBuf::from(v);
        }
        settings.routes_file = get("ROUTES_FILE").map(PathBuf::from);
        settings.fleet_file = get("FLEET_FILE").map(PathBuf::from);

        if !concurrency_set {
            settings.concurrency = settings.partitions as usize;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "application_id",
                value: self.application_id.clone(),
                reason: "must not be blank".to_string(),
            });
        }
        if self.partitions == 0 {
            return Err(ConfigError::Zero { name: "partitions" });
        }
        if self.window_size.is_zero() {
            return Err(ConfigError::Zero { name: "window_size" });
        }
        if self.off_grid_check_interval.is_zero() {
            return Err(ConfigError::Zero {
                name: "off_grid_check_interval",
            });
        }
        if self.poll_batch == 0 {
            return Err(ConfigError::Zero { name: "poll_batch" });
        }
        if !self.speed_threshold_kmh.is_finite() || self.speed_threshold_kmh < 0.0 {
            return Err(ConfigError::Invalid {
                name: "speed_threshold_kmh",
                value: self.speed_threshold_kmh.to_string(),
                reason: "must be a non-negative number".to_string(),
            });
        }
        Ok(())
    }

    /// Worker count actually used: `concurrency` clamped to `1..=partitions`.
    pub fn workers(&self) -> usize {
        self.concurrency.clamp(1, self.partitions.max(1) as usize)
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            partitions: self.partitions,
            concurrency: self.workers(),
            poll_batch: self.poll_batch,
            commit_interval: self.commit_interval,
            state_dir: Some(self.state_dir.clone()),
            ..RuntimeConfig::default()
        }
    }

    pub fn window_size_delta(&self) -> TimeDelta {
        to_delta(self.window_size)
    }

    pub fn window_grace_delta(&self) -> TimeDelta {
        to_delta(self.window_grace)
    }

    pub fn off_grid_silence_delta(&self) -> TimeDelta {
        to_delta(self.off_grid_silence)
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn millis(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(name, value).map(Duration::from_millis)
}
