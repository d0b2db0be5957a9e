use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PlantConfig {
    /// Number of processing lanes; each instrument is pinned to one
    #[serde(default = "defaults::lanes")]
    pub lanes: usize,
    #[serde(default = "defaults::lane_mailbox_capacity")]
    pub lane_mailbox_capacity: usize,
    /// Deltas held per instrument while waiting for a snapshot
    #[serde(default = "defaults::sequence_buffer_capacity")]
    pub sequence_buffer_capacity: usize,
    #[serde(default = "defaults::staleness_threshold_ms")]
    pub staleness_threshold_ms: u64,
    #[serde(default = "defaults::liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    /// Bounded queue between the router and each channel sink
    #[serde(default = "defaults::sink_queue_capacity")]
    pub sink_queue_capacity: usize,
    #[serde(default = "defaults::default_depth")]
    pub default_depth: usize,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub resync: ResyncConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ResyncConfig {
    #[serde(default = "defaults::initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "defaults::max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "defaults::multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    pub fn lanes() -> usize {
        4
    }

    pub fn lane_mailbox_capacity() -> usize {
        4096
    }

    pub fn sequence_buffer_capacity() -> usize {
        10_000
    }

    pub fn staleness_threshold_ms() -> u64 {
        30_000
    }

    pub fn liveness_interval_ms() -> u64 {
        5_000
    }

    pub fn sink_queue_capacity() -> usize {
        1 << 16 // 65536
    }

    pub fn default_depth() -> usize {
        5
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn initial_backoff_ms() -> u64 {
        250
    }

    pub fn max_backoff_ms() -> u64 {
        30_000
    }

    pub fn multiplier() -> f64 {
        2.0
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        ResyncConfig {
            initial_backoff_ms: defaults::initial_backoff_ms(),
            max_backoff_ms: defaults::max_backoff_ms(),
            multiplier: defaults::multiplier(),
            max_attempts: None,
        }
    }
}

impl Default for PlantConfig {
    fn default() -> Self {
        PlantConfig {
            lanes: defaults::lanes(),
            lane_mailbox_capacity: defaults::lane_mailbox_capacity(),
            sequence_buffer_capacity: defaults::sequence_buffer_capacity(),
            staleness_threshold_ms: defaults::staleness_threshold_ms(),
            liveness_interval_ms: defaults::liveness_interval_ms(),
            sink_queue_capacity: defaults::sink_queue_capacity(),
            default_depth: defaults::default_depth(),
            log_level: defaults::log_level(),
            resync: ResyncConfig::default(),
        }
    }
}

impl PlantConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: PlantConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("lanes", self.lanes),
            ("lane_mailbox_capacity", self.lane_mailbox_capacity),
            ("sequence_buffer_capacity", self.sequence_buffer_capacity),
            ("sink_queue_capacity", self.sink_queue_capacity),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        if self.staleness_threshold_ms == 0 {
            return Err(ConfigError::Invalid("staleness_threshold_ms must be greater than zero".into()));
        }
        if !(self.resync.multiplier >= 1.0) {
            return Err(ConfigError::Invalid("resync.multiplier must be at least 1.0".into()));
        }
        if self.resync.initial_backoff_ms > self.resync.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "resync.initial_backoff_ms exceeds resync.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}
