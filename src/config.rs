use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
}

mod duration_ms {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Two-tier buffer sizing and spillover watermarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum events held in the memory ring.
    pub memory_capacity: usize,
    /// Maximum events held in the disk overflow queue.
    pub disk_capacity: usize,
    /// Maximum bytes the disk overflow queue may occupy.
    pub max_disk_bytes: u64,
    pub disk_path: PathBuf,
    /// Memory occupancy percentage that starts spilling to disk.
    pub high_water_mark_percent: f64,
    /// Memory occupancy percentage that stops spilling. Must be below high.
    pub low_water_mark_percent: f64,
    pub compression_enabled: bool,
    /// Records older than this are removed by `sweep_expired`.
    #[serde(with = "duration_ms")]
    pub retention_period: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 100_000,
            disk_capacity: 1_000_000,
            max_disk_bytes: 1024 * 1024 * 1024, // 1GB
            disk_path: PathBuf::from("/tmp/rask-ingest-buffer/spill"),
            high_water_mark_percent: 80.0,
            low_water_mark_percent: 60.0,
            compression_enabled: true,
            retention_period: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial call.
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    pub queue_depth_threshold: usize,
    pub latency_threshold_ms: f64,
    /// Fraction of failed requests (0.0 to 1.0) that activates backpressure.
    pub error_rate_threshold: f64,
    #[serde(with = "duration_ms")]
    pub monitoring_interval: Duration,
    /// When enabled, thresholds relax while healthy and tighten under load.
    pub adaptive_thresholds: bool,
    /// Multiplicative step applied per evaluation when drifting thresholds.
    pub recovery_factor: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            queue_depth_threshold: 50_000,
            latency_threshold_ms: 500.0,
            error_rate_threshold: 0.1,
            monitoring_interval: Duration::from_secs(1),
            adaptive_thresholds: true,
            recovery_factor: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveBatchConfig {
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub target_latency_ms: f64,
    /// Fractional step used when growing or shrinking the batch size.
    pub adjustment_factor: f64,
    #[serde(with = "duration_ms")]
    pub evaluation_interval: Duration,
    /// Desired drain throughput in events per second.
    pub throughput_target: f64,
    pub adaptive_enabled: bool,
}

impl Default for AdaptiveBatchConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 1_000,
            min_batch_size: 100,
            max_batch_size: 10_000,
            target_latency_ms: 200.0,
            adjustment_factor: 0.2,
            evaluation_interval: Duration::from_secs(5),
            throughput_target: 10_000.0,
            adaptive_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowControlConfig {
    /// Number of priority tiers; priority 1 is the highest.
    pub priority_tiers: u8,
    /// Events admitted per tier per replenish interval.
    pub rate_limit_per_tier: usize,
    #[serde(with = "duration_ms")]
    pub replenish_interval: Duration,
    /// Randomize replenish timing by up to this fraction of the interval.
    pub replenish_jitter: f64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            priority_tiers: 4,
            rate_limit_per_tier: 25_000,
            replenish_interval: Duration::from_secs(1),
            replenish_jitter: 0.1,
        }
    }
}

/// Top-level configuration for the ingestion buffer core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub buffer: BufferConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub backpressure: BackpressureConfig,
    pub batching: AdaptiveBatchConfig,
    pub flow_control: FlowControlConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.memory_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "memory_capacity must be greater than zero".to_string(),
            ));
        }
        if self.buffer.disk_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "disk_capacity must be greater than zero".to_string(),
            ));
        }
        if self.buffer.high_water_mark_percent <= self.buffer.low_water_mark_percent {
            return Err(ConfigError::InvalidConfig(format!(
                "high water mark ({}) must be above low water mark ({})",
                self.buffer.high_water_mark_percent, self.buffer.low_water_mark_percent
            )));
        }
        if !(0.0..=100.0).contains(&self.buffer.high_water_mark_percent)
            || !(0.0..=100.0).contains(&self.buffer.low_water_mark_percent)
        {
            return Err(ConfigError::InvalidConfig(
                "watermarks must be percentages between 0 and 100".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidConfig(
                "failure_threshold must be greater than zero".to_string(),
            ));
        }
        if self.batching.min_batch_size == 0
            || self.batching.min_batch_size > self.batching.max_batch_size
        {
            return Err(ConfigError::InvalidConfig(format!(
                "batch bounds invalid: min={} max={}",
                self.batching.min_batch_size, self.batching.max_batch_size
            )));
        }
        if self.batching.initial_batch_size < self.batching.min_batch_size
            || self.batching.initial_batch_size > self.batching.max_batch_size
        {
            return Err(ConfigError::InvalidConfig(
                "initial_batch_size must lie within [min_batch_size, max_batch_size]".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.batching.adjustment_factor)
            || self.batching.adjustment_factor == 0.0
        {
            return Err(ConfigError::InvalidConfig(
                "adjustment_factor must be in (0, 1)".to_string(),
            ));
        }
        if self.flow_control.priority_tiers == 0 {
            return Err(ConfigError::InvalidConfig(
                "at least one priority tier is required".to_string(),
            ));
        }
        if self.flow_control.rate_limit_per_tier == 0 {
            return Err(ConfigError::InvalidConfig(
                "rate_limit_per_tier must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backpressure.error_rate_threshold) {
            return Err(ConfigError::InvalidConfig(
                "error_rate_threshold must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn inverted_watermarks_rejected() {
        let mut config = Config::default();
        config.buffer.high_water_mark_percent = 50.0;
        config.buffer.low_water_mark_percent = 70.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn batch_bounds_rejected_when_min_exceeds_max() {
        let mut config = Config::default();
        config.batching.min_batch_size = 5_000;
        config.batching.max_batch_size = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_preserves_durations() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(
            parsed.backpressure.monitoring_interval,
            config.backpressure.monitoring_interval
        );
        assert_eq!(parsed.buffer.memory_capacity, config.buffer.memory_capacity);
    }
}
