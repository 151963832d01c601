//! Engine and server configuration, validated and constructed via a builder.
//!
//! Mirrors the teacher repo's `LsmConfig`/`LsmConfigBuilder` shape: plain
//! struct with `Default`, a `validate()` pass, and a builder that defers to
//! the defaults for any field the caller didn't set.

use std::path::PathBuf;

use crate::error::{NexaError, Result};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub memtable_max_bytes: usize,
    pub compaction_threshold: usize,
    pub index_interval: usize,
    pub bloom_fp_rate: f64,
    pub wal_batch_max_records: usize,
    pub wal_batch_linger: std::time::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./nexadb_data"),
            memtable_max_bytes: 4 * 1024 * 1024,
            compaction_threshold: 3,
            index_interval: 128,
            bloom_fp_rate: 0.01,
            wal_batch_max_records: 500,
            wal_batch_linger: std::time::Duration::from_millis(5),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.memtable_max_bytes == 0 {
            return Err(NexaError::Internal(
                "memtable_max_bytes cannot be 0".into(),
            ));
        }
        if self.compaction_threshold < 2 {
            return Err(NexaError::Internal(
                "compaction_threshold must be at least 2".into(),
            ));
        }
        if self.index_interval == 0 {
            return Err(NexaError::Internal("index_interval cannot be 0".into()));
        }
        if !(self.bloom_fp_rate > 0.0 && self.bloom_fp_rate < 1.0) {
            return Err(NexaError::Internal(
                "bloom_fp_rate must be in (0, 1)".into(),
            ));
        }
        Ok(())
    }

    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Reads `NEXADB_*` environment variables, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder();
        if let Ok(dir) = std::env::var("NEXADB_DATA_DIR") {
            builder = builder.data_dir(dir);
        }
        if let Some(n) = std::env::var("NEXADB_MEMTABLE_MAX_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            builder = builder.memtable_max_bytes(n);
        }
        if let Some(n) = std::env::var("NEXADB_COMPACTION_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            builder = builder.compaction_threshold(n);
        }
        builder.build()
    }
}

#[derive(Default)]
pub struct EngineConfigBuilder {
    data_dir: Option<PathBuf>,
    memtable_max_bytes: Option<usize>,
    compaction_threshold: Option<usize>,
    index_interval: Option<usize>,
    bloom_fp_rate: Option<f64>,
    wal_batch_max_records: Option<usize>,
    wal_batch_linger: Option<std::time::Duration>,
}

impl EngineConfigBuilder {
    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn memtable_max_bytes(mut self, n: usize) -> Self {
        self.memtable_max_bytes = Some(n);
        self
    }

    pub fn compaction_threshold(mut self, n: usize) -> Self {
        self.compaction_threshold = Some(n);
        self
    }

    pub fn index_interval(mut self, n: usize) -> Self {
        self.index_interval = Some(n);
        self
    }

    pub fn bloom_fp_rate(mut self, rate: f64) -> Self {
        self.bloom_fp_rate = Some(rate);
        self
    }

    pub fn wal_batch_max_records(mut self, n: usize) -> Self {
        self.wal_batch_max_records = Some(n);
        self
    }

    pub fn wal_batch_linger(mut self, d: std::time::Duration) -> Self {
        self.wal_batch_linger = Some(d);
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            data_dir: self.data_dir.unwrap_or(defaults.data_dir),
            memtable_max_bytes: self
                .memtable_max_bytes
                .unwrap_or(defaults.memtable_max_bytes),
            compaction_threshold: self
                .compaction_threshold
                .unwrap_or(defaults.compaction_threshold),
            index_interval: self.index_interval.unwrap_or(defaults.index_interval),
            bloom_fp_rate: self.bloom_fp_rate.unwrap_or(defaults.bloom_fp_rate),
            wal_batch_max_records: self
                .wal_batch_max_records
                .unwrap_or(defaults.wal_batch_max_records),
            wal_batch_linger: self.wal_batch_linger.unwrap_or(defaults.wal_batch_linger),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub worker_pool_size: usize,
    pub max_in_flight_bytes: usize,
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4455,
            worker_pool_size: 100,
            max_in_flight_bytes: 16 * 1024 * 1024,
            auth_token: None,
        }
    }
}

impl ServerConfig {
    /// Reads `NEXADB_*` environment variables, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("NEXADB_HOST").unwrap_or(defaults.host),
            port: std::env::var("NEXADB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            worker_pool_size: std::env::var("NEXADB_WORKER_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.worker_pool_size),
            max_in_flight_bytes: defaults.max_in_flight_bytes,
            auth_token: std::env::var("NEXADB_AUTH_TOKEN").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_rejects_zero_memtable_size() {
        let result = EngineConfig::builder().memtable_max_bytes(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_applies_overrides() {
        let config = EngineConfig::builder()
            .data_dir("/tmp/nexadb-test")
            .memtable_max_bytes(1024 * 1024)
            .compaction_threshold(4)
            .build()
            .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/nexadb-test"));
        assert_eq!(config.memtable_max_bytes, 1024 * 1024);
        assert_eq!(config.compaction_threshold, 4);
    }
}
