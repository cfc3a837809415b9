//! Engine configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest number of hash bits a spill partition id can be derived from.
pub const MAX_HASH_BITS: u8 = 64;

/// Deepest spill level a partition id can encode.
pub const MAX_SPILL_LEVEL: i32 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Hard memory cap (in bytes) shared by all operator pools of a query.
    pub mem_cap_bytes: usize,

    /// Upper bound on drivers per task; plans may lower it.
    pub max_drivers: usize,

    /// Number of executor threads running drivers.
    pub executor_threads: usize,

    /// Per-slice CPU budget of a driver before it yields. 0 disables slicing.
    pub driver_cpu_time_slice_limit_ms: u64,

    /// Bytes buffered by a task cursor before producers block.
    pub cursor_queue_max_bytes: usize,

    /// Master switch for operator spilling.
    pub spill_enabled: bool,

    /// Spilling switch for the row number operator.
    pub row_number_spill_enabled: bool,

    /// Directory for spill files (legacy local-path configuration).
    pub spill_dir: String,

    /// Optional fully-qualified spill URI (`file:///path` or `memory://`).
    pub spill_uri: Option<String>,

    /// Spill segment compression: `none`, `zstd` or `lz4`.
    pub spill_compression: String,

    /// First hash bit used to pick a spill partition.
    pub spill_start_partition_bit: u8,

    /// Number of hash bits per spill level.
    pub spill_num_partition_bits: u8,

    /// Deepest recursive spill level; -1 means unlimited.
    pub max_spill_level: i32,

    /// Bytes buffered per spill partition before a segment is flushed.
    pub spill_write_buffer_size: u64,

    /// Read buffer size hint for spill readers.
    pub spill_read_buffer_size: u64,

    /// Minimum free reservation, as a percentage of current usage, an
    /// operator keeps before taking more input.
    pub min_spillable_reservation_pct: u32,

    /// Reservation growth step, as a percentage of current usage.
    pub spillable_reservation_growth_pct: u32,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            mem_cap_bytes: 512 * 1024 * 1024, // 512 MiB default
            max_drivers: 4,
            executor_threads: 4,
            driver_cpu_time_slice_limit_ms: 0,
            cursor_queue_max_bytes: 4 * 1024 * 1024,
            spill_enabled: false,
            row_number_spill_enabled: true,
            spill_dir: "/tmp/strata-spill".to_string(),
            spill_uri: None,
            spill_compression: "none".to_string(),
            spill_start_partition_bit: 48,
            spill_num_partition_bits: 3,
            max_spill_level: 4,
            spill_write_buffer_size: 1024 * 1024,
            spill_read_buffer_size: 1024 * 1024,
            min_spillable_reservation_pct: 5,
            spillable_reservation_growth_pct: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub uri: Option<String>,
    pub root: String,
}

impl StorageConfig {
    pub fn scheme(&self) -> Option<&str> {
        self.uri
            .as_deref()
            .and_then(|uri| uri.split("://").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// Spill parameters handed to spilling operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpillConfig {
    pub start_partition_bit: u8,
    pub num_partition_bits: u8,
    pub max_spill_level: i32,
    pub write_buffer_size: u64,
    pub read_buffer_size: u64,
    pub min_spillable_reservation_pct: u32,
    pub spillable_reservation_growth_pct: u32,
    pub compression: String,
}

impl SpillConfig {
    /// Spill level of a partition whose bits start at `start_bit_offset`.
    pub fn spill_level(&self, start_bit_offset: u8) -> i32 {
        let num_bits = self.num_partition_bits.max(1) as i32;
        (start_bit_offset as i32 - self.start_partition_bit as i32) / num_bits
    }

    /// True if partitioning at `start_bit_offset` would run out of hash bits
    /// or go deeper than `max_spill_level`.
    pub fn exceed_spill_level_limit(&self, start_bit_offset: u8) -> bool {
        if start_bit_offset as u32 + self.num_partition_bits as u32 > MAX_HASH_BITS as u32 {
            return true;
        }
        let max_level = if self.max_spill_level == -1 {
            MAX_SPILL_LEVEL
        } else {
            self.max_spill_level.min(MAX_SPILL_LEVEL)
        };
        self.spill_level(start_bit_offset) > max_level
    }
}

impl ExecConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `STRATA_MEM_CAP_BYTES`: memory cap in bytes
    /// - `STRATA_MAX_DRIVERS`: drivers per task
    /// - `STRATA_EXECUTOR_THREADS`: executor pool size
    /// - `STRATA_DRIVER_CPU_SLICE_MS`: driver CPU time slice
    /// - `STRATA_CURSOR_QUEUE_MAX_BYTES`: cursor queue capacity
    /// - `STRATA_SPILL_ENABLED` / `STRATA_ROW_NUMBER_SPILL_ENABLED`: `true`/`false`
    /// - `STRATA_SPILL_DIR`, `STRATA_SPILL_URI`, `STRATA_SPILL_COMPRESSION`
    /// - `STRATA_SPILL_START_PARTITION_BIT`, `STRATA_SPILL_NUM_PARTITION_BITS`
    /// - `STRATA_MAX_SPILL_LEVEL`
    /// - `STRATA_SPILL_WRITE_BUFFER_SIZE`, `STRATA_SPILL_READ_BUFFER_SIZE`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse("STRATA_MEM_CAP_BYTES") {
            cfg.mem_cap_bytes = v;
        }
        if let Some(v) = env_parse("STRATA_MAX_DRIVERS") {
            cfg.max_drivers = v;
        }
        if let Some(v) = env_parse("STRATA_EXECUTOR_THREADS") {
            cfg.executor_threads = v;
        }
        if let Some(v) = env_parse("STRATA_DRIVER_CPU_SLICE_MS") {
            cfg.driver_cpu_time_slice_limit_ms = v;
        }
        if let Some(v) = env_parse("STRATA_CURSOR_QUEUE_MAX_BYTES") {
            cfg.cursor_queue_max_bytes = v;
        }
        if let Some(v) = env_parse("STRATA_SPILL_ENABLED") {
            cfg.spill_enabled = v;
        }
        if let Some(v) = env_parse("STRATA_ROW_NUMBER_SPILL_ENABLED") {
            cfg.row_number_spill_enabled = v;
        }
        if let Ok(s) = std::env::var("STRATA_SPILL_DIR") {
            cfg.spill_dir = s;
        }
        if let Ok(s) = std::env::var("STRATA_SPILL_URI") {
            cfg.spill_uri = Some(s);
        }
        if let Ok(s) = std::env::var("STRATA_SPILL_COMPRESSION") {
            cfg.spill_compression = s;
        }
        if let Some(v) = env_parse("STRATA_SPILL_START_PARTITION_BIT") {
            cfg.spill_start_partition_bit = v;
        }
        if let Some(v) = env_parse("STRATA_SPILL_NUM_PARTITION_BITS") {
            cfg.spill_num_partition_bits = v;
        }
        if let Some(v) = env_parse("STRATA_MAX_SPILL_LEVEL") {
            cfg.max_spill_level = v;
        }
        if let Some(v) = env_parse("STRATA_SPILL_WRITE_BUFFER_SIZE") {
            cfg.spill_write_buffer_size = v;
        }
        if let Some(v) = env_parse("STRATA_SPILL_READ_BUFFER_SIZE") {
            cfg.spill_read_buffer_size = v;
        }

        cfg
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_drivers == 0 {
            return Err(Error::Config("max_drivers must be positive".into()));
        }
        if self.executor_threads == 0 {
            return Err(Error::Config("executor_threads must be positive".into()));
        }
        if self.spill_num_partition_bits == 0 || self.spill_num_partition_bits > 16 {
            return Err(Error::Config(format!(
                "spill_num_partition_bits must be in 1..=16, got {}",
                self.spill_num_partition_bits
            )));
        }
        if self.spill_start_partition_bit as u32 + self.spill_num_partition_bits as u32
            > MAX_HASH_BITS as u32
        {
            return Err(Error::Config(format!(
                "spill partition bits [{}, {}) exceed {} hash bits",
                self.spill_start_partition_bit,
                self.spill_start_partition_bit as u32 + self.spill_num_partition_bits as u32,
                MAX_HASH_BITS
            )));
        }
        if self.max_spill_level < -1 || self.max_spill_level > MAX_SPILL_LEVEL {
            return Err(Error::Config(format!(
                "max_spill_level must be -1 or in 0..={}, got {}",
                MAX_SPILL_LEVEL, self.max_spill_level
            )));
        }
        Ok(())
    }

    pub fn spill_config(&self) -> SpillConfig {
        SpillConfig {
            start_partition_bit: self.spill_start_partition_bit,
            num_partition_bits: self.spill_num_partition_bits,
            max_spill_level: self.max_spill_level,
            write_buffer_size: self.spill_write_buffer_size,
            read_buffer_size: self.spill_read_buffer_size,
            min_spillable_reservation_pct: self.min_spillable_reservation_pct,
            spillable_reservation_growth_pct: self.spillable_reservation_growth_pct,
            compression: self.spill_compression.clone(),
        }
    }

    /// Produce a storage configuration snapshot used by the IO layer.
    pub fn storage_config(&self) -> StorageConfig {
        let scheme = self
            .spill_uri
            .as_deref()
            .and_then(|uri| uri.split("://").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let root = match (scheme.as_deref(), self.spill_uri.as_ref()) {
            (Some("file"), Some(uri)) => {
                file_uri_to_path(uri).unwrap_or_else(|| self.spill_dir.clone())
            }
            (Some(_), Some(uri)) => uri.trim_end_matches('/').to_string(),
            _ => self.spill_dir.clone(),
        };

        StorageConfig {
            uri: self.spill_uri.clone(),
            root,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

fn file_uri_to_path(uri: &str) -> Option<String> {
    let stripped = uri.strip_prefix("file://")?;
    if stripped.starts_with('/') {
        Some(stripped.to_string())
    } else {
        Some(format!("/{}", stripped))
    }
}
