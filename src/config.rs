//! Index configuration.
//!
//! [`IndexConfig`] can be built from defaults, deserialized from JSON, or
//! parsed from a plugin-style settings string:
//!
//! ```
//! use mailfts::config::{IndexConfig, SpillDir};
//!
//! let config: IndexConfig = "compact_age_days=7 lock_timeout_secs=30 spill_dir=index"
//!     .parse()
//!     .unwrap();
//! assert_eq!(config.compact_age_days, 7);
//! assert_eq!(config.spill_dir, SpillDir::IndexDirectory);
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MailFtsError, Result};

/// Sentinel accepted for `spill_dir` meaning "next to the index files".
pub const SPILL_DIR_INDEX_SENTINEL: &str = "index";

/// Where spill files are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpillDir {
    /// Use the mailbox index directory.
    #[default]
    IndexDirectory,
    /// Use the given absolute directory.
    Path(PathBuf),
}

impl SpillDir {
    /// Resolve against the index directory.
    pub fn resolve(&self, index_dir: &Path) -> PathBuf {
        match self {
            SpillDir::IndexDirectory => index_dir.to_path_buf(),
            SpillDir::Path(path) => path.clone(),
        }
    }
}

/// How to launch the external indexer helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Program to execute.
    pub program: PathBuf,

    /// Extra arguments passed to the program.
    pub args: Vec<String>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        HelperConfig {
            program: PathBuf::from("mailfts-helper"),
            args: Vec::new(),
        }
    }
}

/// Configuration for a mailbox index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Compact when the oldest deferred expunge is this many days old.
    pub compact_age_days: u32,

    /// Compact when this many uids are waiting to be expunged.
    pub compact_expunges: u32,

    /// Seconds to wait for the index lock (0 = try once).
    pub lock_timeout_secs: u64,

    /// Terms shorter than this are not indexed or searched.
    pub min_term_length: usize,

    /// Seconds the helper gets to answer a command.
    pub indexer_timeout_secs: u64,

    /// Per-fragment search budget in seconds (0 = unbounded).
    pub search_secs: u64,

    /// Where spill files go.
    pub spill_dir: SpillDir,

    /// Fragments at or above this size are not written to anymore.
    pub fragment_threshold_bytes: u64,

    /// Text buffers larger than this are handed to the helper.
    pub accumulation_limit_bytes: usize,

    /// Number of uids resolved per compaction batch.
    pub compact_batch_size: usize,

    /// Number of matches pulled from a fragment at a time.
    pub search_batch_size: usize,

    /// External indexer helper.
    pub helper: HelperConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            compact_age_days: 7,
            compact_expunges: 100,
            lock_timeout_secs: 60,
            min_term_length: 1,
            indexer_timeout_secs: 60,
            search_secs: 30,
            spill_dir: SpillDir::IndexDirectory,
            fragment_threshold_bytes: 1 << 30, // 1GB
            accumulation_limit_bytes: 1 << 20, // 1MB
            compact_batch_size: 100,
            search_batch_size: 1000,
            helper: HelperConfig::default(),
        }
    }
}

impl IndexConfig {
    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.compact_age_days == 0 {
            return Err(MailFtsError::config("compact_age_days must be > 0"));
        }
        if self.compact_expunges == 0 {
            return Err(MailFtsError::config("compact_expunges must be > 0"));
        }
        if self.min_term_length == 0 {
            return Err(MailFtsError::config("min_term_length must be > 0"));
        }
        if self.indexer_timeout_secs == 0 {
            return Err(MailFtsError::config("indexer_timeout_secs must be > 0"));
        }
        if let SpillDir::Path(path) = &self.spill_dir
            && !path.is_absolute()
        {
            return Err(MailFtsError::config(format!(
                "spill_dir must be absolute: {}",
                path.display()
            )));
        }
        if self.fragment_threshold_bytes == 0 {
            return Err(MailFtsError::config("fragment_threshold_bytes must be > 0"));
        }
        if self.compact_batch_size == 0 || self.search_batch_size == 0 {
            return Err(MailFtsError::config("batch sizes must be > 0"));
        }
        Ok(())
    }

    /// Load from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: IndexConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply a single `key=value` setting.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "compact_age_days" => self.compact_age_days = parse_value(key, value)?,
            "compact_expunges" => self.compact_expunges = parse_value(key, value)?,
            "lock_timeout_secs" => self.lock_timeout_secs = parse_value(key, value)?,
            "min_term_length" => self.min_term_length = parse_value(key, value)?,
            "indexer_timeout_secs" => self.indexer_timeout_secs = parse_value(key, value)?,
            "search_secs" => self.search_secs = parse_value(key, value)?,
            "fragment_threshold_bytes" => {
                self.fragment_threshold_bytes = parse_value(key, value)?
            }
            "accumulation_limit_bytes" => {
                self.accumulation_limit_bytes = parse_value(key, value)?
            }
            "compact_batch_size" => self.compact_batch_size = parse_value(key, value)?,
            "search_batch_size" => self.search_batch_size = parse_value(key, value)?,
            "spill_dir" => {
                self.spill_dir = if value == SPILL_DIR_INDEX_SENTINEL {
                    SpillDir::IndexDirectory
                } else {
                    SpillDir::Path(PathBuf::from(value))
                }
            }
            "helper" => self.helper.program = PathBuf::from(value),
            _ => return Err(MailFtsError::config(format!("unknown setting: {key}"))),
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn indexer_timeout(&self) -> Duration {
        Duration::from_secs(self.indexer_timeout_secs)
    }

    /// Per-fragment search budget, `None` when unbounded.
    pub fn search_budget(&self) -> Option<Duration> {
        (self.search_secs > 0).then(|| Duration::from_secs(self.search_secs))
    }

    pub fn compact_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.compact_age_days))
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MailFtsError::config(format!("invalid value for {key}: {value:?}")))
}

impl FromStr for IndexConfig {
    type Err = MailFtsError;

    fn from_str(settings: &str) -> Result<Self> {
        let mut config = IndexConfig::default();
        for item in settings.split_whitespace() {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| MailFtsError::config(format!("expected key=value: {item:?}")))?;
            config.set(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }
}
