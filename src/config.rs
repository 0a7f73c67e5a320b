//! String-keyed configuration provider.
//!
//! Sessions and readers take their tuning knobs (worker counts, buffer
//! sizes, read mode) from a [`Config`] instead of hard-coding them. Values
//! can be set programmatically or loaded from a `key = value` file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{CanopyError, Result};

/// Number of worker threads applying index writes.
pub const INDEX_THREAD_COUNT: &str = "index_thread_count";

/// Capacity of the bounded indexing work queue.
pub const INDEX_QUEUE_SIZE: &str = "index_queue_size";

/// Buffer size, in bytes, for buffered index-file reads.
pub const READ_BUFFER_SIZE: &str = "read_buffer_size";

/// Physical read strategy: `buffered` or `mmap`.
pub const READ_MODE: &str = "read_mode";

/// How index pages are read at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Sequential page reads through a buffered stream.
    #[default]
    Buffered,
    /// Memory-mapped views, one per page.
    Mmap,
}

/// A string-keyed configuration provider.
#[derive(Debug, Clone, Default)]
pub struct Config {
    options: HashMap<String, String>,
}

impl Config {
    /// Create an empty configuration; every getter falls back to its default.
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a `key = value` file. Blank lines and lines
    /// starting with `#` are ignored.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config = Config::new();

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                CanopyError::config(format!("line {}: expected `key = value`", line_no + 1))
            })?;
            config.set(key.trim(), value.trim());
        }

        Ok(config)
    }

    /// Set an option, replacing any previous value.
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> &mut Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Get an option as a raw string.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Get an option parsed as `usize`, falling back to `default` when the
    /// option is absent or unparsable.
    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// The configured worker thread count.
    pub fn index_thread_count(&self) -> usize {
        self.get_usize(INDEX_THREAD_COUNT, num_cpus::get()).max(1)
    }

    /// The configured work-queue capacity.
    pub fn index_queue_size(&self) -> usize {
        self.get_usize(INDEX_QUEUE_SIZE, 65_536).max(1)
    }

    /// The configured read buffer size.
    pub fn read_buffer_size(&self) -> usize {
        self.get_usize(READ_BUFFER_SIZE, 4096).max(512)
    }

    /// The configured physical read strategy.
    pub fn read_mode(&self) -> ReadMode {
        match self.get(READ_MODE) {
            Some("mmap") => ReadMode::Mmap,
            _ => ReadMode::Buffered,
        }
    }
}
