#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON operation logs shared by the hostdeck crates.

use std::{
    fmt,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

/// Log severity level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

impl LogLevel {
    /// Lowercase label used in configuration files.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => bail!("unknown log level `{other}`"),
        }
    }
}

/// Structured log record, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the log.
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Event name, e.g. `operations.job.terminal`.
    pub message: String,
    /// Host job the record refers to, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Arbitrary JSON fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            job_id: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Tags the record with a job identifier.
    #[must_use]
    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Merges the fields of a JSON object into the metadata block.
    ///
    /// Non-object values are stored under a `value` key.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        match metadata {
            serde_json::Value::Object(map) => self.metadata.extend(map),
            serde_json::Value::Null => {}
            other => {
                self.metadata.insert("value".into(), other);
            }
        }
        self
    }
}

/// Thread-safe JSON logger with append-only semantics.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    min_level: LogLevel,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path, accepting every level.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_min_level(path, LogLevel::Debug)
    }

    /// Creates or opens a logger that drops records below `min_level`.
    pub fn with_min_level(path: impl AsRef<Path>, min_level: LogLevel) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            min_level,
            writer: Mutex::new(file),
        })
    }

    /// Writes a log record as a JSON line. Returns whether it was written.
    pub fn log(&self, record: &LogRecord) -> Result<bool> {
        if record.level < self.min_level {
            return Ok(false);
        }
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(true)
    }

    /// Minimum level accepted by this logger.
    #[must_use]
    pub const fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Returns the underlying file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Installs a global `tracing` subscriber writing human readable lines to stderr.
///
/// `filter` uses `EnvFilter` syntax; `RUST_LOG` takes precedence when set.
/// Calling this twice is harmless.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = Registry::default()
        .with(env_filter)
        .with(subscriber_fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
