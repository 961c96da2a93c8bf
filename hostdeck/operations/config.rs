use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use hostdeck_logging::LogLevel;
use serde::{Deserialize, Serialize};

/// Top-level console settings, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleSettings {
    /// Job status polling.
    #[serde(default)]
    pub polling: PollingSettings,
    /// Convergence-based completion.
    #[serde(default)]
    pub convergence: ConvergenceSettings,
    /// Job registry retention.
    #[serde(default)]
    pub registry: RegistrySettings,
    /// Notification feed.
    #[serde(default)]
    pub notifications: NotificationSettings,
    /// Logs and event sinks.
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl ConsoleSettings {
    /// Loads and validates settings from a TOML file.
    ///
    /// Relative telemetry paths resolve against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading console settings {}", path.display()))?;
        let mut settings =
            Self::from_toml(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        for candidate in [
            &mut settings.telemetry.log_path,
            &mut settings.telemetry.event_log,
        ]
        .into_iter()
        .flatten()
        {
            if candidate.is_relative() {
                *candidate = base.join(&*candidate);
            }
        }
        Ok(settings)
    }

    /// Parses and validates settings from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects nonsensical bounds.
    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_ms == 0 {
            bail!("polling.interval_ms must be positive");
        }
        if self.polling.fetch_timeout_ms == 0 {
            bail!("polling.fetch_timeout_ms must be positive");
        }
        if self.polling.transport_failure_limit == 0 {
            bail!("polling.transport_failure_limit must be at least 1");
        }
        if self.convergence.max_wait_secs == 0 {
            bail!("convergence.max_wait_secs must be positive");
        }
        if !self.convergence.reference_pointer.starts_with('/') {
            bail!(
                "convergence.reference_pointer `{}` is not a JSON pointer",
                self.convergence.reference_pointer
            );
        }
        if let Some(pointer) = &self.convergence.pending_pointer {
            if !pointer.starts_with('/') {
                bail!("convergence.pending_pointer `{pointer}` is not a JSON pointer");
            }
        }
        if self.notifications.ttl_ms == 0 {
            bail!("notifications.ttl_ms must be positive");
        }
        if self.telemetry.bus_capacity == 0 {
            bail!("telemetry.bus_capacity must be positive");
        }
        self.telemetry.min_level()?;
        Ok(())
    }
}

/// Job status polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollingSettings {
    /// Fixed interval between status fetches.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Bounded wait for a single status fetch.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Consecutive transport failures tolerated before giving up.
    #[serde(default = "default_transport_failure_limit")]
    pub transport_failure_limit: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            transport_failure_limit: default_transport_failure_limit(),
        }
    }
}

impl PollingSettings {
    /// Interval as a duration.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Fetch timeout as a duration.
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Convergence-based completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConvergenceSettings {
    /// Upper bound on waiting for the reference value to change.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// JSON pointer to the reference value inside the probed payload.
    #[serde(default = "default_reference_pointer")]
    pub reference_pointer: String,
    /// JSON pointer to a boolean that turns `false` once nothing is pending.
    #[serde(default = "default_pending_pointer")]
    pub pending_pointer: Option<String>,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            max_wait_secs: default_max_wait_secs(),
            reference_pointer: default_reference_pointer(),
            pending_pointer: default_pending_pointer(),
        }
    }
}

impl ConvergenceSettings {
    /// Maximum wait as a duration.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

/// Job registry retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrySettings {
    /// How long terminal jobs stay readable.
    #[serde(default = "default_terminal_grace_secs")]
    pub terminal_grace_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            terminal_grace_secs: default_terminal_grace_secs(),
        }
    }
}

impl RegistrySettings {
    /// Grace window as a duration.
    #[must_use]
    pub const fn terminal_grace(&self) -> Duration {
        Duration::from_secs(self.terminal_grace_secs)
    }
}

/// Notification feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationSettings {
    /// Lifetime of each entry.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
        }
    }
}

impl NotificationSettings {
    /// Lifetime as a duration.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Logs and event sinks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetrySettings {
    /// JSON-lines operation log.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// JSON-lines audit trail of bus events.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
    /// Events retained by the in-memory bus.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    /// Lowest level written to the operation log.
    #[serde(default = "default_min_level")]
    pub min_level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_path: None,
            event_log: None,
            bus_capacity: default_bus_capacity(),
            min_level: default_min_level(),
        }
    }
}

impl TelemetrySettings {
    /// Parsed minimum log level.
    pub fn min_level(&self) -> Result<LogLevel> {
        self.min_level
            .parse()
            .with_context(|| format!("telemetry.min_level `{}`", self.min_level))
    }
}

const fn default_interval_ms() -> u64 {
    500
}

const fn default_fetch_timeout_ms() -> u64 {
    10_000
}

const fn default_transport_failure_limit() -> u32 {
    5
}

const fn default_max_wait_secs() -> u64 {
    900
}

fn default_reference_pointer() -> String {
    "/current_commit".into()
}

#[allow(clippy::unnecessary_wraps)]
fn default_pending_pointer() -> Option<String> {
    Some("/update_available".into())
}

const fn default_terminal_grace_secs() -> u64 {
    60
}

const fn default_ttl_ms() -> u64 {
    5_000
}

const fn default_bus_capacity() -> usize {
    256
}

fn default_min_level() -> String {
    "info".into()
}
