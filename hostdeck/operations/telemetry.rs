use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use hostdeck_event_bus::{EventPublisher, EventRecord};
use hostdeck_logging::{JsonLogger, LogLevel, LogRecord};
use serde_json::Value;
use tokio::runtime::Handle;

use crate::jobs::JobId;

/// Builder for operation telemetry sinks.
pub struct OperationsTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl OperationsTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the JSON log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<OperationsTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.min_level)?),
            None => None,
        };
        Ok(OperationsTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared across the operations components.
///
/// Every record is mirrored to `tracing`; the JSON log and the event bus are optional.
#[derive(Clone)]
pub struct OperationsTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for OperationsTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationsTelemetry")
            .field("module", &self.inner.module)
            .field("logger", &self.inner.logger.is_some())
            .field("publisher", &self.inner.publisher.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl OperationsTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> OperationsTelemetryBuilder {
        OperationsTelemetryBuilder::new(module)
    }

    /// Telemetry that only mirrors to `tracing`.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: "operations".into(),
                logger: None,
                publisher: None,
            }),
        }
    }

    /// Logs structured metadata.
    pub fn log(
        &self,
        level: LogLevel,
        message: &str,
        job_id: Option<&JobId>,
        metadata: Value,
    ) -> Result<()> {
        let job = job_id.map(JobId::as_str).unwrap_or_default();
        match level {
            LogLevel::Debug => tracing::debug!(component = %self.inner.module, job, %metadata, "{message}"),
            LogLevel::Info => tracing::info!(component = %self.inner.module, job, %metadata, "{message}"),
            LogLevel::Warn => tracing::warn!(component = %self.inner.module, job, %metadata, "{message}"),
            LogLevel::Error => tracing::error!(component = %self.inner.module, job, %metadata, "{message}"),
        }
        if let Some(logger) = &self.inner.logger {
            let mut record = LogRecord::new(&self.inner.module, level, message);
            if let Some(job_id) = job_id {
                record = record.with_job(job_id.as_str());
            }
            logger.log(&record.with_metadata(metadata))?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    ///
    /// Inside a runtime the publish is spawned; outside one it completes inline.
    pub fn event(&self, topic: &str, job_id: Option<&JobId>, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let mut record = EventRecord::new(&self.inner.module, topic, payload);
        if let Some(job_id) = job_id {
            record = record.for_job(job_id.as_str());
        }
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    tracing::warn!(error = %err, "telemetry event publish failed");
                }
            });
            Ok(())
        } else {
            futures::executor::block_on(publisher.publish(record))
        }
    }

    /// Logs and publishes the same payload.
    pub fn record(&self, level: LogLevel, topic: &str, job_id: Option<&JobId>, payload: Value) {
        if let Err(err) = self.log(level, topic, job_id, payload.clone()) {
            tracing::warn!(error = %err, topic, "operation log write failed");
        }
        if let Err(err) = self.event(topic, job_id, payload) {
            tracing::warn!(error = %err, topic, "operation event publish failed");
        }
    }
}

impl Default for OperationsTelemetry {
    fn default() -> Self {
        Self::disabled()
    }
}
