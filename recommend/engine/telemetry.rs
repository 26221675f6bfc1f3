use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, OnceLock},
};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord, FileEventPublisher};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Handle, Runtime};

use crate::config::TelemetrySettings;

/// Builder for engine telemetry sinks.
pub struct EngineTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl EngineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Info,
            event_publisher: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the lowest level written to the log.
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
    pub fn build(self) -> Result<EngineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.min_level)?),
            None => None,
        };
        Ok(EngineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                event: self.event_publisher.map(EventHandle::new),
            }),
        })
    }
}

/// Telemetry handle shared by the engine and cross-validation.
#[derive(Clone)]
pub struct EngineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for EngineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTelemetry")
            .field("module", &self.inner.module)
            .field("logging", &self.inner.logger.is_some())
            .field("events", &self.inner.event.is_some())
            .finish()
    }
}

impl Default for EngineTelemetry {
    fn default() -> Self {
        Self::disabled("recommend-engine")
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    event: Option<EventHandle>,
}

struct EventHandle {
    runtime: OnceLock<Runtime>,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            runtime: OnceLock::new(),
            publisher,
        }
    }

    fn publish(&self, record: EventRecord) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            return Ok(());
        }
        let runtime = match self.runtime.get() {
            Some(runtime) => runtime,
            None => {
                let _ = self.runtime.set(Runtime::new()?);
                self.runtime
                    .get()
                    .ok_or_else(|| anyhow::anyhow!("telemetry runtime unavailable"))?
            }
        };
        runtime.block_on(self.publisher.publish(record))
    }
}

impl EngineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> EngineTelemetryBuilder {
        EngineTelemetryBuilder::new(module)
    }

    /// Handle with no sinks.
    #[must_use]
    pub fn disabled(module: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: module.into(),
                logger: None,
                event: None,
            }),
        }
    }

    /// Builds sinks from configuration; `event_log` becomes a file publisher.
    pub fn from_settings(settings: &TelemetrySettings) -> Result<Self> {
        let mut builder = Self::builder(&settings.module).min_level(settings.min_level);
        if let Some(path) = &settings.log_path {
            builder = builder.log_path(path);
        }
        if let Some(path) = &settings.event_log {
            builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
        }
        builder.build()
    }

    /// Source name stamped on records.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            if logger.enabled(level) {
                let record =
                    LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
                logger.log(&record)?;
            }
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            handle.publish(EventRecord::new(&self.inner.module, event_type, payload))?;
        }
        Ok(())
    }

    /// Logs at info and emits an event under the same name. Sink failures go to stderr.
    pub fn record(&self, event_type: &str, payload: Value) {
        if let Err(err) = self.log(LogLevel::Info, event_type, payload.clone()) {
            eprintln!("telemetry log failed: {err:?}");
        }
        if let Err(err) = self.event(event_type, payload) {
            eprintln!("telemetry event failed: {err:?}");
        }
    }

    /// Logs a warning. Sink failures go to stderr.
    pub fn warn(&self, message: &str, metadata: Value) {
        if let Err(err) = self.log(LogLevel::Warn, message, metadata) {
            eprintln!("telemetry log failed: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("engine.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = EngineTelemetry::builder("engine")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry.record("engine.model_trained", json!({ "rank": 3 }));
        telemetry
            .log(LogLevel::Debug, "engine.debug", json!({}))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("engine.model_trained"));
        assert!(!content.contains("engine.debug"));
        assert_eq!(bus.events_of_type("engine.model_trained").len(), 1);
    }

    #[test]
    fn settings_build_file_sinks() {
        let tmp = tempdir().unwrap();
        let settings = TelemetrySettings {
            log_path: Some(tmp.path().join("engine.log")),
            event_log: Some(tmp.path().join("events.log")),
            min_level: LogLevel::Warn,
            module: "tuning".into(),
        };
        let telemetry = EngineTelemetry::from_settings(&settings).unwrap();
        telemetry.record("cv.best_selected", json!({ "score": 0.5 }));
        telemetry.warn("engine.slow", json!({}));
        let log = std::fs::read_to_string(tmp.path().join("engine.log")).unwrap();
        assert!(log.contains("engine.slow"));
        assert!(!log.contains("cv.best_selected"));
        let events = std::fs::read_to_string(tmp.path().join("events.log")).unwrap();
        assert!(events.contains("cv.best_selected"));
        assert!(events.contains("tuning"));
    }
}
