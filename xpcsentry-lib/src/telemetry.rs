//! Logging setup, performance telemetry and health reporting.
//!
//! [`init_tracing`] installs the process-wide `tracing` subscriber from a
//! [`LoggingConfig`]. [`TelemetryCollector`] accumulates per-connection
//! timings and named counters and turns them into a [`HealthCheck`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Number of errors after which a component reports itself degraded.
const ERROR_THRESHOLD: u64 = 100;
/// Operation duration above which a component reports itself degraded.
const SLOW_OPERATION: Duration = Duration::from_secs(5);

/// Telemetry and logging setup errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TelemetryError {
    #[error("Failed to initialise logging: {0}")]
    Init(String),

    #[error("IO error opening log file: {0}")]
    Io(#[from] std::io::Error),
}

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Output goes to
/// stderr, or is appended to `config.file` when set, so stdout stays free
/// for records.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.format == "json" {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_ansi(ansi).with_writer(writer).boxed()
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))
}

/// Performance metrics for a component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    /// Component name
    pub component: String,
    /// Collection timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Number of operations performed
    pub operation_count: u64,
    /// Average operation duration in milliseconds
    pub avg_operation_duration_ms: f64,
    /// Error count
    pub error_count: u64,
    /// Named counters (suspicious verdicts, unresolved endpoints, ...)
    pub counters: HashMap<String, u64>,
}

impl Metrics {
    /// Create new metrics for a component.
    pub fn new(component: String) -> Self {
        Self {
            component,
            timestamp: chrono::Utc::now(),
            operation_count: 0,
            avg_operation_duration_ms: 0.0,
            error_count: 0,
            counters: HashMap::new(),
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

/// Health status for a component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[non_exhaustive]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Health check result for a component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    /// Component name
    pub component: String,
    /// Health status
    pub status: HealthStatus,
    /// Check timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Reason for a non-healthy status
    pub error_message: Option<String>,
    /// Additional details
    pub details: HashMap<String, String>,
}

impl HealthCheck {
    /// Create a new health check result.
    pub fn new(component: String, status: HealthStatus) -> Self {
        Self {
            component,
            status,
            timestamp: chrono::Utc::now(),
            error_message: None,
            details: HashMap::new(),
        }
    }

    /// Add a detail to the health check.
    pub fn add_detail(&mut self, key: impl Into<String>, value: impl ToString) {
        self.details.insert(key.into(), value.to_string());
    }
}

/// Performance timer for measuring operation durations.
pub struct PerformanceTimer {
    start_time: Instant,
    operation_name: String,
}

impl PerformanceTimer {
    /// Start timing an operation.
    pub fn start(operation_name: impl Into<String>) -> Self {
        Self {
            start_time: Instant::now(),
            operation_name: operation_name.into(),
        }
    }

    /// Finish timing and return the duration.
    pub fn finish(self) -> Duration {
        let elapsed = self.start_time.elapsed();
        trace!(operation = %self.operation_name, elapsed = ?elapsed, "Operation finished");
        elapsed
    }
}

/// Telemetry collector for gathering metrics and health information.
pub struct TelemetryCollector {
    component: String,
    metrics: Metrics,
    slowest_operation: Duration,
    total_operation_duration: Duration,
}

impl TelemetryCollector {
    /// Create a new telemetry collector.
    pub fn new(component: impl Into<String>) -> Self {
        let component = component.into();
        Self {
            metrics: Metrics::new(component.clone()),
            component,
            slowest_operation: Duration::ZERO,
            total_operation_duration: Duration::ZERO,
        }
    }

    /// Record an operation completion.
    pub fn record_operation(&mut self, duration: Duration) {
        self.metrics.operation_count = self.metrics.operation_count.saturating_add(1);
        self.slowest_operation = self.slowest_operation.max(duration);

        self.total_operation_duration = self.total_operation_duration.saturating_add(duration);
        let total_ms = u32::try_from(self.total_operation_duration.as_millis()).unwrap_or(u32::MAX);
        let count = u32::try_from(self.metrics.operation_count).unwrap_or(u32::MAX).max(1);
        self.metrics.avg_operation_duration_ms = f64::from(total_ms) / f64::from(count);
    }

    /// Record an error occurrence.
    pub const fn record_error(&mut self) {
        self.metrics.error_count = self.metrics.error_count.saturating_add(1);
    }

    /// Increment a named counter.
    pub fn increment(&mut self, name: &str) {
        let counter = self.metrics.counters.entry(name.to_owned()).or_insert(0);
        *counter = counter.saturating_add(1);
    }

    /// Get current metrics.
    pub const fn get_metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Perform a health check.
    pub fn health_check(&self) -> HealthCheck {
        let mut status = HealthStatus::Healthy;
        let mut error_message = None;

        if self.metrics.error_count > ERROR_THRESHOLD {
            status = HealthStatus::Degraded;
            error_message = Some("High error count detected".to_owned());
        }

        if self.slowest_operation > SLOW_OPERATION {
            status = HealthStatus::Degraded;
            error_message = Some("Slow operation performance detected".to_owned());
        }

        let mut health_check = HealthCheck::new(self.component.clone(), status);
        health_check.error_message = error_message;
        health_check.add_detail("operations", self.metrics.operation_count);
        health_check.add_detail("errors", self.metrics.error_count);
        health_check.add_detail(
            "avg_operation_ms",
            format!("{:.2}", self.metrics.avg_operation_duration_ms),
        );
        for (name, value) in &self.metrics.counters {
            health_check.add_detail(name.clone(), value);
        }
        health_check
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new("xpcsentry-agent".to_owned());
        assert_eq!(metrics.component, "xpcsentry-agent");
        assert_eq!(metrics.operation_count, 0);
        assert_eq!(metrics.error_count, 0);
        assert_eq!(metrics.counter("suspicious"), 0);
    }

    #[test]
    fn test_metrics_serialization() {
        let mut collector = TelemetryCollector::new("xpcsentry-agent");
        collector.increment("suspicious");

        let metrics = collector.get_metrics();
        let json = serde_json::to_string(metrics).expect("Failed to serialize metrics");
        let deserialized: Metrics = serde_json::from_str(&json).expect("Failed to deserialize metrics");
        assert_eq!(*metrics, deserialized);
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
        assert_eq!(HealthStatus::Degraded.to_string(), "degraded");
    }

    #[test]
    fn test_telemetry_collector_average() {
        let mut collector = TelemetryCollector::new("xpcsentry-agent");
        collector.record_operation(Duration::from_millis(100));
        collector.record_operation(Duration::from_millis(200));

        let metrics = collector.get_metrics();
        assert_eq!(metrics.operation_count, 2);
        assert!((metrics.avg_operation_duration_ms - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_counters() {
        let mut collector = TelemetryCollector::new("xpcsentry-agent");
        collector.increment("suspicious");
        collector.increment("suspicious");
        collector.increment("unresolved");
        assert_eq!(collector.get_metrics().counter("suspicious"), 2);
        assert_eq!(collector.get_metrics().counter("unresolved"), 1);

        let health = collector.health_check();
        assert_eq!(health.details.get("suspicious").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_health_check_healthy() {
        let collector = TelemetryCollector::new("xpcsentry-agent");
        let health_check = collector.health_check();
        assert_eq!(health_check.component, "xpcsentry-agent");
        assert_eq!(health_check.status, HealthStatus::Healthy);
        assert!(health_check.error_message.is_none());
    }

    #[test]
    fn test_health_check_high_error_count() {
        let mut collector = TelemetryCollector::new("xpcsentry-agent");
        for _ in 0..=ERROR_THRESHOLD {
            collector.record_error();
        }

        let health_check = collector.health_check();
        assert_eq!(health_check.status, HealthStatus::Degraded);
        assert!(
            health_check
                .error_message
                .expect("Expected error message")
                .contains("High error count")
        );
    }

    #[test]
    fn test_health_check_slow_operations() {
        let mut collector = TelemetryCollector::new("xpcsentry-agent");
        collector.record_operation(Duration::from_millis(6000));
        collector.record_operation(Duration::from_millis(1));

        let health_check = collector.health_check();
        assert_eq!(health_check.status, HealthStatus::Degraded);
        assert!(
            health_check
                .error_message
                .expect("Expected error message")
                .contains("Slow operation")
        );
    }

    #[traced_test]
    #[test]
    fn test_performance_timer() {
        let timer = PerformanceTimer::start("resolve");
        assert!(timer.finish() < Duration::from_secs(1));
        assert!(logs_contain("operation=resolve"));
    }
}
