//! Tagged metrics facade for the worker.
//!
//! The collector owns the lifecycle of a pluggable [`MetricsSink`] and
//! hands out [`MetricsScope`]s carrying tag context. The worker scopes
//! itself by agent name at start and layers job tags on top for each job
//! it runs; aggregation and shipping belong to the sink.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

/// Tag set attached to a scope.
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics sink failed to start: {message}")]
    SinkStart { message: String },
}

/// Destination for datapoints.
pub trait MetricsSink: Send + Sync {
    fn start(&self) -> Result<(), MetricsError> {
        Ok(())
    }

    fn stop(&self) {}

    fn count(&self, name: &str, value: i64, tags: &Tags);
}

/// Sink that discards everything; the default when no backend is wired.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn count(&self, _name: &str, _value: i64, _tags: &Tags) {}
}

/// Owns the sink lifecycle and hands out tagged scopes.
#[derive(Clone)]
pub struct MetricsCollector {
    sink: Arc<dyn MetricsSink>,
    started: Arc<AtomicBool>,
}

impl MetricsCollector {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&self) -> Result<(), MetricsError> {
        self.sink.start()?;
        self.started.store(true, Ordering::SeqCst);
        debug!("Metrics collector started");
        Ok(())
    }

    /// Safe to call more than once; only the first call after a start
    /// reaches the sink.
    pub fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.sink.stop();
            debug!("Metrics collector stopped");
        }
    }

    pub fn scope(&self, tags: Tags) -> MetricsScope {
        MetricsScope {
            sink: self.sink.clone(),
            tags,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(Arc::new(NullSink))
    }
}

/// A tag context; [`MetricsScope::with`] layers further tags on top.
#[derive(Clone)]
pub struct MetricsScope {
    sink: Arc<dyn MetricsSink>,
    tags: Tags,
}

impl MetricsScope {
    pub fn with(&self, tags: Tags) -> MetricsScope {
        let mut merged = self.tags.clone();
        merged.extend(tags);
        MetricsScope {
            sink: self.sink.clone(),
            tags: merged,
        }
    }

    pub fn count(&self, name: &str, value: i64) {
        self.sink.count(name, value, &self.tags);
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }
}
