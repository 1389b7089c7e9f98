//! OpenTelemetry metric handles for operon
//!
//! Instruments are built from a [`Meter`] handed in by the caller rather
//! than a process-wide singleton, so each controller decides which provider
//! its series go to. Provides:
//! - Per-operation counters, error counters and latency histograms for
//!   reconciled resources
//! - Controller reconcile outcomes and informer event counts

use std::time::Instant;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Build a metric name following the `<ns>_<subsystem>_<name>` convention
pub fn metric_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

// ============================================================================
// Resource Operation Metrics
// ============================================================================

/// Counters and histogram for resource operations.
///
/// Series:
/// - `<ns>_<subsystem>_operation_total`
/// - `<ns>_<subsystem>_operation_error_total`
/// - `<ns>_<subsystem>_operation` (seconds)
///
/// Labels:
/// - `service`: controller identity
/// - `resource`: the concrete resource's name
/// - `operation`: e.g. get_current_state, apply_create_change, ensure_created
#[derive(Clone, Debug)]
pub struct OperationMetrics {
    service: String,
    operations: Counter<u64>,
    errors: Counter<u64>,
    duration: Histogram<f64>,
}

impl OperationMetrics {
    /// Register the operation instruments on `meter`
    pub fn new(
        meter: &Meter,
        namespace: &str,
        subsystem: &str,
        service: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            operations: meter
                .u64_counter(metric_name(namespace, subsystem, "operation_total"))
                .with_description("Number of operations executed")
                .with_unit("{operations}")
                .build(),
            errors: meter
                .u64_counter(metric_name(namespace, subsystem, "operation_error_total"))
                .with_description("Number of operations that returned an error")
                .with_unit("{errors}")
                .build(),
            duration: meter
                .f64_histogram(metric_name(namespace, subsystem, "operation"))
                .with_description("Duration of operations in seconds")
                .with_unit("s")
                .build(),
        }
    }

    /// Service label attached to every series
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Count an operation and start timing it
    pub fn start(&self, resource: &str, operation: &str) -> OperationTimer<'_> {
        let labels = vec![
            KeyValue::new("service", self.service.clone()),
            KeyValue::new("resource", resource.to_string()),
            KeyValue::new("operation", operation.to_string()),
        ];
        self.operations.add(1, &labels);
        OperationTimer {
            metrics: self,
            labels,
            start: Instant::now(),
        }
    }
}

/// Times one operation started through [`OperationMetrics::start`]
pub struct OperationTimer<'a> {
    metrics: &'a OperationMetrics,
    labels: Vec<KeyValue>,
    start: Instant,
}

impl OperationTimer<'_> {
    /// Record successful completion
    pub fn success(self) {
        self.metrics
            .duration
            .record(self.start.elapsed().as_secs_f64(), &self.labels);
    }

    /// Record error completion
    pub fn error(self) {
        self.metrics
            .duration
            .record(self.start.elapsed().as_secs_f64(), &self.labels);
        self.metrics.errors.add(1, &self.labels);
    }

    /// Record completion according to `succeeded`
    pub fn finish(self, succeeded: bool) {
        if succeeded {
            self.success()
        } else {
            self.error()
        }
    }
}

// ============================================================================
// Controller Metrics
// ============================================================================

/// Kind of reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileKind {
    /// Create/update pass
    Update,
    /// Deletion pass
    Delete,
}

impl ReconcileKind {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Informer output stream an event was delivered on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStream {
    /// Create/update stream
    Update,
    /// Delete stream
    Delete,
    /// Error stream
    Error,
}

impl EventStream {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Error => "error",
        }
    }
}

/// Reconcile outcome and informer event instruments for one controller.
///
/// Labels:
/// - `controller`: controller name
/// - `kind`: update, delete (reconcile series)
/// - `stream`: update, delete, error (event series)
#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    controller: String,
    reconciles: Counter<u64>,
    reconcile_errors: Counter<u64>,
    reconcile_duration: Histogram<f64>,
    events: Counter<u64>,
}

impl ControllerMetrics {
    /// Register the controller instruments on `meter`
    pub fn new(meter: &Meter, namespace: &str, controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            reconciles: meter
                .u64_counter(metric_name(namespace, "controller", "reconcile_total"))
                .with_description("Number of reconciliation passes")
                .with_unit("{reconciles}")
                .build(),
            reconcile_errors: meter
                .u64_counter(metric_name(namespace, "controller", "reconcile_error_total"))
                .with_description("Number of failed reconciliation passes")
                .with_unit("{errors}")
                .build(),
            reconcile_duration: meter
                .f64_histogram(metric_name(
                    namespace,
                    "controller",
                    "reconcile_duration_seconds",
                ))
                .with_description("Duration of reconciliation passes in seconds")
                .with_unit("s")
                .build(),
            events: meter
                .u64_counter(metric_name(namespace, "informer", "event_total"))
                .with_description("Number of informer events received")
                .with_unit("{events}")
                .build(),
        }
    }

    /// Start timing a reconciliation pass
    pub fn reconcile(&self, kind: ReconcileKind) -> ReconcileTimer<'_> {
        let labels = vec![
            KeyValue::new("controller", self.controller.clone()),
            KeyValue::new("kind", kind.as_str()),
        ];
        self.reconciles.add(1, &labels);
        ReconcileTimer {
            metrics: self,
            labels,
            start: Instant::now(),
        }
    }

    /// Count an informer event
    pub fn record_event(&self, stream: EventStream) {
        self.events.add(
            1,
            &[
                KeyValue::new("controller", self.controller.clone()),
                KeyValue::new("stream", stream.as_str()),
            ],
        );
    }
}

/// Times one reconciliation pass
pub struct ReconcileTimer<'a> {
    metrics: &'a ControllerMetrics,
    labels: Vec<KeyValue>,
    start: Instant,
}

impl ReconcileTimer<'_> {
    /// Record successful completion
    pub fn success(self) {
        self.metrics
            .reconcile_duration
            .record(self.start.elapsed().as_secs_f64(), &self.labels);
    }

    /// Record error completion
    pub fn error(self) {
        self.metrics
            .reconcile_duration
            .record(self.start.elapsed().as_secs_f64(), &self.labels);
        self.metrics.reconcile_errors.add(1, &self.labels);
    }
}
