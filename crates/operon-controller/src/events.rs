//! Reconciliation failures as Kubernetes Events.
//!
//! A failed pass is published as a Warning event on the object it was
//! reconciling, naming the pass, the resource whose operation failed and
//! the error. `kubectl describe` on the object shows why it is stuck.
//!
//! Publishing never fails a pass: a rejected event is logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use operon_common::metrics::ReconcileKind;
use operon_common::Error;
use tracing::warn;

/// Longest note the API server accepts on an event, in bytes
pub const MAX_NOTE_BYTES: usize = 1024;

/// Why a pass over an object failed, shown under REASON
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// A resource failed during the create/update pass
    ReconcileFailed,
    /// A resource failed during the delete pass; the finalizer stays
    DeleteFailed,
    /// More than one resource set matches the object, so none runs
    AmbiguousResourceSet,
}

impl FailureReason {
    /// Reason for a resource failing during a `kind` pass
    pub fn for_kind(kind: ReconcileKind) -> Self {
        match kind {
            ReconcileKind::Update => Self::ReconcileFailed,
            ReconcileKind::Delete => Self::DeleteFailed,
        }
    }

    /// Event reason string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReconcileFailed => "ReconcileFailed",
            Self::DeleteFailed => "DeleteFailed",
            Self::AmbiguousResourceSet => "AmbiguousResourceSet",
        }
    }
}

/// One failed pass, as reported on the reconciled object
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileFailure {
    /// Pass that failed
    pub kind: ReconcileKind,
    /// Event reason
    pub reason: FailureReason,
    /// Resource whose operation failed, when the error names one
    pub resource: Option<String>,
    /// Error text
    pub message: String,
}

impl ReconcileFailure {
    /// Failure of a `kind` pass caused by `err`
    pub fn new(kind: ReconcileKind, reason: FailureReason, err: &Error) -> Self {
        Self {
            kind,
            reason,
            resource: err.resource_name().map(str::to_string),
            message: err.to_string(),
        }
    }

    /// Event action, shown under ACTION: the pass that was running
    pub fn action(&self) -> &'static str {
        match self.kind {
            ReconcileKind::Update => "Reconcile",
            ReconcileKind::Delete => "Delete",
        }
    }

    /// Human readable note, cut to [`MAX_NOTE_BYTES`]
    pub fn note(&self) -> String {
        let kind = self.kind.as_str();
        let note = match &self.resource {
            Some(resource) => format!("{kind} pass failed at {resource}: {}", self.message),
            None => format!("{kind} pass failed: {}", self.message),
        };
        truncate_note(note)
    }

    /// The Warning event for this failure
    pub fn to_event(&self) -> Event {
        Event {
            type_: EventType::Warning,
            reason: self.reason.as_str().to_string(),
            note: Some(self.note()),
            action: self.action().to_string(),
            secondary: None,
        }
    }
}

fn truncate_note(mut note: String) -> String {
    if note.len() <= MAX_NOTE_BYTES {
        return note;
    }
    let mut end = MAX_NOTE_BYTES - '…'.len_utf8();
    while !note.is_char_boundary(end) {
        end -= 1;
    }
    note.truncate(end);
    note.push('…');
    note
}

/// Reports failed passes on the objects they concern.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `failure` on `object`
    async fn publish_failure(&self, object: &ObjectReference, failure: &ReconcileFailure);
}

/// [`EventPublisher`] writing `events.k8s.io` Events.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`; the pod name, if set in `POD_NAME`,
    /// identifies the replica.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish_failure(&self, object: &ObjectReference, failure: &ReconcileFailure) {
        let event = failure.to_event();
        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(
                object = object.name.as_deref().unwrap_or_default(),
                kind = failure.kind.as_str(),
                reason = failure.reason.as_str(),
                resource = failure.resource.as_deref().unwrap_or_default(),
                error = %e,
                "Could not record reconcile failure"
            );
        }
    }
}

/// Publisher that drops every failure.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish_failure(&self, _object: &ObjectReference, _failure: &ReconcileFailure) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_follows_the_pass() {
        assert_eq!(
            FailureReason::for_kind(ReconcileKind::Update),
            FailureReason::ReconcileFailed
        );
        assert_eq!(
            FailureReason::for_kind(ReconcileKind::Delete).as_str(),
            "DeleteFailed"
        );
    }

    // Scenario: a resource fails mid delete pass; the event names it
    #[test]
    fn resource_failure_becomes_warning_event() {
        let err = Error::resource("service", "port 80 already allocated");
        let failure = ReconcileFailure::new(
            ReconcileKind::Delete,
            FailureReason::DeleteFailed,
            &err,
        );
        assert_eq!(failure.resource.as_deref(), Some("service"));

        let event = failure.to_event();
        assert!(matches!(event.type_, EventType::Warning));
        assert_eq!(event.reason, "DeleteFailed");
        assert_eq!(event.action, "Delete");
        let note = event.note.unwrap_or_default();
        assert!(note.starts_with("delete pass failed at service: "));
        assert!(note.contains("port 80 already allocated"));
    }

    #[test]
    fn failure_without_resource_keeps_the_error() {
        let err = Error::internal_with_context("controller", "2 resource sets handle default/demo");
        let failure = ReconcileFailure::new(
            ReconcileKind::Update,
            FailureReason::AmbiguousResourceSet,
            &err,
        );
        assert_eq!(failure.resource, None);
        assert_eq!(failure.action(), "Reconcile");
        assert!(failure.note().starts_with("update pass failed: "));
    }

    #[test]
    fn long_notes_are_cut_on_a_char_boundary() {
        let err = Error::resource("r0", "é".repeat(MAX_NOTE_BYTES));
        let failure = ReconcileFailure::new(
            ReconcileKind::Update,
            FailureReason::ReconcileFailed,
            &err,
        );

        let note = failure.note();
        assert!(note.len() <= MAX_NOTE_BYTES);
        assert!(note.ends_with('…'));
    }

    #[tokio::test]
    async fn noop_publisher_accepts_failures() {
        let failure = ReconcileFailure::new(
            ReconcileKind::Update,
            FailureReason::ReconcileFailed,
            &Error::resource("r0", "boom"),
        );
        NoopEventPublisher
            .publish_failure(&ObjectReference::default(), &failure)
            .await;
    }
}
