//! The controller loop.
//!
//! Boot order: the schema is established, the informer is started, then
//! its streams are consumed until the token is cancelled.
//!
//! Every object is routed to the one [`ResourceSet`] whose predicate
//! matches. An update runs the create pass after making sure the
//! controller's finalizer is on the object. A delete runs the delete pass
//! and only then removes the finalizer, so a failed cleanup keeps the object
//! alive and the next resync drives the delete again.

use std::sync::Arc;

use kube::Resource;
use operon_common::backoff::{default_backoff, BackOffFactory};
use operon_common::metrics::{ControllerMetrics, EventStream, ReconcileKind, ReconcileTimer};
use operon_common::{telemetry, Error, Result, DEFAULT_METRIC_NAMESPACE};
use operon_informer::{object_key, Informer};
use operon_resource::{Object, ResourceSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::SchemaLifecycle;
use crate::events::{EventPublisher, FailureReason, NoopEventPublisher, ReconcileFailure};
use crate::finalizer::{finalizer_name, Finalizers, ObjectClient};

/// Builder for [`Controller`]
pub struct ControllerBuilder<K: Object> {
    name: String,
    resource_sets: Vec<ResourceSet<K>>,
    informer: Option<Informer<K>>,
    client: Option<Arc<dyn ObjectClient<K>>>,
    schema: Option<Arc<dyn SchemaLifecycle>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    metrics: Option<ControllerMetrics>,
    finalizer: Option<String>,
    finalizer_backoff: Option<BackOffFactory>,
}

impl<K> ControllerBuilder<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Start building the controller called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_sets: Vec::new(),
            informer: None,
            client: None,
            schema: None,
            publisher: None,
            metrics: None,
            finalizer: None,
            finalizer_backoff: None,
        }
    }

    /// Add a resource set; at most one set may handle any object
    pub fn resource_set(mut self, set: ResourceSet<K>) -> Self {
        self.resource_sets.push(set);
        self
    }

    /// Source of update, delete and error events (required)
    pub fn informer(mut self, informer: Informer<K>) -> Self {
        self.informer = Some(informer);
        self
    }

    /// Client used to edit finalizers (required)
    pub fn object_client(mut self, client: Arc<dyn ObjectClient<K>>) -> Self {
        self.client = Some(client);
        self
    }

    /// Schema established before the informer starts
    pub fn schema(mut self, schema: Arc<dyn SchemaLifecycle>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Where failure events go; defaults to dropping them
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Reconcile metrics; defaults to the global meter
    pub fn metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the finalizer name; defaults to `operon.dev/<name>`
    pub fn finalizer(mut self, name: impl Into<String>) -> Self {
        self.finalizer = Some(name.into());
        self
    }

    /// Retry policy for finalizer updates; defaults to [`default_backoff`]
    pub fn finalizer_backoff(mut self, backoff: BackOffFactory) -> Self {
        self.finalizer_backoff = Some(backoff);
        self
    }

    /// Validate and build the controller
    pub fn build(self) -> Result<Controller<K>> {
        if self.name.is_empty() {
            return Err(Error::invalid_config("controller", "name must not be empty"));
        }
        if self.resource_sets.is_empty() {
            return Err(Error::invalid_config(
                "controller",
                "at least one resource set is required",
            ));
        }
        let informer = self
            .informer
            .ok_or_else(|| Error::invalid_config("controller", "informer must be set"))?;
        let client = self
            .client
            .ok_or_else(|| Error::invalid_config("controller", "object client must be set"))?;

        let finalizers = Finalizers::new(
            self.finalizer.unwrap_or_else(|| finalizer_name(&self.name)),
            client,
            self.finalizer_backoff.unwrap_or_else(default_backoff),
        )?;
        let metrics = self.metrics.unwrap_or_else(|| {
            ControllerMetrics::new(&telemetry::meter(), DEFAULT_METRIC_NAMESPACE, &self.name)
        });

        Ok(Controller {
            name: self.name,
            resource_sets: self.resource_sets,
            informer,
            finalizers,
            schema: self.schema,
            publisher: self
                .publisher
                .unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            metrics,
        })
    }
}

/// Reconciles watched objects through their resource set.
pub struct Controller<K: Object> {
    name: String,
    resource_sets: Vec<ResourceSet<K>>,
    informer: Informer<K>,
    finalizers: Finalizers<K>,
    schema: Option<Arc<dyn SchemaLifecycle>>,
    publisher: Arc<dyn EventPublisher>,
    metrics: ControllerMetrics,
}

impl<K> Controller<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Start building a controller
    pub fn builder(name: impl Into<String>) -> ControllerBuilder<K> {
        ControllerBuilder::new(name)
    }

    /// Controller name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finalizer this controller owns
    pub fn finalizer(&self) -> &str {
        self.finalizers.name()
    }

    /// Run until `token` is cancelled.
    ///
    /// Fails only if the schema cannot be established; reconcile and
    /// informer errors are reported and the loop carries on.
    pub async fn boot(&self, token: CancellationToken) -> Result<()> {
        if let Some(schema) = &self.schema {
            schema.ensure_established().await?;
        }

        let informer_token = token.child_token();
        let mut streams = self.informer.watch(informer_token.clone());
        info!(controller = %self.name, finalizer = %self.finalizer(), "Controller started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(obj) = streams.deletes.recv() => {
                    self.metrics.record_event(EventStream::Delete);
                    let _ = self.reconcile_delete(&obj).await;
                }
                Some(obj) = streams.updates.recv() => {
                    self.metrics.record_event(EventStream::Update);
                    let _ = self.reconcile_update(&obj).await;
                }
                Some(err) = streams.errors.recv() => {
                    self.metrics.record_event(EventStream::Error);
                    self.informer_error(&err);
                }
                else => break,
            }
        }

        informer_token.cancel();
        if let Err(e) = streams.handle.await {
            warn!(controller = %self.name, error = %e, "Informer task ended abnormally");
        }
        info!(controller = %self.name, "Controller stopped");
        Ok(())
    }

    /// Ensure the finalizer, then run the create pass of the object's set
    #[instrument(skip_all, fields(controller = %self.name, object = %object_key(obj)))]
    pub async fn reconcile_update(&self, obj: &K) -> Result<()> {
        let Some(set) = self.select(obj, ReconcileKind::Update).await? else {
            debug!("No resource set handles object, skipping");
            return Ok(());
        };

        let timer = self.metrics.reconcile(ReconcileKind::Update);
        let result = self.create_pass(set, obj).await;
        self.finish(obj, ReconcileKind::Update, timer, result).await
    }

    /// Run the delete pass of the object's set, then release the finalizer
    #[instrument(skip_all, fields(controller = %self.name, object = %object_key(obj)))]
    pub async fn reconcile_delete(&self, obj: &K) -> Result<()> {
        let Some(set) = self.select(obj, ReconcileKind::Delete).await? else {
            // Nothing to clean up; don't hold the object hostage
            if self.finalizers.has_finalizer(obj) {
                return self.finalizers.remove(obj).await;
            }
            return Ok(());
        };

        let timer = self.metrics.reconcile(ReconcileKind::Delete);
        let result = self.delete_pass(set, obj).await;
        self.finish(obj, ReconcileKind::Delete, timer, result).await
    }

    async fn create_pass(&self, set: &ResourceSet<K>, obj: &K) -> Result<()> {
        self.finalizers.ensure(obj).await?;
        for resource in set.resources() {
            resource.ensure_created(obj).await?;
        }
        Ok(())
    }

    async fn delete_pass(&self, set: &ResourceSet<K>, obj: &K) -> Result<()> {
        for resource in set.resources() {
            resource.ensure_deleted(obj).await?;
        }
        self.finalizers.remove(obj).await
    }

    /// The single set handling `obj`; several matching sets is an error
    async fn select(&self, obj: &K, kind: ReconcileKind) -> Result<Option<&ResourceSet<K>>> {
        let matching: Vec<&ResourceSet<K>> = self
            .resource_sets
            .iter()
            .filter(|set| set.handles(obj))
            .collect();

        match matching.as_slice() {
            [] => Ok(None),
            [set] => Ok(Some(*set)),
            many => {
                let err = Error::internal_with_context(
                    "controller",
                    format!("{} resource sets handle {}", many.len(), object_key(obj)),
                );
                error!(error = %err, "Ambiguous resource set, skipping object");
                let failure =
                    ReconcileFailure::new(kind, FailureReason::AmbiguousResourceSet, &err);
                self.publish_failure(obj, &failure).await;
                Err(err)
            }
        }
    }

    async fn finish(
        &self,
        obj: &K,
        kind: ReconcileKind,
        timer: ReconcileTimer<'_>,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                timer.success();
                debug!(kind = kind.as_str(), "Reconciled");
                Ok(())
            }
            Err(e) => {
                timer.error();
                error!(
                    kind = kind.as_str(),
                    resource = e.resource_name().unwrap_or_default(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "Reconciliation failed"
                );
                let failure = ReconcileFailure::new(kind, FailureReason::for_kind(kind), &e);
                self.publish_failure(obj, &failure).await;
                Err(e)
            }
        }
    }

    async fn publish_failure(&self, obj: &K, failure: &ReconcileFailure) {
        self.publisher
            .publish_failure(&obj.object_ref(&()), failure)
            .await;
    }

    fn informer_error(&self, err: &Error) {
        if err.is_retryable() {
            warn!(controller = %self.name, error = %err, "Informer error");
        } else {
            error!(controller = %self.name, error = %err, "Informer error");
        }
    }
}
