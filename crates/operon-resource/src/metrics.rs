//! Metrics decorator
//!
//! Counts, times and error-counts every decorated call on the
//! [`OperationMetrics`] handle it was built with, labeled by service,
//! resource name and operation.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use operon_common::metrics::OperationMetrics;
use operon_common::Result;

use crate::crud::{DynCrudResourceOps, Erased, ErasedRef};
use crate::operation::Operation;
use crate::patch::Patch;
use crate::resource::{BasicResource, Object, Resource};
use crate::wrap::Decorator;

async fn observe<T>(
    metrics: &OperationMetrics,
    resource: &str,
    op: Operation,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    let timer = metrics.start(resource, op.as_str());
    let result = call.await;
    timer.finish(result.is_ok());
    result
}

/// Records operation metrics for the resources it decorates.
#[derive(Clone)]
pub struct MetricsDecorator {
    metrics: Arc<OperationMetrics>,
}

impl MetricsDecorator {
    /// Record on `metrics`, whose service label identifies the controller
    pub fn new(metrics: Arc<OperationMetrics>) -> Self {
        Self { metrics }
    }
}

impl<K: Object> Decorator<K> for MetricsDecorator {
    fn decorate_ops(&self, ops: Arc<dyn DynCrudResourceOps<K>>) -> Arc<dyn DynCrudResourceOps<K>> {
        Arc::new(MetricsOps {
            inner: ops,
            metrics: Arc::clone(&self.metrics),
        })
    }

    fn decorate_resource(&self, resource: Resource<K>) -> Resource<K> {
        Resource::Basic(Arc::new(MetricsResource {
            inner: resource,
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

/// CRUD ops recording metrics for each protocol call
pub struct MetricsOps<K: Object> {
    inner: Arc<dyn DynCrudResourceOps<K>>,
    metrics: Arc<OperationMetrics>,
}

#[async_trait]
impl<K: Object> DynCrudResourceOps<K> for MetricsOps<K> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_current_state(&self, obj: &K) -> Result<Erased> {
        let call = self.inner.get_current_state(obj);
        observe(&self.metrics, self.name(), Operation::GetCurrentState, call).await
    }

    async fn get_desired_state(&self, obj: &K) -> Result<Erased> {
        let call = self.inner.get_desired_state(obj);
        observe(&self.metrics, self.name(), Operation::GetDesiredState, call).await
    }

    async fn new_update_patch(
        &self,
        obj: &K,
        current: &ErasedRef,
        desired: &ErasedRef,
    ) -> Result<Patch<Erased>> {
        let call = self.inner.new_update_patch(obj, current, desired);
        observe(&self.metrics, self.name(), Operation::NewUpdatePatch, call).await
    }

    async fn new_delete_patch(
        &self,
        obj: &K,
        current: &ErasedRef,
        desired: &ErasedRef,
    ) -> Result<Patch<Erased>> {
        let call = self.inner.new_delete_patch(obj, current, desired);
        observe(&self.metrics, self.name(), Operation::NewDeletePatch, call).await
    }

    async fn apply_create_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        let call = self.inner.apply_create_change(obj, change);
        observe(&self.metrics, self.name(), Operation::ApplyCreateChange, call).await
    }

    async fn apply_delete_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        let call = self.inner.apply_delete_change(obj, change);
        observe(&self.metrics, self.name(), Operation::ApplyDeleteChange, call).await
    }

    async fn apply_update_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        let call = self.inner.apply_update_change(obj, change);
        observe(&self.metrics, self.name(), Operation::ApplyUpdateChange, call).await
    }
}

/// Basic resource recording metrics for its ensure calls
pub struct MetricsResource<K: Object> {
    inner: Resource<K>,
    metrics: Arc<OperationMetrics>,
}

#[async_trait]
impl<K: Object> BasicResource<K> for MetricsResource<K> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ensure_created(&self, obj: &K) -> Result<()> {
        let call = self.inner.ensure_created(obj);
        observe(&self.metrics, self.name(), Operation::EnsureCreated, call).await
    }

    async fn ensure_deleted(&self, obj: &K) -> Result<()> {
        let call = self.inner.ensure_deleted(obj);
        observe(&self.metrics, self.name(), Operation::EnsureDeleted, call).await
    }

    fn wrapped(&self) -> Option<Resource<K>> {
        Some(self.inner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crud::CrudResource;
    use crate::testing::{RecordingOps, RecordingResource};
    use crate::wrap::wrap;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::data::{Histogram, Sum};
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
    use opentelemetry_sdk::runtime;
    use opentelemetry_sdk::testing::metrics::InMemoryMetricExporter;

    fn setup() -> (SdkMeterProvider, InMemoryMetricExporter, Arc<OperationMetrics>) {
        let exporter = InMemoryMetricExporter::default();
        let reader = PeriodicReader::builder(exporter.clone(), runtime::Tokio).build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        let meter = provider.meter("operon-test");
        let metrics = Arc::new(OperationMetrics::new(&meter, "operon", "resource", "svc"));
        (provider, exporter, metrics)
    }

    fn label(attributes: &[KeyValue], key: &str) -> Option<String> {
        attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.to_string())
    }

    /// Sum of `name` for the given resource and operation labels
    fn counter_value(
        provider: &SdkMeterProvider,
        exporter: &InMemoryMetricExporter,
        name: &str,
        resource: &str,
        operation: &str,
    ) -> u64 {
        provider.force_flush().unwrap();
        let finished = exporter.get_finished_metrics().unwrap();
        let Some(last) = finished.last() else {
            return 0;
        };

        let mut total = 0;
        for scope in &last.scope_metrics {
            for metric in scope.metrics.iter().filter(|m| m.name == name) {
                let Some(sum) = metric.data.as_any().downcast_ref::<Sum<u64>>() else {
                    continue;
                };
                for point in &sum.data_points {
                    if label(&point.attributes, "service").as_deref() == Some("svc")
                        && label(&point.attributes, "resource").as_deref() == Some(resource)
                        && label(&point.attributes, "operation").as_deref() == Some(operation)
                    {
                        total += point.value;
                    }
                }
            }
        }
        total
    }

    /// Recorded count and sum of the latency histogram for one series
    fn histogram_point(
        provider: &SdkMeterProvider,
        exporter: &InMemoryMetricExporter,
        resource: &str,
        operation: &str,
    ) -> Option<(u64, f64)> {
        provider.force_flush().unwrap();
        let finished = exporter.get_finished_metrics().unwrap();
        let last = finished.last()?;

        last.scope_metrics
            .iter()
            .flat_map(|scope| scope.metrics.iter())
            .filter(|m| m.name == "operon_resource_operation")
            .filter_map(|m| m.data.as_any().downcast_ref::<Histogram<f64>>())
            .flat_map(|histogram| histogram.data_points.iter())
            .find(|point| {
                label(&point.attributes, "service").as_deref() == Some("svc")
                    && label(&point.attributes, "resource").as_deref() == Some(resource)
                    && label(&point.attributes, "operation").as_deref() == Some(operation)
            })
            .map(|point| (point.count, point.sum))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_latency_is_recorded_per_call() {
        let (provider, exporter, metrics) = setup();
        let base = Resource::Crud(CrudResource::new(RecordingOps::new("r0")).unwrap());
        let wrapped = wrap(&[base], &MetricsDecorator::new(metrics)).unwrap();

        wrapped[0]
            .ensure_created(&"default/demo".to_string())
            .await
            .unwrap();

        let (count, sum) = histogram_point(&provider, &exporter, "r0", "get_current_state")
            .expect("latency recorded for get_current_state");
        assert_eq!(count, 1);
        assert!(sum >= 0.0);

        // The delete path was never taken
        assert!(histogram_point(&provider, &exporter, "r0", "new_delete_patch").is_none());
    }

    /// Story: per-resource series are counted independently
    #[tokio::test(flavor = "multi_thread")]
    async fn story_operation_totals_per_resource() {
        let (provider, exporter, metrics) = setup();
        let resources = vec![
            Resource::Crud(CrudResource::new(RecordingOps::new("r0")).unwrap()),
            Resource::Crud(CrudResource::new(RecordingOps::new("r1")).unwrap()),
        ];
        let wrapped = wrap(&resources, &MetricsDecorator::new(metrics)).unwrap();

        // Scenario: one create pass over both resources
        for resource in &wrapped {
            resource
                .ensure_created(&"default/demo".to_string())
                .await
                .unwrap();
        }

        for name in ["r0", "r1"] {
            assert_eq!(
                counter_value(
                    &provider,
                    &exporter,
                    "operon_resource_operation_total",
                    name,
                    "get_current_state"
                ),
                1
            );
            assert_eq!(
                counter_value(
                    &provider,
                    &exporter,
                    "operon_resource_operation_total",
                    name,
                    "apply_update_change"
                ),
                1
            );
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_errors_are_counted_separately() {
        let (provider, exporter, metrics) = setup();
        let base = Resource::basic(
            RecordingResource::new("r1").fail_on(Operation::EnsureDeleted, 1),
        );
        let wrapped = wrap(&[base], &MetricsDecorator::new(metrics)).unwrap();
        let obj = "default/demo".to_string();

        assert!(wrapped[0].ensure_deleted(&obj).await.is_err());
        assert!(wrapped[0].ensure_deleted(&obj).await.is_ok());

        assert_eq!(
            counter_value(
                &provider,
                &exporter,
                "operon_resource_operation_total",
                "r1",
                "ensure_deleted"
            ),
            2
        );
        assert_eq!(
            counter_value(
                &provider,
                &exporter,
                "operon_resource_operation_error_total",
                "r1",
                "ensure_deleted"
            ),
            1
        );
    }
}
