//! Retry decorator
//!
//! Each decorated call gets a fresh cursor from the decorator's
//! [`BackOffFactory`]. Failed attempts are logged as warnings; once the
//! backoff is exhausted, or the error is not retryable, the last error is
//! returned.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use operon_common::backoff::{default_backoff, retry_notify, BackOffFactory};
use operon_common::Result;
use tracing::warn;

use crate::crud::{DynCrudResourceOps, Erased, ErasedRef};
use crate::operation::Operation;
use crate::patch::Patch;
use crate::resource::{BasicResource, Object, Resource};
use crate::wrap::Decorator;

async fn retry<T, F, Fut>(
    backoff: &BackOffFactory,
    resource: &str,
    op: Operation,
    call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut cursor = backoff();
    let mut attempt = 0u32;
    retry_notify(cursor.as_mut(), call, |e, delay| {
        attempt += 1;
        warn!(
            resource = %resource,
            operation = %op,
            attempt = attempt,
            error = %e,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );
    })
    .await
}

/// Retries every call of the resources it decorates.
#[derive(Clone)]
pub struct RetryDecorator {
    backoff: BackOffFactory,
}

impl Default for RetryDecorator {
    fn default() -> Self {
        Self::new(default_backoff())
    }
}

impl RetryDecorator {
    /// Retry with cursors drawn from `backoff`
    pub fn new(backoff: BackOffFactory) -> Self {
        Self { backoff }
    }
}

impl<K: Object> Decorator<K> for RetryDecorator {
    fn decorate_ops(&self, ops: Arc<dyn DynCrudResourceOps<K>>) -> Arc<dyn DynCrudResourceOps<K>> {
        Arc::new(RetryOps {
            inner: ops,
            backoff: self.backoff.clone(),
        })
    }

    fn decorate_resource(&self, resource: Resource<K>) -> Resource<K> {
        Resource::Basic(Arc::new(RetryResource {
            inner: resource,
            backoff: self.backoff.clone(),
        }))
    }
}

/// CRUD ops retrying each protocol call individually
pub struct RetryOps<K: Object> {
    inner: Arc<dyn DynCrudResourceOps<K>>,
    backoff: BackOffFactory,
}

#[async_trait]
impl<K: Object> DynCrudResourceOps<K> for RetryOps<K> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_current_state(&self, obj: &K) -> Result<Erased> {
        retry(&self.backoff, self.name(), Operation::GetCurrentState, || {
            self.inner.get_current_state(obj)
        })
        .await
    }

    async fn get_desired_state(&self, obj: &K) -> Result<Erased> {
        retry(&self.backoff, self.name(), Operation::GetDesiredState, || {
            self.inner.get_desired_state(obj)
        })
        .await
    }

    async fn new_update_patch(
        &self,
        obj: &K,
        current: &ErasedRef,
        desired: &ErasedRef,
    ) -> Result<Patch<Erased>> {
        retry(&self.backoff, self.name(), Operation::NewUpdatePatch, || {
            self.inner.new_update_patch(obj, current, desired)
        })
        .await
    }

    async fn new_delete_patch(
        &self,
        obj: &K,
        current: &ErasedRef,
        desired: &ErasedRef,
    ) -> Result<Patch<Erased>> {
        retry(&self.backoff, self.name(), Operation::NewDeletePatch, || {
            self.inner.new_delete_patch(obj, current, desired)
        })
        .await
    }

    async fn apply_create_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        retry(&self.backoff, self.name(), Operation::ApplyCreateChange, || {
            self.inner.apply_create_change(obj, change)
        })
        .await
    }

    async fn apply_delete_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        retry(&self.backoff, self.name(), Operation::ApplyDeleteChange, || {
            self.inner.apply_delete_change(obj, change)
        })
        .await
    }

    async fn apply_update_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        retry(&self.backoff, self.name(), Operation::ApplyUpdateChange, || {
            self.inner.apply_update_change(obj, change)
        })
        .await
    }
}

/// Basic resource retrying its ensure calls
pub struct RetryResource<K: Object> {
    inner: Resource<K>,
    backoff: BackOffFactory,
}

#[async_trait]
impl<K: Object> BasicResource<K> for RetryResource<K> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ensure_created(&self, obj: &K) -> Result<()> {
        retry(&self.backoff, self.name(), Operation::EnsureCreated, || {
            self.inner.ensure_created(obj)
        })
        .await
    }

    async fn ensure_deleted(&self, obj: &K) -> Result<()> {
        retry(&self.backoff, self.name(), Operation::EnsureDeleted, || {
            self.inner.ensure_deleted(obj)
        })
        .await
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
    use crate::wrap::wrap_one;
    use operon_common::backoff::{factory, BackOff, MaxRetries, ZeroBackOff};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use Operation::*;

    fn obj() -> String {
        "default/demo".to_string()
    }

    fn retried(ops: RecordingOps, backoff: BackOffFactory) -> Resource<String> {
        let base = Resource::Crud(CrudResource::new(ops).unwrap());
        wrap_one(&base, &RetryDecorator::new(backoff)).unwrap()
    }

    /// Story: a clean delete pass is unchanged by the retry layer
    #[tokio::test]
    async fn story_zero_backoff_delete_pass() {
        let ops = RecordingOps::new("r0");
        let calls = ops.calls();
        let resource = retried(ops, factory(ZeroBackOff));

        resource.ensure_deleted(&obj()).await.unwrap();

        assert_eq!(
            calls.take(),
            vec![
                GetCurrentState,
                GetDesiredState,
                NewDeletePatch,
                ApplyCreateChange,
                ApplyDeleteChange,
                ApplyUpdateChange,
            ]
        );
    }

    /// Story: a failing step is retried on its own, earlier steps are not re-run
    #[tokio::test]
    async fn story_failed_step_is_retried_in_place() {
        // Scenario: first get_current_state fails on a delete pass
        let ops = RecordingOps::new("r0").fail_on(GetCurrentState, 1);
        let calls = ops.calls();
        let resource = retried(ops, factory(ZeroBackOff));

        resource.ensure_deleted(&obj()).await.unwrap();
        assert_eq!(
            calls.take(),
            vec![
                GetCurrentState,
                GetCurrentState,
                GetDesiredState,
                NewDeletePatch,
                ApplyCreateChange,
                ApplyDeleteChange,
                ApplyUpdateChange,
            ]
        );

        // Scenario: an apply step fails twice on the next create pass
        let ops = RecordingOps::new("r0")
            .fail_on(ApplyUpdateChange, 1)
            .fail_on(ApplyUpdateChange, 2);
        let calls = ops.calls();
        let resource = retried(ops, factory(ZeroBackOff));

        resource.ensure_created(&obj()).await.unwrap();
        assert_eq!(
            calls.take(),
            vec![
                GetCurrentState,
                GetDesiredState,
                NewUpdatePatch,
                ApplyCreateChange,
                ApplyDeleteChange,
                ApplyUpdateChange,
                ApplyUpdateChange,
                ApplyUpdateChange,
            ]
        );
    }

    #[tokio::test]
    async fn test_exhausted_backoff_returns_last_error() {
        let ops = RecordingOps::new("r0")
            .fail_on(GetDesiredState, 1)
            .fail_on(GetDesiredState, 2);
        let calls = ops.calls();
        let resource = retried(ops, factory(MaxRetries::new(ZeroBackOff, 1)));

        let err = resource.ensure_created(&obj()).await.unwrap_err();
        assert_eq!(err.resource_name(), Some("r0"));
        assert_eq!(
            calls.take(),
            vec![GetCurrentState, GetDesiredState, GetDesiredState]
        );
    }

    #[tokio::test]
    async fn test_each_call_gets_a_fresh_cursor() {
        // One retry per call: both failures are absorbed because each call
        // draws its own cursor.
        let ops = RecordingOps::new("r0")
            .fail_on(GetCurrentState, 1)
            .fail_on(GetDesiredState, 1);
        let calls = ops.calls();
        let resource = retried(ops, factory(MaxRetries::new(ZeroBackOff, 1)));

        resource.ensure_created(&obj()).await.unwrap();
        assert_eq!(calls.take().len(), 8);
    }

    /// Counts how often a retry was considered
    #[derive(Clone, Default)]
    struct CountingBackOff(Arc<AtomicUsize>);

    impl BackOff for CountingBackOff {
        fn next_backoff(&mut self) -> Option<Duration> {
            self.0.fetch_add(1, Ordering::SeqCst);
            None
        }

        fn reset(&mut self) {}
    }

    #[tokio::test]
    async fn test_type_mismatch_is_not_retried() {
        let backoff = CountingBackOff::default();
        let consulted = backoff.0.clone();
        let resource = retried(RecordingOps::new("r0"), factory(backoff));
        let Resource::Crud(crud) = resource else {
            panic!("retry layer must keep the crud shape");
        };

        let err = crud
            .ops()
            .apply_delete_change(&obj(), &"not a change")
            .await
            .unwrap_err();
        assert!(err.is_type_mismatch());
        assert_eq!(consulted.load(Ordering::SeqCst), 0);

        // A retryable failure on the same layer does consult the backoff
        let ops = RecordingOps::new("r0").fail_on(GetCurrentState, 1);
        let backoff = CountingBackOff::default();
        let consulted = backoff.0.clone();
        let resource = retried(ops, factory(backoff));
        assert!(resource.ensure_created(&obj()).await.is_err());
        assert_eq!(consulted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_basic_resource_retries_ensure_calls() {
        let base = RecordingResource::new("r1").fail_on(EnsureDeleted, 1);
        let calls = base.calls();
        let resource = wrap_one(
            &Resource::basic(base),
            &RetryDecorator::new(factory(ZeroBackOff)),
        )
        .unwrap();

        resource.ensure_deleted(&obj()).await.unwrap();
        resource.ensure_created(&obj()).await.unwrap();

        assert_eq!(calls.take(), vec![EnsureDeleted, EnsureDeleted, EnsureCreated]);
    }
}
