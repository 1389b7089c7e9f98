//! Logging decorator: a debug event when a call starts and when it ends,
//! an error event when it fails.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use operon_common::Result;
use tracing::{debug, error};

use crate::crud::{DynCrudResourceOps, Erased, ErasedRef};
use crate::operation::Operation;
use crate::patch::Patch;
use crate::resource::{BasicResource, Object, Resource};
use crate::wrap::Decorator;

async fn logged<T>(
    resource: &str,
    op: Operation,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    debug!(resource = %resource, operation = %op, "Operation started");
    let start = Instant::now();
    let result = call.await;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => debug!(
            resource = %resource,
            operation = %op,
            elapsed_ms,
            "Operation finished"
        ),
        Err(e) => error!(
            resource = %resource,
            operation = %op,
            elapsed_ms,
            error = %e,
            "Operation failed"
        ),
    }
    result
}

/// Logs every call of the resources it decorates.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingDecorator;

impl LoggingDecorator {
    /// Create a logging decorator
    pub fn new() -> Self {
        Self
    }
}

impl<K: Object> Decorator<K> for LoggingDecorator {
    fn decorate_ops(&self, ops: Arc<dyn DynCrudResourceOps<K>>) -> Arc<dyn DynCrudResourceOps<K>> {
        Arc::new(LoggingOps { inner: ops })
    }

    fn decorate_resource(&self, resource: Resource<K>) -> Resource<K> {
        Resource::Basic(Arc::new(LoggingResource { inner: resource }))
    }
}

/// CRUD ops logging each protocol call
pub struct LoggingOps<K: Object> {
    inner: Arc<dyn DynCrudResourceOps<K>>,
}

#[async_trait]
impl<K: Object> DynCrudResourceOps<K> for LoggingOps<K> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_current_state(&self, obj: &K) -> Result<Erased> {
        logged(self.name(), Operation::GetCurrentState, self.inner.get_current_state(obj)).await
    }

    async fn get_desired_state(&self, obj: &K) -> Result<Erased> {
        logged(self.name(), Operation::GetDesiredState, self.inner.get_desired_state(obj)).await
    }

    async fn new_update_patch(
        &self,
        obj: &K,
        current: &ErasedRef,
        desired: &ErasedRef,
    ) -> Result<Patch<Erased>> {
        let call = self.inner.new_update_patch(obj, current, desired);
        logged(self.name(), Operation::NewUpdatePatch, call).await
    }

    async fn new_delete_patch(
        &self,
        obj: &K,
        current: &ErasedRef,
        desired: &ErasedRef,
    ) -> Result<Patch<Erased>> {
        let call = self.inner.new_delete_patch(obj, current, desired);
        logged(self.name(), Operation::NewDeletePatch, call).await
    }

    async fn apply_create_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        let call = self.inner.apply_create_change(obj, change);
        logged(self.name(), Operation::ApplyCreateChange, call).await
    }

    async fn apply_delete_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        let call = self.inner.apply_delete_change(obj, change);
        logged(self.name(), Operation::ApplyDeleteChange, call).await
    }

    async fn apply_update_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        let call = self.inner.apply_update_change(obj, change);
        logged(self.name(), Operation::ApplyUpdateChange, call).await
    }
}

/// Basic resource logging its ensure calls
pub struct LoggingResource<K: Object> {
    inner: Resource<K>,
}

#[async_trait]
impl<K: Object> BasicResource<K> for LoggingResource<K> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ensure_created(&self, obj: &K) -> Result<()> {
        logged(self.name(), Operation::EnsureCreated, self.inner.ensure_created(obj)).await
    }

    async fn ensure_deleted(&self, obj: &K) -> Result<()> {
        logged(self.name(), Operation::EnsureDeleted, self.inner.ensure_deleted(obj)).await
    }

    fn wrapped(&self) -> Option<Resource<K>> {
        Some(self.inner.clone())
    }
}
