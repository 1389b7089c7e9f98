//! The CRUD patch protocol.
//!
//! A concrete resource implements [`CrudResourceOps`]: read current and
//! desired state, turn them into a [`Patch`], and apply each of its changes.
//! [`CrudResource`] runs those calls in a fixed order for both the create and
//! the delete path:
//!
//! 1. `get_current_state`
//! 2. `get_desired_state`
//! 3. `new_update_patch` (or `new_delete_patch` on the delete path)
//! 4. `apply_create_change` if the patch has a create change
//! 5. `apply_delete_change` if the patch has a delete change
//! 6. `apply_update_change` if the patch has an update change
//!
//! Any error aborts the remaining steps and is returned as is. Retrying is a
//! decorator concern and never happens in here.
//!
//! Decorators work on [`DynCrudResourceOps`], the type-erased form of the
//! ops, so they can forward calls without knowing a resource's state and
//! change types.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use operon_common::{Error, Result};

use crate::patch::Patch;
use crate::resource::Object;

/// Type-erased state or change payload
pub type Erased = Box<dyn Any + Send + Sync>;

/// Borrowed form of [`Erased`]
pub type ErasedRef = dyn Any + Send + Sync;

/// The seven calls a concrete CRUD resource implements.
#[async_trait]
pub trait CrudResourceOps<K: Object>: Send + Sync + 'static {
    /// Observed or declared state of the managed thing
    type State: Send + Sync + 'static;
    /// One unit of change applied by an `apply_*` call
    type Change: Send + Sync + 'static;

    /// Stable, non-empty resource name
    fn name(&self) -> &str;

    /// Read what currently exists for `obj`
    async fn get_current_state(&self, obj: &K) -> Result<Self::State>;

    /// Compute what should exist for `obj`
    async fn get_desired_state(&self, obj: &K) -> Result<Self::State>;

    /// Changes converging `current` toward `desired`
    async fn new_update_patch(
        &self,
        obj: &K,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>>;

    /// Changes removing what `obj` caused to exist
    async fn new_delete_patch(
        &self,
        obj: &K,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>>;

    /// Apply a patch's create change
    async fn apply_create_change(&self, obj: &K, change: &Self::Change) -> Result<()>;

    /// Apply a patch's delete change
    async fn apply_delete_change(&self, obj: &K, change: &Self::Change) -> Result<()>;

    /// Apply a patch's update change
    async fn apply_update_change(&self, obj: &K, change: &Self::Change) -> Result<()>;
}

/// [`CrudResourceOps`] with state and change payloads erased.
///
/// Implemented for every typed ops value through [`CrudResource::new`], and
/// by the decorators that forward to another `DynCrudResourceOps`.
#[async_trait]
pub trait DynCrudResourceOps<K: Object>: Send + Sync {
    /// Stable, non-empty resource name
    fn name(&self) -> &str;

    /// See [`CrudResourceOps::get_current_state`]
    async fn get_current_state(&self, obj: &K) -> Result<Erased>;

    /// See [`CrudResourceOps::get_desired_state`]
    async fn get_desired_state(&self, obj: &K) -> Result<Erased>;

    /// See [`CrudResourceOps::new_update_patch`]
    async fn new_update_patch(
        &self,
        obj: &K,
        current: &ErasedRef,
        desired: &ErasedRef,
    ) -> Result<Patch<Erased>>;

    /// See [`CrudResourceOps::new_delete_patch`]
    async fn new_delete_patch(
        &self,
        obj: &K,
        current: &ErasedRef,
        desired: &ErasedRef,
    ) -> Result<Patch<Erased>>;

    /// See [`CrudResourceOps::apply_create_change`]
    async fn apply_create_change(&self, obj: &K, change: &ErasedRef) -> Result<()>;

    /// See [`CrudResourceOps::apply_delete_change`]
    async fn apply_delete_change(&self, obj: &K, change: &ErasedRef) -> Result<()>;

    /// See [`CrudResourceOps::apply_update_change`]
    async fn apply_update_change(&self, obj: &K, change: &ErasedRef) -> Result<()>;
}

/// Erases a typed ops value
struct Typed<O>(O);

fn downcast<'a, T: 'static>(resource: &str, what: &str, value: &'a ErasedRef) -> Result<&'a T> {
    value.downcast_ref::<T>().ok_or_else(|| {
        Error::type_mismatch(
            resource,
            format!("{what} is not a {}", std::any::type_name::<T>()),
        )
    })
}

fn erase<C: Send + Sync + 'static>(patch: Patch<C>) -> Patch<Erased> {
    patch.map(|change| Box::new(change) as Erased)
}

#[async_trait]
impl<K, O> DynCrudResourceOps<K> for Typed<O>
where
    K: Object,
    O: CrudResourceOps<K>,
{
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn get_current_state(&self, obj: &K) -> Result<Erased> {
        let state = self.0.get_current_state(obj).await?;
        Ok(Box::new(state))
    }

    async fn get_desired_state(&self, obj: &K) -> Result<Erased> {
        let state = self.0.get_desired_state(obj).await?;
        Ok(Box::new(state))
    }

    async fn new_update_patch(
        &self,
        obj: &K,
        current: &ErasedRef,
        desired: &ErasedRef,
    ) -> Result<Patch<Erased>> {
        let current = downcast::<O::State>(self.name(), "current state", current)?;
        let desired = downcast::<O::State>(self.name(), "desired state", desired)?;
        Ok(erase(self.0.new_update_patch(obj, current, desired).await?))
    }

    async fn new_delete_patch(
        &self,
        obj: &K,
        current: &ErasedRef,
        desired: &ErasedRef,
    ) -> Result<Patch<Erased>> {
        let current = downcast::<O::State>(self.name(), "current state", current)?;
        let desired = downcast::<O::State>(self.name(), "desired state", desired)?;
        Ok(erase(self.0.new_delete_patch(obj, current, desired).await?))
    }

    async fn apply_create_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        let change = downcast::<O::Change>(self.name(), "create change", change)?;
        self.0.apply_create_change(obj, change).await
    }

    async fn apply_delete_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        let change = downcast::<O::Change>(self.name(), "delete change", change)?;
        self.0.apply_delete_change(obj, change).await
    }

    async fn apply_update_change(&self, obj: &K, change: &ErasedRef) -> Result<()> {
        let change = downcast::<O::Change>(self.name(), "update change", change)?;
        self.0.apply_update_change(obj, change).await
    }
}

/// Which patch constructor a pass uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Update,
    Delete,
}

/// Runs the patch protocol over a (possibly decorated) ops value.
///
/// The ops are fixed at construction. Decorating a `CrudResource` builds a
/// new one around decorated ops; a resource already handed out is never
/// changed.
pub struct CrudResource<K: Object> {
    ops: Arc<dyn DynCrudResourceOps<K>>,
}

impl<K: Object> Clone for CrudResource<K> {
    fn clone(&self) -> Self {
        Self {
            ops: Arc::clone(&self.ops),
        }
    }
}

impl<K: Object> fmt::Debug for CrudResource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrudResource")
            .field("name", &self.name())
            .finish()
    }
}

impl<K: Object> CrudResource<K> {
    /// Build a resource from a typed ops implementation
    pub fn new<O: CrudResourceOps<K>>(ops: O) -> Result<Self> {
        Self::from_dyn_ops(Arc::new(Typed(ops)))
    }

    /// Build a resource from already erased (usually decorated) ops
    pub fn from_dyn_ops(ops: Arc<dyn DynCrudResourceOps<K>>) -> Result<Self> {
        if ops.name().is_empty() {
            return Err(Error::invalid_config(
                "crud resource",
                "ops name must not be empty",
            ));
        }
        Ok(Self { ops })
    }

    /// Name reported by the ops
    pub fn name(&self) -> &str {
        self.ops.name()
    }

    /// The ops this resource drives
    pub fn ops(&self) -> &Arc<dyn DynCrudResourceOps<K>> {
        &self.ops
    }

    /// Create or update: run the protocol with `new_update_patch`
    pub async fn ensure_created(&self, obj: &K) -> Result<()> {
        self.reconcile(obj, Pass::Update).await
    }

    /// Delete: run the protocol with `new_delete_patch`
    pub async fn ensure_deleted(&self, obj: &K) -> Result<()> {
        self.reconcile(obj, Pass::Delete).await
    }

    async fn reconcile(&self, obj: &K, pass: Pass) -> Result<()> {
        let current = self.ops.get_current_state(obj).await?;
        let desired = self.ops.get_desired_state(obj).await?;

        let patch = match pass {
            Pass::Update => {
                self.ops
                    .new_update_patch(obj, &*current, &*desired)
                    .await?
            }
            Pass::Delete => {
                self.ops
                    .new_delete_patch(obj, &*current, &*desired)
                    .await?
            }
        };

        let (create, delete, update) = patch.into_parts();
        if let Some(change) = create {
            self.ops.apply_create_change(obj, &*change).await?;
        }
        if let Some(change) = delete {
            self.ops.apply_delete_change(obj, &*change).await?;
        }
        if let Some(change) = update {
            self.ops.apply_update_change(obj, &*change).await?;
        }
        Ok(())
    }
}
