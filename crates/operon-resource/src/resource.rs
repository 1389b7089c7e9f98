//! The minimal contract every reconciling unit satisfies.
//!
//! A [`Resource`] is either a basic resource, which only knows how to
//! ensure its object exists or is gone, or a [`CrudResource`] driving the
//! patch protocol through its ops. Decorators pick their wrapping strategy
//! by matching on the variant.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use operon_common::{Error, Result};

use crate::crud::CrudResource;

/// Maximum number of `wrapped()` hops followed by [`Resource::underlying`]
pub const MAX_UNWRAP_DEPTH: usize = 100;

/// Bound shared by every object type a resource reconciles.
pub trait Object: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Object for T {}

/// A resource that ensures an object's side effects exist or are removed.
#[async_trait]
pub trait BasicResource<K: Object>: Send + Sync {
    /// Stable name, used as the `resource` metric label and log field
    fn name(&self) -> &str;

    /// Converge toward the object's desired state (create or update)
    async fn ensure_created(&self, obj: &K) -> Result<()>;

    /// Remove whatever the object caused to exist
    async fn ensure_deleted(&self, obj: &K) -> Result<()>;

    /// The resource this one decorates, if any
    fn wrapped(&self) -> Option<Resource<K>> {
        None
    }
}

/// A reconciling unit, tagged by how it can be decorated.
pub enum Resource<K: Object> {
    /// Anything implementing only the two ensure calls
    Basic(Arc<dyn BasicResource<K>>),
    /// A resource driven by the patch protocol
    Crud(CrudResource<K>),
}

impl<K: Object> Clone for Resource<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Basic(basic) => Self::Basic(Arc::clone(basic)),
            Self::Crud(crud) => Self::Crud(crud.clone()),
        }
    }
}

impl<K: Object> fmt::Debug for Resource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic(basic) => f.debug_tuple("Basic").field(&basic.name()).finish(),
            Self::Crud(crud) => f.debug_tuple("Crud").field(&crud.name()).finish(),
        }
    }
}

impl<K: Object> From<CrudResource<K>> for Resource<K> {
    fn from(crud: CrudResource<K>) -> Self {
        Self::Crud(crud)
    }
}

impl<K: Object> Resource<K> {
    /// Wrap a basic resource implementation
    pub fn basic(resource: impl BasicResource<K> + 'static) -> Self {
        Self::Basic(Arc::new(resource))
    }

    /// Stable name of the resource
    pub fn name(&self) -> &str {
        match self {
            Self::Basic(basic) => basic.name(),
            Self::Crud(crud) => crud.name(),
        }
    }

    /// Converge toward the object's desired state
    pub async fn ensure_created(&self, obj: &K) -> Result<()> {
        match self {
            Self::Basic(basic) => basic.ensure_created(obj).await,
            Self::Crud(crud) => crud.ensure_created(obj).await,
        }
    }

    /// Remove the object's side effects
    pub async fn ensure_deleted(&self, obj: &K) -> Result<()> {
        match self {
            Self::Basic(basic) => basic.ensure_deleted(obj).await,
            Self::Crud(crud) => crud.ensure_deleted(obj).await,
        }
    }

    /// The directly wrapped resource. CRUD resources decorate at the ops
    /// level and never wrap another resource.
    pub fn wrapped(&self) -> Option<Resource<K>> {
        match self {
            Self::Basic(basic) => basic.wrapped(),
            Self::Crud(_) => None,
        }
    }

    /// True for the CRUD variant
    pub fn is_crud(&self) -> bool {
        matches!(self, Self::Crud(_))
    }

    /// Follow `wrapped()` down to the innermost resource.
    ///
    /// Fails with [`Error::LoopDetected`] after [`MAX_UNWRAP_DEPTH`] hops.
    pub fn underlying(&self) -> Result<Resource<K>> {
        let mut current = self.clone();
        for _ in 0..MAX_UNWRAP_DEPTH {
            match current.wrapped() {
                Some(inner) => current = inner,
                None => return Ok(current),
            }
        }
        match current.wrapped() {
            Some(_) => Err(Error::loop_detected(MAX_UNWRAP_DEPTH)),
            None => Ok(current),
        }
    }
}
