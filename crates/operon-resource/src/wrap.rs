//! Applying decorators to resources.
//!
//! A [`Decorator`] knows two ways to add behavior: splicing decorated ops
//! into a CRUD resource, which decorates each of the seven protocol calls,
//! or wrapping a whole resource around its two ensure calls. [`wrap`] tries
//! the splice first and falls back to the resource-level wrap when the
//! splice reports [`Error::IncompatibleUnderlyingResource`].

use std::sync::Arc;

use operon_common::{Error, Result};

use crate::crud::{CrudResource, DynCrudResourceOps};
use crate::resource::{Object, Resource};

/// Adds behavior around a resource's calls.
pub trait Decorator<K: Object>: Send + Sync {
    /// Forward every protocol call of `ops` with added behavior
    fn decorate_ops(&self, ops: Arc<dyn DynCrudResourceOps<K>>) -> Arc<dyn DynCrudResourceOps<K>>;

    /// Wrap the two ensure calls of `resource`
    fn decorate_resource(&self, resource: Resource<K>) -> Resource<K>;
}

/// Build a new CRUD resource around decorated ops.
///
/// Only a resource that is itself CRUD can be spliced. A basic wrapper is
/// never looked through, so behavior it adds is kept.
pub fn splice<K: Object>(
    resource: &Resource<K>,
    decorator: &dyn Decorator<K>,
) -> Result<Resource<K>> {
    match resource {
        Resource::Crud(crud) => {
            let ops = decorator.decorate_ops(Arc::clone(crud.ops()));
            Ok(Resource::Crud(CrudResource::from_dyn_ops(ops)?))
        }
        Resource::Basic(basic) => Err(Error::incompatible_underlying_resource(
            basic.name(),
            "not a CRUD resource",
        )),
    }
}

/// Decorate one resource, preferring the ops-level splice.
///
/// A basic resource that wraps a CRUD resource is decorated as a whole,
/// not spliced: the decorator only sees the two ensure calls. For a retry
/// decorator this means a failed step re-runs the entire pass from
/// `get_current_state` instead of retrying that step alone. Apply
/// step-level decorators before any basic wrapper to keep them per step.
pub fn wrap_one<K: Object>(
    resource: &Resource<K>,
    decorator: &dyn Decorator<K>,
) -> Result<Resource<K>> {
    // Surface wrapper cycles before adding another layer.
    resource.underlying()?;

    match splice(resource, decorator) {
        Err(e) if e.is_incompatible_underlying_resource() => {
            Ok(decorator.decorate_resource(resource.clone()))
        }
        other => other,
    }
}

/// Decorate each resource, preserving order and names.
///
/// Each resource goes through [`wrap_one`], so a basic wrapper around a
/// CRUD resource gets the resource-level fallback described there.
pub fn wrap<K: Object>(
    resources: &[Resource<K>],
    decorator: &dyn Decorator<K>,
) -> Result<Vec<Resource<K>>> {
    resources
        .iter()
        .map(|resource| wrap_one(resource, decorator))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LoggingDecorator;
    use crate::operation::Operation;
    use crate::retry::RetryDecorator;
    use crate::testing::{RecordingOps, RecordingResource};
    use operon_common::backoff::{factory, ZeroBackOff};

    #[test]
    fn test_wrap_preserves_order_and_names() {
        let resources = vec![
            Resource::Crud(CrudResource::new(RecordingOps::new("r0")).unwrap()),
            Resource::basic(RecordingResource::new("r1")),
            Resource::Crud(CrudResource::new(RecordingOps::new("r2")).unwrap()),
        ];

        let wrapped = wrap(&resources, &LoggingDecorator::new()).unwrap();

        let names: Vec<_> = wrapped.iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["r0", "r1", "r2"]);
        assert!(wrapped[0].is_crud());
        assert!(!wrapped[1].is_crud());
        assert!(wrapped[2].is_crud());
    }

    #[test]
    fn test_basic_resource_falls_back_to_resource_level() {
        let base = Resource::basic(RecordingResource::new("r1"));
        let decorator = RetryDecorator::new(factory(ZeroBackOff));

        let err = splice(&base, &decorator).unwrap_err();
        assert!(err.is_incompatible_underlying_resource());

        let wrapped = wrap_one(&base, &decorator).unwrap();
        assert_eq!(wrapped.name(), "r1");
        assert_eq!(wrapped.wrapped().map(|r| r.name().to_string()), Some("r1".into()));
    }

    // Scenario: a logging wrapper hides the crud resource, so the retry
    // layer added afterwards re-runs the whole pass on a failed step
    #[tokio::test]
    async fn test_basic_wrapper_around_crud_retries_whole_pass() {
        use Operation::*;

        let ops = RecordingOps::new("r0").fail_on(GetDesiredState, 1);
        let calls = ops.calls();
        let crud = Resource::Crud(CrudResource::new(ops).unwrap());
        let hidden = Decorator::decorate_resource(&LoggingDecorator::new(), crud);
        assert!(!hidden.is_crud());

        let wrapped = wrap_one(&hidden, &RetryDecorator::new(factory(ZeroBackOff))).unwrap();
        assert!(!wrapped.is_crud());

        wrapped.ensure_created(&"default/demo".to_string()).await.unwrap();
        assert_eq!(
            calls.take(),
            vec![
                GetCurrentState,
                GetDesiredState,
                GetCurrentState,
                GetDesiredState,
                NewUpdatePatch,
                ApplyCreateChange,
                ApplyDeleteChange,
                ApplyUpdateChange,
            ]
        );
    }

    #[test]
    fn test_crud_resource_is_spliced_not_wrapped() {
        let base = Resource::Crud(CrudResource::new(RecordingOps::new("r0")).unwrap());
        let wrapped = wrap_one(&base, &LoggingDecorator::new()).unwrap();

        assert!(wrapped.is_crud());
        assert!(wrapped.wrapped().is_none());
    }

    /// Story: stacking decorators keeps every layer
    #[tokio::test]
    async fn story_stacked_decorators_all_apply() {
        let resource = RecordingResource::new("r1").fail_on(Operation::EnsureCreated, 1);
        let calls = resource.calls();
        let base = vec![Resource::basic(resource)];

        // Scenario: retry innermost, logging outside it
        let retried = wrap(&base, &RetryDecorator::new(factory(ZeroBackOff))).unwrap();
        let logged = wrap(&retried, &LoggingDecorator::new()).unwrap();

        logged[0].ensure_created(&"default/demo".to_string()).await.unwrap();
        assert_eq!(
            calls.take(),
            vec![Operation::EnsureCreated, Operation::EnsureCreated]
        );

        // Two wrapper hops down to the base
        let underlying = logged[0].underlying().unwrap();
        assert_eq!(underlying.name(), "r1");
        assert!(underlying.wrapped().is_none());
    }
}
