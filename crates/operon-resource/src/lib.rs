//! Reconciliation resources for operon controllers
//!
//! - [`Resource`]: the two-call contract every reconciling unit satisfies
//! - [`CrudResource`]: drives a [`CrudResourceOps`] implementation through
//!   the current/desired/patch/apply protocol
//! - [`wrap`]: decorates resources with [`RetryDecorator`],
//!   [`MetricsDecorator`] or [`LoggingDecorator`]
//! - [`ResourceSet`]: an ordered pipeline plus the predicate selecting the
//!   objects it applies to

#![deny(missing_docs)]

pub mod crud;
pub mod logging;
pub mod metrics;
pub mod operation;
pub mod patch;
pub mod resource;
pub mod resource_set;
pub mod retry;
pub mod wrap;

#[cfg(test)]
mod testing;

pub use crud::{CrudResource, CrudResourceOps, DynCrudResourceOps};
pub use logging::LoggingDecorator;
pub use metrics::MetricsDecorator;
pub use operation::Operation;
pub use patch::Patch;
pub use resource::{BasicResource, Object, Resource, MAX_UNWRAP_DEPTH};
pub use resource_set::{ResourceSet, ResourceSetConfig};
pub use retry::RetryDecorator;
pub use wrap::{wrap, wrap_one, Decorator};
