//! Controller loop for operon
//!
//! Wires an [`Informer`](operon_informer::Informer) to one or more
//! [`ResourceSet`](operon_resource::ResourceSet)s:
//! - **crd**: establishes the controller's CustomResourceDefinition first
//! - **finalizer**: holds deleting objects until their cleanup succeeded
//! - **events**: records failed passes as Warning events on the object
//! - **controller**: routes informer events to the matching resource set
//!
//! # Example
//!
//! ```ignore
//! use operon_controller::{Controller, CrdLifecycle, KubeCrdApi, KubeObjectClient};
//!
//! let controller = Controller::builder("widget-controller")
//!     .resource_set(widgets)
//!     .informer(Informer::from_source(InformerConfig::default(), KubeListWatch::new(api))?)
//!     .object_client(Arc::new(KubeObjectClient::<Widget>::namespaced(client.clone())))
//!     .schema(Arc::new(CrdLifecycle::new(Widget::crd(), Arc::new(KubeCrdApi::new(client)))?))
//!     .build()?;
//! controller.boot(token).await?;
//! ```

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod events;
pub mod finalizer;

pub use controller::{Controller, ControllerBuilder};
pub use crd::{CrdApi, CrdLifecycle, KubeCrdApi, SchemaLifecycle};
pub use events::{
    EventPublisher, FailureReason, KubeEventPublisher, NoopEventPublisher, ReconcileFailure,
};
pub use finalizer::{finalizer_name, Finalizers, KubeObjectClient, ObjectClient};
