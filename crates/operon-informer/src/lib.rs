//! Informer for operon controllers
//!
//! Lists the watched objects, then follows a watch from the list's resource
//! version, re-listing every resync period. Changes come out on three
//! streams: updates, deletes and errors.
//!
//! # Example
//!
//! ```ignore
//! use operon_informer::{Informer, InformerConfig, KubeListWatch};
//!
//! let api: Api<MyResource> = Api::all(client);
//! let informer = Informer::from_source(InformerConfig::default(), KubeListWatch::new(api))?;
//! let mut streams = informer.watch(token.child_token());
//! while let Some(obj) = streams.updates.recv().await {
//!     // reconcile
//! }
//! ```

#![deny(missing_docs)]

pub mod cache;
pub mod informer;
pub mod kube_source;
pub mod source;

pub use cache::{object_key, ObjectCache};
pub use informer::{Informer, InformerConfig, InformerStreams};
pub use kube_source::KubeListWatch;
pub use source::{Lister, ObjectList, WatchEvent, WatchStream, Watcher};
