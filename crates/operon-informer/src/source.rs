//! The list and watch calls an informer consumes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use operon_common::Result;

/// Snapshot returned by a list call
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    /// Objects present at `resource_version`
    pub items: Vec<K>,
    /// Version to start watching from
    pub resource_version: String,
}

/// One change reported by a watch stream
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// Object created
    Added(K),
    /// Object changed
    Modified(K),
    /// Object removed
    Deleted(K),
    /// Progress marker without an object
    Bookmark {
        /// Latest version the server has sent
        resource_version: String,
    },
}

/// Events of one watch call; the stream ends when the server closes it
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Remote list call
#[async_trait]
pub trait Lister<K>: Send + Sync {
    /// List every watched object
    async fn list(&self) -> Result<ObjectList<K>>;
}

/// Remote watch call
#[async_trait]
pub trait Watcher<K>: Send + Sync {
    /// Open a watch delivering changes after `resource_version`
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>>;
}
