//! Finalizer bookkeeping on watched objects.
//!
//! The controller adds its finalizer before the first create pass and
//! removes it only after every resource reported a successful delete, so
//! the API server keeps a deleting object around until cleanup finished.
//!
//! Updates are compare-and-swap replaces against the object's resource
//! version. A conflict means someone else wrote in between: the latest
//! object is read again and the edit re-applied under the backoff policy.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::PostParams;
use kube::{Api, Client, Resource, ResourceExt};
use operon_common::backoff::{retry_with_backoff, BackOffFactory};
use operon_common::{Error, Result, FINALIZER_PREFIX};
use operon_informer::cache::{is_deleting, object_key};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

/// Default finalizer name of the controller called `controller`
pub fn finalizer_name(controller: &str) -> String {
    format!("{}/{}", FINALIZER_PREFIX, controller)
}

/// Read and compare-and-swap access to watched objects
#[async_trait]
pub trait ObjectClient<K>: Send + Sync {
    /// Latest version of an object
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K>;

    /// Replace an object, failing with `Conflict` if its resource version
    /// is stale and `NotFound` if it is gone
    async fn replace(&self, obj: &K) -> Result<K>;
}

/// [`ObjectClient`] over the Kubernetes API
pub struct KubeObjectClient<K> {
    client: Client,
    api_for: fn(Client, Option<&str>) -> Api<K>,
}

impl<K> KubeObjectClient<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    /// Client for a namespaced kind
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api_for: |client, namespace| match namespace {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::default_namespaced(client),
            },
        }
    }
}

impl<K> KubeObjectClient<K>
where
    K: Resource<Scope = ClusterResourceScope>,
    K::DynamicType: Default,
{
    /// Client for a cluster-scoped kind
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api_for: |client, _| Api::all(client),
        }
    }
}

#[async_trait]
impl<K> ObjectClient<K> for KubeObjectClient<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        let api = (self.api_for)(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| {
            let key = match namespace {
                Some(ns) => format!("{}/{}", ns, name),
                None => name.to_string(),
            };
            Error::from_kube_for(key, e)
        })
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let api = (self.api_for)(self.client.clone(), obj.namespace().as_deref());
        api.replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube_for(object_key(obj), e))
    }
}

/// Adds and removes one finalizer on watched objects.
pub struct Finalizers<K> {
    name: String,
    client: Arc<dyn ObjectClient<K>>,
    backoff: BackOffFactory,
}

impl<K> Clone for Finalizers<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            client: Arc::clone(&self.client),
            backoff: Arc::clone(&self.backoff),
        }
    }
}

impl<K> Finalizers<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Manage the finalizer `name`, retrying conflicts under `backoff`
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ObjectClient<K>>,
        backoff: BackOffFactory,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::invalid_config("finalizer", "name must not be empty"));
        }
        Ok(Self {
            name,
            client,
            backoff,
        })
    }

    /// Finalizer name written on objects
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `obj` carries the finalizer
    pub fn has_finalizer(&self, obj: &K) -> bool {
        obj.finalizers().iter().any(|f| f == &self.name)
    }

    /// Add the finalizer unless already present.
    ///
    /// Objects already being deleted are left alone: the API server rejects
    /// new finalizers on them.
    pub async fn ensure(&self, obj: &K) -> Result<()> {
        if self.has_finalizer(obj) {
            return Ok(());
        }

        let client = &self.client;
        let finalizer = self.name.as_str();
        let namespace = obj.namespace();
        let namespace = namespace.as_deref();
        let name = obj.name_any();
        let name = name.as_str();

        retry_with_backoff(&self.backoff, "add_finalizer", || async move {
            let mut latest = client.get(namespace, name).await?;
            if latest.finalizers().iter().any(|f| f == finalizer) || is_deleting(&latest) {
                return Ok(());
            }
            latest.finalizers_mut().push(finalizer.to_string());
            client.replace(&latest).await?;
            info!(object = %object_key(&latest), finalizer, "Added finalizer");
            Ok(())
        })
        .await
    }

    /// Remove the finalizer; an object that is already gone counts as done
    pub async fn remove(&self, obj: &K) -> Result<()> {
        let client = &self.client;
        let finalizer = self.name.as_str();
        let namespace = obj.namespace();
        let namespace = namespace.as_deref();
        let name = obj.name_any();
        let name = name.as_str();

        let result = retry_with_backoff(&self.backoff, "remove_finalizer", || async move {
            let mut latest = client.get(namespace, name).await?;
            if !latest.finalizers().iter().any(|f| f == finalizer) {
                return Ok(());
            }
            latest.finalizers_mut().retain(|f| f != finalizer);
            client.replace(&latest).await?;
            info!(object = %object_key(&latest), finalizer, "Removed finalizer");
            Ok(())
        })
        .await;

        match result {
            Err(e) if e.is_not_found() => {
                debug!(object = %object_key(obj), "Object already gone");
                Ok(())
            }
            other => other,
        }
    }
}
