//! CustomResourceDefinition lifecycle run before the informer starts.
//!
//! The controller's kind must be served before listing it. [`CrdLifecycle`]
//! creates the definition, waits for the API server to report it
//! `Established` and, if it never does, deletes the definition it created.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use operon_common::backoff::{
    factory, retry_with_backoff, BackOffFactory, ConstantBackOff, MaxRetries,
};
use operon_common::{Error, Result};
use tracing::{debug, error, info, warn};

/// Condition type the API server sets once a CRD is served
pub const ESTABLISHED: &str = "Established";

/// Interval between establishment checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Number of establishment checks before rolling back
pub const DEFAULT_MAX_POLLS: u32 = 30;

/// Brings the controller's schema into a servable state.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SchemaLifecycle: Send + Sync {
    /// Make sure the schema exists and is established
    async fn ensure_established(&self) -> Result<()>;
}

/// CRD calls used by [`CrdLifecycle`]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrdApi: Send + Sync {
    /// Create the definition; `Conflict` if it already exists
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<()>;

    /// Read a definition by name
    async fn get(&self, name: &str) -> Result<CustomResourceDefinition>;

    /// Delete a definition by name
    async fn delete(&self, name: &str) -> Result<()>;
}

/// [`CrdApi`] over the Kubernetes API
pub struct KubeCrdApi {
    api: Api<CustomResourceDefinition>,
}

impl KubeCrdApi {
    /// CRD access through `client`
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CrdApi for KubeCrdApi {
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<()> {
        let name = crd.metadata.name.clone().unwrap_or_default();
        self.api
            .create(&PostParams::default(), crd)
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube_for(name, e))
    }

    async fn get(&self, name: &str) -> Result<CustomResourceDefinition> {
        self.api
            .get(name)
            .await
            .map_err(|e| Error::from_kube_for(name, e))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube_for(name, e))
    }
}

/// True if the definition reports `Established=True`
pub fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == ESTABLISHED && c.status == "True")
        })
}

/// Creates a CRD and waits for it to be established.
pub struct CrdLifecycle {
    crd: CustomResourceDefinition,
    name: String,
    api: Arc<dyn CrdApi>,
    backoff: BackOffFactory,
}

impl CrdLifecycle {
    /// Manage `crd` through `api`, polling every 2s up to 30 times
    pub fn new(crd: CustomResourceDefinition, api: Arc<dyn CrdApi>) -> Result<Self> {
        let name = crd
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::invalid_config("crd", "definition must have a name"))?;
        Ok(Self {
            crd,
            name,
            api,
            backoff: factory(MaxRetries::new(
                ConstantBackOff::new(DEFAULT_POLL_INTERVAL),
                DEFAULT_MAX_POLLS,
            )),
        })
    }

    /// Replace the establishment polling policy
    pub fn with_backoff(mut self, backoff: BackOffFactory) -> Self {
        self.backoff = backoff;
        self
    }

    async fn wait_established(&self) -> Result<()> {
        let api = &self.api;
        let name = self.name.as_str();

        retry_with_backoff(&self.backoff, "wait_for_crd", || async move {
            let crd = api.get(name).await?;
            if is_established(&crd) {
                Ok(())
            } else {
                Err(Error::timeout("wait_for_crd", format!("{} not established", name)))
            }
        })
        .await
    }
}

#[async_trait]
impl SchemaLifecycle for CrdLifecycle {
    async fn ensure_established(&self) -> Result<()> {
        let created = match self.api.create(&self.crd).await {
            Ok(()) => {
                info!(crd = %self.name, "Created CRD");
                true
            }
            Err(e) if e.is_conflict() => {
                debug!(crd = %self.name, "CRD already exists");
                false
            }
            Err(e) => return Err(e),
        };

        let Err(e) = self.wait_established().await else {
            info!(crd = %self.name, "CRD established");
            return Ok(());
        };

        // Only a definition created here is rolled back; deleting a
        // pre-existing one would delete every object of the kind.
        if created {
            warn!(crd = %self.name, error = %e, "CRD not established, rolling back");
            match self.api.delete(&self.name).await {
                Ok(()) => {}
                Err(del) if del.is_not_found() => {}
                Err(del) => error!(crd = %self.name, error = %del, "Failed to roll back CRD"),
            }
        }
        Err(e)
    }
}
