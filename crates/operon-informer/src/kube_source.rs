//! [`Lister`] and [`Watcher`] over a `kube::Api`.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{ListParams, WatchParams};
use kube::core::WatchEvent as KubeWatchEvent;
use kube::Api;
use operon_common::{Error, Result};
use serde::de::DeserializeOwned;

use crate::source::{Lister, ObjectList, WatchEvent, WatchStream, Watcher};

/// Server-side watch timeout; the API server caps it below 295 seconds
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;

/// Lists and watches objects through the Kubernetes API
#[derive(Clone)]
pub struct KubeListWatch<K> {
    api: Api<K>,
    label_selector: Option<String>,
    field_selector: Option<String>,
    timeout_secs: u32,
}

impl<K> KubeListWatch<K> {
    /// List and watch everything `api` can see
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            label_selector: None,
            field_selector: None,
            timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
        }
    }

    /// Restrict to objects matching a label selector
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    /// Restrict to objects matching a field selector
    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    /// Override the server-side watch timeout
    pub fn timeout(mut self, secs: u32) -> Self {
        self.timeout_secs = secs.min(DEFAULT_WATCH_TIMEOUT_SECS);
        self
    }

    fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(labels) = &self.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        params
    }

    fn watch_params(&self) -> WatchParams {
        let mut params = WatchParams::default().timeout(self.timeout_secs);
        if let Some(labels) = &self.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        params
    }
}

/// Sort a kube error into decode, API or transport failures
fn classify(err: kube::Error) -> Error {
    match err {
        kube::Error::SerdeError(e) => Error::decode(e.to_string()),
        api @ kube::Error::Api(_) => Error::from(api),
        other => Error::transport(other.to_string()),
    }
}

fn convert<K>(event: KubeWatchEvent<K>) -> Result<WatchEvent<K>> {
    match event {
        KubeWatchEvent::Added(obj) => Ok(WatchEvent::Added(obj)),
        KubeWatchEvent::Modified(obj) => Ok(WatchEvent::Modified(obj)),
        KubeWatchEvent::Deleted(obj) => Ok(WatchEvent::Deleted(obj)),
        KubeWatchEvent::Bookmark(bookmark) => Ok(WatchEvent::Bookmark {
            resource_version: bookmark.metadata.resource_version,
        }),
        KubeWatchEvent::Error(status) => Err(Error::watch(status.code, status.message)),
    }
}

#[async_trait]
impl<K> Lister<K> for KubeListWatch<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self) -> Result<ObjectList<K>> {
        let list = self.api.list(&self.list_params()).await.map_err(classify)?;
        Ok(ObjectList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }
}

#[async_trait]
impl<K> Watcher<K> for KubeListWatch<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>> {
        let stream = self
            .api
            .watch(&self.watch_params(), resource_version)
            .await
            .map_err(classify)?;
        Ok(stream
            .map(|item| item.map_err(classify).and_then(convert))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    #[test]
    fn test_watch_error_status_is_gone_aware() {
        let event: KubeWatchEvent<()> = KubeWatchEvent::Error(ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        });
        let err = convert(event).unwrap_err();
        assert!(err.is_gone());
    }

    #[test]
    fn test_classify_keeps_api_errors() {
        let err = classify(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        }));
        assert!(matches!(err, Error::Kube { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_marks_decode_errors() {
        let serde_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err = classify(kube::Error::SerdeError(serde_err));
        assert!(matches!(err, Error::Decode { .. }));
        assert!(!err.is_retryable());
    }
}
