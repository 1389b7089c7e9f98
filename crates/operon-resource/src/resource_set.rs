//! Ordered resource pipelines selected per object.

use std::fmt;
use std::sync::Arc;

use operon_common::{Error, Result};

use crate::resource::{Object, Resource};

/// Predicate deciding whether a resource set applies to an object
pub type HandlesFn<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// Inputs of [`ResourceSet::new`]
pub struct ResourceSetConfig<K: Object> {
    /// Which watched objects the set applies to
    pub handles: Option<HandlesFn<K>>,
    /// Resources reconciled in order for every handled object
    pub resources: Vec<Resource<K>>,
}

impl<K: Object> Default for ResourceSetConfig<K> {
    fn default() -> Self {
        Self {
            handles: None,
            resources: Vec::new(),
        }
    }
}

impl<K: Object> ResourceSetConfig<K> {
    /// Set the handles predicate
    pub fn with_handles(mut self, handles: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.handles = Some(Arc::new(handles));
        self
    }

    /// Append a resource to the pipeline
    pub fn with_resource(mut self, resource: Resource<K>) -> Self {
        self.resources.push(resource);
        self
    }
}

/// A predicate plus the ordered resources reconciled for matching objects.
///
/// At most one set should handle a given object; the controller owning the
/// sets enforces that.
pub struct ResourceSet<K: Object> {
    handles: HandlesFn<K>,
    resources: Vec<Resource<K>>,
}

impl<K: Object> Clone for ResourceSet<K> {
    fn clone(&self) -> Self {
        Self {
            handles: Arc::clone(&self.handles),
            resources: self.resources.clone(),
        }
    }
}

impl<K: Object> fmt::Debug for ResourceSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSet")
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

impl<K: Object> ResourceSet<K> {
    /// Validate `config` and build the set
    pub fn new(config: ResourceSetConfig<K>) -> Result<Self> {
        let handles = config.handles.ok_or_else(|| {
            Error::invalid_config("resource set", "handles predicate must be set")
        })?;
        if config.resources.is_empty() {
            return Err(Error::invalid_config(
                "resource set",
                "at least one resource is required",
            ));
        }
        if let Some(index) = config.resources.iter().position(|r| r.name().is_empty()) {
            return Err(Error::invalid_config(
                "resource set",
                format!("resource at position {index} has an empty name"),
            ));
        }

        Ok(Self {
            handles,
            resources: config.resources,
        })
    }

    /// Whether this set applies to `obj`
    pub fn handles(&self, obj: &K) -> bool {
        (self.handles)(obj)
    }

    /// Resources in reconciliation order
    pub fn resources(&self) -> &[Resource<K>] {
        &self.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingResource;

    fn config() -> ResourceSetConfig<String> {
        ResourceSetConfig::default()
            .with_handles(|obj: &String| obj.starts_with("default/"))
            .with_resource(Resource::basic(RecordingResource::new("r0")))
            .with_resource(Resource::basic(RecordingResource::new("r1")))
    }

    #[test]
    fn test_valid_config_builds_set() {
        let set = ResourceSet::new(config()).unwrap();
        let names: Vec<_> = set.resources().iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["r0", "r1"]);
        assert!(set.handles(&"default/demo".to_string()));
        assert!(!set.handles(&"kube-system/demo".to_string()));
    }

    #[test]
    fn test_missing_predicate_is_rejected() {
        let mut config = config();
        config.handles = None;
        let err = ResourceSet::new(config).unwrap_err();
        assert!(err.is_invalid_config());
        assert!(err.to_string().contains("handles"));
    }

    #[test]
    fn test_empty_resource_list_is_rejected() {
        let config = ResourceSetConfig::<String>::default().with_handles(|_| true);
        let err = ResourceSet::new(config).unwrap_err();
        assert!(err.is_invalid_config());
    }

    #[test]
    fn test_unnamed_resource_is_rejected() {
        let config = config().with_resource(Resource::basic(RecordingResource::new("")));
        let err = ResourceSet::new(config).unwrap_err();
        assert!(err.is_invalid_config());
        assert!(err.to_string().contains("position 2"));
    }
}
