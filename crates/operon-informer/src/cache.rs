//! Last-observed identity of every watched object.
//!
//! The cache keeps just enough to tell a genuine change from a replay of
//! something already delivered, and whether the object was delivered on the
//! delete stream.

use std::collections::{HashMap, HashSet};

use kube::{Resource, ResourceExt};

/// `namespace/name` for namespaced objects, `name` otherwise
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// True when the object carries a deletion timestamp
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// What the informer last saw of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Resource version of the last delivered event
    pub resource_version: String,
    /// Whether that event went to the delete stream
    pub deleting: bool,
}

/// Where an observed object should be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Create/update stream
    Update,
    /// Delete stream
    Delete,
    /// Already delivered at this version
    Replay,
}

/// Per-object cache keyed by [`object_key`]
#[derive(Debug, Default)]
pub struct ObjectCache {
    entries: HashMap<String, CacheEntry>,
}

impl ObjectCache {
    /// Number of tracked objects
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for `key`, if tracked
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Record an added or modified object and decide where it goes
    pub fn observe<K: Resource>(&mut self, obj: &K) -> Delivery {
        let key = object_key(obj);
        let version = obj.resource_version().unwrap_or_default();
        let deleting = is_deleting(obj);

        if let Some(entry) = self.entries.get(&key) {
            if !version.is_empty() && entry.resource_version == version {
                return Delivery::Replay;
            }
        }

        self.entries.insert(
            key,
            CacheEntry {
                resource_version: version,
                deleting,
            },
        );
        if deleting {
            Delivery::Delete
        } else {
            Delivery::Update
        }
    }

    /// Drop a deleted object; true if its deletion still needs delivering
    pub fn remove<K: Resource>(&mut self, obj: &K) -> bool {
        match self.entries.remove(&object_key(obj)) {
            Some(entry) => !entry.deleting,
            None => true,
        }
    }

    /// Forget objects whose keys are not in `present`
    pub fn retain_keys(&mut self, present: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| present.contains(key));
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn cm(name: &str, version: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn deleting(mut obj: ConfigMap) -> ConfigMap {
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        obj
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key(&cm("demo", "1")), "default/demo");

        let mut cluster_scoped = cm("demo", "1");
        cluster_scoped.metadata.namespace = None;
        assert_eq!(object_key(&cluster_scoped), "demo");
    }

    #[test]
    fn test_replay_is_suppressed() {
        let mut cache = ObjectCache::default();
        assert_eq!(cache.observe(&cm("demo", "1")), Delivery::Update);
        assert_eq!(cache.observe(&cm("demo", "1")), Delivery::Replay);
        assert_eq!(cache.observe(&cm("demo", "2")), Delivery::Update);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_deleting_object_goes_to_delete_stream_once() {
        let mut cache = ObjectCache::default();
        cache.observe(&cm("demo", "1"));

        assert_eq!(cache.observe(&deleting(cm("demo", "2"))), Delivery::Delete);
        assert_eq!(cache.get("default/demo").map(|e| e.deleting), Some(true));

        // The final Deleted event was already covered by the deleting update
        assert!(!cache.remove(&cm("demo", "3")));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_deleted_without_timestamp_is_delivered() {
        let mut cache = ObjectCache::default();
        cache.observe(&cm("demo", "1"));
        assert!(cache.remove(&cm("demo", "2")));
        // Unknown objects are delivered too
        assert!(cache.remove(&cm("other", "5")));
    }

    #[test]
    fn test_retain_keys_drops_vanished_objects() {
        let mut cache = ObjectCache::default();
        cache.observe(&cm("a", "1"));
        cache.observe(&cm("b", "1"));

        let present = HashSet::from(["default/a".to_string()]);
        let dropped = cache.retain_keys(&present);
        assert_eq!(dropped, 1);
        assert!(cache.get("default/b").is_none());
    }

    #[test]
    fn test_retain_keys_prunes_everything_absent_from_list() {
        let mut cache = ObjectCache::default();
        for name in ["a", "b", "c", "d"] {
            cache.observe(&cm(name, "1"));
        }

        let present: HashSet<String> = ["default/b", "default/d", "default/unknown"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(cache.retain_keys(&present), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("default/a").is_none());
        assert!(cache.get("default/c").is_none());

        // Scenario: the next identical list drops nothing
        assert_eq!(cache.retain_keys(&present), 0);

        // Scenario: an empty list forgets every object
        assert_eq!(cache.retain_keys(&HashSet::new()), 2);
        assert!(cache.is_empty());
    }
}
