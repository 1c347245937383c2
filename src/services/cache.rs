//! src/services/cache.rs
//!
//! In-process caches for virtual objects and resolved versions. Both are
//! keyed by [`ObjectCacheKey`], invalidated eagerly whenever an object is
//! saved or deleted, and filled lazily on the next read.

use crate::models::object::VirtualObject;
use moka::sync::Cache;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc, time::Duration};

const DEFAULT_CAPACITY: u64 = 10_000;
const DEFAULT_TTL_SECS: u64 = 60 * 60;

/// Identifies one virtual object across both caches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectCacheKey {
    pub bucket: String,
    pub object_key: String,
}

impl ObjectCacheKey {
    pub fn new(bucket: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object_key: object_key.into(),
        }
    }

    pub fn of(object: &VirtualObject) -> Self {
        Self::new(&object.bucket, &object.object_key)
    }
}

/// Caches permanent virtual objects by key.
#[derive(Clone)]
pub struct ObjectCache {
    objects: Cache<ObjectCacheKey, VirtualObject>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self {
            objects: Cache::builder()
                .max_capacity(DEFAULT_CAPACITY)
                .time_to_live(Duration::from_secs(DEFAULT_TTL_SECS))
                .build(),
        }
    }

    pub fn get(&self, key: &ObjectCacheKey) -> Option<VirtualObject> {
        self.objects.get(key)
    }

    /// Temporary objects are never cached.
    pub fn put(&self, object: &VirtualObject) {
        if !object.temporary {
            self.objects.insert(ObjectCacheKey::of(object), object.clone());
        }
    }

    pub fn remove(&self, key: &ObjectCacheKey) {
        self.objects.invalidate(key);
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

type VersionMap = Arc<RwLock<HashMap<String, String>>>;

/// Maps an object to the physical keys of its computed versions (`spec -> key`).
#[derive(Clone)]
pub struct VersionCache {
    versions: Cache<ObjectCacheKey, VersionMap>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self {
            versions: Cache::builder()
                .max_capacity(DEFAULT_CAPACITY)
                .time_to_live(Duration::from_secs(DEFAULT_TTL_SECS))
                .build(),
        }
    }

    pub fn get(&self, key: &ObjectCacheKey, spec: &str) -> Option<String> {
        self.versions
            .get(key)
            .and_then(|versions| versions.read().get(spec).cloned())
    }

    pub fn put(&self, key: &ObjectCacheKey, spec: &str, physical_key: &str) {
        let versions = self.versions.get_with(key.clone(), VersionMap::default);
        versions
            .write()
            .insert(spec.to_string(), physical_key.to_string());
    }

    /// Drops every cached version of the object.
    pub fn remove(&self, key: &ObjectCacheKey) {
        self.versions.invalidate(key);
    }
}

impl Default for VersionCache {
    fn default() -> Self {
        Self::new()
    }
}
