//! Client-side resource collections kept live by list+watch.
//!
//! A collection is filled from paginated list responses and then mutated by
//! watch events. [`WatchableCollection`] keeps the objects themselves, sorted
//! by name with no duplicate UIDs; [`Counter`] only tracks how many there are.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use parking_lot::RwLock;

/// One page of a list response
#[derive(Clone, Debug)]
pub struct Page<K> {
    pub items: Vec<K>,
    /// Cursor for the next page, `None` on the last page
    pub continue_token: Option<String>,
    pub resource_version: String,
    /// Objects left after this page, when the server reports it
    pub remaining_item_count: Option<i64>,
}

/// A change delivered by a watch
#[derive(Clone, Debug)]
pub enum ResourceEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress notification carrying only a resource version
    Bookmark(String),
}

impl<K: Resource> ResourceEvent<K> {
    /// Resource version this event moves the cursor to
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => {
                obj.meta().resource_version.as_deref()
            }
            Self::Bookmark(rv) => Some(rv),
        }
    }
}

/// State driven by the list+watch reconciler
pub trait ListWatchState<K>: Clone + Send + Sync + 'static {
    /// Discard everything before a full resync
    fn reset(&mut self);

    /// Merge one list page
    fn apply_page(&mut self, page: Page<K>);

    /// Merge one watch event
    fn apply_event(&mut self, event: ResourceEvent<K>);

    /// Cursor to resume a watch from
    fn resource_version(&self) -> &str;
}

/// Pagination and watch cursors of a collection
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionMeta {
    pub continue_token: String,
    pub resource_version: String,
}

/// Identity map shared by every view of the same objects
///
/// Views update it on every event so an object removed from one collection is
/// seen as deleted by any other view holding the same UID.
pub struct ObjectCache<K> {
    objects: Arc<RwLock<HashMap<String, K>>>,
}

impl<K> Clone for ObjectCache<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
        }
    }
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K: Resource + Clone> ObjectCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, obj: &K) {
        self.objects.write().insert(identity(obj), obj.clone());
    }

    pub fn get(&self, uid: &str) -> Option<K> {
        self.objects.read().get(uid).cloned()
    }

    /// Stamp a synthetic deletion timestamp on the cached copy
    pub fn mark_deleted(&self, obj: &K, at: DateTime<Utc>) {
        let mut objects = self.objects.write();
        let entry = objects.entry(identity(obj)).or_insert_with(|| obj.clone());
        entry.meta_mut().deletion_timestamp = Some(Time(at));
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

/// Ordered, deduplicated list of resources
#[derive(Clone)]
pub struct WatchableCollection<K> {
    items: Vec<K>,
    metadata: CollectionMeta,
    cache: Option<ObjectCache<K>>,
}

impl<K> Default for WatchableCollection<K> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            metadata: CollectionMeta::default(),
            cache: None,
        }
    }
}

impl<K: Resource + Clone> WatchableCollection<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an identity map with other views
    pub fn with_cache(mut self, cache: ObjectCache<K>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Items sorted by name
    pub fn items(&self) -> &[K] {
        &self.items
    }

    pub fn metadata(&self) -> &CollectionMeta {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, uid: &str) -> Option<&K> {
        self.position(uid).map(|idx| &self.items[idx])
    }

    fn position(&self, uid: &str) -> Option<usize> {
        self.items.iter().position(|item| identity(item) == uid)
    }

    fn remember(&self, obj: &K) {
        if let Some(cache) = &self.cache {
            cache.upsert(obj);
        }
    }

    /// Insert keeping name order; replaces an existing entry with the same UID
    fn upsert(&mut self, obj: K) {
        self.remember(&obj);
        if let Some(idx) = self.position(&identity(&obj)) {
            self.items[idx] = obj;
            return;
        }
        let name = name_of(&obj);
        let pos = self.items.partition_point(|item| name_of(item) <= name);
        self.items.insert(pos, obj);
    }

    fn set_resource_version(&mut self, rv: Option<&str>) {
        if let Some(rv) = rv {
            self.metadata.resource_version = rv.to_string();
        }
    }
}

impl<K> ListWatchState<K> for WatchableCollection<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn reset(&mut self) {
        self.items.clear();
        self.metadata = CollectionMeta::default();
    }

    fn apply_page(&mut self, page: Page<K>) {
        for item in page.items {
            self.upsert(item);
        }
        self.metadata.continue_token = page.continue_token.unwrap_or_default();
        self.metadata.resource_version = page.resource_version;
    }

    fn apply_event(&mut self, event: ResourceEvent<K>) {
        let rv = event.resource_version().map(str::to_string);

        match event {
            ResourceEvent::Added(obj) => {
                if self.position(&identity(&obj)).is_none() {
                    self.upsert(obj);
                }
            }
            ResourceEvent::Modified(obj) => {
                if let Some(idx) = self.position(&identity(&obj)) {
                    self.remember(&obj);
                    self.items[idx] = obj;
                } else {
                    self.remember(&obj);
                }
            }
            ResourceEvent::Deleted(obj) => {
                let uid = identity(&obj);
                if obj.meta().deletion_timestamp.is_none() {
                    // Forced delete: no graceful-termination phase was observed
                    self.items.retain(|item| identity(item) != uid);
                    if let Some(cache) = &self.cache {
                        cache.mark_deleted(&obj, Utc::now());
                    }
                } else if let Some(idx) = self.position(&uid) {
                    self.remember(&obj);
                    self.items[idx] = obj;
                }
            }
            ResourceEvent::Bookmark(_) => {}
        }

        self.set_resource_version(rv.as_deref());
    }

    fn resource_version(&self) -> &str {
        &self.metadata.resource_version
    }
}

/// Count of resources kept live without storing them
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Counter {
    remaining_item_count: i64,
    resource_version: String,
    listed: i64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of objects
    pub fn remaining_item_count(&self) -> i64 {
        self.remaining_item_count
    }
}

impl<K> ListWatchState<K> for Counter
where
    K: Resource + Send + Sync + 'static,
{
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn apply_page(&mut self, page: Page<K>) {
        self.listed += page.items.len() as i64;
        self.remaining_item_count = self.listed + page.remaining_item_count.unwrap_or(0);
        self.resource_version = page.resource_version;
    }

    fn apply_event(&mut self, event: ResourceEvent<K>) {
        if let Some(rv) = event.resource_version() {
            self.resource_version = rv.to_string();
        }
        match event {
            ResourceEvent::Added(_) => self.remaining_item_count += 1,
            ResourceEvent::Deleted(_) => self.remaining_item_count -= 1,
            ResourceEvent::Modified(_) | ResourceEvent::Bookmark(_) => {}
        }
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }
}

/// UID of an object, falling back to namespace/name for objects without one
fn identity<K: Resource>(obj: &K) -> String {
    let meta = obj.meta();
    match &meta.uid {
        Some(uid) => uid.clone(),
        None => format!(
            "{}/{}",
            meta.namespace.as_deref().unwrap_or_default(),
            meta.name.as_deref().unwrap_or_default()
        ),
    }
}

fn name_of<K: Resource>(obj: &K) -> &str {
    obj.meta().name.as_deref().unwrap_or_default()
}
