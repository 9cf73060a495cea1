//! Watch registry and change-notification routing
//!
//! Resources and dependencies discovered during a reconcile ask the
//! [`WatchRegistry`] for a watch on their kind. The registry makes sure at most
//! one watch per `(kind, purpose)` is ever started for the lifetime of a
//! controller; the [`WatchSource`] starts it and feeds events through a
//! [`Dispatcher`] into the work queue.

mod mapper;
mod source;

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::discovery::ApiResource;
use serde_json::json;
use tracing::{debug, info};

use crate::error::Result;

pub use mapper::{
    parse_dependents, render_dependents, AnnotationMapper, EventMapper, OwnerMapper, SelfMapper,
};
pub use source::{Dispatcher, KubeWatchSource, RecordingWatchSource, VersionTracker};

/// Why a kind is being watched
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchPurpose {
    /// The managed kind itself
    Primary,
    /// Child objects owned by managed objects
    Owner,
    /// External objects referenced through the back-reference annotation
    Dependency,
}

impl WatchPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchPurpose::Primary => "primary",
            WatchPurpose::Owner => "owner",
            WatchPurpose::Dependency => "dependency",
        }
    }
}

impl fmt::Display for WatchPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(kind, purpose)` pair identifying one watch
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey {
    /// `apiVersion/Kind`, e.g. `v1/ConfigMap`
    pub kind: String,
    pub purpose: WatchPurpose,
}

impl WatchKey {
    pub fn new(resource: &ApiResource, purpose: WatchPurpose) -> Self {
        Self {
            kind: format!("{}/{}", resource.api_version, resource.kind),
            purpose,
        }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.purpose)
    }
}

/// A change notification as seen by event handlers
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// First sighting of an object
    Create(ObjectMeta),
    /// An object seen before, with the resource version it had then
    Update {
        old_version: Option<String>,
        meta: ObjectMeta,
    },
    Delete(ObjectMeta),
    /// Synthetic trigger not caused by the watch itself
    Generic(ObjectMeta),
}

impl WatchEvent {
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            WatchEvent::Create(meta)
            | WatchEvent::Update { meta, .. }
            | WatchEvent::Delete(meta)
            | WatchEvent::Generic(meta) => meta,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WatchEvent::Create(_) => "create",
            WatchEvent::Update { .. } => "update",
            WatchEvent::Delete(_) => "delete",
            WatchEvent::Generic(_) => "generic",
        }
    }

    /// Content identifying this notification independent of who receives it
    pub fn fingerprint(&self, kind: &str) -> Vec<u8> {
        let meta = self.meta();
        json!({
            "type": self.type_name(),
            "kind": kind,
            "namespace": meta.namespace,
            "name": meta.name,
            "uid": meta.uid,
            "resourceVersion": meta.resource_version,
        })
        .to_string()
        .into_bytes()
    }
}

/// Which events trigger a reconcile
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChangeFilter {
    /// Ignore creations, and updates that did not change the resource version
    #[default]
    VersionChanged,
    /// Like `VersionChanged` but creations trigger too
    All,
}

impl ChangeFilter {
    pub fn admits(&self, event: &WatchEvent) -> bool {
        match event {
            WatchEvent::Create(_) => *self == ChangeFilter::All,
            WatchEvent::Update { old_version, meta } => {
                old_version.is_none() || *old_version != meta.resource_version
            }
            WatchEvent::Delete(_) | WatchEvent::Generic(_) => true,
        }
    }
}

/// Everything needed to start one watch
#[derive(Clone)]
pub struct WatchRequest {
    pub resource: ApiResource,
    pub key: WatchKey,
    pub filter: ChangeFilter,
    pub mapper: Arc<dyn EventMapper>,
}

impl WatchRequest {
    pub fn new(resource: ApiResource, purpose: WatchPurpose, mapper: Arc<dyn EventMapper>) -> Self {
        let filter = match purpose {
            WatchPurpose::Primary => ChangeFilter::All,
            WatchPurpose::Owner | WatchPurpose::Dependency => ChangeFilter::VersionChanged,
        };
        Self {
            key: WatchKey::new(&resource, purpose),
            resource,
            filter,
            mapper,
        }
    }
}

impl fmt::Debug for WatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRequest")
            .field("key", &self.key)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Starts watches; the watch itself runs in the background
pub trait WatchSource: Send + Sync {
    fn start(&self, request: WatchRequest) -> Result<()>;
}

/// Set of `(kind, purpose)` pairs with a running watch
///
/// Entries are never removed while the controller runs, except to roll back
/// a registration whose watch failed to start.
pub struct WatchRegistry {
    controller: String,
    watching: Mutex<HashSet<WatchKey>>,
    source: Arc<dyn WatchSource>,
}

impl WatchRegistry {
    pub fn new(controller: &str, source: Arc<dyn WatchSource>) -> Self {
        Self {
            controller: controller.to_string(),
            watching: Mutex::new(HashSet::new()),
            source,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<WatchKey>> {
        self.watching.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_watching(&self, key: &WatchKey) -> bool {
        self.lock().contains(key)
    }

    /// Record a watch; false if it was already recorded
    pub fn mark_watching(&self, key: WatchKey) -> bool {
        self.lock().insert(key)
    }

    /// Start the watch unless one is already registered for its key
    ///
    /// Returns whether a watch was started by this call.
    pub fn ensure_watch(&self, request: WatchRequest) -> Result<bool> {
        let key = request.key.clone();
        if !self.mark_watching(key.clone()) {
            return Ok(false);
        }
        if let Err(e) = self.source.start(request) {
            self.lock().remove(&key);
            return Err(e);
        }
        info!("Started watch on {} for {}", key, self.controller);
        #[cfg(feature = "metrics")]
        crate::controller::metrics::inc_watch_registered(
            &self.controller,
            &key.kind,
            key.purpose.as_str(),
        );
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<WatchKey> {
        let mut keys: Vec<_> = self.lock().iter().cloned().collect();
        keys.sort();
        debug!("{} registered watches", keys.len());
        keys
    }
}
