//! Watch sources and event dispatch into the work queue

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher::{self, metadata_watcher, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{WatchEvent, WatchPurpose, WatchRequest, WatchSource};
use crate::client::ObjectKey;
use crate::controller::queue::{EventCorrelations, RequestQueue};
use crate::error::{Error, Result};

/// Routes change notifications into the work queue
///
/// Each admitted event resolves its correlation from the event-correlation
/// cache, so the same notification reaching several handlers shares one
/// correlation, and enqueues the mapped keys through a queue view bound to it.
pub struct Dispatcher {
    queue: Arc<RequestQueue>,
    correlations: EventCorrelations,
}

impl Dispatcher {
    pub fn new(queue: Arc<RequestQueue>) -> Self {
        Self {
            queue,
            correlations: EventCorrelations::new(),
        }
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn correlations(&self) -> &EventCorrelations {
        &self.correlations
    }

    /// Handle one event for one watch, returning the number of keys enqueued
    pub fn dispatch(&self, request: &WatchRequest, event: &WatchEvent) -> usize {
        if !request.filter.admits(event) {
            return 0;
        }
        let keys = request.mapper.map(event.meta());
        if keys.is_empty() {
            return 0;
        }

        let correlation = self
            .correlations
            .resolve(&event.fingerprint(&request.key.kind));
        let _guard = correlation.span().clone().entered();
        debug!(
            watch = %request.key,
            event = event.type_name(),
            object = %ObjectKey::from_meta(event.meta()),
            "Enqueueing {} reconcile request(s)",
            keys.len()
        );

        let queue = self.queue.bind(correlation.clone());
        for key in &keys {
            queue.add(key.clone());
        }
        keys.len()
    }
}

/// Classifies applied objects as creations or updates
///
/// Remembers the last resource version seen per object, so a relist after a
/// watch restart does not look like a wave of creations.
#[derive(Default)]
pub struct VersionTracker {
    versions: HashMap<ObjectKey, Option<String>>,
}

impl VersionTracker {
    pub fn applied(&mut self, meta: ObjectMeta) -> WatchEvent {
        let key = ObjectKey::from_meta(&meta);
        match self.versions.insert(key, meta.resource_version.clone()) {
            None => WatchEvent::Create(meta),
            Some(old_version) => WatchEvent::Update { old_version, meta },
        }
    }

    pub fn deleted(&mut self, meta: ObjectMeta) -> WatchEvent {
        self.versions.remove(&ObjectKey::from_meta(&meta));
        WatchEvent::Delete(meta)
    }
}

enum Observed {
    Applied(ObjectMeta),
    Deleted(ObjectMeta),
}

fn observe<K: Resource>(event: Event<K>) -> Option<Observed> {
    match event {
        Event::Apply(obj) | Event::InitApply(obj) => Some(Observed::Applied(obj.meta().clone())),
        Event::Delete(obj) => Some(Observed::Deleted(obj.meta().clone())),
        Event::Init | Event::InitDone => None,
    }
}

/// Starts kube watches feeding a [`Dispatcher`]
///
/// The primary kind is watched with full objects, everything else with
/// metadata-only watches. All watch tasks stop when `shutdown` is cancelled.
pub struct KubeWatchSource {
    client: Client,
    namespace: Option<String>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl KubeWatchSource {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            namespace,
            dispatcher,
            shutdown,
        }
    }

    fn api(&self, request: &WatchRequest) -> Api<DynamicObject> {
        match (&self.namespace, request.key.purpose) {
            (Some(ns), WatchPurpose::Primary) => {
                Api::namespaced_with(self.client.clone(), ns, &request.resource)
            }
            _ => Api::all_with(self.client.clone(), &request.resource),
        }
    }
}

impl WatchSource for KubeWatchSource {
    fn start(&self, request: WatchRequest) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let api = self.api(&request);
        let config = watcher::Config::default();
        let events: BoxStream<'static, std::result::Result<Option<Observed>, watcher::Error>> =
            if request.key.purpose == WatchPurpose::Primary {
                watcher(api, config).default_backoff().map_ok(observe).boxed()
            } else {
                metadata_watcher(api, config)
                    .default_backoff()
                    .map_ok(observe)
                    .boxed()
            };

        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut events = events;
            let mut versions = VersionTracker::default();
            info!("Watching {}", request.key);
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = events.next() => next,
                };
                match next {
                    Some(Ok(Some(Observed::Applied(meta)))) => {
                        dispatcher.dispatch(&request, &versions.applied(meta));
                    }
                    Some(Ok(Some(Observed::Deleted(meta)))) => {
                        dispatcher.dispatch(&request, &versions.deleted(meta));
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => warn!("Watch on {} failed: {}", request.key, e),
                    None => break,
                }
            }
            debug!("Watch on {} stopped", request.key);
        });
        Ok(())
    }
}

/// Watch source that records requests instead of watching
///
/// Events can be fed through the recorded requests with [`deliver`], which
/// runs them through the same filter/mapper/dispatch path as a live watch.
///
/// [`deliver`]: RecordingWatchSource::deliver
#[derive(Default)]
pub struct RecordingWatchSource {
    started: Mutex<Vec<WatchRequest>>,
    fail_next: Mutex<bool>,
}

impl RecordingWatchSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WatchRequest>> {
        self.started.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn started(&self) -> Vec<WatchRequest> {
        self.lock().clone()
    }

    /// Number of watches started for `kind` (`apiVersion/Kind`)
    pub fn count(&self, kind: &str, purpose: WatchPurpose) -> usize {
        self.lock()
            .iter()
            .filter(|r| r.key.kind == kind && r.key.purpose == purpose)
            .count()
    }

    /// Make the next `start` call fail
    pub fn fail_next_start(&self) {
        *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Feed an event to every started watch on `kind`
    pub fn deliver(&self, dispatcher: &Dispatcher, kind: &str, event: &WatchEvent) -> usize {
        let requests: Vec<_> = self
            .lock()
            .iter()
            .filter(|r| r.key.kind == kind)
            .cloned()
            .collect();
        requests
            .iter()
            .map(|r| dispatcher.dispatch(r, event))
            .sum()
    }
}

impl WatchSource for RecordingWatchSource {
    fn start(&self, request: WatchRequest) -> Result<()> {
        let fail = std::mem::take(&mut *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner));
        if fail {
            return Err(Error::ConfigError(format!(
                "failed to start watch on {}",
                request.key
            )));
        }
        self.lock().push(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::api_resource;
    use crate::controller::queue::{BasicQueue, InstrumentedQueue, WorkQueue};
    use crate::controller::watch::{AnnotationMapper, OwnerMapper};
    use crate::crd::Bundle;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(InstrumentedQueue::new(BasicQueue::default())))
    }

    fn owned_config_map(rv: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some("demo-config".to_string()),
            namespace: Some("apps".to_string()),
            uid: Some("cm-uid".to_string()),
            resource_version: Some(rv.to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "steward.dev/v1alpha1".to_string(),
                kind: "Bundle".to_string(),
                name: "demo".to_string(),
                uid: "bundle-uid".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            annotations: Some(BTreeMap::from([(
                "steward.dev/bundle-dependents".to_string(),
                "apps/consumer".to_string(),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn test_version_tracker_classifies_applies() {
        let mut tracker = VersionTracker::default();
        assert!(matches!(
            tracker.applied(owned_config_map("1")),
            WatchEvent::Create(_)
        ));
        match tracker.applied(owned_config_map("2")) {
            WatchEvent::Update { old_version, .. } => assert_eq!(old_version.as_deref(), Some("1")),
            other => panic!("expected update, got {other:?}"),
        }
        assert!(matches!(
            tracker.deleted(owned_config_map("2")),
            WatchEvent::Delete(_)
        ));
        assert!(matches!(
            tracker.applied(owned_config_map("3")),
            WatchEvent::Create(_)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_enqueues_owner_with_correlation() {
        let dispatcher = dispatcher();
        let request = WatchRequest::new(
            api_resource::<ConfigMap>(),
            WatchPurpose::Owner,
            Arc::new(OwnerMapper::for_kind::<Bundle>()),
        );
        let event = WatchEvent::Update {
            old_version: Some("1".to_string()),
            meta: owned_config_map("2"),
        };

        assert_eq!(dispatcher.dispatch(&request, &event), 1);
        let key = ObjectKey::namespaced("apps", "demo");
        let meta = dispatcher.queue().get_meta_of(&key).unwrap();
        assert!(meta.correlation.is_some());
        assert_eq!(dispatcher.queue().get().await, Some(key));
    }

    #[tokio::test]
    async fn test_filtered_event_enqueues_nothing() {
        let dispatcher = dispatcher();
        let request = WatchRequest::new(
            api_resource::<ConfigMap>(),
            WatchPurpose::Owner,
            Arc::new(OwnerMapper::for_kind::<Bundle>()),
        );
        assert_eq!(
            dispatcher.dispatch(&request, &WatchEvent::Create(owned_config_map("1"))),
            0
        );
        assert!(dispatcher.queue().is_empty());
    }

    #[tokio::test]
    async fn test_same_notification_shares_correlation_across_handlers() {
        let dispatcher = dispatcher();
        let source = RecordingWatchSource::new();

        source
            .start(WatchRequest::new(
                api_resource::<ConfigMap>(),
                WatchPurpose::Owner,
                Arc::new(OwnerMapper::for_kind::<Bundle>()),
            ))
            .unwrap();
        source
            .start(WatchRequest::new(
                api_resource::<ConfigMap>(),
                WatchPurpose::Dependency,
                Arc::new(AnnotationMapper::new("steward.dev/bundle-dependents")),
            ))
            .unwrap();

        let event = WatchEvent::Delete(owned_config_map("7"));
        assert_eq!(source.deliver(&dispatcher, "v1/ConfigMap", &event), 2);

        let owner = dispatcher
            .queue()
            .get_meta_of(&ObjectKey::namespaced("apps", "demo"))
            .and_then(|m| m.correlation)
            .unwrap();
        let dependent = dispatcher
            .queue()
            .get_meta_of(&ObjectKey::namespaced("apps", "consumer"))
            .and_then(|m| m.correlation)
            .unwrap();
        assert!(Arc::ptr_eq(&owner, &dependent));
        assert_eq!(dispatcher.correlations().len(), 1);
    }

    #[tokio::test]
    async fn test_correlation_cache_entry_released_with_items() {
        let dispatcher = dispatcher();
        let request = WatchRequest::new(
            api_resource::<Secret>(),
            WatchPurpose::Dependency,
            Arc::new(AnnotationMapper::new("steward.dev/bundle-dependents")),
        );
        dispatcher.dispatch(&request, &WatchEvent::Generic(owned_config_map("1")));
        assert_eq!(dispatcher.correlations().len(), 1);

        let key = dispatcher.queue().get().await.unwrap();
        dispatcher.queue().forget(&key);
        dispatcher.queue().done(&key);
        assert!(dispatcher.correlations().is_empty());
    }

    #[test]
    fn test_recording_source_counts() {
        let source = RecordingWatchSource::new();
        source
            .start(WatchRequest::new(
                api_resource::<Secret>(),
                WatchPurpose::Dependency,
                Arc::new(AnnotationMapper::new("x")),
            ))
            .unwrap();
        assert_eq!(source.count("v1/Secret", WatchPurpose::Dependency), 1);
        assert_eq!(source.count("v1/Secret", WatchPurpose::Owner), 0);
    }
}
