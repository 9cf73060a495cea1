//! Dependency descriptors and resolution
//!
//! A dependency is an external object the managed object relies on but does
//! not own. The engine only reads it and keeps a back-reference annotation on
//! it, so changes to the dependency can be routed back to every managed object
//! that uses it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::handle::{ManagedHandle, ManagedObject};
use super::hooks::{Hook, HookKind, Hooks};
use super::request::Request;
use super::result::StepResult;
use super::watch::{
    parse_dependents, render_dependents, AnnotationMapper, WatchPurpose, WatchRequest,
};
use crate::client::{
    api_resource, get_typed, merge, patch_typed, ObjectKey, ObjectStore, RemoteObject,
};
use crate::error::Result;
use crate::try_step;

/// Type-erased dependency resolver the engine iterates over
#[async_trait]
pub trait DependencyResolver<K: ManagedObject>: Send + Sync {
    fn id(&self, object: &K) -> String;

    async fn resolve(&self, req: &mut Request<K>) -> StepResult;
}

type Identity<K> = Arc<dyn Fn(&K) -> ObjectKey + Send + Sync>;
type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Add or remove `dependent` in a back-reference annotation
///
/// Returns whether the annotation value changed. An emptied list removes the
/// annotation.
pub fn update_dependents(
    annotations: &mut Option<BTreeMap<String, String>>,
    annotation: &str,
    dependent: &ObjectKey,
    present: bool,
) -> bool {
    let current = annotations
        .as_ref()
        .and_then(|a| a.get(annotation))
        .map(|v| parse_dependents(v))
        .unwrap_or_default();
    let mut next: Vec<ObjectKey> = current.iter().filter(|k| *k != dependent).cloned().collect();
    if present {
        next.push(dependent.clone());
    }
    let rendered = render_dependents(&next);
    if rendered == render_dependents(&current) {
        return false;
    }
    let map = annotations.get_or_insert_with(BTreeMap::new);
    if rendered.is_empty() {
        map.remove(annotation);
    } else {
        map.insert(annotation.to_string(), rendered);
    }
    true
}

/// Declaration of one external object of type `D` used by a managed `K`
pub struct DependencyDescriptor<K, D> {
    identity: Identity<K>,
    optional: bool,
    ready: Predicate<D>,
    wait_for_ready: bool,
    annotate: bool,
    hooks: Hooks<K, D>,
}

impl<K: ManagedObject, D: RemoteObject> DependencyDescriptor<K, D> {
    pub fn new(identity: impl Fn(&K) -> ObjectKey + Send + Sync + 'static) -> Self {
        Self {
            identity: Arc::new(identity),
            optional: false,
            ready: Arc::new(|_: &D| true),
            wait_for_ready: false,
            annotate: true,
            hooks: Hooks::default(),
        }
    }

    /// A missing optional dependency is not waited for
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn ready(mut self, ready: impl Fn(&D) -> bool + Send + Sync + 'static) -> Self {
        self.ready = Arc::new(ready);
        self
    }

    /// Requeue until the readiness predicate holds
    pub fn wait_for_ready(mut self, wait: bool) -> Self {
        self.wait_for_ready = wait;
        self
    }

    /// Maintain the back-reference annotation on the dependency
    pub fn annotate(mut self, annotate: bool) -> Self {
        self.annotate = annotate;
        self
    }

    pub fn before(
        mut self,
        hook: impl Fn(&mut ManagedHandle<K>, Option<&D>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        let hook: Hook<K, D> = Arc::new(hook);
        self.hooks.set(HookKind::Before, hook);
        self
    }

    pub fn after(
        mut self,
        hook: impl Fn(&mut ManagedHandle<K>, Option<&D>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        let hook: Hook<K, D> = Arc::new(hook);
        self.hooks.set(HookKind::After, hook);
        self
    }

    /// Patch the back-reference annotation if it changed
    async fn sync_annotation(
        &self,
        store: &dyn ObjectStore,
        key: &ObjectKey,
        found: D,
        annotation: &str,
        dependent: &ObjectKey,
        present: bool,
    ) -> Result<D> {
        let mut next = found.clone();
        if !update_dependents(&mut next.meta_mut().annotations, annotation, dependent, present) {
            return Ok(found);
        }
        let before = serde_json::to_value(&found)?;
        let after = serde_json::to_value(&next)?;
        match merge::diff(&before, &after) {
            Some(patch) => {
                debug!("Updating {} on {} {}", annotation, D::kind(&()), key);
                patch_typed::<D>(store, key, &patch).await
            }
            None => Ok(found),
        }
    }

    async fn apply(&self, req: &mut Request<K>, id: &str, last: &mut Option<D>) -> StepResult {
        let ctx = req.ctx.clone();
        let store = ctx.store.as_ref();
        let backoff: Duration = ctx.config.dependency_backoff;
        let kind = D::kind(&());
        let deleting = req.is_being_deleted();
        let dependent = req.key.clone();
        try_step!(req.check_cancelled());

        let handle = try_step!(req.handle_mut());
        try_step!(self.hooks.run(HookKind::Before, id, handle, None));
        let key = (self.identity)(handle.object());
        let annotation = ctx.config.dependents_annotation(&K::kind(&()));

        let found = match get_typed::<D>(store, &key).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => {
                if deleting || self.optional {
                    debug!("{} {} not found, nothing to wait for", kind, key);
                    return StepResult::Success;
                }
                info!("Waiting for {} {} to exist", kind, key);
                return StepResult::Requeue(backoff);
            }
            Err(e) => return StepResult::Error(e),
        };
        *last = Some(found.clone());

        if deleting {
            if self.annotate {
                try_step!(req.check_cancelled());
                let cleaned = try_step!(
                    self.sync_annotation(store, &key, found, &annotation, &dependent, false)
                        .await
                );
                *last = Some(cleaned);
            }
            return StepResult::Stop;
        }

        try_step!(ctx.watches.ensure_watch(WatchRequest::new(
            api_resource::<D>(),
            WatchPurpose::Dependency,
            Arc::new(AnnotationMapper::new(annotation.clone())),
        )));

        let current = if self.annotate {
            try_step!(req.check_cancelled());
            try_step!(
                self.sync_annotation(store, &key, found, &annotation, &dependent, true)
                    .await
            )
        } else {
            found
        };
        let ready = (self.ready)(&current);
        *last = Some(current);

        if self.wait_for_ready && !ready {
            info!("Waiting for {} {} to become ready", kind, key);
            return StepResult::Requeue(backoff);
        }
        StepResult::Success
    }
}

#[async_trait]
impl<K: ManagedObject, D: RemoteObject> DependencyResolver<K> for DependencyDescriptor<K, D> {
    fn id(&self, object: &K) -> String {
        format!("{}/{}", D::kind(&()), (self.identity)(object))
    }

    #[instrument(skip(self, req), fields(kind = %D::kind(&()), managed = %req.key))]
    async fn resolve(&self, req: &mut Request<K>) -> StepResult {
        let id = match req.object() {
            Ok(object) => self.id(object),
            Err(e) => return StepResult::Error(e),
        };
        let mut last = None;
        let result = self.apply(req, &id, &mut last).await;
        let policy = req.config().hook_error_policy;
        self.hooks
            .finish(policy, &id, req.handle.as_mut(), last.as_ref(), result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_dependents_add_and_remove() {
        let me = ObjectKey::namespaced("apps", "demo");
        let other = ObjectKey::namespaced("apps", "other");
        let mut annotations = None;

        assert!(update_dependents(&mut annotations, "a", &me, true));
        assert!(!update_dependents(&mut annotations, "a", &me, true));
        assert!(update_dependents(&mut annotations, "a", &other, true));
        assert_eq!(
            annotations.as_ref().unwrap()["a"],
            "apps/demo,apps/other"
        );

        assert!(update_dependents(&mut annotations, "a", &me, false));
        assert_eq!(annotations.as_ref().unwrap()["a"], "apps/other");
        assert!(update_dependents(&mut annotations, "a", &other, false));
        assert!(!annotations.as_ref().unwrap().contains_key("a"));
        assert!(!update_dependents(&mut annotations, "a", &other, false));
    }
}
