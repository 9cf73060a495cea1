//! Resource descriptors and the per-resource reconcile state machine
//!
//! A [`ResourceDescriptor`] declares one child object of the managed object:
//! where it lives, how to compute its desired state, when it is ready, when
//! it should be removed instead, and which hooks run along the way.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::handle::{is_paused, ManagedHandle, ManagedObject};
use super::hooks::{Hook, HookKind, Hooks};
use super::request::{Context, Request};
use super::result::StepResult;
use super::watch::{OwnerMapper, WatchPurpose, WatchRequest};
use crate::client::{
    api_resource, create_typed, delete_typed, get_typed, ignore_not_found, merge, patch_typed,
    ObjectKey, RemoteObject,
};
use crate::error::{Error, Result};
use crate::try_step;

/// Label recording which controller manages an object
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Type-erased resource reconciler the engine iterates over
#[async_trait]
pub trait ResourceReconciler<K: ManagedObject>: Send + Sync {
    /// Identity of this resource, unique within one reconcile
    fn id(&self, object: &K) -> Result<String>;

    async fn reconcile(&self, req: &mut Request<K>) -> StepResult;
}

/// How create-or-patch changed the remote object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

type Identity<K> = Arc<dyn Fn(&K) -> Result<ObjectKey> + Send + Sync>;
type Mutator<K, R> = Arc<dyn Fn(&K, &mut R) -> Result<()> + Send + Sync>;
type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Create an OwnerReference for garbage collection
pub fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels put on every object the engine creates or patches
pub fn standard_labels(field_manager: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), field_manager.to_string());
    labels
}

/// Declaration of one child object of type `R` owned by a managed `K`
pub struct ResourceDescriptor<K, R> {
    id: Option<String>,
    identity: Identity<K>,
    mutate: Mutator<K, R>,
    ready: Predicate<R>,
    skip_and_delete: Predicate<K>,
    requires_manual_deletion: Predicate<K>,
    hooks: Hooks<K, R>,
}

impl<K: ManagedObject, R: RemoteObject + Default> ResourceDescriptor<K, R> {
    /// `identity` names the child; `mutate` writes its desired state
    ///
    /// The identity may deliberately point at a name recorded in the managed
    /// object's status, so that a disabled or renamed child is deleted where
    /// it actually lives.
    pub fn new(
        identity: impl Fn(&K) -> Result<ObjectKey> + Send + Sync + 'static,
        mutate: impl Fn(&K, &mut R) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: None,
            identity: Arc::new(identity),
            mutate: Arc::new(mutate),
            ready: Arc::new(|_: &R| true),
            skip_and_delete: Arc::new(|_: &K| false),
            requires_manual_deletion: Arc::new(|_: &K| false),
            hooks: Hooks::default(),
        }
    }

    /// Use a fixed identifier instead of `Kind/namespace/name`
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn ready(mut self, ready: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        self.ready = Arc::new(ready);
        self
    }

    /// Delete the child instead of reconciling it while `predicate` holds
    pub fn skip_and_delete(mut self, predicate: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.skip_and_delete = Arc::new(predicate);
        self
    }

    /// Children that garbage collection cannot reclaim get no owner
    /// reference and are deleted explicitly during finalization
    pub fn requires_manual_deletion(
        mut self,
        predicate: impl Fn(&K) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.requires_manual_deletion = Arc::new(predicate);
        self
    }

    pub fn hook(
        mut self,
        kind: HookKind,
        hook: impl Fn(&mut ManagedHandle<K>, Option<&R>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        let hook: Hook<K, R> = Arc::new(hook);
        self.hooks.set(kind, hook);
        self
    }

    pub fn before(
        self,
        hook: impl Fn(&mut ManagedHandle<K>, Option<&R>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hook(HookKind::Before, hook)
    }

    pub fn after(
        self,
        hook: impl Fn(&mut ManagedHandle<K>, Option<&R>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hook(HookKind::After, hook)
    }

    pub fn on_create(
        self,
        hook: impl Fn(&mut ManagedHandle<K>, Option<&R>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hook(HookKind::OnCreate, hook)
    }

    pub fn on_update(
        self,
        hook: impl Fn(&mut ManagedHandle<K>, Option<&R>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hook(HookKind::OnUpdate, hook)
    }

    pub fn on_delete(
        self,
        hook: impl Fn(&mut ManagedHandle<K>, Option<&R>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hook(HookKind::OnDelete, hook)
    }

    pub fn on_finalize(
        self,
        hook: impl Fn(&mut ManagedHandle<K>, Option<&R>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hook(HookKind::OnFinalize, hook)
    }

    /// Point owner reference and managed-by label at the managed object
    ///
    /// Children that need manual deletion carry the owner's uid in an
    /// annotation instead of an owner reference.
    fn link(&self, owner: &K, child: &mut R, ctx: &Context, manual: bool) {
        let meta = child.meta_mut();
        meta.labels
            .get_or_insert_with(BTreeMap::new)
            .extend(standard_labels(&ctx.config.field_manager));
        let reference = owner_reference(owner);
        if manual {
            meta.annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(ctx.config.owner_annotation(), reference.uid);
            return;
        }
        let refs = meta.owner_references.get_or_insert_with(Vec::new);
        match refs.iter_mut().find(|r| r.uid == reference.uid) {
            Some(existing) => *existing = reference,
            None => refs.push(reference),
        }
    }

    async fn create_or_patch(
        &self,
        ctx: &Context,
        cancel: &CancellationToken,
        owner: &K,
        key: &ObjectKey,
        existing: Option<R>,
        manual: bool,
    ) -> Result<(R, ApplyOutcome)> {
        let store = ctx.store.as_ref();
        match existing {
            None => {
                let mut desired = R::default();
                desired.meta_mut().name = Some(key.name.clone());
                desired.meta_mut().namespace = key.namespace.clone();
                (self.mutate)(owner, &mut desired)?;
                self.link(owner, &mut desired, ctx, manual);
                if ObjectKey::from_meta(desired.meta()) != *key {
                    return Err(Error::validation(format!(
                        "mutator moved {} {} to {}",
                        R::kind(&()),
                        key,
                        ObjectKey::from_meta(desired.meta())
                    )));
                }
                check(cancel)?;
                let created = create_typed(store, &desired).await?;
                Ok((created, ApplyOutcome::Created))
            }
            Some(existing) => {
                if let Some(other) = foreign_controller(owner, &existing) {
                    return Err(Error::validation(format!(
                        "{} {} is already controlled by {} {}",
                        R::kind(&()),
                        key,
                        other.kind,
                        other.name
                    )));
                }
                let before = serde_json::to_value(&existing)?;
                let mut desired = existing.clone();
                (self.mutate)(owner, &mut desired)?;
                self.link(owner, &mut desired, ctx, manual);
                let after = serde_json::to_value(&desired)?;
                match merge::diff(&before, &after) {
                    None => Ok((existing, ApplyOutcome::Unchanged)),
                    Some(patch) => {
                        check(cancel)?;
                        let patched = patch_typed::<R>(store, key, &patch).await?;
                        Ok((patched, ApplyOutcome::Updated))
                    }
                }
            }
        }
    }

    /// Steps 1-8 of the resource lifecycle; the after hook runs in `reconcile`
    async fn apply(&self, req: &mut Request<K>, id: &str, last: &mut Option<R>) -> StepResult {
        let ctx = req.ctx.clone();
        let cancel = req.cancel.clone();
        let store = ctx.store.as_ref();
        let kind = R::kind(&());
        let managed = req.key.clone();

        let handle = try_step!(req.handle_mut());
        let owner = handle.object().clone();
        let key = try_step!((self.identity)(&owner));
        if key.name.is_empty() {
            return StepResult::Error(Error::validation(format!("{id}: empty {kind} name")));
        }

        if (self.skip_and_delete)(&owner) {
            try_step!(check(&cancel));
            let Some(existing) = try_step!(ignore_not_found(get_typed::<R>(store, &key).await))
            else {
                return StepResult::Stop;
            };
            if !is_owned_by(&owner, &existing, &ctx.config.owner_annotation()) {
                warn!("Not deleting disabled {} {}: not owned by {}", kind, key, managed);
                return StepResult::Stop;
            }
            try_step!(check(&cancel));
            if try_step!(delete_typed::<R>(store, &key).await) {
                info!("Deleted disabled {} {}", kind, key);
                try_step!(self.hooks.run(HookKind::OnDelete, id, handle, None));
            }
            return StepResult::Stop;
        }

        let manual = (self.requires_manual_deletion)(&owner);
        if handle.is_being_deleted() && !manual {
            try_step!(self.hooks.run(HookKind::OnFinalize, id, handle, None));
            return StepResult::Success;
        }

        try_step!(self.hooks.run(HookKind::Before, id, handle, None));

        try_step!(check(&cancel));
        let existing = try_step!(ignore_not_found(get_typed::<R>(store, &key).await));
        last.clone_from(&existing);

        let label = &ctx.config.pause_label;
        let child_paused = existing.as_ref().is_some_and(|e| is_paused(e.meta(), label));
        if handle.is_paused(label) || child_paused {
            info!("{} {} is paused, skipping", kind, key);
            return StepResult::Success;
        }

        if handle.is_being_deleted() {
            let owned = existing
                .as_ref()
                .is_some_and(|e| is_owned_by(&owner, e, &ctx.config.owner_annotation()));
            if owned {
                try_step!(check(&cancel));
                if try_step!(delete_typed::<R>(store, &key).await) {
                    info!("Deleted {} {} during finalization", kind, key);
                }
            } else if existing.is_some() {
                warn!("Not deleting {} {}: not owned by {}", kind, key, managed);
            }
            try_step!(self.hooks.run(HookKind::OnFinalize, id, handle, last.as_ref()));
            return StepResult::Success;
        }

        try_step!(ctx.watches.ensure_watch(WatchRequest::new(
            api_resource::<R>(),
            WatchPurpose::Owner,
            Arc::new(OwnerMapper::for_kind::<K>()),
        )));

        let (object, outcome) = try_step!(
            self.create_or_patch(&ctx, &cancel, &owner, &key, existing, manual)
                .await
        );
        debug!("{} {} {:?}", kind, key, outcome);
        let ready = (self.ready)(&object);
        *last = Some(object);
        match outcome {
            ApplyOutcome::Created => {
                info!("Created {} {}", kind, key);
                try_step!(self.hooks.run(HookKind::OnCreate, id, handle, last.as_ref()));
            }
            ApplyOutcome::Updated => {
                info!("Updated {} {}", kind, key);
                try_step!(self.hooks.run(HookKind::OnUpdate, id, handle, last.as_ref()));
            }
            ApplyOutcome::Unchanged => {}
        }

        if !ready {
            debug!("{} {} is not ready yet", kind, key);
            req.pending.push(id.to_string());
            return StepResult::Stop;
        }
        StepResult::Success
    }
}

/// Whether `child` was linked to `owner` by an owner reference or, for
/// manually deleted children, the owner uid annotation
pub fn is_owned_by<K: Resource<DynamicType = ()>, R: Resource>(
    owner: &K,
    child: &R,
    owner_annotation: &str,
) -> bool {
    let Some(uid) = owner.meta().uid.as_deref() else {
        return false;
    };
    child.owner_references().iter().any(|r| r.uid == uid)
        || child.annotations().get(owner_annotation).map(String::as_str) == Some(uid)
}

/// Controller reference on `child` held by anything other than `owner`
fn foreign_controller<'a, K: Resource<DynamicType = ()>, R: Resource>(
    owner: &K,
    child: &'a R,
) -> Option<&'a OwnerReference> {
    let uid = owner.meta().uid.as_deref().unwrap_or_default();
    child
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != uid)
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

#[async_trait]
impl<K: ManagedObject, R: RemoteObject + Default> ResourceReconciler<K> for ResourceDescriptor<K, R> {
    fn id(&self, object: &K) -> Result<String> {
        if let Some(id) = &self.id {
            return Ok(id.clone());
        }
        Ok(format!("{}/{}", R::kind(&()), (self.identity)(object)?))
    }

    #[instrument(skip(self, req), fields(kind = %R::kind(&()), managed = %req.key))]
    async fn reconcile(&self, req: &mut Request<K>) -> StepResult {
        let id = match req.object().and_then(|o| self.id(o)) {
            Ok(id) => id,
            Err(e) => return StepResult::Error(e),
        };
        let mut last = None;
        let result = self.apply(req, &id, &mut last).await;
        let policy = req.config().hook_error_policy;
        self.hooks
            .finish(policy, &id, req.handle.as_mut(), last.as_ref(), result)
    }
}
