//! Built-in pipeline steps

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::finalizers::{add_finalizer, remove_finalizer};
use super::handle::{ManagedHandle, ManagedObject};
use super::pipeline::Step;
use super::request::{ensure_unique, Request, Shape};
use super::result::{demote_to_parent, StepResult};
use crate::client::get_typed;
use crate::crd::Condition;
use crate::try_step;

/// Fetch the managed object, build its shape, and guard the finalizer
///
/// Stops the pipeline when the object is gone, paused, or being deleted
/// without our finalizer.
pub struct LoadObject<K: ManagedObject> {
    shape: Arc<dyn Shape<K>>,
}

impl<K: ManagedObject> LoadObject<K> {
    pub fn new(shape: Arc<dyn Shape<K>>) -> Self {
        Self { shape }
    }
}

#[async_trait]
impl<K: ManagedObject> Step<K> for LoadObject<K> {
    fn name(&self) -> &str {
        "load-object"
    }

    async fn run(&self, req: &mut Request<K>) -> StepResult {
        try_step!(req.check_cancelled());
        let store = req.store();
        let object: K = match get_typed(store.as_ref(), &req.key).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                debug!("{} {} no longer exists", K::kind(&()), req.key);
                req.handle = None;
                return StepResult::Stop;
            }
            Err(e) => return StepResult::Error(e),
        };

        req.resources = self.shape.resources(&object);
        req.dependencies = self.shape.dependencies(&object);
        req.pending.clear();
        try_step!(req.check_cancelled());
        let handle = req.handle.insert(ManagedHandle::new(object));

        let pause_label = &req.ctx.config.pause_label;
        if handle.is_paused(pause_label) {
            info!("{} {} is paused, skipping reconcile", K::kind(&()), req.key);
            return StepResult::Stop;
        }

        let finalizer = req.ctx.config.finalizer();
        if handle.is_being_deleted() {
            if !handle.has_finalizer(&finalizer) {
                debug!("{} is being deleted without our finalizer", req.key);
                return StepResult::Stop;
            }
            return StepResult::Success;
        }

        demote_to_parent(add_finalizer(handle, store.as_ref(), &finalizer).await)
    }
}

/// Resolve every dependency in declaration order
pub struct ResolveDependencies;

#[async_trait]
impl<K: ManagedObject> Step<K> for ResolveDependencies {
    fn name(&self) -> &str {
        "resolve-dependencies"
    }

    async fn run(&self, req: &mut Request<K>) -> StepResult {
        let dependencies = req.dependencies.clone();
        {
            let object = try_step!(req.object());
            let ids: Vec<String> = dependencies.iter().map(|d| d.id(object)).collect();
            try_step!(ensure_unique(ids.iter().map(String::as_str)));
        }

        let store = req.store();
        for dependency in dependencies {
            let mut result = dependency.resolve(req).await;
            if let Err(e) = try_step!(req.handle_mut()).flush_status(store.as_ref()).await {
                result = result.merge(StepResult::Error(e));
            }
            match result {
                StepResult::Success | StepResult::Stop => continue,
                other if other.should_return() => return other,
                _ => continue,
            }
        }
        StepResult::Success
    }
}

/// Reconcile every resource in declaration order
///
/// A resource that stops (not ready, or deleted because it is disabled) does
/// not hold back the ones after it; an error or requeue does.
pub struct ReconcileResources;

#[async_trait]
impl<K: ManagedObject> Step<K> for ReconcileResources {
    fn name(&self) -> &str {
        "reconcile-resources"
    }

    async fn run(&self, req: &mut Request<K>) -> StepResult {
        let resources = req.resources.clone();
        {
            let object = try_step!(req.object());
            let ids = try_step!(resources
                .iter()
                .map(|r| r.id(object))
                .collect::<crate::Result<Vec<_>>>());
            try_step!(ensure_unique(ids.iter().map(String::as_str)));
        }

        let store = req.store();
        for resource in resources {
            let mut result = resource.reconcile(req).await;
            if let Err(e) = try_step!(req.handle_mut()).flush_status(store.as_ref()).await {
                result = result.merge(StepResult::Error(e));
            }
            match result {
                StepResult::Success | StepResult::Stop => continue,
                other if other.should_return() => return other,
                _ => continue,
            }
        }
        StepResult::Success
    }
}

/// Publish readiness and observed generation, or release the finalizer
/// once deletion has been handled
pub struct FinalizeStatus;

pub const REASON_RECONCILED: &str = "Reconciled";
pub const REASON_RESOURCES_NOT_READY: &str = "ResourcesNotReady";

#[async_trait]
impl<K: ManagedObject> Step<K> for FinalizeStatus {
    fn name(&self) -> &str {
        "finalize-status"
    }

    async fn run(&self, req: &mut Request<K>) -> StepResult {
        let store = req.store();
        let finalizer = req.ctx.config.finalizer();
        let pending = req.pending.clone();
        try_step!(req.check_cancelled());
        let handle = try_step!(req.handle_mut());

        if handle.is_being_deleted() {
            return demote_to_parent(remove_finalizer(handle, store.as_ref(), &finalizer).await);
        }

        let ready = if pending.is_empty() {
            Condition::ready(true, REASON_RECONCILED, "All resources are ready")
        } else {
            Condition::ready(
                false,
                REASON_RESOURCES_NOT_READY,
                &format!("Waiting for: {}", pending.join(", ")),
            )
        };
        handle.set_condition(ready);
        let generation = handle.generation();
        handle.object_mut().set_observed_generation(generation);
        handle.request_status_patch();

        try_step!(handle.flush_status(store.as_ref()).await);
        StepResult::Success
    }
}
