//! Ordered step pipeline
//!
//! Steps run strictly in order. The first step whose result says the
//! pipeline should return ends the run, and its result becomes the outward
//! [`Outcome`]. Steps that run their own sub-steps demote the sub-step result
//! with [`demote_to_parent`](super::result::demote_to_parent) first, so a
//! per-item `Stop` never ends the whole reconcile.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, instrument};

use super::handle::ManagedObject;
use super::request::{Request, Shape};
use super::result::{Outcome, StepResult};
use super::steps::{FinalizeStatus, LoadObject, ReconcileResources, ResolveDependencies};
use crate::error::Result;

#[async_trait]
pub trait Step<K: ManagedObject>: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, req: &mut Request<K>) -> StepResult;
}

/// Step backed by a closure, see [`step_fn`]
pub struct FnStep<K, F> {
    name: String,
    f: F,
    _kind: PhantomData<fn() -> K>,
}

/// Build a step from a closure returning a boxed future
///
/// ```ignore
/// let step = step_fn("log", |req: &mut Request<Bundle>| {
///     Box::pin(async move {
///         tracing::info!("reconciling {}", req.key);
///         StepResult::Success
///     })
/// });
/// ```
pub fn step_fn<K, F>(name: &str, f: F) -> FnStep<K, F>
where
    K: ManagedObject,
    F: for<'a> Fn(&'a mut Request<K>) -> BoxFuture<'a, StepResult> + Send + Sync,
{
    FnStep {
        name: name.to_string(),
        f,
        _kind: PhantomData,
    }
}

#[async_trait]
impl<K, F> Step<K> for FnStep<K, F>
where
    K: ManagedObject,
    F: for<'a> Fn(&'a mut Request<K>) -> BoxFuture<'a, StepResult> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, req: &mut Request<K>) -> StepResult {
        (self.f)(req).await
    }
}

pub struct Pipeline<K: ManagedObject> {
    steps: Vec<Arc<dyn Step<K>>>,
}

impl<K: ManagedObject> Default for Pipeline<K> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<K: ManagedObject> Pipeline<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard pipeline: load, resolve dependencies, reconcile
    /// resources, finalize status
    pub fn standard(shape: Arc<dyn Shape<K>>) -> Self {
        Self::new()
            .step(LoadObject::new(shape))
            .step(ResolveDependencies)
            .step(ReconcileResources)
            .step(FinalizeStatus)
    }

    pub fn step(mut self, step: impl Step<K> + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Insert a step right before the step named `before`, or at the end
    pub fn step_before(mut self, before: &str, step: impl Step<K> + 'static) -> Self {
        let at = self
            .steps
            .iter()
            .position(|s| s.name() == before)
            .unwrap_or(self.steps.len());
        self.steps.insert(at, Arc::new(step));
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run the steps in order and translate the deciding result
    #[instrument(skip(self, req), fields(name = %req.key.name, namespace = ?req.key.namespace))]
    pub async fn execute(&self, req: &mut Request<K>) -> Result<Outcome> {
        for step in &self.steps {
            let result = step.run(req).await;
            debug!(step = step.name(), result = %result, "Step finished");
            #[cfg(feature = "metrics")]
            crate::controller::metrics::inc_step_result(
                &req.ctx.controller,
                step.name(),
                result.label(),
            );
            if result.should_return() {
                return self.outward(req, result);
            }
        }
        Ok(Outcome::Done)
    }

    fn outward(&self, req: &Request<K>, result: StepResult) -> Result<Outcome> {
        match result {
            StepResult::Error(e) if e.is_not_found() && req.is_being_deleted() => {
                debug!("{} vanished during deletion: {}", req.key, e);
                Ok(Outcome::RequeueAfter(req.config().deletion_race_requeue))
            }
            other => other.into_outcome(),
        }
    }
}
