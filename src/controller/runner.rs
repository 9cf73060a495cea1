//! Controller runtime: workers draining the queue into the pipeline

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, info_span, warn, Instrument};

use super::config::ControllerConfig;
use super::handle::ManagedObject;
use super::pipeline::Pipeline;
use super::queue::{
    BasicQueue, Correlation, InstrumentedQueue, ItemExponentialBackoff, RequestQueue, WorkQueue,
};
use super::request::{Context, Request};
use super::result::Outcome;
use super::watch::{Dispatcher, SelfMapper, WatchPurpose, WatchRegistry, WatchRequest, WatchSource};
use crate::client::{api_resource, ObjectKey, ObjectStore};
use crate::error::{Error, Result};

/// One controller: a queue, the watches feeding it, and the pipeline its
/// workers run
pub struct Controller<K: ManagedObject> {
    ctx: Arc<Context>,
    pipeline: Arc<Pipeline<K>>,
    dispatcher: Arc<Dispatcher>,
}

impl<K: ManagedObject> Controller<K> {
    /// Wire a controller around `store`
    ///
    /// `source` receives the dispatcher its watches must deliver events to
    /// and returns the watch source the registry starts watches on.
    pub fn new(
        name: &str,
        store: Arc<dyn ObjectStore>,
        config: ControllerConfig,
        pipeline: Pipeline<K>,
        source: impl FnOnce(Arc<Dispatcher>) -> Arc<dyn WatchSource>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = ItemExponentialBackoff::new(config.rate_limit_base, config.rate_limit_max);
        let queue: Arc<RequestQueue> = Arc::new(InstrumentedQueue::new(BasicQueue::new(limiter)));
        let dispatcher = Arc::new(Dispatcher::new(queue));
        let watches = Arc::new(WatchRegistry::new(name, source(dispatcher.clone())));
        Ok(Self {
            ctx: Arc::new(Context::new(name, store, watches, config)),
            pipeline: Arc::new(pipeline),
            dispatcher,
        })
    }

    pub fn name(&self) -> &str {
        &self.ctx.controller
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        self.dispatcher.queue()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Start the watch on the managed kind itself
    pub fn watch_primary(&self) -> Result<bool> {
        self.ctx.watches.ensure_watch(WatchRequest::new(
            api_resource::<K>(),
            WatchPurpose::Primary,
            Arc::new(SelfMapper),
        ))
    }

    /// Enqueue a reconcile that no watch event caused
    pub fn trigger(&self, key: ObjectKey, origin: &str) {
        let correlation = Correlation::detached(origin);
        self.queue().bind(correlation).add(key);
    }

    /// Take one key off the queue and reconcile it
    ///
    /// Returns false once the queue is shut down.
    pub async fn process_next(&self, shutdown: &CancellationToken) -> bool {
        let queue = self.queue();
        let Some(key) = queue.get().await else {
            return false;
        };
        let correlation = queue.get_meta_of(&key).and_then(|meta| meta.correlation);

        let span = info_span!(
            "reconcile",
            controller = %self.name(),
            object = %key,
            correlation_id = field::Empty,
        );
        if let Some(correlation) = &correlation {
            span.follows_from(correlation.span());
            span.record("correlation_id", field::display(correlation.id()));
        }

        let started = Instant::now();
        let mut req = Request::new(key.clone(), self.ctx.clone(), shutdown.child_token());
        let outcome = self.pipeline.execute(&mut req).instrument(span.clone()).await;
        drop(req);

        #[cfg(feature = "metrics")]
        super::metrics::observe_reconcile_duration_seconds(
            self.name(),
            started.elapsed().as_secs_f64(),
        );
        span.in_scope(|| self.settle(key, outcome, correlation, shutdown, started));
        self.record_queue();
        true
    }

    /// Mark the key done and schedule its next reconcile, if any
    fn settle(
        &self,
        key: ObjectKey,
        outcome: Result<Outcome>,
        correlation: Option<Arc<Correlation>>,
        shutdown: &CancellationToken,
        started: Instant,
    ) {
        let queue = self.queue();
        match outcome {
            Ok(Outcome::Done) => {
                debug!("Reconciled {} in {:?}", key, started.elapsed());
                queue.forget(&key);
                queue.done(&key);
            }
            Ok(Outcome::RequeueAfter(after)) => {
                debug!("Requeueing {} after {:?}", key, after);
                queue.forget(&key);
                queue.done(&key);
                self.requeue_after(key, after, correlation);
            }
            Err(e) => {
                self.report(&key, &e);
                queue.done(&key);
                if shutdown.is_cancelled() {
                    return;
                }
                match correlation {
                    Some(correlation) => queue.bind(correlation).add_rate_limited(key),
                    None => queue.add_rate_limited(key),
                }
            }
        }
    }

    fn requeue_after(&self, key: ObjectKey, after: Duration, correlation: Option<Arc<Correlation>>) {
        match correlation {
            Some(correlation) => self.queue().bind(correlation).add_after(key, after),
            None => self.queue().add_after(key, after),
        }
    }

    fn report(&self, key: &ObjectKey, e: &Error) {
        #[cfg(feature = "metrics")]
        super::metrics::inc_reconcile_error(self.name(), e.metric_label());
        let requeues = self.queue().num_requeues(key);
        if matches!(e, Error::Cancelled) {
            debug!("Reconcile of {} cancelled", key);
        } else if e.is_retriable() {
            warn!(requeues, "Reconcile of {} failed, retrying: {}", key, e);
        } else {
            error!(requeues, "Reconcile of {} failed: {}", key, e);
        }
    }

    fn record_queue(&self) {
        #[cfg(feature = "metrics")]
        super::metrics::set_queue_gauges(
            self.name(),
            self.queue().len(),
            self.queue().tracked_len(),
        );
    }

    /// Watch the managed kind and run workers until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.watch_primary()?;
        let workers = self.ctx.config.workers;
        info!("Starting {} controller with {} workers", self.name(), workers);

        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            let controller = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { while controller.process_next(&shutdown).await {} });
        }

        shutdown.cancelled().await;
        info!("Stopping {} controller", self.name());
        self.queue().shut_down();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Worker of {} panicked: {}", self.name(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryStore;
    use crate::controller::bundle::BundleShape;
    use crate::controller::test_support::bundle;
    use crate::controller::watch::{RecordingWatchSource, WatchEvent};
    use crate::crd::Bundle;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::ResourceExt;

    fn controller(store: Arc<MemoryStore>, source: Arc<RecordingWatchSource>) -> Controller<Bundle> {
        Controller::new(
            "bundle",
            store,
            ControllerConfig::default(),
            Pipeline::standard(Arc::new(BundleShape)),
            move |_| source as Arc<dyn WatchSource>,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_primary_watch_registered_once() {
        let source = Arc::new(RecordingWatchSource::new());
        let controller = controller(Arc::new(MemoryStore::new()), source.clone());
        assert!(controller.watch_primary().unwrap());
        assert!(!controller.watch_primary().unwrap());
        assert_eq!(
            source.count("steward.dev/v1alpha1/Bundle", WatchPurpose::Primary),
            1
        );
    }

    #[tokio::test]
    async fn test_event_to_reconcile_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(RecordingWatchSource::new());
        let controller = controller(store.clone(), source.clone());
        controller.watch_primary().unwrap();

        let obj = bundle("demo", "demo-config");
        store.insert(&obj).unwrap();
        let stored: Bundle = store.object(&ObjectKey::namespaced("default", "demo")).unwrap();
        let delivered = source.deliver(
            controller.dispatcher(),
            "steward.dev/v1alpha1/Bundle",
            &WatchEvent::Create(stored.metadata.clone()),
        );
        assert_eq!(delivered, 1);

        let shutdown = CancellationToken::new();
        assert!(controller.process_next(&shutdown).await);

        let cm: ConfigMap = store
            .object(&ObjectKey::namespaced("default", "demo-config"))
            .unwrap();
        assert_eq!(cm.owner_references()[0].name, "demo");
        assert!(controller.queue().is_empty());
        assert_eq!(controller.queue().tracked_len(), 0);
        assert_eq!(
            source.count("v1/ConfigMap", WatchPurpose::Owner),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_rate_limited_with_correlation() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(RecordingWatchSource::new());
        let controller = controller(store.clone(), source);
        store.insert(&bundle("demo", "demo-config")).unwrap();
        store.fail(crate::client::memory::Op::Create, "ConfigMap", "boom");

        let key = ObjectKey::namespaced("default", "demo");
        controller.trigger(key.clone(), "test");
        let first = controller
            .queue()
            .get_meta_of(&key)
            .and_then(|m| m.correlation)
            .unwrap();

        let shutdown = CancellationToken::new();
        assert!(controller.process_next(&shutdown).await);
        assert_eq!(controller.queue().num_requeues(&key), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let again = controller
            .queue()
            .get_meta_of(&key)
            .and_then(|m| m.correlation)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let source = Arc::new(RecordingWatchSource::new());
        let controller = Arc::new(controller(Arc::new(MemoryStore::new()), source));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(controller.clone().run(shutdown.clone()));
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(controller.queue().is_shutting_down());
    }
}
