//! Reconciliation engine
//!
//! A controller is a [`Pipeline`] of ordered steps run by [`Controller`]
//! workers against keys drawn from an instrumented work queue. The standard
//! pipeline loads the managed object, resolves its [dependencies], reconciles
//! its [resources] and publishes its status.
//!
//! [dependencies]: DependencyDescriptor
//! [resources]: ResourceDescriptor

pub mod bundle;
pub mod conditions;
pub mod config;
pub mod dependency;
mod finalizers;
pub mod handle;
pub mod hooks;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod request;
pub mod resource;
mod result;
mod runner;
pub mod steps;
pub mod watch;


pub use config::{ControllerConfig, HookErrorPolicy};
pub use dependency::{DependencyDescriptor, DependencyResolver};
pub use finalizers::{add_finalizer, remove_finalizer, STEWARD_FINALIZER};
pub use handle::{ManagedHandle, ManagedObject};
pub use hooks::HookKind;
pub use pipeline::{step_fn, Pipeline, Step};
pub use request::{Context, Request, Shape};
pub use resource::{ApplyOutcome, ResourceDescriptor, ResourceReconciler};
pub use result::{demote_to_parent, Outcome, StepResult};
pub use runner::Controller;

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::config::ControllerConfig;
    use super::request::{Context, Request};
    use super::watch::{RecordingWatchSource, WatchRegistry};
    use super::ManagedObject;
    use crate::client::{MemoryStore, ObjectKey};
    use crate::crd::{Bundle, BundleSpec, ConfigMapTemplate};

    /// A Bundle in namespace `default` rendering ConfigMap `config_map`
    pub fn bundle(name: &str, config_map: &str) -> Bundle {
        let mut b = Bundle::new(
            name,
            BundleSpec {
                config_map: ConfigMapTemplate {
                    name: config_map.to_string(),
                    enabled: true,
                    data: BTreeMap::from([("greeting".to_string(), "hello".to_string())]),
                },
                secret_ref: None,
            },
        );
        b.metadata.namespace = Some("default".to_string());
        b.metadata.uid = Some(format!("{name}-uid"));
        b.metadata.generation = Some(1);
        b
    }

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub source: Arc<RecordingWatchSource>,
        pub ctx: Arc<Context>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(ControllerConfig::default())
        }

        pub fn with_config(config: ControllerConfig) -> Self {
            let store = Arc::new(MemoryStore::new());
            let source = Arc::new(RecordingWatchSource::new());
            let watches = Arc::new(WatchRegistry::new("test", source.clone()));
            let ctx = Arc::new(Context::new("test", store.clone(), watches, config));
            Self { store, source, ctx }
        }

        pub fn request<K: ManagedObject>(&self, key: &ObjectKey) -> Request<K> {
            Request::new(key.clone(), self.ctx.clone(), CancellationToken::new())
        }
    }
}
