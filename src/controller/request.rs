//! Per-reconcile request state and the shared controller context

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::config::ControllerConfig;
use super::dependency::DependencyResolver;
use super::handle::{ManagedHandle, ManagedObject};
use super::resource::ResourceReconciler;
use super::watch::WatchRegistry;
use crate::client::{ObjectKey, ObjectStore};
use crate::error::{Error, Result};

/// State shared by every reconcile of one controller
pub struct Context {
    /// Controller name used in logs and metric labels
    pub controller: String,
    pub store: Arc<dyn ObjectStore>,
    pub watches: Arc<WatchRegistry>,
    pub config: ControllerConfig,
}

impl Context {
    pub fn new(
        controller: &str,
        store: Arc<dyn ObjectStore>,
        watches: Arc<WatchRegistry>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            controller: controller.to_string(),
            store,
            watches,
            config,
        }
    }
}

/// Resources and dependencies a managed object needs
///
/// Consulted once per reconcile after the object is loaded, so the set may
/// depend on the object's spec.
pub trait Shape<K: ManagedObject>: Send + Sync {
    fn resources(&self, object: &K) -> Vec<Arc<dyn ResourceReconciler<K>>>;

    fn dependencies(&self, _object: &K) -> Vec<Arc<dyn DependencyResolver<K>>> {
        Vec::new()
    }
}

/// Worker-local state of one reconcile
pub struct Request<K: ManagedObject> {
    pub key: ObjectKey,
    pub ctx: Arc<Context>,
    pub cancel: CancellationToken,
    /// The managed object, once loaded
    pub handle: Option<ManagedHandle<K>>,
    pub resources: Vec<Arc<dyn ResourceReconciler<K>>>,
    pub dependencies: Vec<Arc<dyn DependencyResolver<K>>>,
    /// Identities of resources that exist but are not ready yet
    pub pending: Vec<String>,
}

impl<K: ManagedObject> Request<K> {
    pub fn new(key: ObjectKey, ctx: Arc<Context>, cancel: CancellationToken) -> Self {
        Self {
            key,
            ctx,
            cancel,
            handle: None,
            resources: Vec::new(),
            dependencies: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.ctx.store.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.ctx.config
    }

    /// Fails once the request is cancelled; checked before every remote call
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub fn is_being_deleted(&self) -> bool {
        self.handle
            .as_ref()
            .map(ManagedHandle::is_being_deleted)
            .unwrap_or(false)
    }

    pub fn object(&self) -> Result<&K> {
        self.handle
            .as_ref()
            .map(ManagedHandle::object)
            .ok_or_else(|| self.not_loaded())
    }

    pub fn handle_mut(&mut self) -> Result<&mut ManagedHandle<K>> {
        match self.handle.as_mut() {
            Some(handle) => Ok(handle),
            None => Err(Error::validation(format!(
                "managed object {} is not loaded",
                self.key
            ))),
        }
    }

    fn not_loaded(&self) -> Error {
        Error::validation(format!("managed object {} is not loaded", self.key))
    }
}

/// Reject identity collisions within one reconcile
pub fn ensure_unique<'a>(ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(Error::validation(format!(
                "identity '{id}' is declared more than once"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_unique() {
        assert!(ensure_unique(["v1/ConfigMap/a/x", "v1/Secret/a/x"]).is_ok());
        assert!(matches!(
            ensure_unique(["v1/ConfigMap/a/x", "v1/ConfigMap/a/x"]),
            Err(Error::ValidationError(_))
        ));
    }
}
