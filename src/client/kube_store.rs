//! `ObjectStore` backed by the Kubernetes API server

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::debug;

use super::{not_found, ObjectKey, ObjectStore};
use crate::error::{Error, Result};

/// Store issuing one request per call through `kube::Api<DynamicObject>`
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn map_err(e: kube::Error, ar: &ApiResource, key: &ObjectKey) -> Error {
    match e {
        kube::Error::Api(ref resp) if resp.code == 404 => not_found(ar, key),
        e => Error::KubeError(e),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<DynamicObject> {
        self.api(ar, key.namespace.as_deref())
            .get(&key.name)
            .await
            .map_err(|e| map_err(e, ar, key))
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::from_meta(&obj.metadata);
        debug!("Creating {} {}", ar.kind, key);
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.api(ar, key.namespace.as_deref())
            .create(&params, obj)
            .await
            .map_err(|e| map_err(e, ar, &key))
    }

    async fn patch(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        debug!("Patching {} {}", ar.kind, key);
        self.api(ar, key.namespace.as_deref())
            .patch(&key.name, &self.patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_err(e, ar, key))
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        debug!("Patching status of {} {}", ar.kind, key);
        self.api(ar, key.namespace.as_deref())
            .patch_status(&key.name, &self.patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_err(e, ar, key))
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<()> {
        debug!("Deleting {} {}", ar.kind, key);
        self.api(ar, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, ar, key))
    }
}
