//! In-memory `ObjectStore`
//!
//! Mimics the API server closely enough for controller tests: resource
//! versions and uids are assigned, finalizers hold deletion behind a
//! `deletionTimestamp`, and deleting an owner garbage-collects objects that
//! carry an owner reference to it. Every call is recorded.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::{ErrorResponse, TypeMeta};
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{from_dynamic, not_found, to_dynamic, ObjectKey, ObjectStore};
use crate::error::{Error, Result};

/// Store operation, used to record calls and inject failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    Get,
    Create,
    Patch,
    PatchStatus,
    Delete,
}

/// A recorded store call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub kind: String,
    pub key: ObjectKey,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, ObjectKey), Value>,
    calls: Vec<Call>,
    failures: BTreeMap<(Op, String), String>,
    revision: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn kind_key(ar: &ApiResource) -> String {
    format!("{}/{}", ar.api_version, ar.kind)
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn set_metadata(obj: &mut Value, field: &str, value: Value) {
    if let Some(root) = obj.as_object_mut() {
        let meta = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert(field.to_string(), value);
        }
    }
}

fn has_finalizers(obj: &Value) -> bool {
    obj.pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|f| !f.is_empty())
        .unwrap_or(false)
}

fn is_deleting(obj: &Value) -> bool {
    obj.pointer("/metadata/deletionTimestamp")
        .map(|v| !v.is_null())
        .unwrap_or(false)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an object directly, bypassing call recording
    pub fn insert<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let ar = ApiResource::erase::<K>(&());
        let dynamic = to_dynamic(obj)?;
        let key = ObjectKey::from_meta(&dynamic.metadata);
        let mut state = self.lock();
        let value = state.stamp_new(&ar, dynamic)?;
        state.objects.insert((kind_key(&ar), key), value);
        Ok(())
    }

    /// Read an object without recording a call
    pub fn object<K>(&self, key: &ObjectKey) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let ar = ApiResource::erase::<K>(&());
        let value = self.lock().objects.get(&(kind_key(&ar), key.clone()))?.clone();
        serde_json::from_value::<DynamicObject>(value)
            .ok()
            .and_then(|d| from_dynamic(d).ok())
    }

    pub fn contains<K: Resource<DynamicType = ()>>(&self, key: &ObjectKey) -> bool {
        let ar = ApiResource::erase::<K>(&());
        self.lock().objects.contains_key(&(kind_key(&ar), key.clone()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of calls of `op` against `kind` (e.g. "ConfigMap")
    pub fn count(&self, op: Op, kind: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op && c.kind == kind)
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make every `op` against `kind` fail with a 500 until `clear_failures`
    pub fn fail(&self, op: Op, kind: &str, message: &str) {
        self.lock()
            .failures
            .insert((op, kind.to_string()), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    fn begin(&self, op: Op, ar: &ApiResource, key: &ObjectKey) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(Call {
            op,
            kind: ar.kind.clone(),
            key: key.clone(),
        });
        if let Some(message) = state.failures.get(&(op, ar.kind.clone())) {
            return Err(api_error(500, "InternalError", message.clone()));
        }
        Ok(state)
    }
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn stamp_new(&mut self, ar: &ApiResource, mut obj: DynamicObject) -> Result<Value> {
        if obj.types.is_none() {
            obj.types = Some(TypeMeta {
                api_version: ar.api_version.clone(),
                kind: ar.kind.clone(),
            });
        }
        let revision = self.next_revision();
        let meta = &mut obj.metadata;
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{revision}"));
        }
        meta.resource_version = Some(revision);
        meta.generation = Some(meta.generation.unwrap_or(1));
        Ok(serde_json::to_value(obj)?)
    }

    fn to_object(value: &Value) -> Result<DynamicObject> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Delete or mark for deletion, cascading to owned objects once gone
    fn delete(&mut self, id: &(String, ObjectKey)) {
        let Some(obj) = self.objects.get_mut(id) else {
            return;
        };
        if has_finalizers(obj) {
            if !is_deleting(obj) {
                set_metadata(
                    obj,
                    "deletionTimestamp",
                    Value::String(chrono::Utc::now().to_rfc3339()),
                );
                let revision = self.next_revision();
                if let Some(obj) = self.objects.get_mut(id) {
                    set_metadata(obj, "resourceVersion", Value::String(revision));
                }
            }
            return;
        }
        let removed = self.objects.remove(id);
        let Some(uid) = removed
            .as_ref()
            .and_then(|o| o.pointer("/metadata/uid"))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return;
        };
        let dependents: Vec<(String, ObjectKey)> = self
            .objects
            .iter()
            .filter(|(_, o)| {
                o.pointer("/metadata/ownerReferences")
                    .and_then(Value::as_array)
                    .map(|refs| refs.iter().any(|r| r["uid"] == uid.as_str()))
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for dependent in dependents {
            self.delete(&dependent);
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<DynamicObject> {
        let state = self.begin(Op::Get, ar, key)?;
        match state.objects.get(&(kind_key(ar), key.clone())) {
            Some(value) => State::to_object(value),
            None => Err(not_found(ar, key)),
        }
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::from_meta(&obj.metadata);
        if key.name.is_empty() {
            return Err(Error::validation(format!("{} must have a name", ar.kind)));
        }
        let mut state = self.begin(Op::Create, ar, &key)?;
        let id = (kind_key(ar), key.clone());
        if state.objects.contains_key(&id) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} {} already exists", ar.kind, key),
            ));
        }
        let mut obj = obj.clone();
        obj.metadata.creation_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        let value = state.stamp_new(ar, obj)?;
        state.objects.insert(id, value.clone());
        State::to_object(&value)
    }

    async fn patch(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let mut state = self.begin(Op::Patch, ar, key)?;
        let id = (kind_key(ar), key.clone());
        let revision = state.next_revision();
        let Some(current) = state.objects.get_mut(&id) else {
            return Err(not_found(ar, key));
        };

        let mut patch = patch.clone();
        if let Value::Object(fields) = &mut patch {
            fields.remove("status");
        }
        let touches_spec = patch
            .as_object()
            .map(|f| f.keys().any(|k| k != "metadata"))
            .unwrap_or(false);

        json_patch::merge(current, &patch);
        set_metadata(current, "resourceVersion", Value::String(revision));
        if touches_spec {
            let generation = current
                .pointer("/metadata/generation")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            set_metadata(current, "generation", Value::from(generation + 1));
        }

        let result = State::to_object(current)?;
        if is_deleting(current) && !has_finalizers(current) {
            state.delete(&id);
        }
        Ok(result)
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let mut state = self.begin(Op::PatchStatus, ar, key)?;
        let id = (kind_key(ar), key.clone());
        let revision = state.next_revision();
        let Some(current) = state.objects.get_mut(&id) else {
            return Err(not_found(ar, key));
        };
        if let Some(status) = patch.get("status") {
            let mut target = current.get("status").cloned().unwrap_or(Value::Null);
            json_patch::merge(&mut target, status);
            current["status"] = target;
        }
        set_metadata(current, "resourceVersion", Value::String(revision));
        State::to_object(current)
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<()> {
        let mut state = self.begin(Op::Delete, ar, key)?;
        let id = (kind_key(ar), key.clone());
        if !state.objects.contains_key(&id) {
            return Err(not_found(ar, key));
        }
        state.delete(&id);
        Ok(())
    }
}
