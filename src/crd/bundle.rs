//! Bundle Custom Resource Definition
//!
//! A Bundle renders a ConfigMap from inline data and optionally waits for an
//! externally managed Secret before reporting ready. It exists to exercise
//! every part of the reconciliation engine from a real controller.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "steward.dev",
    version = "v1alpha1",
    kind = "Bundle",
    namespaced,
    status = "BundleStatus",
    shortname = "bdl",
    printcolumn = r#"{"name":"ConfigMap","type":"string","jsonPath":".status.configMapName"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    pub config_map: ConfigMapTemplate,

    /// External Secret this bundle depends on (never modified beyond annotations)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretDependencyRef>,
}

/// ConfigMap rendered and owned by the Bundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapTemplate {
    pub name: String,

    /// When false the ConfigMap is deleted, including under a previously recorded name
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

/// Reference to an externally managed Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretDependencyRef {
    pub name: String,

    /// Defaults to the Bundle's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// The Secret is considered ready once this key is present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_key: Option<String>,

    #[serde(default)]
    pub optional: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Name under which the ConfigMap was last created or updated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_map_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl BundleSpec {
    /// Validate the spec, returning a human-readable reason on failure
    pub fn validate(&self) -> Result<(), String> {
        if self.config_map.name.is_empty() {
            return Err("spec.configMap.name must not be empty".to_string());
        }
        if self.config_map.name.len() > 253 {
            return Err("spec.configMap.name must be at most 253 characters".to_string());
        }
        if let Some(secret) = &self.secret_ref {
            if secret.name.is_empty() {
                return Err("spec.secretRef.name must not be empty".to_string());
            }
        }
        Ok(())
    }
}
