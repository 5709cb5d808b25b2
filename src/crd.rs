use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Opaque per-tier resource requests/limits, passed through verbatim to
/// every container this operator creates (broker, coordinator, server-proxy,
/// the two Redis containers). The CR does not ask for per-tier overrides.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct ResourceRequirementsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<std::collections::BTreeMap<String, String>>,
}

/// Generate the Kubernetes wrapper struct `UndermoonCluster` from our Spec
/// and Status structs. This provides a hook for generating the CRD yaml (in
/// crdgen.rs).
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "UndermoonCluster",
    group = "undermoon.midlane.io",
    version = "v1",
    namespaced
)]
#[kube(status = "UndermoonClusterStatus", shortname = "um")]
pub struct UndermoonClusterSpec {
    pub cluster_name: String,
    pub chunk_number: u32,
    #[serde(default = "default_max_memory")]
    pub max_memory: u32,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_proxy_threads")]
    pub proxy_threads: u32,
    #[serde(default)]
    pub active_redirection: bool,
    pub undermoon_image: String,
    #[serde(default = "default_redis_image")]
    pub redis_image: String,
    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirementsSpec>,
}

fn default_max_memory() -> u32 {
    512
}
fn default_port() -> u16 {
    5299
}
fn default_proxy_threads() -> u32 {
    2
}
fn default_redis_image() -> String {
    "redis:6.2".to_string()
}
fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

impl UndermoonClusterSpec {
    /// `nodeCount = 4·chunkCount` (GLOSSARY).
    pub fn node_number(&self) -> u32 {
        4 * self.chunk_number
    }

    /// `proxyCount = 2·chunkCount` (GLOSSARY).
    pub fn proxy_number(&self) -> u32 {
        2 * self.chunk_number
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Provisioning,
    Running,
    Degraded,
}

/// The status object of `UndermoonCluster`. `phase`/`conditions` are purely
/// informational: no reconcile step reads them back.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct UndermoonClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_broker_address: Option<String>,
    #[serde(default)]
    pub phase: ClusterPhase,
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
}

/// `k8s_openapi`'s `Condition` carries no `JsonSchema` impl, so the
/// `#[derive(JsonSchema)]` on `UndermoonClusterStatus` needs a hand-written
/// schema for this field instead.
fn conditions_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "lastTransitionTime",
                "message",
                "reason",
                "status",
                "type"
            ],
        },
    }))
    .unwrap()
}
