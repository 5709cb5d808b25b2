use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use serde_json::json;
use tracing::info;

use crate::crd::UndermoonCluster;
use crate::resources::{
    desired_storage_internal_service, desired_storage_public_service, desired_storage_statefulset,
    storage_internal_service_name, storage_public_service_name, storage_statefulset_name,
};
use crate::util::errors::{Error, StdError};

use super::get_or_create;

/// Ready when both the StatefulSet's ready replica count and the discovered
/// endpoint count reach the desired proxy count, matching `storageAllReady`
/// in the original operator: replicas alone can lag endpoint propagation (or
/// vice versa), so both are required.
pub fn all_ready(ss: &StatefulSet, cr: &UndermoonCluster, ready_endpoint_count: usize) -> bool {
    let desired = cr.spec.proxy_number() as i32;
    ready_replicas(ss) >= desired && ready_endpoint_count as i32 >= desired
}

fn ready_replicas(ss: &StatefulSet) -> i32 {
    ss.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0)
}

fn current_replicas(ss: &StatefulSet) -> i32 {
    ss.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

pub async fn reconcile(
    client: Client,
    namespace: &str,
    cr: &UndermoonCluster,
    oref: OwnerReference,
) -> Result<(StatefulSet, Service, Service), Error> {
    let ss_api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let svc_api: Api<Service> = Api::namespaced(client, namespace);

    let mut ss = get_or_create(
        &ss_api,
        &storage_statefulset_name(cr),
        &desired_storage_statefulset(cr, oref.clone()),
    )
    .await?;

    let desired_replicas = cr.spec.proxy_number() as i32;
    if current_replicas(&ss) < desired_replicas {
        info!(
            "scaling storage up {} -> {}",
            current_replicas(&ss),
            desired_replicas
        );
        ss = scale_to(&ss_api, &storage_statefulset_name(cr), desired_replicas).await?;
    }

    let internal = get_or_create(
        &svc_api,
        &storage_internal_service_name(cr),
        &desired_storage_internal_service(cr, oref.clone()),
    )
    .await?;
    let public = get_or_create(
        &svc_api,
        &storage_public_service_name(cr),
        &desired_storage_public_service(cr, oref),
    )
    .await?;

    Ok((ss, internal, public))
}

/// Patches replica count only — never touches any other field, per spec.md
/// §4.3's "never mutate fields the control plane owns" rule. Used both for
/// the eager scale-up above and for the gated scale-down in the meta
/// controller. Optimistic-concurrency conflicts are surfaced to the caller,
/// which is expected to translate them into a retry-soon outcome.
pub async fn scale_to(api: &Api<StatefulSet>, name: &str, replicas: i32) -> Result<StatefulSet, Error> {
    let patch = json!({ "spec": { "replicas": replicas } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| StdError::KubeError(e).into())
}

/// One endpoint of the internal storage service, as reported by Kubernetes.
/// `publishNotReadyAddresses=true` on that service means this includes pods
/// that haven't joined a cluster yet (spec.md §4.4 step 7).
pub struct ProxyEndpoint {
    pub ip: String,
    pub hostname: Option<String>,
}

/// Discover the live proxy endpoints behind the internal storage service —
/// used by the reconciler both to derive `ServerProxyMeta` descriptors and
/// to count ready endpoints for the all-ready gate.
pub async fn discover_proxy_endpoints(
    client: Client,
    namespace: &str,
    cr: &UndermoonCluster,
) -> Result<Vec<ProxyEndpoint>, Error> {
    let api: Api<Endpoints> = Api::namespaced(client, namespace);
    let endpoints = match api.get_opt(&storage_internal_service_name(cr)).await {
        Ok(Some(e)) => e,
        Ok(None) => return Ok(vec![]),
        Err(e) => return Err(StdError::KubeError(e).into()),
    };

    let mut result = Vec::new();
    for subset in endpoints.subsets.unwrap_or_default() {
        for addr in subset.addresses.unwrap_or_default() {
            result.push(ProxyEndpoint {
                ip: addr.ip,
                hostname: addr.hostname,
            });
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};

    fn ss_with(replicas: i32, ready: i32) -> StatefulSet {
        StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                ready_replicas: Some(ready),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn cr_with_chunks(chunk_number: u32) -> UndermoonCluster {
        UndermoonCluster::new(
            "demo",
            crate::crd::UndermoonClusterSpec {
                cluster_name: "demo-cluster".to_string(),
                chunk_number,
                max_memory: 256,
                port: 5299,
                proxy_threads: 2,
                active_redirection: false,
                undermoon_image: "undermoon/undermoon:latest".to_string(),
                redis_image: "redis:6.2".to_string(),
                image_pull_policy: "IfNotPresent".to_string(),
                resources: None,
            },
        )
    }

    #[test]
    fn all_ready_requires_exact_match_with_proxy_number() {
        let cr = cr_with_chunks(2);
        assert!(!all_ready(&ss_with(4, 3), &cr, 4));
        assert!(all_ready(&ss_with(4, 4), &cr, 4));
    }

    #[test]
    fn all_ready_also_requires_enough_ready_endpoints() {
        let cr = cr_with_chunks(2);
        assert!(!all_ready(&ss_with(4, 4), &cr, 3));
        assert!(all_ready(&ss_with(4, 4), &cr, 4));
    }

    #[test]
    fn current_replicas_reads_spec_not_status() {
        let ss = ss_with(4, 2);
        assert_eq!(current_replicas(&ss), 4);
    }
}
