use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{api::Api, Client};

use crate::crd::UndermoonCluster;
use crate::resources::{
    coordinator_service_name, coordinator_statefulset_name, desired_coordinator_service,
    desired_coordinator_statefulset,
};
use crate::util::errors::Error;

use super::get_or_create;

/// Ready when at least one coordinator pod is up (spec.md §4.3).
pub fn ready(ss: &StatefulSet) -> bool {
    ready_replicas(ss) >= 1
}

pub fn all_ready(ss: &StatefulSet) -> bool {
    ready_replicas(ss) >= 3
}

fn ready_replicas(ss: &StatefulSet) -> i32 {
    ss.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0)
}

pub async fn reconcile(
    client: Client,
    namespace: &str,
    cr: &UndermoonCluster,
    oref: OwnerReference,
) -> Result<(StatefulSet, k8s_openapi::api::core::v1::Service), Error> {
    let ss_api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let svc_api: Api<k8s_openapi::api::core::v1::Service> = Api::namespaced(client, namespace);

    let ss = get_or_create(
        &ss_api,
        &coordinator_statefulset_name(cr),
        &desired_coordinator_statefulset(cr, oref.clone()),
    )
    .await?;
    let svc = get_or_create(
        &svc_api,
        &coordinator_service_name(cr),
        &desired_coordinator_service(cr, oref),
    )
    .await?;

    Ok((ss, svc))
}
