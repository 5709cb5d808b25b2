use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{api::Api, Client};

use crate::crd::UndermoonCluster;
use crate::resources::{broker_service_name, broker_statefulset_name, desired_broker_service, desired_broker_statefulset};
use crate::util::errors::Error;

use super::get_or_create;

/// Ready when ≥2 of the 3 broker pods are ready (spec.md §4.3): the broker
/// quorum can still answer as long as a majority is up.
pub fn ready(ss: &StatefulSet) -> bool {
    ready_replicas(ss) >= 2
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
        &broker_statefulset_name(cr),
        &desired_broker_statefulset(cr, oref.clone()),
    )
    .await?;
    let svc = get_or_create(&svc_api, &broker_service_name(cr), &desired_broker_service(cr, oref)).await?;

    Ok((ss, svc))
}
