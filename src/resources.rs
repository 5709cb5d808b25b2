use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, EnvVarSource, ExecAction, ObjectFieldSelector, PodAffinityTerm,
            PodAntiAffinity, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Service, ServicePort,
            ServiceSpec, WeightedPodAffinityTerm,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, OwnerReference},
        util::intstr::IntOrString,
    },
};
use kube::api::ObjectMeta;

use crate::crd::UndermoonCluster;

pub const BROKER_PORT: u16 = 7799;
pub const BROKER_REPLICAS: i32 = 3;
pub const COORDINATOR_PORT: u16 = 6699;
pub const COORDINATOR_REPLICAS: i32 = 3;
pub const REDIS_PORT_1: u16 = 7001;
pub const REDIS_PORT_2: u16 = 7002;

fn name(cr: &UndermoonCluster) -> String {
    cr.metadata.name.clone().expect("UndermoonCluster requires a name")
}

fn namespace(cr: &UndermoonCluster) -> String {
    cr.metadata.namespace.clone().unwrap_or_else(|| "default".to_string())
}

fn labels(cr: &UndermoonCluster, tier: &str) -> BTreeMap<String, String> {
    let mut l = BTreeMap::new();
    l.insert("app.kubernetes.io/name".to_string(), "undermoon".to_string());
    l.insert("undermoon.midlane.io/cluster".to_string(), name(cr));
    l.insert("undermoon.midlane.io/tier".to_string(), tier.to_string());
    l
}

fn resource_requirements(cr: &UndermoonCluster) -> Option<ResourceRequirements> {
    cr.spec.resources.as_ref().map(|r| ResourceRequirements {
        requests: r.requests.as_ref().map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect()
        }),
        limits: r.limits.as_ref().map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect()
        }),
        claims: None,
    })
}

fn pod_ip_env(env_name: &str) -> EnvVar {
    EnvVar {
        name: env_name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "status.podIP".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_name_env(env_name: &str) -> EnvVar {
    EnvVar {
        name: env_name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "metadata.name".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env(n: &str, v: impl ToString) -> EnvVar {
    EnvVar {
        name: n.to_string(),
        value: Some(v.to_string()),
        ..Default::default()
    }
}

/// Deterministic broker DNS names, used by the reconciler to address each
/// broker pod directly and to hand the replica set to the coordinators.
pub fn broker_dns_names(cr: &UndermoonCluster) -> Vec<String> {
    let ns = namespace(cr);
    let svc = broker_service_name(cr);
    (0..BROKER_REPLICAS)
        .map(|i| format!("{}-{}.{}.{}.svc.cluster.local:{}", broker_statefulset_name(cr), i, svc, ns, BROKER_PORT))
        .collect()
}

pub fn broker_statefulset_name(cr: &UndermoonCluster) -> String {
    format!("{}-broker-ss", name(cr))
}

pub fn broker_service_name(cr: &UndermoonCluster) -> String {
    format!("{}-broker-svc", name(cr))
}

pub fn desired_broker_statefulset(cr: &UndermoonCluster, oref: OwnerReference) -> StatefulSet {
    let l = labels(cr, "broker");
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(broker_statefulset_name(cr)),
            namespace: Some(namespace(cr)),
            owner_references: Some(vec![oref]),
            labels: Some(l.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(BROKER_REPLICAS),
            service_name: broker_service_name(cr),
            selector: LabelSelector {
                match_expressions: None,
                match_labels: Some(l.clone()),
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(l),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "broker".to_string(),
                        image: Some(cr.spec.undermoon_image.clone()),
                        image_pull_policy: Some(cr.spec.image_pull_policy.clone()),
                        ports: Some(vec![ContainerPort {
                            container_port: BROKER_PORT as i32,
                            ..Default::default()
                        }]),
                        env: Some(vec![
                            pod_ip_env("UNDERMOON_ADDRESS"),
                            env("UNDERMOON_FAILURE_TTL", 60),
                            env("UNDERMOON_FAILURE_QUORUM", 2),
                            env("UNDERMOON_MIGRATION_LIMIT", 2),
                            env("UNDERMOON_RECOVER_FROM_META_FILE", true),
                            env("UNDERMOON_META_FILENAME", "metadata"),
                            env("UNDERMOON_AUTO_UPDATE_META_FILE", true),
                            env("UNDERMOON_UPDATE_META_FILE_INTERVAL", 10),
                            env("UNDERMOON_REPLICA_ADDRESSES", ""),
                            env("UNDERMOON_SYNC_META_INTERVAL", 5),
                            env("UNDERMOON_DEBUG", false),
                        ]),
                        resources: resource_requirements(cr),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn desired_broker_service(cr: &UndermoonCluster, oref: OwnerReference) -> Service {
    let l = labels(cr, "broker");
    Service {
        metadata: ObjectMeta {
            name: Some(broker_service_name(cr)),
            namespace: Some(namespace(cr)),
            owner_references: Some(vec![oref]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(l),
            ports: Some(vec![ServicePort {
                name: Some("broker".to_string()),
                port: BROKER_PORT as i32,
                target_port: Some(IntOrString::Int(BROKER_PORT as i32)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn coordinator_statefulset_name(cr: &UndermoonCluster) -> String {
    format!("{}-coordinator-ss", name(cr))
}

pub fn coordinator_service_name(cr: &UndermoonCluster) -> String {
    format!("{}-coordinator-svc", name(cr))
}

/// Deterministic coordinator DNS names, used by the reconciler to push the
/// elected broker address to each pod in turn.
pub fn coordinator_dns_names(cr: &UndermoonCluster) -> Vec<String> {
    let ns = namespace(cr);
    let svc = coordinator_service_name(cr);
    (0..COORDINATOR_REPLICAS)
        .map(|i| {
            format!(
                "{}-{}.{}.{}.svc.cluster.local:{}",
                coordinator_statefulset_name(cr),
                i,
                svc,
                ns,
                COORDINATOR_PORT
            )
        })
        .collect()
}

pub fn desired_coordinator_statefulset(cr: &UndermoonCluster, oref: OwnerReference) -> StatefulSet {
    let l = labels(cr, "coordinator");
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(coordinator_statefulset_name(cr)),
            namespace: Some(namespace(cr)),
            owner_references: Some(vec![oref]),
            labels: Some(l.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(COORDINATOR_REPLICAS),
            service_name: coordinator_service_name(cr),
            selector: LabelSelector {
                match_expressions: None,
                match_labels: Some(l.clone()),
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(l),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "coordinator".to_string(),
                        image: Some(cr.spec.undermoon_image.clone()),
                        image_pull_policy: Some(cr.spec.image_pull_policy.clone()),
                        ports: Some(vec![ContainerPort {
                            container_port: COORDINATOR_PORT as i32,
                            ..Default::default()
                        }]),
                        env: Some(vec![
                            pod_ip_env("UNDERMOON_ADDRESS"),
                            pod_name_env("UNDERMOON_REPORTER_ID"),
                            env("UNDERMOON_THREAD_NUMBER", 2),
                        ]),
                        resources: resource_requirements(cr),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn desired_coordinator_service(cr: &UndermoonCluster, oref: OwnerReference) -> Service {
    let l = labels(cr, "coordinator");
    Service {
        metadata: ObjectMeta {
            name: Some(coordinator_service_name(cr)),
            namespace: Some(namespace(cr)),
            owner_references: Some(vec![oref]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(l),
            ports: Some(vec![ServicePort {
                name: Some("coordinator".to_string()),
                port: COORDINATOR_PORT as i32,
                target_port: Some(IntOrString::Int(COORDINATOR_PORT as i32)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn storage_statefulset_name(cr: &UndermoonCluster) -> String {
    format!("{}-stg-ss", name(cr))
}

pub fn storage_internal_service_name(cr: &UndermoonCluster) -> String {
    format!("{}-stg-svc", name(cr))
}

pub fn storage_public_service_name(cr: &UndermoonCluster) -> String {
    name(cr)
}

fn redis_container(port: u16, cr: &UndermoonCluster) -> Container {
    Container {
        name: format!("redis-{port}"),
        image: Some(cr.spec.redis_image.clone()),
        image_pull_policy: Some(cr.spec.image_pull_policy.clone()),
        command: Some(vec!["redis-server".to_string()]),
        args: Some(vec![
            "--maxmemory".to_string(),
            format!("{}mb", cr.spec.max_memory),
            "--port".to_string(),
            port.to_string(),
            "--slave-announce-port".to_string(),
            port.to_string(),
            "--slave-announce-ip".to_string(),
            "$(POD_IP)".to_string(),
            "--maxmemory-policy".to_string(),
            "allkeys-lru".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: port as i32,
            ..Default::default()
        }]),
        env: Some(vec![pod_ip_env("POD_IP")]),
        resources: resource_requirements(cr),
        ..Default::default()
    }
}

fn server_proxy_container(cr: &UndermoonCluster) -> Container {
    let port = cr.spec.port;
    Container {
        name: "server-proxy".to_string(),
        image: Some(cr.spec.undermoon_image.clone()),
        image_pull_policy: Some(cr.spec.image_pull_policy.clone()),
        ports: Some(vec![ContainerPort {
            container_port: port as i32,
            ..Default::default()
        }]),
        env: Some(vec![
            pod_ip_env("POD_IP"),
            env("UNDERMOON_ADDRESS", format!("$(POD_IP):{port}")),
            env("UNDERMOON_AUTO_SELECT_CLUSTER", true),
            env("UNDERMOON_THREAD_NUMBER", cr.spec.proxy_threads),
            env("UNDERMOON_ACTIVE_REDIRECTION", cr.spec.active_redirection),
            env("UNDERMOON_SLOWLOG_LEN", 1024),
            env("UNDERMOON_SLOWLOG_LOG_SLOWER_THAN", 10000),
            env("UNDERMOON_BACKEND_BATCH_MIN_TIME", 100),
            env("UNDERMOON_BACKEND_BATCH_MAX_TIME", 500),
            env("UNDERMOON_BACKEND_BATCH_BUF_SIZE", 50),
            env("UNDERMOON_SESSION_CHANNEL_SIZE", 1024),
            env("UNDERMOON_BACKEND_CONN_NUM", 4),
        ]),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "redis-cli".to_string(),
                    "-p".to_string(),
                    port.to_string(),
                    "CLUSTER".to_string(),
                    "NODES".to_string(),
                ]),
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(5),
            ..Default::default()
        }),
        resources: resource_requirements(cr),
        ..Default::default()
    }
}

pub fn desired_storage_statefulset(cr: &UndermoonCluster, oref: OwnerReference) -> StatefulSet {
    let l = labels(cr, "storage");
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(storage_statefulset_name(cr)),
            namespace: Some(namespace(cr)),
            owner_references: Some(vec![oref]),
            labels: Some(l.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(cr.spec.proxy_number() as i32),
            service_name: storage_internal_service_name(cr),
            selector: LabelSelector {
                match_expressions: None,
                match_labels: Some(l.clone()),
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(l.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity: Some(k8s_openapi::api::core::v1::Affinity {
                        pod_anti_affinity: Some(PodAntiAffinity {
                            preferred_during_scheduling_ignored_during_execution: Some(vec![
                                WeightedPodAffinityTerm {
                                    weight: 100,
                                    pod_affinity_term: PodAffinityTerm {
                                        label_selector: Some(LabelSelector {
                                            match_expressions: None,
                                            match_labels: Some(l),
                                        }),
                                        topology_key: "kubernetes.io/hostname".to_string(),
                                        ..Default::default()
                                    },
                                },
                            ]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    containers: vec![
                        server_proxy_container(cr),
                        redis_container(REDIS_PORT_1, cr),
                        redis_container(REDIS_PORT_2, cr),
                    ],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn desired_storage_internal_service(cr: &UndermoonCluster, oref: OwnerReference) -> Service {
    let l = labels(cr, "storage");
    Service {
        metadata: ObjectMeta {
            name: Some(storage_internal_service_name(cr)),
            namespace: Some(namespace(cr)),
            owner_references: Some(vec![oref]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(l),
            ports: Some(vec![ServicePort {
                name: Some("proxy".to_string()),
                port: cr.spec.port as i32,
                target_port: Some(IntOrString::Int(cr.spec.port as i32)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn desired_storage_public_service(cr: &UndermoonCluster, oref: OwnerReference) -> Service {
    let l = labels(cr, "storage");
    Service {
        metadata: ObjectMeta {
            name: Some(storage_public_service_name(cr)),
            namespace: Some(namespace(cr)),
            owner_references: Some(vec![oref]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(l),
            ports: Some(vec![ServicePort {
                name: Some("proxy".to_string()),
                port: cr.spec.port as i32,
                target_port: Some(IntOrString::Int(cr.spec.port as i32)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cr() -> UndermoonCluster {
        let mut cr = UndermoonCluster::new(
            "demo",
            crate::crd::UndermoonClusterSpec {
                cluster_name: "demo-cluster".to_string(),
                chunk_number: 2,
                max_memory: 256,
                port: 5299,
                proxy_threads: 2,
                active_redirection: false,
                undermoon_image: "undermoon/undermoon:latest".to_string(),
                redis_image: "redis:6.2".to_string(),
                image_pull_policy: "IfNotPresent".to_string(),
                resources: None,
            },
        );
        cr.metadata.namespace = Some("default".to_string());
        cr
    }

    fn fake_oref() -> OwnerReference {
        OwnerReference {
            api_version: "undermoon.midlane.io/v1".to_string(),
            kind: "UndermoonCluster".to_string(),
            name: "demo".to_string(),
            uid: "uid".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn broker_statefulset_has_fixed_replicas_and_owner_ref() {
        let cr = test_cr();
        let ss = desired_broker_statefulset(&cr, fake_oref());
        assert_eq!(ss.spec.as_ref().unwrap().replicas, Some(3));
        assert_eq!(ss.metadata.owner_references.unwrap().len(), 1);
    }

    #[test]
    fn storage_statefulset_replica_count_is_2x_chunk_number() {
        let cr = test_cr();
        let ss = desired_storage_statefulset(&cr, fake_oref());
        assert_eq!(ss.spec.as_ref().unwrap().replicas, Some(4));
        assert_eq!(ss.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers.len(), 3);
    }

    #[test]
    fn storage_has_two_distinct_services() {
        let cr = test_cr();
        let internal = desired_storage_internal_service(&cr, fake_oref());
        let public = desired_storage_public_service(&cr, fake_oref());
        assert_ne!(internal.metadata.name, public.metadata.name);
        assert_eq!(
            internal.spec.as_ref().unwrap().publish_not_ready_addresses,
            Some(true)
        );
        assert_eq!(public.spec.as_ref().unwrap().publish_not_ready_addresses, None);
    }

    #[test]
    fn public_service_name_is_bare_cr_name() {
        let cr = test_cr();
        assert_eq!(storage_public_service_name(&cr), "demo");
    }

    #[test]
    fn broker_dns_names_are_deterministic_and_match_replica_count() {
        let cr = test_cr();
        let names = broker_dns_names(&cr);
        assert_eq!(names.len(), BROKER_REPLICAS as usize);
        assert!(names[0].starts_with("demo-broker-ss-0."));
    }
}
