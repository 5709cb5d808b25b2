use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Service};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{finalizer, Event as Finalizer},
        watcher::{self, Config},
    },
    Resource, ResourceExt,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::*;

use crate::broker::{BrokerApi, BrokerClient, ServerProxyMeta};
use crate::coordinator::CoordinatorClientPool;
use crate::crd::{ClusterPhase, UndermoonCluster};
use crate::meta;
use crate::resources;
use crate::tiers;
use crate::util::errors::{self, ErrorWithRequeue, StdError, RETRY_SOON};
use crate::util::{metrics, telemetry};

pub static UNDERMOON_CLUSTER_FINALIZER: &str = "undermoon.midlane.io/cleanup";
type Result<T, E = errors::Error> = std::result::Result<T, E>;

impl UndermoonCluster {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let client = ctx.client.clone();
        let ns = self.namespace().unwrap();
        let name = self.name_any();
        let oref = self.controller_owner_ref(&()).unwrap();
        let cluster_api: Api<UndermoonCluster> = Api::namespaced(client.clone(), &ns);

        // Step 2: provision the three tiers. Independent, so run concurrently.
        let (broker_result, coordinator_result, storage_result) = tokio::try_join!(
            tiers::broker::reconcile(client.clone(), &ns, self, oref.clone()),
            tiers::coordinator::reconcile(client.clone(), &ns, self, oref.clone()),
            tiers::storage::reconcile(client.clone(), &ns, self, oref.clone()),
        )?;
        let (broker_ss, _broker_svc) = broker_result;
        let (coordinator_ss, _coordinator_svc) = coordinator_result;
        let (storage_ss, _storage_internal_svc, _storage_public_svc) = storage_result;

        // Step 3: gate on broker+coordinator readiness.
        if !tiers::broker::ready(&broker_ss) || !tiers::coordinator::ready(&coordinator_ss) {
            info!("broker/coordinator not yet ready, requeueing");
            return Ok(Action::requeue(RETRY_SOON));
        }

        // Step 4: elect (or confirm) master broker.
        let broker_addresses = resources::broker_dns_names(self);
        let master = meta::elect_master(ctx.broker.as_ref(), &broker_addresses).await?;
        patch_status(&cluster_api, &name, json!({ "master_broker_address": master })).await?;

        // Step 5: push the elected broker address to every coordinator. Per-item
        // failures are logged, not fatal — convergence is the next pass's job.
        for coordinator_address in resources::coordinator_dns_names(self) {
            if let Err(e) = ctx.coordinators.set_brokers(&coordinator_address, &master).await {
                warn!("failed to push broker address to coordinator {coordinator_address}: {e}");
            }
        }

        // Step 6: epoch repair. A proxy that has observed a higher epoch than the
        // broker means the broker lost its meta file; raise the broker's epoch
        // past it before any further meta writes.
        let proxy_endpoints = tiers::storage::discover_proxy_endpoints(client.clone(), &ns, self).await?;
        let broker_epoch = ctx.broker.get_epoch(&master).await.map_err(StdError::BrokerError)?;
        let mut max_proxy_epoch = 0u64;
        for endpoint in &proxy_endpoints {
            let proxy_address = format!("{}:{}", endpoint.ip, self.spec.port);
            match ctx.broker.get_epoch(&proxy_address).await {
                Ok(epoch) => max_proxy_epoch = max_proxy_epoch.max(epoch),
                Err(e) => warn!("failed to query epoch from proxy {proxy_address}: {e}"),
            }
        }
        if max_proxy_epoch > broker_epoch {
            warn!("broker epoch {broker_epoch} behind proxy epoch {max_proxy_epoch}, repairing");
            ctx.broker
                .fix_epoch(&master, max_proxy_epoch + 1)
                .await
                .map_err(StdError::BrokerError)?;
        }

        // Step 7: enumerate proxies from the internal storage service's endpoints.
        let proxies: Vec<ServerProxyMeta> = proxy_endpoints
            .iter()
            .map(|endpoint| ServerProxyMeta {
                proxy_address: format!("{}:{}", endpoint.ip, self.spec.port),
                nodes: [
                    format!("{}:{}", endpoint.ip, resources::REDIS_PORT_1),
                    format!("{}:{}", endpoint.ip, resources::REDIS_PORT_2),
                ],
                host: endpoint.hostname.clone().unwrap_or_else(|| endpoint.ip.clone()),
            })
            .collect();

        // Step 8: storage all-ready gate — both the StatefulSet's ready
        // replica count and the discovered endpoint count must reach the
        // desired proxy count.
        let storage_all_ready = tiers::storage::all_ready(&storage_ss, self, proxy_endpoints.len());

        // Step 9: push meta — registry reconciliation plus create/info when ready.
        let node_number = self.spec.node_number();
        let info = meta::reconcile_meta(
            ctx.broker.as_ref(),
            &master,
            &self.spec.cluster_name,
            node_number,
            &proxies,
            storage_all_ready,
        )
        .await?;

        // Step 10: change node count if the broker confirms a stable (non-migrating)
        // cluster.
        if let Some(info) = &info {
            meta::change_node_count(ctx.broker.as_ref(), &master, &self.spec.cluster_name, node_number, info)
                .await?;
        }

        // Step 11: second registry-only pass with no freshly discovered proxies, to
        // catch entries the broker should drop now that scaling has moved on.
        meta::reconcile_meta(
            ctx.broker.as_ref(),
            &master,
            &self.spec.cluster_name,
            node_number,
            &[],
            false,
        )
        .await?;

        // Step 12: scale-down gate. Only shrink storage once the broker confirms
        // migration has fully converged on the new node count.
        if let Some(info) = &info {
            if info.node_number_with_slots != node_number {
                info!(
                    "cluster {} still converging ({} of {} nodes with slots), requeueing",
                    self.spec.cluster_name, info.node_number_with_slots, node_number
                );
                return Ok(Action::requeue(RETRY_SOON));
            }
            let ss_api: Api<StatefulSet> = Api::namespaced(client.clone(), &ns);
            tiers::storage::scale_to(
                &ss_api,
                &resources::storage_statefulset_name(self),
                self.spec.proxy_number() as i32,
            )
            .await?;
        }

        let phase = if info.is_some() {
            ClusterPhase::Running
        } else {
            ClusterPhase::Provisioning
        };
        patch_status(&cluster_api, &name, json!({ "phase": phase })).await?;

        Ok(Action::requeue(tokio::time::Duration::from_secs(5 * 60)))
    }

    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("Delete `{}`", self.name_any())),
                action: "Deleting".into(),
                secondary: None,
            })
            .await
            .map_err(StdError::KubeError)?;
        Ok(Action::await_change())
    }
}

/// A JSON merge patch (RFC 7386) only touches the keys it names, so setting
/// `master_broker_address` on one call and `phase` on another never clobbers
/// the field the other call owns.
async fn patch_status(cluster_api: &Api<UndermoonCluster>, name: &str, status: serde_json::Value) -> Result<()> {
    let patch = json!({ "status": status });
    cluster_api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(StdError::KubeError)?;
    Ok(())
}

/// State shared between the controller and the web server.
#[derive(Clone, Default)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    registry: prometheus::Registry,
}

impl State {
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: metrics::Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
            broker: Arc::new(BrokerClient::new()),
            coordinators: CoordinatorClientPool::new(),
        })
    }
}

/// Context passed to every reconcile call.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: metrics::Metrics,
    pub broker: Arc<dyn BrokerApi>,
    pub coordinators: CoordinatorClientPool,
}

#[instrument(skip(ctx, cluster), fields(trace_id))]
pub async fn reconcile(cluster: Arc<UndermoonCluster>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = cluster.namespace().unwrap();
    let cluster_api: Api<UndermoonCluster> = Api::namespaced(ctx.client.clone(), &ns);

    info!("reconciling UndermoonCluster \"{}\" in {}", cluster.name_any(), ns);

    finalizer(&cluster_api, UNDERMOON_CLUSTER_FINALIZER, cluster, |event| async {
        match event {
            Finalizer::Apply(cluster) => cluster.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(cluster) => cluster.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| StdError::FinalizerError(Box::new(e)).into())
}

/// Diagnostics exposed by the web server.
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    #[serde(deserialize_with = "from_ts")]
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "undermoon-operator".into(),
        }
    }
}

impl Diagnostics {
    fn recorder(&self, client: Client, cluster: &UndermoonCluster) -> Recorder {
        Recorder::new(client, self.reporter.clone(), cluster.object_ref(&()))
    }
}

fn from_ts<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn error_policy(cluster: Arc<UndermoonCluster>, error: &errors::Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&*cluster, error);
    match error {
        errors::Error::ErrorWithRequeue(ErrorWithRequeue { duration, .. }) => Action::requeue(*duration),
        errors::Error::StdError(_) => Action::requeue(tokio::time::Duration::from_secs(5 * 60)),
    }
}

/// Initialize the controller and shared state (given the CRD is installed).
pub async fn run(state: State) {
    let client = Client::try_default().await.expect("failed to create kube Client");

    let clusters = Api::<UndermoonCluster>::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    Controller::new(clusters, Config::default().any_semantic())
        .owns(Api::<StatefulSet>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
