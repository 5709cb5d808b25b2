use std::collections::HashSet;

use tracing::{info, warn};

use crate::broker::{BrokerApi, BrokerError, ClusterInfo, ServerProxyMeta};
use crate::util::errors::{Error, StdError};

/// Transliterates `getCurrentMaster` in the original operator: ask each
/// broker for its `replica_addresses`; exactly one non-empty answer wins
/// outright, otherwise fall back to the highest epoch (ties broken by scan
/// order — the Go source uses a strict `>`, not `>=`).
pub async fn elect_master(broker: &dyn BrokerApi, addresses: &[String]) -> Result<String, Error> {
    let mut non_empty = Vec::new();
    let mut reachable = Vec::new();

    for addr in addresses {
        match broker.get_replicas(addr).await {
            Ok(replicas) => {
                reachable.push(addr.clone());
                if !replicas.is_empty() {
                    non_empty.push(addr.clone());
                }
            }
            Err(e) => warn!("broker {addr} unreachable during election: {e}"),
        }
    }

    if reachable.is_empty() {
        return Err(StdError::NoBrokerReachable.into());
    }

    let master = if non_empty.len() == 1 {
        non_empty[0].clone()
    } else {
        let mut best: Option<(String, u64)> = None;
        for addr in &reachable {
            match broker.get_epoch(addr).await {
                Ok(epoch) => {
                    if best.as_ref().map(|(_, e)| epoch > *e).unwrap_or(true) {
                        best = Some((addr.clone(), epoch));
                    }
                }
                Err(e) => warn!("broker {addr} unreachable fetching epoch: {e}"),
            }
        }
        best.ok_or(StdError::NoBrokerReachable)?.0
    };

    let replicas: Vec<String> = addresses.iter().filter(|a| *a != &master).cloned().collect();
    broker
        .set_replicas(&master, replicas)
        .await
        .map_err(StdError::BrokerError)?;

    info!("elected {master} as master broker");
    Ok(master)
}

/// Transliterates `reconcileMeta`/`reconcileServerProxyRegistry`: register
/// proxies present in `discovered` that the broker doesn't know about yet,
/// deregister ones the broker knows about that are no longer discovered,
/// then (only when storage is fully ready) create the cluster if absent and
/// fetch its info.
pub async fn reconcile_meta(
    broker: &dyn BrokerApi,
    master: &str,
    cluster_name: &str,
    node_number: u32,
    discovered: &[ServerProxyMeta],
    storage_all_ready: bool,
) -> Result<Option<ClusterInfo>, Error> {
    let registered: HashSet<String> = broker
        .list_proxies(master)
        .await
        .map_err(StdError::BrokerError)?
        .into_iter()
        .collect();
    let discovered_addrs: HashSet<&str> = discovered.iter().map(|p| p.proxy_address.as_str()).collect();

    // Per-item failures are logged, not fatal: a transient error registering
    // one proxy shouldn't abort the rest. Convergence is the next pass's job.
    for proxy in discovered {
        if !registered.contains(&proxy.proxy_address) {
            if let Err(e) = broker.register_proxy(master, proxy).await {
                warn!("failed to register proxy {}: {e}", proxy.proxy_address);
            }
        }
    }

    for addr in &registered {
        if !discovered_addrs.contains(addr.as_str()) {
            if let Err(e) = broker.deregister_proxy(master, addr).await {
                warn!("failed to deregister proxy {addr}: {e}");
            }
        }
    }

    if !storage_all_ready {
        return Ok(None);
    }

    broker
        .create_cluster(master, cluster_name, node_number)
        .await
        .map_err(StdError::BrokerError)?;
    let info = broker
        .get_cluster_info(master, cluster_name)
        .await
        .map_err(StdError::BrokerError)?;
    Ok(Some(info))
}

/// Transliterates `changeMeta`/`changeNodeNumber`: if the cluster isn't
/// migrating, ask the broker to converge to `node_number` nodes.
/// `MIGRATION_RUNNING` is translated into the retry-soon sentinel rather
/// than a hard failure.
pub async fn change_node_count(
    broker: &dyn BrokerApi,
    master: &str,
    cluster_name: &str,
    node_number: u32,
    info: &ClusterInfo,
) -> Result<(), Error> {
    if info.is_migrating {
        return Ok(());
    }

    match broker.scale_nodes(master, cluster_name, node_number).await {
        Ok(()) => Ok(()),
        Err(BrokerError::MigrationRunning) => Err(Error::retry_soon(StdError::BrokerError(
            BrokerError::MigrationRunning,
        ))),
        Err(e) => Err(StdError::BrokerError(e).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBroker {
        replicas: std::collections::HashMap<String, Vec<String>>,
        epochs: std::collections::HashMap<String, u64>,
        set_replicas_calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl BrokerApi for MockBroker {
        async fn get_replicas(&self, address: &str) -> Result<Vec<String>, BrokerError> {
            Ok(self.replicas.get(address).cloned().unwrap_or_default())
        }
        async fn set_replicas(&self, address: &str, replicas: Vec<String>) -> Result<(), BrokerError> {
            self.set_replicas_calls
                .lock()
                .unwrap()
                .push((address.to_string(), replicas));
            Ok(())
        }
        async fn get_epoch(&self, address: &str) -> Result<u64, BrokerError> {
            Ok(*self.epochs.get(address).unwrap_or(&0))
        }
        async fn list_proxies(&self, _address: &str) -> Result<Vec<String>, BrokerError> {
            Ok(vec![])
        }
        async fn register_proxy(&self, _address: &str, _proxy: &ServerProxyMeta) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn deregister_proxy(&self, _address: &str, _proxy_address: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn create_cluster(&self, _address: &str, _cluster_name: &str, _node_number: u32) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn list_clusters(&self, _address: &str) -> Result<Vec<String>, BrokerError> {
            Ok(vec![])
        }
        async fn get_cluster_info(&self, _address: &str, _cluster_name: &str) -> Result<ClusterInfo, BrokerError> {
            Ok(ClusterInfo {
                is_migrating: false,
                node_number_with_slots: 0,
                node_number: 0,
            })
        }
        async fn scale_nodes(&self, _address: &str, _cluster_name: &str, _node_number: u32) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn fix_epoch(&self, _address: &str, _epoch_floor: u64) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn elects_the_sole_broker_reporting_non_empty_replicas() {
        let mut broker = MockBroker::default();
        broker.replicas.insert("b1".to_string(), vec!["b2".to_string(), "b3".to_string()]);
        broker.replicas.insert("b2".to_string(), vec![]);
        broker.replicas.insert("b3".to_string(), vec![]);

        let master = elect_master(&broker, &["b1".to_string(), "b2".to_string(), "b3".to_string()])
            .await
            .unwrap();
        assert_eq!(master, "b1");
    }

    #[tokio::test]
    async fn falls_back_to_highest_epoch_on_disagreement() {
        let mut broker = MockBroker::default();
        broker.epochs.insert("b1".to_string(), 5);
        broker.epochs.insert("b2".to_string(), 9);
        broker.epochs.insert("b3".to_string(), 3);

        let master = elect_master(&broker, &["b1".to_string(), "b2".to_string(), "b3".to_string()])
            .await
            .unwrap();
        assert_eq!(master, "b2");

        let calls = broker.set_replicas_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "b2");
        assert_eq!(calls[0].1, vec!["b1".to_string(), "b3".to_string()]);
    }

    #[tokio::test]
    async fn epoch_ties_keep_the_first_seen_broker() {
        let mut broker = MockBroker::default();
        broker.epochs.insert("b1".to_string(), 4);
        broker.epochs.insert("b2".to_string(), 4);
        broker.epochs.insert("b3".to_string(), 4);

        let master = elect_master(&broker, &["b1".to_string(), "b2".to_string(), "b3".to_string()])
            .await
            .unwrap();
        assert_eq!(master, "b1");
    }

    #[tokio::test]
    async fn change_node_count_is_a_noop_while_migrating() {
        let broker = MockBroker::default();
        let info = ClusterInfo {
            is_migrating: true,
            node_number_with_slots: 4,
            node_number: 4,
        };
        change_node_count(&broker, "b1", "c", 8, &info).await.unwrap();
    }
}
