use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("redis connection to coordinator failed: {0}")]
    Connect(#[source] redis::RedisError),

    #[error("CONFIG SET brokers failed: {0}")]
    ConfigSet(#[source] redis::RedisError),
}

/// A single coordinator's RESP connection. Coordinators expose a Redis
/// protocol endpoint accepting `CONFIG SET brokers <addr>`, used to push
/// down the elected broker's address (spec.md §4.2).
pub struct CoordinatorClient {
    conn: redis::aio::MultiplexedConnection,
}

impl CoordinatorClient {
    async fn connect(address: &str) -> Result<Self, CoordinatorError> {
        let url = format!("redis://{address}");
        let client = redis::Client::open(url).map_err(CoordinatorError::Connect)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(CoordinatorError::Connect)?;
        Ok(Self { conn })
    }

    pub async fn set_brokers(&mut self, broker_address: &str) -> Result<(), CoordinatorError> {
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("brokers")
            .arg(broker_address)
            .query_async(&mut self.conn)
            .await
            .map_err(CoordinatorError::ConfigSet)?;
        Ok(())
    }
}

/// Process-wide pool of coordinator connections keyed by address, guarded
/// by a single mutex. Connections are never evicted: the pool lives for the
/// lifetime of the operator process and coordinators come and go with their
/// owning StatefulSet, so the address space is small and bounded.
#[derive(Clone, Default)]
pub struct CoordinatorClientPool {
    clients: Arc<Mutex<HashMap<String, CoordinatorClient>>>,
}

impl CoordinatorClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_brokers(&self, address: &str, broker_address: &str) -> Result<(), CoordinatorError> {
        let mut clients = self.clients.lock().await;
        if !clients.contains_key(address) {
            info!("opening coordinator connection to {address}");
            let client = CoordinatorClient::connect(address).await?;
            clients.insert(address.to_string(), client);
        }
        let client = clients.get_mut(address).expect("just inserted");
        client.set_brokers(broker_address).await
    }
}
