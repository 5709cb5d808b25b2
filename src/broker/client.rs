use super::types::{
    BrokerConfig, BrokerErrorBody, BrokerErrorCode, ClusterInfo, CreateClusterPayload, ServerProxyMeta,
};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("broker returned unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("could not decode broker response: {0}")]
    Decode(String),

    /// `scaleNodes` returned 409/400 with `error=MIGRATION_RUNNING` — the
    /// one broker response spec.md §4.1 says must be surfaced as a
    /// distinguished retryable error rather than folded into a generic
    /// failure.
    #[error("broker is migrating slots")]
    MigrationRunning,
}

/// A typed HTTP client to one broker address. Stateless and cheap to
/// construct per call; all operations are idempotent at the broker and must
/// be treated as such by callers (spec.md §4.1).
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn get_replicas(&self, address: &str) -> Result<Vec<String>, BrokerError>;
    async fn set_replicas(&self, address: &str, replicas: Vec<String>) -> Result<(), BrokerError>;
    async fn get_epoch(&self, address: &str) -> Result<u64, BrokerError>;
    async fn list_proxies(&self, address: &str) -> Result<Vec<String>, BrokerError>;
    async fn register_proxy(&self, address: &str, proxy: &ServerProxyMeta) -> Result<(), BrokerError>;
    async fn deregister_proxy(&self, address: &str, proxy_address: &str) -> Result<(), BrokerError>;
    async fn create_cluster(
        &self,
        address: &str,
        cluster_name: &str,
        node_number: u32,
    ) -> Result<(), BrokerError>;
    async fn list_clusters(&self, address: &str) -> Result<Vec<String>, BrokerError>;
    async fn get_cluster_info(&self, address: &str, cluster_name: &str) -> Result<ClusterInfo, BrokerError>;
    async fn scale_nodes(
        &self,
        address: &str,
        cluster_name: &str,
        node_number: u32,
    ) -> Result<(), BrokerError>;
    async fn fix_epoch(&self, address: &str, epoch_floor: u64) -> Result<(), BrokerError>;
}

pub struct BrokerClient {
    http: reqwest::Client,
}

impl Default for BrokerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Parse a non-2xx response body for a known broker error code. Returns
    /// `Ok(Some(code))` when the body carries one of the recognized codes,
    /// `Ok(None)` when the body is well-formed JSON but carries an
    /// unrecognized code, and the raw body text when it's not JSON at all.
    async fn classify_error(resp: reqwest::Response) -> (u16, Option<BrokerErrorCode>, String) {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let code = serde_json::from_str::<BrokerErrorBody>(&body)
            .ok()
            .and_then(|b| BrokerErrorCode::parse(&b.error));
        (status, code, body)
    }
}

#[async_trait]
impl BrokerApi for BrokerClient {
    async fn get_replicas(&self, address: &str) -> Result<Vec<String>, BrokerError> {
        let url = format!("http://{address}/api/v2/config");
        let resp = self.http.get(&url).send().await?;
        if resp.status() != 200 {
            let (status, _, body) = Self::classify_error(resp).await;
            return Err(BrokerError::UnexpectedStatus { status, body });
        }
        let cfg: BrokerConfig = resp.json().await.map_err(|e| BrokerError::Decode(e.to_string()))?;
        Ok(cfg.replica_addresses)
    }

    async fn set_replicas(&self, address: &str, replicas: Vec<String>) -> Result<(), BrokerError> {
        let url = format!("http://{address}/api/v2/config");
        let payload = BrokerConfig {
            replica_addresses: replicas,
        };
        let resp = self.http.put(&url).json(&payload).send().await?;
        if resp.status() != 200 {
            let (status, _, body) = Self::classify_error(resp).await;
            return Err(BrokerError::UnexpectedStatus { status, body });
        }
        Ok(())
    }

    async fn get_epoch(&self, address: &str) -> Result<u64, BrokerError> {
        let url = format!("http://{address}/api/v2/epoch");
        let resp = self.http.get(&url).send().await?;
        if resp.status() != 200 {
            let (status, _, body) = Self::classify_error(resp).await;
            return Err(BrokerError::UnexpectedStatus { status, body });
        }
        let body = resp.text().await.map_err(BrokerError::Http)?;
        body.trim()
            .parse::<u64>()
            .map_err(|_| BrokerError::Decode(format!("invalid epoch from broker: {body}")))
    }

    async fn list_proxies(&self, address: &str) -> Result<Vec<String>, BrokerError> {
        let url = format!("http://{address}/api/v2/proxies/addresses");
        let resp = self.http.get(&url).send().await?;
        if resp.status() != 200 {
            let (status, _, body) = Self::classify_error(resp).await;
            return Err(BrokerError::UnexpectedStatus { status, body });
        }
        resp.json().await.map_err(|e| BrokerError::Decode(e.to_string()))
    }

    async fn register_proxy(&self, address: &str, proxy: &ServerProxyMeta) -> Result<(), BrokerError> {
        let url = format!("http://{address}/api/v2/proxies/meta");
        let resp = self.http.post(&url).json(proxy).send().await?;
        match resp.status().as_u16() {
            200 => Ok(()),
            409 => {
                // Idempotent no-op: the proxy is already registered.
                info!("proxy {} already registered", proxy.proxy_address);
                Ok(())
            }
            _ => {
                let (status, _, body) = Self::classify_error(resp).await;
                error!("failed to register proxy {}: {}", proxy.proxy_address, body);
                Err(BrokerError::UnexpectedStatus { status, body })
            }
        }
    }

    async fn deregister_proxy(&self, address: &str, proxy_address: &str) -> Result<(), BrokerError> {
        let url = format!("http://{address}/api/v2/proxies/meta/{proxy_address}");
        let resp = self.http.delete(&url).send().await?;
        match resp.status().as_u16() {
            200 | 400 | 404 => Ok(()),
            _ => {
                let (status, _, body) = Self::classify_error(resp).await;
                Err(BrokerError::UnexpectedStatus { status, body })
            }
        }
    }

    async fn create_cluster(
        &self,
        address: &str,
        cluster_name: &str,
        node_number: u32,
    ) -> Result<(), BrokerError> {
        let url = format!("http://{address}/api/v2/clusters/meta/{cluster_name}");
        let payload = CreateClusterPayload { node_number };
        let resp = self.http.post(&url).json(&payload).send().await?;
        if resp.status() == 200 {
            return Ok(());
        }
        let (status, code, body) = Self::classify_error(resp).await;
        if status == 409 && code == Some(BrokerErrorCode::AlreadyExisted) {
            info!("cluster {cluster_name} already exists, treating create as success");
            return Ok(());
        }
        Err(BrokerError::UnexpectedStatus { status, body })
    }

    async fn list_clusters(&self, address: &str) -> Result<Vec<String>, BrokerError> {
        let url = format!("http://{address}/api/v2/clusters/names");
        let resp = self.http.get(&url).send().await?;
        if resp.status() != 200 {
            let (status, _, body) = Self::classify_error(resp).await;
            return Err(BrokerError::UnexpectedStatus { status, body });
        }
        resp.json().await.map_err(|e| BrokerError::Decode(e.to_string()))
    }

    async fn get_cluster_info(&self, address: &str, cluster_name: &str) -> Result<ClusterInfo, BrokerError> {
        let url = format!("http://{address}/api/v2/clusters/info/{cluster_name}");
        let resp = self.http.get(&url).send().await?;
        if resp.status() != 200 {
            let (status, _, body) = Self::classify_error(resp).await;
            return Err(BrokerError::UnexpectedStatus { status, body });
        }
        resp.json().await.map_err(|e| BrokerError::Decode(e.to_string()))
    }

    async fn scale_nodes(
        &self,
        address: &str,
        cluster_name: &str,
        node_number: u32,
    ) -> Result<(), BrokerError> {
        let url = format!("http://{address}/api/v2/clusters/migrations/auto/{cluster_name}/{node_number}");
        let resp = self.http.post(&url).send().await?;
        if resp.status() == 200 {
            return Ok(());
        }
        let (status, code, body) = Self::classify_error(resp).await;
        if (status == 409 || status == 400) && code == Some(BrokerErrorCode::MigrationRunning) {
            return Err(BrokerError::MigrationRunning);
        }
        if (status == 409 || status == 400)
            && matches!(
                code,
                Some(BrokerErrorCode::NodeNumAlreadyEnough) | Some(BrokerErrorCode::SlotsAlreadyEven)
            )
        {
            // Idempotent no-op: the cluster is already at the requested size.
            warn!("scale_nodes({cluster_name}, {node_number}) is a no-op: {body}");
            return Ok(());
        }
        Err(BrokerError::UnexpectedStatus { status, body })
    }

    async fn fix_epoch(&self, address: &str, epoch_floor: u64) -> Result<(), BrokerError> {
        let url = format!("http://{address}/api/v2/epoch/{epoch_floor}");
        let resp = self.http.put(&url).send().await?;
        if resp.status() != 200 {
            let (status, _, body) = Self::classify_error(resp).await;
            return Err(BrokerError::UnexpectedStatus { status, body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn proxy() -> ServerProxyMeta {
        ServerProxyMeta {
            proxy_address: "10.0.0.1:5299".to_string(),
            nodes: ["10.0.0.1:7001".to_string(), "10.0.0.1:7002".to_string()],
            host: "0".to_string(),
        }
    }

    #[tokio::test]
    async fn get_epoch_parses_plain_text_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/epoch"))
            .respond_with(ResponseTemplate::new(200).set_body_string("42"))
            .mount(&server)
            .await;

        let client = BrokerClient::new();
        let epoch = client.get_epoch(&addr(&server)).await.unwrap();
        assert_eq!(epoch, 42);
    }

    #[tokio::test]
    async fn create_cluster_treats_already_existed_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/clusters/meta/my-cluster"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({"error": "ALREADY_EXISTED"})))
            .mount(&server)
            .await;

        let client = BrokerClient::new();
        client
            .create_cluster(&addr(&server), "my-cluster", 4)
            .await
            .expect("ALREADY_EXISTED must be treated as success");
    }

    #[tokio::test]
    async fn create_cluster_surfaces_other_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/clusters/meta/my-cluster"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = BrokerClient::new();
        let err = client.create_cluster(&addr(&server), "my-cluster", 4).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnexpectedStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn scale_nodes_translates_migration_running() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/clusters/migrations/auto/my-cluster/8"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({"error": "MIGRATION_RUNNING"})))
            .mount(&server)
            .await;

        let client = BrokerClient::new();
        let err = client
            .scale_nodes(&addr(&server), "my-cluster", 8)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::MigrationRunning));
    }

    #[tokio::test]
    async fn register_proxy_treats_409_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/proxies/meta"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let client = BrokerClient::new();
        client.register_proxy(&addr(&server), &proxy()).await.unwrap();
    }

    #[tokio::test]
    async fn deregister_proxy_treats_404_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v2/proxies/meta/10.0.0.1:5299"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = BrokerClient::new();
        client
            .deregister_proxy(&addr(&server), "10.0.0.1:5299")
            .await
            .unwrap();
    }

    fn addr(server: &MockServer) -> String {
        server.address().to_string()
    }
}
