use serde::{Deserialize, Serialize};

/// `GET/PUT /api/v2/config` — the broker's view of which two addresses
/// replicate this broker's meta store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub replica_addresses: Vec<String>,
}

/// Body for `POST /api/v2/proxies/meta` (spec.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProxyMeta {
    pub proxy_address: String,
    pub nodes: [String; 2],
    pub host: String,
}

/// Body for `POST /api/v2/clusters/meta/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClusterPayload {
    pub node_number: u32,
}

/// `GET /api/v2/clusters/info/{name}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub is_migrating: bool,
    pub node_number_with_slots: u32,
    #[serde(default)]
    pub node_number: u32,
}

/// The recognized broker error strings (spec.md §6). Any other string is
/// carried verbatim in `BrokerError::UnexpectedStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorCode {
    AlreadyExisted,
    NodeNumAlreadyEnough,
    MigrationRunning,
    FreeNodeNotFound,
    FreeNodeFound,
    InvalidNodeNumber,
    SlotsAlreadyEven,
}

impl BrokerErrorCode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALREADY_EXISTED" => Some(Self::AlreadyExisted),
            "NODE_NUM_ALREADY_ENOUGH" => Some(Self::NodeNumAlreadyEnough),
            "MIGRATION_RUNNING" => Some(Self::MigrationRunning),
            "FREE_NODE_NOT_FOUND" => Some(Self::FreeNodeNotFound),
            "FREE_NODE_FOUND" => Some(Self::FreeNodeFound),
            "INVALID_NODE_NUMBER" => Some(Self::InvalidNodeNumber),
            "SLOTS_ALREADY_EVEN" => Some(Self::SlotsAlreadyEven),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerErrorBody {
    pub error: String,
}
