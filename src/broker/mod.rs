pub mod client;
pub mod types;

pub use client::{BrokerApi, BrokerClient, BrokerError};
pub use types::{BrokerConfig, BrokerErrorCode, ClusterInfo, ServerProxyMeta};
