pub mod broker;
pub mod coordinator;
pub mod storage;

use kube::{
    api::{Api, PostParams},
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use tracing::info;

use crate::util::errors::{Error, StdError};

const CREATE_RETRY_ATTEMPTS: u32 = 3;

/// Mirrors `createServiceGuard`/`createStatefulSetGuard` in the original
/// operator: GET by name, CREATE if absent, retry a handful of times on a
/// create-race `AlreadyExists` conflict.
pub async fn get_or_create<K>(api: &Api<K>, name: &str, desired: &K) -> Result<K, Error>
where
    K: Clone + Debug + DeserializeOwned + Serialize + Resource,
{
    if let Some(existing) = api.get_opt(name).await.map_err(StdError::KubeError)? {
        return Ok(existing);
    }

    let mut attempts = 0;
    loop {
        match api.create(&PostParams::default(), desired).await {
            Ok(created) => return Ok(created),
            Err(kube::Error::Api(err)) if err.code == 409 && attempts < CREATE_RETRY_ATTEMPTS => {
                attempts += 1;
                info!("create race on {name}, retrying ({attempts}/{CREATE_RETRY_ATTEMPTS})");
                if let Some(existing) = api.get_opt(name).await.map_err(StdError::KubeError)? {
                    return Ok(existing);
                }
            }
            Err(e) => return Err(StdError::KubeError(e).into()),
        }
    }
}
