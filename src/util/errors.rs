use crate::broker::BrokerError;
use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

/// The default "come back soon" delay used throughout the reconcile pass.
/// spec.md §5 calls this out as the sole retry primitive (~3s).
pub const RETRY_SOON: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum StdError {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // boxed to break the cycle: finalizer::Error embeds this crate's Error
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Broker Error: {0}")]
    BrokerError(#[source] BrokerError),

    #[error("Coordinator Error: {0}")]
    CoordinatorError(String),

    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    #[error("NoBrokerReachable")]
    NoBrokerReachable,
}

impl StdError {
    pub fn metric_label(&self) -> String {
        match self {
            StdError::KubeError(_) => "kube_error".to_string(),
            StdError::FinalizerError(_) => "finalizer_error".to_string(),
            StdError::BrokerError(_) => "broker_error".to_string(),
            StdError::CoordinatorError(_) => "coordinator_error".to_string(),
            StdError::SerializationError(_) => "serialization_error".to_string(),
            StdError::MetadataMissing(_) => "metadata_missing".to_string(),
            StdError::InvalidArgument(_) => "invalid_argument".to_string(),
            StdError::NoBrokerReachable => "no_broker_reachable".to_string(),
        }
    }
}

/// The first-class retry-soon sentinel (spec.md §9 "Design Notes": must be a
/// typed value, never a magic string or a success with side information).
#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> Self {
        Self { error, duration }
    }

    pub fn retry_soon(error: StdError) -> Self {
        Self::new(error, RETRY_SOON)
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.error.metric_label(),
        }
    }

    pub fn retry_soon(error: StdError) -> Self {
        Error::ErrorWithRequeue(ErrorWithRequeue::retry_soon(error))
    }
}

impl From<StdError> for Error {
    fn from(e: StdError) -> Self {
        Error::StdError(e)
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::StdError(StdError::KubeError(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
