use thiserror::Error;

use crate::config::ValidationError;
use crate::stats::Family;

/// Result type alias for sender setup operations
pub type Result<T, E = SenderError> = std::result::Result<T, E>;

/// Errors that prevent the pipeline from being built
#[derive(Error, Debug)]
pub enum SenderError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("failed to set up transport: {0}")]
    Transport(#[from] TransportError),
}

/// A sample could not be mapped to a destination queue
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("no available node in the {0} ring")]
    NoAvailableNode(Family),

    #[error("no send queue for {family} node {node}")]
    UnknownNode { family: Family, node: String },
}

/// A sample or group could not be converted to its wire shape
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("unsupported counter type: {0}")]
    UnsupportedCounterType(String),

    #[error("malformed scaling expression {expression:?} for metric {metric}")]
    MalformedExpression { metric: String, expression: String },

    #[error("{field} {value} is out of range")]
    OutOfRange { field: &'static str, value: i64 },
}

/// Delivery of a batch to a downstream failed
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error talking to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection to {0} closed by peer")]
    Closed(String),

    #[error("connection pool for {addr}: {message}")]
    Pool { addr: String, message: String },

    #[error("rpc call {method} failed: {message}")]
    Rpc { method: String, message: String },

    #[error("failed to encode or decode payload: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("downstream rejected data with code {code}: {message}")]
    Rejected { code: i64, message: String },

    #[error("{failed} of {total} records failed, first error: {first}")]
    Partial {
        failed: usize,
        total: usize,
        first: Box<TransportError>,
    },
}

impl TransportError {
    /// Number of records of a batch of `batch_len` that were lost with this error.
    pub fn records_lost(&self, batch_len: usize) -> usize {
        match self {
            TransportError::Partial { failed, .. } => *failed,
            _ => batch_len,
        }
    }
}
