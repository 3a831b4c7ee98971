//! Outbound transports, one per destination kind.
//!
//! A dispatch worker only knows its transport through [`Deliver`]. Transports never
//! retry; a failed call is reported back and the worker accounts for the lost records.

use async_trait::async_trait;

use crate::errors::TransportError;

pub mod pool;
pub mod report;
pub mod rpc;
pub mod tsdb;

pub use pool::ConnPool;
pub use report::ReportClient;
pub use rpc::RpcClient;
pub use tsdb::TsdbClient;

/// Delivers one batch of records to a single destination.
#[async_trait]
pub trait Deliver<R>: Send + Sync {
    async fn deliver(&self, batch: &[R]) -> Result<(), TransportError>;

    /// Address or URL, used in logs.
    fn destination(&self) -> &str;
}
