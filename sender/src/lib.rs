//! Routing tier of the metrics pipeline.
//!
//! Canonical samples are routed to their downstream nodes, converted into each
//! destination's record shape and queued per destination. Dispatch workers drain the
//! queues. Everything is best effort: a full queue drops the newest record and a failed
//! delivery loses its batch, both counted per family.

pub mod config;
pub mod convert;
pub mod decimation;
pub mod dispatch;
pub mod errors;
pub mod metrics_defs;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod rate_limited_logger;
pub mod report;
pub mod ring;
pub mod stats;
pub mod transport;

#[cfg(test)]
mod testutils;

pub use config::Config;
pub use dispatch::Dispatchers;
pub use errors::{Result, SenderError};
pub use model::CanonicalSample;
pub use pipeline::Pipeline;
pub use stats::{Family, StatsSnapshot};
