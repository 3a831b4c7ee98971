use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::queue::DEFAULT_CAPACITY;
use crate::ring::DEFAULT_REPLICAS;
use crate::stats::Family;

pub const DEFAULT_MIN_STEP: i64 = 30;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{0} is enabled but its cluster is empty")]
    EmptyCluster(Family),

    #[error("empty node name in the {0} cluster")]
    EmptyNodeName(Family),

    #[error("storage node {0} has no replica addresses")]
    EmptyReplicaList(String),

    #[error("empty address for {0}")]
    EmptyAddress(Family),

    #[error("batch size for {0} must be at least 1")]
    InvalidBatchSize(Family),

    #[error("queue capacity for {0} must be at least 1")]
    InvalidQueueCapacity(Family),

    #[error("report period must be positive, got {0}")]
    InvalidPeriod(i64),

    #[error("forwarding rule for metric {0} has an empty output name")]
    EmptyForwardName(String),
}

fn default_true() -> bool {
    true
}

fn default_min_step() -> i64 {
    DEFAULT_MIN_STEP
}

fn default_queue_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_idle_backoff_ms() -> u64 {
    50
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_batch() -> usize {
    200
}

fn default_replicas() -> usize {
    DEFAULT_REPLICAS
}

fn default_report_timeout_ms() -> u64 {
    5000
}

/// Sender configuration
///
/// A family whose section is missing, or has `enabled: false`, receives nothing.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Lower bound for the step of threshold and storage records, in seconds.
    /// Values below 1 fall back to 30.
    #[serde(default = "default_min_step")]
    pub min_step: i64,
    /// Capacity of every send queue unless a family overrides it
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long a dispatch worker sleeps when its queue is empty
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
    /// Interval of the queue depth / drop count snapshots
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    pub threshold: Option<ThresholdConfig>,
    pub storage: Option<StorageConfig>,
    pub archive: Option<ArchiveConfig>,
    pub report: Option<ReportConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_step: DEFAULT_MIN_STEP,
            queue_capacity: DEFAULT_CAPACITY,
            idle_backoff_ms: default_idle_backoff_ms(),
            stats_interval_secs: default_stats_interval_secs(),
            threshold: None,
            storage: None,
            archive: None,
            report: None,
        }
    }
}

impl Config {
    pub fn effective_min_step(&self) -> i64 {
        if self.min_step < 1 {
            DEFAULT_MIN_STEP
        } else {
            self.min_step
        }
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn threshold(&self) -> Option<&ThresholdConfig> {
        self.threshold.as_ref().filter(|c| c.enabled)
    }

    pub fn storage(&self) -> Option<&StorageConfig> {
        self.storage.as_ref().filter(|c| c.enabled)
    }

    pub fn archive(&self) -> Option<&ArchiveConfig> {
        self.archive.as_ref().filter(|c| c.enabled)
    }

    pub fn report(&self) -> Option<&ReportConfig> {
        self.report.as_ref().filter(|c| c.enabled)
    }

    /// Queue capacity for a family, honoring its override.
    pub fn queue_capacity_for(&self, family: Family) -> usize {
        let custom = match family {
            Family::Threshold => self.threshold.as_ref().and_then(|c| c.queue_capacity),
            Family::Storage => self.storage.as_ref().and_then(|c| c.queue_capacity),
            Family::Archive => self.archive.as_ref().and_then(|c| c.queue_capacity),
            Family::Report => self.report.as_ref().and_then(|c| c.queue_capacity),
        };
        custom.unwrap_or(self.queue_capacity)
    }

    /// Validates the sender configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(threshold) = self.threshold() {
            validate_batch(Family::Threshold, threshold.batch)?;
            if threshold.cluster.is_empty() {
                return Err(ValidationError::EmptyCluster(Family::Threshold));
            }
            for (node, addr) in &threshold.cluster {
                if node.is_empty() {
                    return Err(ValidationError::EmptyNodeName(Family::Threshold));
                }
                if addr.trim().is_empty() {
                    return Err(ValidationError::EmptyAddress(Family::Threshold));
                }
            }
        }

        if let Some(storage) = self.storage() {
            validate_batch(Family::Storage, storage.batch)?;
            if storage.cluster.is_empty() {
                return Err(ValidationError::EmptyCluster(Family::Storage));
            }
            for (node, addrs) in &storage.cluster {
                if node.is_empty() {
                    return Err(ValidationError::EmptyNodeName(Family::Storage));
                }
                if addrs.is_empty() {
                    return Err(ValidationError::EmptyReplicaList(node.clone()));
                }
                if addrs.iter().any(|a| a.trim().is_empty()) {
                    return Err(ValidationError::EmptyAddress(Family::Storage));
                }
            }
        }

        if let Some(archive) = self.archive() {
            validate_batch(Family::Archive, archive.batch)?;
            if archive.address.trim().is_empty() {
                return Err(ValidationError::EmptyAddress(Family::Archive));
            }
        }

        if let Some(report) = self.report() {
            validate_batch(Family::Report, report.batch)?;
            if report.period <= 0 {
                return Err(ValidationError::InvalidPeriod(report.period));
            }
            for (metric, rule) in &report.forward {
                if rule.name.is_empty() {
                    return Err(ValidationError::EmptyForwardName(metric.clone()));
                }
            }
        }

        for family in Family::ALL {
            if self.queue_capacity_for(family) == 0 {
                return Err(ValidationError::InvalidQueueCapacity(family));
            }
        }

        Ok(())
    }
}

fn validate_batch(family: Family, batch: usize) -> Result<(), ValidationError> {
    if batch == 0 {
        return Err(ValidationError::InvalidBatchSize(family));
    }
    Ok(())
}

/// Settings shared by the pooled TCP transports
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "ConnectionConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound for delivering one batch, including checkout and connect
    #[serde(default = "ConnectionConfig::default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Idle connections kept per address
    #[serde(default = "ConnectionConfig::default_max_idle")]
    pub max_idle: usize,
}

impl ConnectionConfig {
    fn default_connect_timeout_ms() -> u64 {
        1000
    }

    fn default_call_timeout_ms() -> u64 {
        5000
    }

    fn default_max_idle() -> usize {
        8
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            call_timeout_ms: Self::default_call_timeout_ms(),
            max_idle: Self::default_max_idle(),
        }
    }
}

/// Threshold-evaluation cluster
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ThresholdConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch")]
    pub batch: usize,
    /// Virtual points per node on the hash ring
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Node name -> address
    pub cluster: HashMap<String, String>,
}

/// Time-series storage cluster
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch")]
    pub batch: usize,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    /// Capacity of each replica queue
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Node name -> replica addresses. Every replica receives every record of the node.
    pub cluster: HashMap<String, Vec<String>>,
}

/// Raw archive store
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ArchiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch")]
    pub batch: usize,
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    pub address: String,
}

/// External reporting sink
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ReportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch")]
    pub batch: usize,
    pub queue_capacity: Option<usize>,
    /// Target of the HTTP POST requests
    pub url: Url,
    /// Reporting period required by the sink, in seconds
    pub period: i64,
    #[serde(default = "default_report_timeout_ms")]
    pub timeout_ms: u64,
    /// Drop decimation state for keys without samples for this long.
    /// State is kept forever when unset.
    pub cache_ttl_secs: Option<u64>,
    /// Source metric name -> forwarding rule. Other metrics are not reported.
    #[serde(default)]
    pub forward: HashMap<String, ForwardRule>,
}

impl ReportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How one source metric appears in the report
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ForwardRule {
    /// Output metric name
    pub name: String,
    /// Tag whose value becomes the sub-key; `-` when unset or missing on the sample
    pub tag: Option<String>,
    /// `value*N` or `value/N` with integer N
    pub expression: Option<String>,
}
