//! Canonical input sample and the per-destination record shapes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::ConversionError;

pub const GAUGE: &str = "GAUGE";
pub const COUNTER: &str = "COUNTER";
pub const DERIVE: &str = "DERIVE";

/// Bound value meaning "unbounded" in a storage record.
pub const UNBOUNDED: &str = "U";

/// A metric observation as produced by the collection layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalSample {
    pub endpoint: String,
    pub metric: String,
    pub value: f64,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Collection step in seconds.
    pub step: i64,
    pub counter_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl CanonicalSample {
    /// Key used for ring lookups.
    ///
    /// `endpoint/metric` without tags, `endpoint/metric/k1=v1,k2=v2` otherwise.
    /// Tags are kept sorted by key, so the key only depends on the sample identity.
    pub fn routing_key(&self) -> String {
        if self.tags.is_empty() {
            return format!("{}/{}", self.endpoint, self.metric);
        }
        let tags = self
            .tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}/{}/{}", self.endpoint, self.metric, tags)
    }

    /// Key of the decimation state for this sample. Tags are not part of it.
    pub fn decimation_key(&self) -> String {
        format!("{}/{}", self.endpoint, self.metric)
    }
}

/// Counter semantics understood by the storage cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterType {
    Gauge,
    Counter,
    Derive,
}

impl FromStr for CounterType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            GAUGE => Ok(CounterType::Gauge),
            COUNTER => Ok(CounterType::Counter),
            DERIVE => Ok(CounterType::Derive),
            other => Err(ConversionError::UnsupportedCounterType(other.to_string())),
        }
    }
}

impl fmt::Display for CounterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CounterType::Gauge => GAUGE,
            CounterType::Counter => COUNTER,
            CounterType::Derive => DERIVE,
        };
        f.write_str(s)
    }
}

/// Record delivered to the threshold-evaluation service.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdRecord {
    pub endpoint: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: i64,
    pub judge_type: String,
    pub tags: BTreeMap<String, String>,
}

/// Record delivered to every replica of a storage node.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StorageRecord {
    pub endpoint: String,
    pub metric: String,
    pub tags: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: i64,
    #[serde(rename = "dstype")]
    pub ds_type: String,
    pub step: i64,
    pub heartbeat: i64,
    pub min: String,
    pub max: String,
}

/// Record written to the archive store.
#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveRecord {
    pub metric: String,
    pub timestamp: i64,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
}

impl ArchiveRecord {
    /// Renders the record as one `put` line, newline included.
    pub fn to_put_line(&self) -> String {
        let mut line = format!("put {} {} {}", self.metric, self.timestamp, self.value);
        for (k, v) in &self.tags {
            line.push(' ');
            line.push_str(k);
            line.push('=');
            line.push_str(v);
        }
        line.push('\n');
        line
    }
}

/// Kind of endpoint reported to the external sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Host,
    Network,
}

impl EndpointType {
    /// Network devices are named with `-` separated segments, hosts are not.
    pub fn classify(endpoint: &str) -> Self {
        if endpoint.contains('-') {
            EndpointType::Network
        } else {
            EndpointType::Host
        }
    }
}

/// Output metric name -> sub-key -> value.
pub type DataList = BTreeMap<String, BTreeMap<String, f64>>;

/// One timestamped envelope per endpoint, posted to the external sink.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
    /// Milliseconds.
    pub timestamp: i64,
    pub data_list: DataList,
}

/// Response body of the external sink.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub result_code: i64,
    #[serde(default)]
    pub result_msg: String,
    #[serde(default)]
    pub system_time: String,
}
