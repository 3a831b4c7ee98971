//! Grouping and conversion for the external report sink.
//!
//! The sink nests all values of one endpoint at one instant under a single envelope, so
//! samples are grouped by `(endpoint, timestamp)` before conversion.

use indexmap::IndexMap;
use std::collections::HashMap;

use crate::config::{ForwardRule, ReportConfig};
use crate::convert::Scale;
use crate::errors::ConversionError;
use crate::model::{CanonicalSample, DataList, EndpointType, ReportRecord};

/// Sub-key used when a rule has no selector tag or the sample lacks it.
pub const DEFAULT_SUB_KEY: &str = "-";

/// Forwarding map snapshot: which metrics are reported and how.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReportRules {
    forward: HashMap<String, ForwardRule>,
}

impl ReportRules {
    pub fn new(forward: HashMap<String, ForwardRule>) -> Self {
        Self { forward }
    }

    pub fn from_config(config: &ReportConfig) -> Self {
        Self::new(config.forward.clone())
    }

    pub fn get(&self, metric: &str) -> Option<&ForwardRule> {
        self.forward.get(metric)
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.forward.contains_key(metric)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Rules whose expression can never be applied, as `(metric, expression)`.
    pub fn malformed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.forward.iter().filter_map(|(metric, rule)| {
            let expression = rule.expression.as_deref()?;
            Scale::parse(expression)
                .is_none()
                .then_some((metric.as_str(), expression))
        })
    }
}

/// Groups samples by endpoint and exact timestamp, keeping arrival order.
pub fn group_samples<'a, I>(samples: I) -> IndexMap<(&'a str, i64), Vec<&'a CanonicalSample>>
where
    I: IntoIterator<Item = &'a CanonicalSample>,
{
    let mut groups: IndexMap<(&str, i64), Vec<&CanonicalSample>> = IndexMap::new();
    for sample in samples {
        groups
            .entry((sample.endpoint.as_str(), sample.timestamp))
            .or_default()
            .push(sample);
    }
    groups
}

/// Converts one group into a report envelope.
///
/// Fails as a whole if any contributing rule has a malformed expression. Returns
/// `Ok(None)` when no sample of the group has a forwarding rule.
pub fn to_report(
    group: &[&CanonicalSample],
    rules: &ReportRules,
) -> Result<Option<ReportRecord>, ConversionError> {
    let Some(first) = group.first() else {
        return Ok(None);
    };

    let mut data_list = DataList::new();
    for sample in group {
        let Some(rule) = rules.get(&sample.metric) else {
            continue;
        };

        let expression = rule.expression.as_deref().unwrap_or_default();
        let scale =
            Scale::parse(expression).ok_or_else(|| ConversionError::MalformedExpression {
                metric: sample.metric.clone(),
                expression: expression.to_string(),
            })?;

        let sub_key = rule
            .tag
            .as_deref()
            .filter(|tag| !tag.is_empty())
            .and_then(|tag| sample.tags.get(tag))
            .map(String::as_str)
            .unwrap_or(DEFAULT_SUB_KEY);

        // Same output name and sub-key within a group: the last sample wins.
        data_list
            .entry(rule.name.clone())
            .or_default()
            .insert(sub_key.to_string(), scale.apply(sample.value));
    }

    if data_list.is_empty() {
        return Ok(None);
    }

    let timestamp = first
        .timestamp
        .checked_mul(1000)
        .ok_or(ConversionError::OutOfRange {
            field: "timestamp",
            value: first.timestamp,
        })?;

    Ok(Some(ReportRecord {
        name: first.endpoint.clone(),
        endpoint_type: EndpointType::classify(&first.endpoint),
        timestamp,
        data_list,
    }))
}
