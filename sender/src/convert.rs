//! Pure conversions from the canonical sample to the per-destination records.

use crate::errors::ConversionError;
use crate::model::{
    ArchiveRecord, CanonicalSample, CounterType, DERIVE, StorageRecord, ThresholdRecord,
    UNBOUNDED,
};

/// Floors `ts` to a multiple of `period`.
pub fn align_ts(ts: i64, period: i64) -> i64 {
    if period <= 0 {
        return ts;
    }
    ts.saturating_sub(ts.rem_euclid(period))
}

fn floored_step(sample: &CanonicalSample, min_step: i64) -> i64 {
    sample.step.max(min_step)
}

pub fn to_threshold(sample: &CanonicalSample, min_step: i64) -> ThresholdRecord {
    let step = floored_step(sample, min_step);
    ThresholdRecord {
        endpoint: sample.endpoint.clone(),
        metric: sample.metric.clone(),
        value: sample.value,
        timestamp: align_ts(sample.timestamp, step),
        judge_type: sample.counter_type.clone(),
        tags: sample.tags.clone(),
    }
}

/// Storage records need a step no finer than `min_step`, a heartbeat of two steps and
/// counter semantics the storage engine understands.
pub fn to_storage(
    sample: &CanonicalSample,
    min_step: i64,
) -> Result<StorageRecord, ConversionError> {
    let counter_type: CounterType = sample.counter_type.parse()?;
    let (ds_type, min) = match counter_type {
        CounterType::Gauge => (counter_type.to_string(), UNBOUNDED),
        CounterType::Counter | CounterType::Derive => (DERIVE.to_string(), "0"),
    };

    let step = floored_step(sample, min_step);
    let heartbeat = step.checked_mul(2).ok_or(ConversionError::OutOfRange {
        field: "step",
        value: step,
    })?;
    Ok(StorageRecord {
        endpoint: sample.endpoint.clone(),
        metric: sample.metric.clone(),
        tags: sample.tags.clone(),
        value: sample.value,
        timestamp: align_ts(sample.timestamp, step),
        ds_type,
        step,
        heartbeat,
        min: min.to_string(),
        max: UNBOUNDED.to_string(),
    })
}

pub fn to_archive(sample: &CanonicalSample) -> ArchiveRecord {
    let mut tags = sample.tags.clone();
    tags.insert("endpoint".to_string(), sample.endpoint.clone());
    ArchiveRecord {
        metric: sample.metric.clone(),
        timestamp: sample.timestamp,
        value: sample.value,
        tags,
    }
}

/// Linear rescaling applied to reported values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scale {
    Identity,
    Multiply(i64),
    Divide(i64),
}

impl Scale {
    /// Parses `value*N` or `value/N`. An empty expression is the identity.
    ///
    /// Returns `None` for anything else, including a zero divisor.
    pub fn parse(expression: &str) -> Option<Scale> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Some(Scale::Identity);
        }
        if let Some(n) = expression.strip_prefix("value*") {
            return n.trim().parse().ok().map(Scale::Multiply);
        }
        if let Some(n) = expression.strip_prefix("value/") {
            return n
                .trim()
                .parse()
                .ok()
                .filter(|n| *n != 0)
                .map(Scale::Divide);
        }
        None
    }

    pub fn apply(&self, value: f64) -> f64 {
        match self {
            Scale::Identity => value,
            Scale::Multiply(n) => value * *n as f64,
            Scale::Divide(n) => value / *n as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{COUNTER, GAUGE};
    use crate::testutils::{sample, sample_with};

    #[test]
    fn test_align_ts() {
        assert_eq!(align_ts(1700000017, 30), 1700000010);
        assert_eq!(align_ts(1700000010, 30), 1700000010);
        assert_eq!(align_ts(59, 60), 0);
        assert_eq!(align_ts(100, 0), 100);
        assert_eq!(align_ts(i64::MIN, 60), i64::MIN);
    }

    #[test]
    fn test_threshold_record() {
        let mut s = sample_with("host1", "cpu.idle", 42.0, 10, GAUGE);
        s.timestamp = 1700000047;
        s.tags.insert("core".into(), "0".into());

        let record = to_threshold(&s, 30);
        assert_eq!(record.timestamp, 1700000040);
        assert_eq!(record.judge_type, GAUGE);
        assert_eq!(record.tags, s.tags);

        // A step coarser than the minimum is kept
        let mut s = sample_with("host1", "cpu.idle", 42.0, 60, GAUGE);
        s.timestamp = 1700000047;
        assert_eq!(to_threshold(&s, 30).timestamp % 60, 0);
    }

    #[test]
    fn test_counter_to_storage() {
        let mut s = sample_with("host1", "net.if.in.bytes", 1000.0, 5, COUNTER);
        s.timestamp = 1700000047;

        let record = to_storage(&s, 30).unwrap();
        assert_eq!(record.step, 30);
        assert_eq!(record.heartbeat, 60);
        assert_eq!(record.ds_type, "DERIVE");
        assert_eq!(record.min, "0");
        assert_eq!(record.max, "U");
        assert_eq!(record.timestamp % 30, 0);
        assert!(record.timestamp <= s.timestamp && s.timestamp - record.timestamp < 30);
    }

    #[test]
    fn test_gauge_and_derive_to_storage() {
        let s = sample_with("host1", "load.1min", 0.5, 60, GAUGE);
        let record = to_storage(&s, 30).unwrap();
        assert_eq!(record.ds_type, "GAUGE");
        assert_eq!(record.min, "U");
        assert_eq!(record.max, "U");
        assert_eq!(record.step, 60);
        assert_eq!(record.heartbeat, 120);

        let s = sample_with("host1", "disk.io.ops", 3.0, 60, "DERIVE");
        let record = to_storage(&s, 30).unwrap();
        assert_eq!(record.ds_type, "DERIVE");
        assert_eq!(record.min, "0");
    }

    #[test]
    fn test_unsupported_counter_type() {
        let s = sample_with("host1", "x", 1.0, 60, "BOGUS");
        assert_eq!(
            to_storage(&s, 30).unwrap_err(),
            ConversionError::UnsupportedCounterType("BOGUS".into())
        );
    }

    #[test]
    fn test_step_too_large_for_heartbeat() {
        let s = sample_with("host1", "load.1min", 0.5, i64::MAX / 2 + 1, GAUGE);
        assert_eq!(
            to_storage(&s, 30).unwrap_err(),
            ConversionError::OutOfRange {
                field: "step",
                value: i64::MAX / 2 + 1
            }
        );

        let s = sample_with("host1", "load.1min", 0.5, i64::MAX / 2, GAUGE);
        assert_eq!(to_storage(&s, 30).unwrap().heartbeat, i64::MAX - 1);
    }

    #[test]
    fn test_archive_record_injects_endpoint() {
        let mut s = sample("host1", "mem.used", 10.0);
        s.tags.insert("pool".into(), "main".into());

        let record = to_archive(&s);
        assert_eq!(record.tags.len(), 2);
        assert_eq!(record.tags["endpoint"], "host1");
        assert_eq!(record.tags["pool"], "main");
        assert_eq!(record.timestamp, s.timestamp);
    }

    #[test]
    fn test_scale() {
        assert_eq!(Scale::parse(""), Some(Scale::Identity));
        assert_eq!(Scale::parse("value*1000").unwrap().apply(2.5), 2500.0);
        assert_eq!(Scale::parse("value/4").unwrap().apply(10.0), 2.5);
        assert_eq!(Scale::parse(" value*8 "), Some(Scale::Multiply(8)));

        assert_eq!(Scale::parse("value*x"), None);
        assert_eq!(Scale::parse("value/1.5"), None);
        assert_eq!(Scale::parse("value/0"), None);
        assert_eq!(Scale::parse("value+1"), None);
    }
}
