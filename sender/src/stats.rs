//! Per-family counters.
//!
//! Counters only ever grow. They are mirrored to the `metrics` facade so an installed
//! recorder sees them, and kept locally so the admin endpoint and the periodic ticker
//! can read them back.

use serde::Serialize;
use shared::counter;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics_defs::{
    RECORDS_DELIVERED, RECORDS_DROPPED, RECORDS_ENQUEUED, SAMPLES_SUPPRESSED,
};

/// Downstream family a record is destined for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Threshold,
    Storage,
    Archive,
    Report,
}

impl Family {
    pub const ALL: [Family; 4] = [
        Family::Threshold,
        Family::Storage,
        Family::Archive,
        Family::Report,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Family::Threshold => "threshold",
            Family::Storage => "storage",
            Family::Archive => "archive",
            Family::Report => "report",
        }
    }

    const fn index(&self) -> usize {
        match self {
            Family::Threshold => 0,
            Family::Storage => 1,
            Family::Archive => 2,
            Family::Report => 3,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record was dropped. Only used to label the emitted metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Routing,
    Conversion,
    QueueFull,
    Transport,
    Closed,
}

impl DropReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DropReason::Routing => "routing",
            DropReason::Conversion => "conversion",
            DropReason::QueueFull => "queue_full",
            DropReason::Transport => "transport",
            DropReason::Closed => "closed",
        }
    }
}

#[derive(Debug, Default)]
struct FamilyCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    suppressed: AtomicU64,
}

#[derive(Debug, Default)]
pub struct Counters {
    families: [FamilyCounters; 4],
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    fn family(&self, family: Family) -> &FamilyCounters {
        &self.families[family.index()]
    }

    pub fn record_enqueued(&self, family: Family, n: u64) {
        self.family(family).enqueued.fetch_add(n, Ordering::Relaxed);
        counter!(RECORDS_ENQUEUED, "family" => family.as_str()).increment(n);
    }

    pub fn record_dropped(&self, family: Family, reason: DropReason, n: u64) {
        self.family(family).dropped.fetch_add(n, Ordering::Relaxed);
        counter!(
            RECORDS_DROPPED,
            "family" => family.as_str(),
            "reason" => reason.as_str(),
        )
        .increment(n);
    }

    pub fn record_delivered(&self, family: Family, n: u64) {
        self.family(family).delivered.fetch_add(n, Ordering::Relaxed);
        counter!(RECORDS_DELIVERED, "family" => family.as_str()).increment(n);
    }

    pub fn record_suppressed(&self, family: Family, n: u64) {
        self.family(family).suppressed.fetch_add(n, Ordering::Relaxed);
        counter!(SAMPLES_SUPPRESSED, "family" => family.as_str()).increment(n);
    }

    pub fn dropped(&self, family: Family) -> u64 {
        self.family(family).dropped.load(Ordering::Relaxed)
    }

    pub fn enqueued(&self, family: Family) -> u64 {
        self.family(family).enqueued.load(Ordering::Relaxed)
    }

    pub fn delivered(&self, family: Family) -> u64 {
        self.family(family).delivered.load(Ordering::Relaxed)
    }

    pub fn suppressed(&self, family: Family) -> u64 {
        self.family(family).suppressed.load(Ordering::Relaxed)
    }

    pub fn family_snapshot(&self, family: Family, queue_depth: usize) -> FamilySnapshot {
        FamilySnapshot {
            enqueued: self.enqueued(family),
            dropped: self.dropped(family),
            delivered: self.delivered(family),
            suppressed: self.suppressed(family),
            queue_depth,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FamilySnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub suppressed: u64,
    /// Sum of the lengths of all queues of the family at snapshot time.
    pub queue_depth: usize,
}

/// Point-in-time view of all enabled families.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub families: BTreeMap<Family, FamilySnapshot>,
    pub decimation_keys: usize,
}
