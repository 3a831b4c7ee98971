//! Metrics definitions for the sender.

use shared::metrics_defs::{MetricDef, MetricType};

pub const SAMPLES_RECEIVED: MetricDef = MetricDef {
    name: "sender.samples.received",
    metric_type: MetricType::Counter,
    description: "Number of canonical samples pushed into the pipeline",
};

pub const RECORDS_ENQUEUED: MetricDef = MetricDef {
    name: "sender.records.enqueued",
    metric_type: MetricType::Counter,
    description: "Records accepted by a send queue. Tagged with family.",
};

pub const RECORDS_DROPPED: MetricDef = MetricDef {
    name: "sender.records.dropped",
    metric_type: MetricType::Counter,
    description: "Records dropped before delivery. Tagged with family, reason.",
};

pub const RECORDS_DELIVERED: MetricDef = MetricDef {
    name: "sender.records.delivered",
    metric_type: MetricType::Counter,
    description: "Records delivered to a downstream. Tagged with family.",
};

pub const SAMPLES_SUPPRESSED: MetricDef = MetricDef {
    name: "sender.samples.suppressed",
    metric_type: MetricType::Counter,
    description: "Samples withheld by decimation. Tagged with family.",
};

pub const DELIVERY_DURATION: MetricDef = MetricDef {
    name: "sender.delivery.duration",
    metric_type: MetricType::Histogram,
    description: "Time to deliver one batch in seconds. Tagged with family.",
};

pub const BATCH_SIZE: MetricDef = MetricDef {
    name: "sender.delivery.batch_size",
    metric_type: MetricType::Histogram,
    description: "Number of records per delivered batch. Tagged with family.",
};

pub const QUEUE_DEPTH: MetricDef = MetricDef {
    name: "sender.queue.depth",
    metric_type: MetricType::Gauge,
    description: "Records waiting in the send queues of a family. Tagged with family.",
};

pub const DECIMATION_KEYS: MetricDef = MetricDef {
    name: "sender.decimation.keys",
    metric_type: MetricType::Gauge,
    description: "Number of keys tracked by the decimation cache",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SAMPLES_RECEIVED,
    RECORDS_ENQUEUED,
    RECORDS_DROPPED,
    RECORDS_DELIVERED,
    SAMPLES_SUPPRESSED,
    DELIVERY_DURATION,
    BATCH_SIZE,
    QUEUE_DEPTH,
    DECIMATION_KEYS,
];
