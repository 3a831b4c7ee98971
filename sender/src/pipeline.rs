//! Routing and fan-out of canonical samples into the send queues.
//!
//! A [`Pipeline`] owns every ring, queue and the decimation state. It is built once from
//! the configuration, shared behind an `Arc` by the producers, and closed at shutdown.
//! Queues are created for the nodes and addresses known at construction; a reload can
//! only rebuild rings over those.

use arc_swap::ArcSwap;
use shared::{counter, gauge};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::{ArchiveConfig, Config, ReportConfig, StorageConfig, ThresholdConfig};
use crate::convert::{to_archive, to_storage, to_threshold};
use crate::decimation::{DecimationCache, Decision};
use crate::dispatch::{Dispatchers, Worker};
use crate::errors::{Result, RoutingError, TransportError};
use crate::metrics_defs::{DECIMATION_KEYS, QUEUE_DEPTH, SAMPLES_RECEIVED};
use crate::model::{
    ArchiveRecord, CanonicalSample, ReportRecord, StorageRecord, ThresholdRecord,
};
use crate::queue::BoundedQueue;
use crate::rate_limited_logger::{DEFAULT_LOG_INTERVAL, RateLimitedLogger};
use crate::report::{ReportRules, group_samples, to_report};
use crate::ring::NodeRing;
use crate::stats::{Counters, DropReason, Family, StatsSnapshot};
use crate::transport::rpc::{STORAGE_METHOD, THRESHOLD_METHOD};
use crate::transport::{Deliver, ReportClient, RpcClient, TsdbClient};

/// Per-call outcome of one family, flushed into the counters once.
#[derive(Default)]
struct Tally {
    enqueued: u64,
    routing: u64,
    conversion: u64,
    queue_full: u64,
}

impl Tally {
    fn push<T>(&mut self, queue: &BoundedQueue<T>, item: T) {
        if queue.try_push(item) {
            self.enqueued += 1;
        } else {
            self.queue_full += 1;
        }
    }

    fn flush(self, counters: &Counters, family: Family) {
        if self.enqueued > 0 {
            counters.record_enqueued(family, self.enqueued);
        }
        for (reason, n) in [
            (DropReason::Routing, self.routing),
            (DropReason::Conversion, self.conversion),
            (DropReason::QueueFull, self.queue_full),
        ] {
            if n > 0 {
                counters.record_dropped(family, reason, n);
            }
        }
    }
}

struct ThresholdRoute {
    config: ThresholdConfig,
    ring: NodeRing,
    /// Node name -> queue
    queues: HashMap<String, Arc<BoundedQueue<ThresholdRecord>>>,
    /// Node name -> client
    clients: HashMap<String, RpcClient>,
    errors: RateLimitedLogger,
}

impl ThresholdRoute {
    fn new(config: &ThresholdConfig, capacity: usize) -> Result<Self, TransportError> {
        let queues = config
            .cluster
            .keys()
            .map(|node| (node.clone(), Arc::new(BoundedQueue::new(capacity))))
            .collect();
        let clients = config
            .cluster
            .iter()
            .map(|(node, addr)| {
                let client = RpcClient::new(THRESHOLD_METHOD, addr.clone(), &config.connection)?;
                Ok((node.clone(), client))
            })
            .collect::<Result<_, TransportError>>()?;
        Ok(Self {
            ring: NodeRing::new(Family::Threshold, config.cluster.keys(), config.replicas),
            config: config.clone(),
            queues,
            clients,
            errors: RateLimitedLogger::new(Family::Threshold.as_str(), DEFAULT_LOG_INTERVAL),
        })
    }

    fn queue_for(&self, key: &str) -> Result<&BoundedQueue<ThresholdRecord>, RoutingError> {
        let node = self.ring.resolve(key)?;
        self.queues
            .get(&*node)
            .map(|queue| queue.as_ref())
            .ok_or_else(|| RoutingError::UnknownNode {
                family: Family::Threshold,
                node: node.to_string(),
            })
    }
}

struct StorageRoute {
    config: StorageConfig,
    ring: NodeRing,
    /// Replica address -> queue
    queues: HashMap<String, Arc<BoundedQueue<Arc<StorageRecord>>>>,
    /// Replica address -> client
    clients: HashMap<String, RpcClient>,
    errors: RateLimitedLogger,
}

impl StorageRoute {
    fn new(config: &StorageConfig, capacity: usize) -> Result<Self, TransportError> {
        let queues = config
            .cluster
            .values()
            .flatten()
            .map(|addr| (addr.clone(), Arc::new(BoundedQueue::new(capacity))))
            .collect();
        let clients = config
            .cluster
            .values()
            .flatten()
            .map(|addr| {
                let client = RpcClient::new(STORAGE_METHOD, addr.clone(), &config.connection)?;
                Ok((addr.clone(), client))
            })
            .collect::<Result<_, TransportError>>()?;
        Ok(Self {
            ring: NodeRing::new(Family::Storage, config.cluster.keys(), config.replicas),
            config: config.clone(),
            queues,
            clients,
            errors: RateLimitedLogger::new(Family::Storage.as_str(), DEFAULT_LOG_INTERVAL),
        })
    }

    fn replicas_for(&self, key: &str) -> Result<&[String], RoutingError> {
        let node = self.ring.resolve(key)?;
        self.config
            .cluster
            .get(&*node)
            .map(Vec::as_slice)
            .ok_or_else(|| RoutingError::UnknownNode {
                family: Family::Storage,
                node: node.to_string(),
            })
    }
}

struct ArchiveRoute {
    config: ArchiveConfig,
    queue: Arc<BoundedQueue<ArchiveRecord>>,
    client: TsdbClient,
}

struct ReportRoute {
    config: ReportConfig,
    rules: ArcSwap<ReportRules>,
    queue: Arc<BoundedQueue<ReportRecord>>,
    client: ReportClient,
    errors: RateLimitedLogger,
}

fn warn_malformed_rules(rules: &ReportRules) {
    for (metric, expression) in rules.malformed() {
        tracing::warn!(
            metric,
            expression,
            "forwarding rule has a malformed expression, groups using it will be dropped"
        );
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub struct Pipeline {
    min_step: i64,
    idle_backoff: Duration,
    stats_interval: Duration,
    accepting: AtomicBool,
    started: AtomicBool,
    counters: Arc<Counters>,
    decimation: DecimationCache,
    threshold: Option<ThresholdRoute>,
    storage: Option<StorageRoute>,
    archive: Option<ArchiveRoute>,
    report: Option<ReportRoute>,
}

impl Pipeline {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let report = match config.report() {
            Some(report) => {
                let rules = ReportRules::from_config(report);
                warn_malformed_rules(&rules);
                Some(ReportRoute {
                    config: report.clone(),
                    rules: ArcSwap::from_pointee(rules),
                    queue: Arc::new(BoundedQueue::new(
                        config.queue_capacity_for(Family::Report),
                    )),
                    client: ReportClient::new(report.url.clone(), report.timeout())?,
                    errors: RateLimitedLogger::new(
                        Family::Report.as_str(),
                        DEFAULT_LOG_INTERVAL,
                    ),
                })
            }
            None => None,
        };

        let pipeline = Self {
            min_step: config.effective_min_step(),
            idle_backoff: config.idle_backoff(),
            stats_interval: config.stats_interval(),
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            counters: Arc::new(Counters::new()),
            decimation: DecimationCache::new(),
            threshold: config
                .threshold()
                .map(|c| ThresholdRoute::new(c, config.queue_capacity_for(Family::Threshold)))
                .transpose()?,
            storage: config
                .storage()
                .map(|c| StorageRoute::new(c, config.queue_capacity_for(Family::Storage)))
                .transpose()?,
            archive: config
                .archive()
                .map(|c| {
                    Ok::<_, TransportError>(ArchiveRoute {
                        config: c.clone(),
                        queue: Arc::new(BoundedQueue::new(
                            config.queue_capacity_for(Family::Archive),
                        )),
                        client: TsdbClient::new(c.address.clone(), &c.connection)?,
                    })
                })
                .transpose()?,
            report,
        };

        tracing::info!(
            families = ?pipeline.enabled_families(),
            min_step = pipeline.min_step,
            "send pipeline created"
        );
        Ok(pipeline)
    }

    pub fn enabled_families(&self) -> Vec<Family> {
        let mut families = Vec::new();
        if self.threshold.is_some() {
            families.push(Family::Threshold);
        }
        if self.storage.is_some() {
            families.push(Family::Storage);
        }
        if self.archive.is_some() {
            families.push(Family::Archive);
        }
        if self.report.is_some() {
            families.push(Family::Report);
        }
        families
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Dispatch workers are running and samples are still accepted.
    pub fn is_ready(&self) -> bool {
        self.started.load(Ordering::Acquire) && self.is_accepting()
    }

    /// Stops accepting samples. Later pushes are counted as dropped.
    pub fn close(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            tracing::info!("send pipeline closed");
        }
    }

    /// Returns true, counting the drop, if the pipeline no longer accepts samples.
    fn reject_closed(&self, family: Family, n: usize) -> bool {
        if self.is_accepting() {
            return false;
        }
        self.counters.record_dropped(family, DropReason::Closed, n as u64);
        true
    }

    /// Fans a batch of samples out to every enabled family.
    ///
    /// Never fails: whatever cannot be routed, converted or queued is counted as dropped
    /// for its family without affecting the other families.
    pub fn push(&self, samples: &[CanonicalSample]) {
        if samples.is_empty() {
            return;
        }
        counter!(SAMPLES_RECEIVED).increment(samples.len() as u64);

        self.push_threshold(samples);
        self.push_storage(samples);
        self.push_archive(samples);
        self.push_report(samples);
    }

    pub fn push_threshold(&self, samples: &[CanonicalSample]) {
        let Some(route) = &self.threshold else {
            return;
        };
        if self.reject_closed(Family::Threshold, samples.len()) {
            return;
        }

        let mut tally = Tally::default();
        for sample in samples {
            match route.queue_for(&sample.routing_key()) {
                Ok(queue) => tally.push(queue, to_threshold(sample, self.min_step)),
                Err(e) => {
                    tally.routing += 1;
                    route.errors.warn("failed to route sample", &e);
                }
            }
        }
        tally.flush(&self.counters, Family::Threshold);
    }

    /// Every replica of the owning node gets its own reference to one shared record.
    /// A full replica queue costs one drop; the other replicas still get the record.
    pub fn push_storage(&self, samples: &[CanonicalSample]) {
        let Some(route) = &self.storage else {
            return;
        };
        if self.reject_closed(Family::Storage, samples.len()) {
            return;
        }

        let mut tally = Tally::default();
        for sample in samples {
            let replicas = match route.replicas_for(&sample.routing_key()) {
                Ok(replicas) => replicas,
                Err(e) => {
                    tally.routing += 1;
                    route.errors.warn("failed to route sample", &e);
                    continue;
                }
            };

            let record = match to_storage(sample, self.min_step) {
                Ok(record) => Arc::new(record),
                Err(e) => {
                    tally.conversion += 1;
                    route.errors.warn(
                        "failed to convert sample",
                        &format_args!("{}/{}: {e}", sample.endpoint, sample.metric),
                    );
                    continue;
                }
            };

            for addr in replicas {
                match route.queues.get(addr) {
                    Some(queue) => tally.push(queue, record.clone()),
                    None => tally.routing += 1,
                }
            }
        }
        tally.flush(&self.counters, Family::Storage);
    }

    pub fn push_archive(&self, samples: &[CanonicalSample]) {
        let Some(route) = &self.archive else {
            return;
        };
        if self.reject_closed(Family::Archive, samples.len()) {
            return;
        }

        let mut tally = Tally::default();
        for sample in samples {
            tally.push(&route.queue, to_archive(sample));
        }
        tally.flush(&self.counters, Family::Archive);
    }

    /// Only metrics with a forwarding rule are considered. Those pass the decimation
    /// cache, the survivors are grouped per endpoint and timestamp, and each group
    /// becomes one report record.
    pub fn push_report(&self, samples: &[CanonicalSample]) {
        let Some(route) = &self.report else {
            return;
        };
        let rules = route.rules.load_full();
        let candidates: Vec<&CanonicalSample> = samples
            .iter()
            .filter(|sample| rules.contains(&sample.metric))
            .collect();
        if candidates.is_empty() {
            return;
        }
        if self.reject_closed(Family::Report, candidates.len()) {
            return;
        }

        let period = route.config.period;
        let mut suppressed = 0;
        let admitted = candidates.into_iter().filter(|sample| {
            let decision = self.decimation.admit(
                &sample.decimation_key(),
                sample.step,
                sample.timestamp,
                period,
            );
            if decision == Decision::Suppress {
                suppressed += 1;
            }
            decision == Decision::Forward
        });
        let groups = group_samples(admitted);
        if suppressed > 0 {
            self.counters.record_suppressed(Family::Report, suppressed);
        }

        let mut tally = Tally::default();
        for ((endpoint, timestamp), group) in &groups {
            match to_report(group, &rules) {
                Ok(Some(record)) => tally.push(&route.queue, record),
                Ok(None) => {}
                Err(e) => {
                    tally.conversion += 1;
                    route.errors.warn(
                        "failed to convert report group",
                        &format_args!("{endpoint}@{timestamp}: {e}"),
                    );
                }
            }
        }
        tally.flush(&self.counters, Family::Report);
    }

    pub fn threshold_queue(&self, node: &str) -> Option<&BoundedQueue<ThresholdRecord>> {
        self.threshold
            .as_ref()?
            .queues
            .get(node)
            .map(|queue| queue.as_ref())
    }

    pub fn storage_queue(&self, addr: &str) -> Option<&BoundedQueue<Arc<StorageRecord>>> {
        self.storage
            .as_ref()?
            .queues
            .get(addr)
            .map(|queue| queue.as_ref())
    }

    pub fn archive_queue(&self) -> Option<&BoundedQueue<ArchiveRecord>> {
        self.archive.as_ref().map(|route| route.queue.as_ref())
    }

    pub fn report_queue(&self) -> Option<&BoundedQueue<ReportRecord>> {
        self.report.as_ref().map(|route| route.queue.as_ref())
    }

    /// Current ring members of a ring family; empty for the other families.
    pub fn ring_members(&self, family: Family) -> Vec<String> {
        match family {
            Family::Threshold => self.threshold.as_ref().map(|r| r.ring.members()),
            Family::Storage => self.storage.as_ref().map(|r| r.ring.members()),
            Family::Archive | Family::Report => None,
        }
        .unwrap_or_default()
    }

    fn queue_depth(&self, family: Family) -> usize {
        match family {
            Family::Threshold => self
                .threshold
                .as_ref()
                .map(|r| r.queues.values().map(|q| q.len()).sum())
                .unwrap_or_default(),
            Family::Storage => self
                .storage
                .as_ref()
                .map(|r| r.queues.values().map(|q| q.len()).sum())
                .unwrap_or_default(),
            Family::Archive => self.archive_queue().map_or(0, |q| q.len()),
            Family::Report => self.report_queue().map_or(0, |q| q.len()),
        }
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let families = self
            .enabled_families()
            .into_iter()
            .map(|family| {
                let snapshot = self
                    .counters
                    .family_snapshot(family, self.queue_depth(family));
                (family, snapshot)
            })
            .collect::<BTreeMap<_, _>>();
        StatsSnapshot {
            families,
            decimation_keys: self.decimation.len(),
        }
    }

    /// Logs a snapshot, updates the gauges and runs the decimation sweep if configured.
    fn emit_stats(&self) {
        let snapshot = self.stats_snapshot();
        for (family, stats) in &snapshot.families {
            gauge!(QUEUE_DEPTH, "family" => family.as_str()).set(stats.queue_depth as f64);
            tracing::info!(
                family = %family,
                queue_depth = stats.queue_depth,
                enqueued = stats.enqueued,
                delivered = stats.delivered,
                dropped = stats.dropped,
                suppressed = stats.suppressed,
                "send queue stats"
            );
        }

        if let Some(route) = &self.report {
            gauge!(DECIMATION_KEYS).set(snapshot.decimation_keys as f64);
            if let Some(ttl) = route.config.cache_ttl_secs {
                let removed = self.decimation.evict_idle(unix_now(), ttl as i64);
                if removed > 0 {
                    tracing::debug!(removed, "evicted idle decimation state");
                }
            }
        }
    }

    /// Applies a new configuration to the running pipeline.
    ///
    /// Rings are rebuilt over the configured nodes that already have queues, and the
    /// forwarding rules are swapped. Anything else needs a restart and is only logged.
    pub fn reload(&self, config: &Config) -> Result<()> {
        config.validate()?;

        for family in Family::ALL {
            let running = self.enabled_families().contains(&family);
            let wanted = match family {
                Family::Threshold => config.threshold().is_some(),
                Family::Storage => config.storage().is_some(),
                Family::Archive => config.archive().is_some(),
                Family::Report => config.report().is_some(),
            };
            if running != wanted {
                tracing::warn!(
                    family = %family,
                    enabled = wanted,
                    "enabling or disabling a family requires a restart"
                );
            }
        }

        if let (Some(route), Some(new)) = (&self.threshold, config.threshold()) {
            let nodes = known_nodes(Family::Threshold, new.cluster.keys(), |node| {
                route.queues.contains_key(node)
                    && route.config.cluster.get(node) == new.cluster.get(node)
            });
            route.ring.rebuild(nodes);
        }

        if let (Some(route), Some(new)) = (&self.storage, config.storage()) {
            let nodes = known_nodes(Family::Storage, new.cluster.keys(), |node| {
                route.config.cluster.get(node) == new.cluster.get(node)
            });
            route.ring.rebuild(nodes);
        }

        if let (Some(route), Some(new)) = (&self.report, config.report()) {
            if new.period != route.config.period {
                tracing::warn!(
                    period = route.config.period,
                    requested = new.period,
                    "changing the report period requires a restart"
                );
            }
            let rules = ReportRules::from_config(new);
            warn_malformed_rules(&rules);
            tracing::info!(rules = rules.len(), "swapped forwarding rules");
            route.rules.store(Arc::new(rules));
        }

        Ok(())
    }

    /// Spawns one dispatch worker per queue plus the stats ticker.
    ///
    /// Workers are started at most once; later calls return an empty set.
    pub fn start(self: &Arc<Self>) -> Dispatchers {
        let mut dispatchers = Dispatchers::new();
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::warn!("dispatch workers are already running");
            return dispatchers;
        }

        if let Some(route) = &self.threshold {
            for (node, queue) in &route.queues {
                let Some(client) = route.clients.get(node) else {
                    continue;
                };
                dispatchers.spawn_worker(self.worker(
                    Family::Threshold,
                    queue,
                    Box::new(client.clone()),
                    route.config.batch,
                    route.config.connection.call_timeout(),
                ));
            }
        }

        if let Some(route) = &self.storage {
            for (addr, queue) in &route.queues {
                let Some(client) = route.clients.get(addr) else {
                    continue;
                };
                dispatchers.spawn_worker(self.worker(
                    Family::Storage,
                    queue,
                    Box::new(client.clone()),
                    route.config.batch,
                    route.config.connection.call_timeout(),
                ));
            }
        }

        if let Some(route) = &self.archive {
            dispatchers.spawn_worker(self.worker(
                Family::Archive,
                &route.queue,
                Box::new(route.client.clone()),
                route.config.batch,
                route.config.connection.call_timeout(),
            ));
        }

        if let Some(route) = &self.report {
            // One request per record, each bounded by the client timeout
            let batch = u32::try_from(route.config.batch).unwrap_or(u32::MAX);
            dispatchers.spawn_worker(self.worker(
                Family::Report,
                &route.queue,
                Box::new(route.client.clone()),
                route.config.batch,
                route.config.timeout().saturating_mul(batch),
            ));
        }

        let workers = dispatchers.len();
        let pipeline = self.clone();
        dispatchers.spawn(move |shutdown| run_stats_ticker(pipeline, shutdown));

        tracing::info!(workers, "dispatch workers started");
        dispatchers
    }

    fn worker<R>(
        &self,
        family: Family,
        queue: &Arc<BoundedQueue<R>>,
        transport: Box<dyn Deliver<R>>,
        batch: usize,
        call_timeout: Duration,
    ) -> Worker<R>
    where
        R: Send + Sync + 'static,
    {
        Worker::new(family, queue.clone(), transport, self.counters.clone())
            .with_batch(batch)
            .with_idle_backoff(self.idle_backoff)
            .with_call_timeout(call_timeout)
    }

    /// Empties every queue, counting the records as dropped. Meant for after the
    /// dispatch workers are gone. Returns the number of discarded records.
    pub fn discard_pending(&self) -> usize {
        fn drain<T>(queue: &BoundedQueue<T>) -> usize {
            queue.pop_batch(usize::MAX).len()
        }

        let mut total = 0;
        for family in self.enabled_families() {
            let discarded = match family {
                Family::Threshold => self
                    .threshold
                    .as_ref()
                    .map(|r| r.queues.values().map(|q| drain(q)).sum())
                    .unwrap_or_default(),
                Family::Storage => self
                    .storage
                    .as_ref()
                    .map(|r| r.queues.values().map(|q| drain(q)).sum())
                    .unwrap_or_default(),
                Family::Archive => self.archive_queue().map_or(0, drain),
                Family::Report => self.report_queue().map_or(0, drain),
            };
            if discarded > 0 {
                self.counters
                    .record_dropped(family, DropReason::Closed, discarded as u64);
                tracing::warn!(family = %family, discarded, "discarded undelivered records");
            }
            total += discarded;
        }
        total
    }
}

/// Keeps the requested nodes accepted by `known`, logging the others.
fn known_nodes<'a, I, F>(family: Family, requested: I, known: F) -> Vec<&'a String>
where
    I: IntoIterator<Item = &'a String>,
    F: Fn(&str) -> bool,
{
    requested
        .into_iter()
        .filter(|node| {
            let ok = known(node.as_str());
            if !ok {
                tracing::warn!(
                    family = %family,
                    node = node.as_str(),
                    "node is new or changed its addresses, ignored until restart"
                );
            }
            ok
        })
        .collect()
}

async fn run_stats_ticker(pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(pipeline.stats_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => pipeline.emit_stats(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
