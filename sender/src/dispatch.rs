//! Dispatch workers: one long-running task per send queue.
//!
//! A worker drains its queue in batches and hands each batch to its transport. A failed
//! batch is lost as a whole (or partially, if the transport can tell), counted and
//! logged at a limited rate. Nothing is requeued.

use shared::histogram;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

use crate::errors::TransportError;
use crate::metrics_defs::{BATCH_SIZE, DELIVERY_DURATION};
use crate::queue::BoundedQueue;
use crate::rate_limited_logger::{DEFAULT_LOG_INTERVAL, RateLimitedLogger};
use crate::stats::{Counters, DropReason, Family};
use crate::transport::Deliver;

pub struct Worker<R> {
    family: Family,
    queue: Arc<BoundedQueue<R>>,
    transport: Box<dyn Deliver<R>>,
    batch: usize,
    idle_backoff: Duration,
    call_timeout: Duration,
    counters: Arc<Counters>,
    errors: RateLimitedLogger,
}

impl<R> Worker<R>
where
    R: Send + Sync + 'static,
{
    pub fn new(
        family: Family,
        queue: Arc<BoundedQueue<R>>,
        transport: Box<dyn Deliver<R>>,
        counters: Arc<Counters>,
    ) -> Self {
        let errors = RateLimitedLogger::new(transport.destination(), DEFAULT_LOG_INTERVAL);
        Self {
            family,
            queue,
            transport,
            batch: 200,
            idle_backoff: Duration::from_millis(50),
            call_timeout: Duration::from_secs(5),
            counters,
            errors,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Runs until shutdown is signalled and the queue is empty.
    ///
    /// Producers are expected to stop before shutdown is signalled, so the remaining
    /// items are flushed rather than abandoned.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(
            family = %self.family,
            destination = self.transport.destination(),
            "dispatch worker started"
        );

        let mut stopping = false;
        loop {
            let batch = self.queue.pop_batch(self.batch);
            if batch.is_empty() {
                if stopping || *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = sleep(self.idle_backoff) => {}
                    changed = shutdown.changed() => {
                        // Sender gone: same as an explicit shutdown
                        if changed.is_err() {
                            stopping = true;
                        }
                    }
                }
                continue;
            }
            self.send(batch).await;
        }

        tracing::debug!(
            family = %self.family,
            destination = self.transport.destination(),
            "dispatch worker stopped"
        );
    }

    async fn send(&self, batch: Vec<R>) {
        let len = batch.len();
        histogram!(BATCH_SIZE, "family" => self.family.as_str()).record(len as f64);

        let start = Instant::now();
        let result = match timeout(self.call_timeout, self.transport.deliver(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.call_timeout)),
        };
        histogram!(DELIVERY_DURATION, "family" => self.family.as_str())
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => self.counters.record_delivered(self.family, len as u64),
            Err(e) => {
                let lost = e.records_lost(len).min(len);
                if lost < len {
                    self.counters.record_delivered(self.family, (len - lost) as u64);
                }
                self.counters.record_dropped(self.family, DropReason::Transport, lost as u64);
                self.errors.warn("failed to deliver batch", &e);
            }
        }
    }
}

/// Running dispatch tasks and the signal that stops them.
pub struct Dispatchers {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Dispatchers {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    /// Spawns a task that receives the shutdown signal.
    pub fn spawn<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task(self.shutdown.subscribe()));
    }

    pub fn spawn_worker<R>(&mut self, worker: Worker<R>)
    where
        R: Send + Sync + 'static,
    {
        self.spawn(|shutdown| worker.run(shutdown));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signals shutdown and waits up to `grace` for the tasks to flush their queues.
    /// Tasks still running after that are aborted. Returns whether all tasks finished
    /// on their own.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        let _ = self.shutdown.send(true);

        let tasks = &mut self.tasks;
        let finished = timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "dispatch task failed");
                }
            }
        })
        .await
        .is_ok();

        if !finished {
            tracing::warn!(
                remaining = self.tasks.len(),
                "dispatch tasks did not finish in time, aborting"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
        finished
    }
}

impl Default for Dispatchers {
    fn default() -> Self {
        Self::new()
    }
}
