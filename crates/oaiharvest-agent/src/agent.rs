//! Harvest pipeline: many concurrent harvests feeding one batching writer.
//!
//! Every harvest runs on a worker of a dedicated rayon pool and offers its
//! records to a shared [`BoundedQueue`]. The thread that calls
//! [`HarvestAgent::start`] is the single consumer: it polls the queue,
//! accumulates batches of `batch_size` records and writes each full batch
//! to the [`RecordSink`]. A harvest whose offer times out is interrupted and
//! ends with a capacity failure, unless the agent was stopped: the writer
//! is gone by then and the rest of the page is dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use oaiharvest_core::{BoundedQueue, CancelToken, Transport};
use oaiharvest_harvester::{
    HarvestError, HarvestObserver, HarvestParameters, HarvestedRecord, Harvester, ResponseHandler,
};
use rustc_hash::FxHashSet;

use crate::config::AgentConfig;
use crate::error::{AgentError, SinkError};
use crate::sink::{FailedRecord, RecordSink};

/// Outcome of one batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Records offered to the sink
    pub size: usize,
    pub written: usize,
    pub rejected: usize,
    /// Queue depth right after the write
    pub queue_len: usize,
    /// Deepest the queue has been so far in this run
    pub max_queue_len: usize,
    pub running: usize,
}

/// Receives writer-side events. Called on the consumer thread.
pub trait AgentListener: Send + Sync {
    fn on_batch_written(&self, _report: &BatchReport) {}

    fn on_record_failed(&self, _failure: &FailedRecord) {}

    fn on_batch_failed(&self, _size: usize, _error: &SinkError) {}
}

/// Totals for one agent run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub harvests: usize,
    pub records_enqueued: usize,
    /// Records extracted after a stop that found no room in the queue
    pub records_dropped: usize,
    pub records_written: usize,
    pub records_rejected: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub max_queue_len: usize,
}

struct Harvest {
    params: HarvestParameters,
    harvester: Arc<Harvester>,
}

pub struct HarvestAgentBuilder {
    transport: Arc<dyn Transport>,
    config: AgentConfig,
    listeners: Vec<Arc<dyn AgentListener>>,
}

impl HarvestAgentBuilder {
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn AgentListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<HarvestAgent, AgentError> {
        self.config.validate()?;
        Ok(HarvestAgent {
            queue: BoundedQueue::new(self.config.queue_capacity),
            transport: self.transport,
            config: self.config,
            listeners: self.listeners,
            harvests: Mutex::new(Vec::new()),
            running: Mutex::new(FxHashSet::default()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            enqueued: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            max_queue_len: AtomicUsize::new(0),
        })
    }
}

/// Runs a fixed set of harvests once.
pub struct HarvestAgent {
    transport: Arc<dyn Transport>,
    config: AgentConfig,
    listeners: Vec<Arc<dyn AgentListener>>,
    queue: BoundedQueue<HarvestedRecord>,
    harvests: Mutex<Vec<Harvest>>,
    running: Mutex<FxHashSet<usize>>,
    started: AtomicBool,
    stopped: AtomicBool,
    enqueued: AtomicUsize,
    dropped: AtomicUsize,
    max_queue_len: AtomicUsize,
}

impl std::fmt::Debug for HarvestAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestAgent")
            .field("config", &self.config)
            .field("queue_len", &self.queue.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a harvest from the running set when its worker finishes,
/// however it finishes.
struct Registration<'a> {
    running: &'a Mutex<FxHashSet<usize>>,
    id: usize,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        lock(self.running).remove(&self.id);
    }
}

/// Per-harvest consumer that feeds the shared queue.
struct QueueingHandler<'a> {
    queue: &'a BoundedQueue<HarvestedRecord>,
    cancel: CancelToken,
    offer_timeout: Duration,
    enqueued: &'a AtomicUsize,
    dropped: &'a AtomicUsize,
    max_queue_len: &'a AtomicUsize,
    /// Set once an offer timed out after a stop
    dropping: bool,
}

impl ResponseHandler for QueueingHandler<'_> {
    fn on_record(&mut self, record: HarvestedRecord) -> Result<(), HarvestError> {
        if self.dropping {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        match self.queue.offer(record, self.offer_timeout) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                self.max_queue_len
                    .fetch_max(self.queue.len(), Ordering::Relaxed);
                Ok(())
            }
            Err(record) if self.cancel.is_stopped() => {
                log::warn!(
                    "{}: harvest stopped with a full queue, dropping the rest of the page from {}",
                    record.base_url,
                    record.identifier
                );
                self.dropping = true;
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(record) => {
                log::warn!(
                    "{}: queue full for {:?}, interrupting harvest at {}",
                    record.base_url,
                    self.offer_timeout,
                    record.identifier
                );
                self.cancel.interrupt();
                Err(HarvestError::Capacity {
                    timeout: self.offer_timeout,
                })
            }
        }
    }
}

impl HarvestAgent {
    pub fn builder(transport: Arc<dyn Transport>) -> HarvestAgentBuilder {
        HarvestAgentBuilder {
            transport,
            config: AgentConfig::default(),
            listeners: Vec::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Register a harvest, with observers for its notifications.
    /// Returns its index in this agent.
    pub fn add_harvest(
        &self,
        params: HarvestParameters,
        observers: Vec<Arc<dyn HarvestObserver>>,
    ) -> Result<usize, AgentError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(AgentError::AlreadyStarted);
        }
        params.validate()?;

        let mut builder = Harvester::builder(self.transport.clone());
        for observer in observers {
            builder = builder.observer(observer);
        }
        let mut harvests = lock(&self.harvests);
        harvests.push(Harvest {
            params,
            harvester: Arc::new(builder.build()),
        });
        Ok(harvests.len() - 1)
    }

    pub fn harvest_count(&self) -> usize {
        lock(&self.harvests).len()
    }

    /// Harvests whose worker has not finished yet.
    pub fn running_harvests(&self) -> usize {
        lock(&self.running).len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Deepest the queue has been during this run.
    pub fn max_queue_len(&self) -> usize {
        self.max_queue_len.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop every harvest before its next request and make the writer exit.
    /// Records already queued are still written.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!("Stopping harvest agent");
        for harvest in lock(&self.harvests).iter() {
            harvest.harvester.stop();
        }
    }

    /// Run every registered harvest to its end, writing records to `sink`.
    ///
    /// Blocks the calling thread, which acts as the writer. Can be called
    /// once per agent.
    pub fn start(&self, sink: &mut dyn RecordSink) -> Result<RunSummary, AgentError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyStarted);
        }

        let jobs: Vec<(usize, HarvestParameters, Arc<Harvester>)> = lock(&self.harvests)
            .iter()
            .enumerate()
            .map(|(id, h)| (id, h.params.clone(), h.harvester.clone()))
            .collect();
        let mut summary = RunSummary {
            harvests: jobs.len(),
            ..RunSummary::default()
        };
        if jobs.is_empty() {
            log::info!("No harvests registered");
            if let Err(e) = sink.finish() {
                log::error!("Sink finish failed: {e}");
            }
            return Ok(summary);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers.min(jobs.len()))
            .thread_name(|i| format!("harvest-{i}"))
            .build()
            .map_err(|e| AgentError::ThreadPool(e.to_string()))?;

        lock(&self.running).extend(jobs.iter().map(|(id, _, _)| *id));
        log::info!(
            "Starting {} harvests on {} workers",
            jobs.len(),
            pool.current_num_threads()
        );

        let mut batch = Vec::with_capacity(self.config.batch_size);
        pool.in_place_scope(|scope| {
            for (id, params, harvester) in &jobs {
                scope.spawn(move |_| self.run_harvest(*id, params, harvester));
            }
            self.consume(sink, &mut batch, &mut summary);
        });

        // producers are done; the remainder goes out in one write
        batch.extend(self.queue.drain());
        if !batch.is_empty() {
            self.flush(sink, std::mem::take(&mut batch), &mut summary);
        }

        match sink.finish() {
            Ok(rows) => log::debug!("Sink finished with {rows} records"),
            Err(e) => log::error!("Sink finish failed: {e}"),
        }

        summary.records_enqueued = self.enqueued.load(Ordering::Relaxed);
        summary.records_dropped = self.dropped.load(Ordering::Relaxed);
        if summary.records_dropped > 0 {
            log::warn!(
                "{} records extracted after the stop were not queued",
                summary.records_dropped
            );
        }
        summary.max_queue_len = self.max_queue_len();
        log::info!(
            "Harvest agent done: {} records enqueued, {} written, {} rejected, {} batches ({} failed)",
            summary.records_enqueued,
            summary.records_written,
            summary.records_rejected,
            summary.batches,
            summary.failed_batches
        );
        Ok(summary)
    }

    fn run_harvest(&self, id: usize, params: &HarvestParameters, harvester: &Harvester) {
        let _registration = Registration {
            running: &self.running,
            id,
        };
        if self.is_stopped() {
            // still run, so the harvest reports its own stopped ENDED
            harvester.stop();
        }
        let mut handler = QueueingHandler {
            queue: &self.queue,
            cancel: harvester.cancel_token().clone(),
            offer_timeout: self.config.offer_timeout,
            enqueued: &self.enqueued,
            dropped: &self.dropped,
            max_queue_len: &self.max_queue_len,
            dropping: false,
        };
        match harvester.start(params, &mut handler) {
            Ok(ended) => {
                if let Some(cause) = &ended.cause {
                    log::error!("{}: harvest failed: {cause}", params.base_uri());
                }
            }
            Err(e) => log::error!("{}: harvest not started: {e}", params.base_uri()),
        }
    }

    fn consume(
        &self,
        sink: &mut dyn RecordSink,
        batch: &mut Vec<HarvestedRecord>,
        summary: &mut RunSummary,
    ) {
        while !self.is_stopped() && (self.running_harvests() > 0 || !self.queue.is_empty()) {
            let Some(record) = self.queue.poll(self.config.poll_timeout) else {
                continue;
            };
            self.max_queue_len
                .fetch_max(self.queue.len() + 1, Ordering::Relaxed);
            batch.push(record);
            if batch.len() >= self.config.batch_size {
                let full = std::mem::replace(batch, Vec::with_capacity(self.config.batch_size));
                self.flush(sink, full, summary);
            }
        }
    }

    fn flush(
        &self,
        sink: &mut dyn RecordSink,
        batch: Vec<HarvestedRecord>,
        summary: &mut RunSummary,
    ) {
        let size = batch.len();
        summary.batches += 1;
        match sink.write_batch(batch, self.config.write_policy) {
            Ok(failed) => {
                for failure in &failed {
                    log::warn!(
                        "{}: record {} rejected: {}",
                        failure.record.base_url,
                        failure.record.identifier,
                        failure.cause
                    );
                    for listener in &self.listeners {
                        listener.on_record_failed(failure);
                    }
                }
                let report = BatchReport {
                    size,
                    written: size - failed.len(),
                    rejected: failed.len(),
                    queue_len: self.queue.len(),
                    max_queue_len: self.max_queue_len(),
                    running: self.running_harvests(),
                };
                summary.records_written += report.written;
                summary.records_rejected += report.rejected;
                log::info!(
                    "Wrote batch of {} records ({} rejected, queue {})",
                    report.written,
                    report.rejected,
                    report.queue_len
                );
                for listener in &self.listeners {
                    listener.on_batch_written(&report);
                }
            }
            Err(e) => {
                summary.failed_batches += 1;
                log::error!("Batch of {size} records failed: {e}");
                for listener in &self.listeners {
                    listener.on_batch_failed(size, &e);
                }
            }
        }
    }
}
