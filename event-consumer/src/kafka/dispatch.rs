//! Dispatch & Commit Pipeline
//!
//! Each partition gets its own worker, ensuring:
//! 1. Records of a partition are handled and committed in arrival order
//! 2. Partitions progress independently of each other
//! 3. Fetching pauses for a partition whose queue is full and resumes once it
//!    has drained to half
//!
//! Nothing here waits on a worker except `shutdown`, so a slow handler only
//! holds up its own partition.
//!
//! A record's failure ends at the record: it is logged, its offset is not
//! committed, and the worker moves on to the next record.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{CommitPolicy, ConsumerConfig};
use crate::diagnostics::{Category, NO_CORRELATION_ID};
use crate::error::ConsumerError;
use crate::event::{Event, Record};
use crate::handler::EventHandler;
use crate::kafka::broker::BrokerClient;
use crate::kafka::offset_tracker::{CommitDecision, OffsetTracker};
use crate::kafka::types::{Partition, PartitionOffset};
use crate::metrics_consts::{
    COMMITS, COMMITS_WITHHELD, HANDLER_DURATION, PARTITION_PAUSES, RECORDS_HANDLED,
    RECORDS_MALFORMED, RECORDS_RECEIVED,
};

/// How processing of a single record ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Committed(i64),
    /// Handled, but the commit policy did not allow committing its offset
    CommitSkipped,
    CommitFailed,
    HandlerFailed,
    Malformed,
}

/// Everything a partition worker needs besides its queue.
struct WorkerContext {
    broker: Arc<dyn BrokerClient>,
    handler: Arc<dyn EventHandler>,
    correlation_id_field: String,
}

/// Deserialize, handle, and (only on success) commit one record.
async fn process_record(
    record: Record,
    context: &WorkerContext,
    tracker: &mut OffsetTracker,
) -> RecordOutcome {
    let partition = record.partition_id();

    let event = match Event::from_record(&record, &context.correlation_id_field) {
        Ok(event) => event,
        Err(e) => {
            metrics::counter!(RECORDS_MALFORMED, "topic" => record.topic.clone()).increment(1);
            tracker.mark_failed(record.offset);
            error!(
                category = %Category::Record,
                correlation_id = NO_CORRELATION_ID,
                topic = record.topic.as_str(),
                partition = record.partition,
                offset = record.offset,
                error = %ConsumerError::from(e),
                "Dropping malformed record without committing"
            );
            return RecordOutcome::Malformed;
        }
    };

    let started = Instant::now();
    let result = match AssertUnwindSafe(context.handler.handle(&event))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("handler panicked")),
    };
    metrics::histogram!(HANDLER_DURATION).record(started.elapsed().as_secs_f64());

    if let Err(source) = result {
        metrics::counter!(RECORDS_HANDLED, "outcome" => "failed").increment(1);
        tracker.mark_failed(event.offset);
        let failure = ConsumerError::RecordHandling {
            partition,
            offset: event.offset,
            source,
        };
        error!(
            category = %Category::Record,
            correlation_id = event.correlation_id(),
            topic = event.topic.as_str(),
            partition = event.partition,
            offset = event.offset,
            error = %failure,
            "Handler failed, offset not committed"
        );
        return RecordOutcome::HandlerFailed;
    }
    metrics::counter!(RECORDS_HANDLED, "outcome" => "succeeded").increment(1);

    let cursor = match tracker.decide(event.offset) {
        CommitDecision::Commit(cursor) => cursor,
        CommitDecision::AlreadyCovered => {
            debug!(
                category = %Category::Commit,
                correlation_id = event.correlation_id(),
                topic = event.topic.as_str(),
                partition = event.partition,
                offset = event.offset,
                "Offset already covered by an earlier commit"
            );
            return RecordOutcome::CommitSkipped;
        }
        CommitDecision::Withheld { failed_offset } => {
            metrics::counter!(COMMITS_WITHHELD).increment(1);
            warn!(
                category = %Category::Commit,
                correlation_id = event.correlation_id(),
                topic = event.topic.as_str(),
                partition = event.partition,
                offset = event.offset,
                failed_offset = failed_offset,
                "Commit withheld, an earlier record on this partition failed"
            );
            return RecordOutcome::CommitSkipped;
        }
    };

    let target = PartitionOffset::new(partition, cursor);
    match context.broker.commit(&target).await {
        Ok(()) => {
            metrics::counter!(COMMITS, "outcome" => "committed").increment(1);
            tracker.mark_committed(cursor);
            debug!(
                category = %Category::Commit,
                correlation_id = event.correlation_id(),
                topic = event.topic.as_str(),
                partition = event.partition,
                offset = cursor,
                "Committed offset"
            );
            RecordOutcome::Committed(cursor)
        }
        Err(source) => {
            // Not retried: the next successful commit on this partition supersedes it
            metrics::counter!(COMMITS, "outcome" => "failed").increment(1);
            let failure = ConsumerError::Commit {
                offset: target,
                source,
            };
            error!(
                category = %Category::Commit,
                correlation_id = event.correlation_id(),
                topic = event.topic.as_str(),
                partition = event.partition,
                offset = event.offset,
                error = %failure,
                "Failed to commit offset"
            );
            RecordOutcome::CommitFailed
        }
    }
}

/// Queue depth of one partition, pausing the broker's fetch when it is full.
///
/// Depth and pause state change under one lock so a worker draining its queue
/// cannot resume before the dispatcher's pause went out.
struct FlowGate {
    partition: Partition,
    broker: Arc<dyn BrokerClient>,
    capacity: usize,
    state: Mutex<FlowState>,
}

#[derive(Default)]
struct FlowState {
    queued: usize,
    paused: bool,
}

impl FlowGate {
    fn new(partition: Partition, broker: Arc<dyn BrokerClient>, capacity: usize) -> Self {
        Self {
            partition,
            broker,
            capacity,
            state: Mutex::new(FlowState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueued(&self) {
        let mut state = self.lock();
        state.queued += 1;
        if state.paused || state.queued < self.capacity {
            return;
        }

        match self.broker.pause(std::slice::from_ref(&self.partition)) {
            Ok(()) => {
                metrics::counter!(PARTITION_PAUSES).increment(1);
                state.paused = true;
                warn!(
                    category = %Category::Record,
                    correlation_id = NO_CORRELATION_ID,
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    queued = state.queued,
                    "Partition queue full, pausing fetch"
                );
            }
            Err(e) => error!(
                category = %Category::Broker,
                correlation_id = NO_CORRELATION_ID,
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                error = %e,
                "Failed to pause partition"
            ),
        }
    }

    fn processed(&self) {
        let mut state = self.lock();
        state.queued = state.queued.saturating_sub(1);
        if !state.paused || state.queued > self.capacity / 2 {
            return;
        }

        // Cleared even on failure: a revoked partition cannot be resumed
        state.paused = false;
        match self.broker.resume(std::slice::from_ref(&self.partition)) {
            Ok(()) => info!(
                category = %Category::Record,
                correlation_id = NO_CORRELATION_ID,
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                queued = state.queued,
                "Partition queue drained, resuming fetch"
            ),
            Err(e) => warn!(
                category = %Category::Broker,
                correlation_id = NO_CORRELATION_ID,
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                error = %e,
                "Failed to resume partition"
            ),
        }
    }
}

/// A worker that processes records for a single partition
struct PartitionWorker {
    sender: mpsc::UnboundedSender<Record>,
    gate: Arc<FlowGate>,
    handle: JoinHandle<()>,
}

impl PartitionWorker {
    /// `predecessor` is a retired worker of the same partition that is still
    /// draining; this worker starts only after it finished.
    fn new(
        partition: Partition,
        context: Arc<WorkerContext>,
        policy: CommitPolicy,
        capacity: usize,
        predecessor: Option<JoinHandle<()>>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let gate = Arc::new(FlowGate::new(
            partition.clone(),
            context.broker.clone(),
            capacity,
        ));
        let tracker = OffsetTracker::new(partition.clone(), policy);
        let handle = tokio::spawn(Self::run(
            partition,
            receiver,
            context,
            gate.clone(),
            tracker,
            predecessor,
        ));

        Self {
            sender,
            gate,
            handle,
        }
    }

    async fn run(
        partition: Partition,
        mut receiver: mpsc::UnboundedReceiver<Record>,
        context: Arc<WorkerContext>,
        gate: Arc<FlowGate>,
        mut tracker: OffsetTracker,
        predecessor: Option<JoinHandle<()>>,
    ) {
        if let Some(predecessor) = predecessor {
            debug!("Waiting for retired worker of {} to drain", partition);
            if let Err(e) = predecessor.await {
                warn!("Retired partition worker for {} failed: {}", partition, e);
            }
        }
        debug!("Starting partition worker for {}", partition);

        while let Some(record) = receiver.recv().await {
            let offset = record.offset;
            let outcome = process_record(record, &context, &mut tracker).await;
            gate.processed();
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                outcome = ?outcome,
                "Processed record"
            );
        }

        debug!(
            "Partition worker for {} stopped, last committed {:?}",
            partition,
            tracker.committed()
        );
    }

    /// Stop accepting records. Queued records are still processed.
    fn close(self) -> JoinHandle<()> {
        drop(self.sender);
        self.handle
    }
}

/// Routes records to their partition's worker, creating workers on demand.
pub struct DispatchPipeline {
    context: Arc<WorkerContext>,
    policy: CommitPolicy,
    queue_size: usize,
    workers: HashMap<Partition, PartitionWorker>,
    /// Closed workers still draining, joined at shutdown
    retiring: HashMap<Partition, JoinHandle<()>>,
}

impl DispatchPipeline {
    pub fn new(
        config: &ConsumerConfig,
        broker: Arc<dyn BrokerClient>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            context: Arc::new(WorkerContext {
                broker,
                handler,
                correlation_id_field: config.correlation_id_field.clone(),
            }),
            policy: config.commit_policy,
            queue_size: config.partition_queue_size.max(1),
            workers: HashMap::new(),
            retiring: HashMap::new(),
        }
    }

    /// Queue a record behind earlier records of its partition. Never waits on
    /// the partition's worker.
    pub fn dispatch(&mut self, record: Record) {
        metrics::counter!(RECORDS_RECEIVED, "topic" => record.topic.clone()).increment(1);

        let partition = record.partition_id();
        if !self.workers.contains_key(&partition) {
            let predecessor = self.retiring.remove(&partition);
            let worker = PartitionWorker::new(
                partition.clone(),
                self.context.clone(),
                self.policy,
                self.queue_size,
                predecessor,
            );
            self.workers.insert(partition.clone(), worker);
        }
        let Some(worker) = self.workers.get(&partition) else {
            return;
        };

        worker.gate.enqueued();
        if let Err(e) = worker.sender.send(record) {
            let record = e.0;
            error!(
                category = %Category::Record,
                correlation_id = NO_CORRELATION_ID,
                topic = record.topic.as_str(),
                partition = record.partition,
                offset = record.offset,
                "Partition worker is gone, record dropped"
            );
            if let Some(worker) = self.workers.remove(&partition) {
                self.retiring.insert(partition, worker.close());
            }
        }
    }

    /// Close the workers of partitions this consumer no longer owns. They
    /// finish their queued records in the background.
    pub fn retire(&mut self, partitions: &[Partition]) {
        for partition in partitions {
            if let Some(worker) = self.workers.remove(partition) {
                let queued = worker.gate.lock().queued;
                self.retiring.insert(partition.clone(), worker.close());
                info!(
                    "Retiring partition worker for {} with {} queued records",
                    partition, queued
                );
            }
        }
        self.retiring.retain(|_, handle| !handle.is_finished());
    }

    pub fn active_partitions(&self) -> usize {
        self.workers.len()
    }

    /// Workers closed by `retire` that have not finished draining yet.
    pub fn retiring_partitions(&self) -> usize {
        self.retiring
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Close every worker and wait for all of them to drain.
    pub async fn shutdown(mut self) {
        info!(
            "Draining {} partition workers before shutdown",
            self.workers.len() + self.retiring.len()
        );
        let mut handles: Vec<(Partition, JoinHandle<()>)> = self
            .workers
            .drain()
            .map(|(partition, worker)| (partition, worker.close()))
            .collect();
        handles.extend(self.retiring.drain());

        for (partition, handle) in handles {
            if let Err(e) = handle.await {
                warn!(
                    "Partition worker for {} panicked during shutdown: {}",
                    partition, e
                );
            }
        }
    }
}
