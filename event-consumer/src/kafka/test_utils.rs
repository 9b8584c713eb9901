use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{debug, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{Layer, Registry};

use crate::error::BrokerError;
use crate::event::{Event, Record};
use crate::handler::EventHandler;
use crate::kafka::broker::{
    BrokerClient, BrokerEvent, EventReceiver, EventSender, RebalanceSignal,
};
use crate::kafka::types::{Partition, PartitionOffset, Watermarks};

/// Test utilities for kafka module tests
pub fn json_record(topic: &str, partition: i32, offset: i64, guid: &str) -> Record {
    let payload = serde_json::json!({ "guid": guid }).to_string().into_bytes();
    Record::new(topic, partition, offset, Some(payload))
}

pub fn partition(topic: &str, partition_number: i32) -> Partition {
    Partition::new(topic.to_string(), partition_number)
}

/// Poll `condition` until it holds or `limit` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[derive(Default)]
struct MockState {
    connect_calls: usize,
    subscriptions: Vec<Vec<String>>,
    consuming: bool,
    commit_attempts: Vec<PartitionOffset>,
    commits: Vec<PartitionOffset>,
    assigns: Vec<Vec<Partition>>,
    unassigns: Vec<Vec<Partition>>,
    watermark_queries: Vec<Partition>,
    pause_calls: Vec<Vec<Partition>>,
    resume_calls: Vec<Vec<Partition>>,
    paused: BTreeSet<Partition>,
    fail_commits: bool,
    fail_next_assign: bool,
    fail_watermarks: bool,
}

/// In-memory `BrokerClient` that records every call made against it.
///
/// Records and rebalances are injected by the test through `deliver` and
/// `rebalance`, which push onto the same channel a real client would use.
pub struct MockBroker {
    events: EventSender,
    ready_after: Option<Duration>,
    state: Mutex<MockState>,
}

impl MockBroker {
    /// A broker that reports ready as soon as it is connected.
    pub fn new() -> (Arc<Self>, EventReceiver) {
        Self::build(Some(Duration::ZERO))
    }

    pub fn ready_after(delay: Duration) -> (Arc<Self>, EventReceiver) {
        Self::build(Some(delay))
    }

    pub fn never_ready() -> (Arc<Self>, EventReceiver) {
        Self::build(None)
    }

    fn build(ready_after: Option<Duration>) -> (Arc<Self>, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = Self {
            events: tx,
            ready_after,
            state: Mutex::new(MockState::default()),
        };
        (Arc::new(broker), rx)
    }

    pub fn emit(&self, event: BrokerEvent) {
        self.events.send(event).expect("consumer dropped its event channel");
    }

    pub fn deliver(&self, record: Record) {
        self.emit(BrokerEvent::Record(record));
    }

    pub fn rebalance(&self, signal: RebalanceSignal) {
        self.emit(BrokerEvent::Rebalance(signal));
    }

    pub fn fail_commits(&self, fail: bool) {
        self.state.lock().unwrap().fail_commits = fail;
    }

    pub fn fail_next_assign(&self) {
        self.state.lock().unwrap().fail_next_assign = true;
    }

    pub fn fail_watermarks(&self, fail: bool) {
        self.state.lock().unwrap().fail_watermarks = fail;
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().unwrap().connect_calls
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn is_consuming(&self) -> bool {
        self.state.lock().unwrap().consuming
    }

    pub fn commit_attempts(&self) -> Vec<PartitionOffset> {
        self.state.lock().unwrap().commit_attempts.clone()
    }

    /// Commits the broker accepted
    pub fn commits(&self) -> Vec<PartitionOffset> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Highest accepted commit per partition
    pub fn committed_offsets(&self) -> HashMap<Partition, i64> {
        let mut committed = HashMap::new();
        for commit in self.commits() {
            let entry = committed.entry(commit.partition().clone()).or_insert(commit.offset());
            *entry = (*entry).max(commit.offset());
        }
        committed
    }

    pub fn assigns(&self) -> Vec<Vec<Partition>> {
        self.state.lock().unwrap().assigns.clone()
    }

    pub fn unassigns(&self) -> Vec<Vec<Partition>> {
        self.state.lock().unwrap().unassigns.clone()
    }

    pub fn pause_calls(&self) -> Vec<Vec<Partition>> {
        self.state.lock().unwrap().pause_calls.clone()
    }

    pub fn resume_calls(&self) -> Vec<Vec<Partition>> {
        self.state.lock().unwrap().resume_calls.clone()
    }

    /// Partitions currently paused
    pub fn paused(&self) -> Vec<Partition> {
        self.state.lock().unwrap().paused.iter().cloned().collect()
    }

    pub fn watermark_queries(&self) -> Vec<Partition> {
        self.state.lock().unwrap().watermark_queries.clone()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    fn connect(&self) -> Result<(), BrokerError> {
        self.state.lock().unwrap().connect_calls += 1;

        if let Some(delay) = self.ready_after {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if events.send(BrokerEvent::Ready).is_err() {
                    debug!("Consumer dropped before the mock became ready");
                }
            });
        }
        Ok(())
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        self.state.lock().unwrap().subscriptions.push(topics.to_vec());
        Ok(())
    }

    fn consume(&self) -> Result<(), BrokerError> {
        self.state.lock().unwrap().consuming = true;
        Ok(())
    }

    async fn commit(&self, offset: &PartitionOffset) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.commit_attempts.push(offset.clone());
        if state.fail_commits {
            return Err(BrokerError::Kafka(KafkaError::ConsumerCommit(
                RDKafkaErrorCode::RebalanceInProgress,
            )));
        }
        state.commits.push(offset.clone());
        Ok(())
    }

    fn assign(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.assigns.push(partitions.to_vec());
        if std::mem::take(&mut state.fail_next_assign) {
            return Err(BrokerError::AssignmentRejected(
                "injected assignment failure".to_string(),
            ));
        }
        Ok(())
    }

    fn unassign(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.state.lock().unwrap().unassigns.push(partitions.to_vec());
        Ok(())
    }

    fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.pause_calls.push(partitions.to_vec());
        state.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.resume_calls.push(partitions.to_vec());
        for partition in partitions {
            state.paused.remove(partition);
        }
        Ok(())
    }

    async fn query_watermark_offsets(
        &self,
        partition: &Partition,
        _timeout: Duration,
    ) -> Result<Watermarks, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.watermark_queries.push(partition.clone());
        if state.fail_watermarks {
            return Err(BrokerError::Kafka(KafkaError::MetadataFetch(
                RDKafkaErrorCode::UnknownTopicOrPartition,
            )));
        }
        Ok(Watermarks { low: 0, high: 100 })
    }
}

/// `EventHandler` that records what it handled and misbehaves on request.
#[derive(Default)]
pub struct RecordingHandler {
    handled: Mutex<Vec<Event>>,
    failing: HashSet<i64>,
    panicking: HashSet<i64>,
    delays: HashMap<i64, Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, offsets: &[i64]) -> Self {
        self.failing.extend(offsets);
        self
    }

    pub fn panicking_on(mut self, offsets: &[i64]) -> Self {
        self.panicking.extend(offsets);
        self
    }

    pub fn delaying(mut self, offset: i64, delay: Duration) -> Self {
        self.delays.insert(offset, delay);
        self
    }

    pub fn handled_events(&self) -> Vec<Event> {
        self.handled.lock().unwrap().clone()
    }

    pub fn handled_offsets(&self) -> Vec<i64> {
        self.handled_events().iter().map(|e| e.offset).collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.handled.lock().unwrap().push(event.clone());

        if let Some(delay) = self.delays.get(&event.offset) {
            tokio::time::sleep(*delay).await;
        }
        if self.panicking.contains(&event.offset) {
            panic!("handler exploded on offset {}", event.offset);
        }
        if self.failing.contains(&event.offset) {
            anyhow::bail!("boom");
        }
        Ok(())
    }
}

/// Captures formatted log events so tests can assert on diagnostics.
///
/// Installed per thread; use it from current-thread runtimes so spawned
/// tasks log into the same capture.
#[derive(Clone, Default)]
pub struct LogCapture {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(Registry::default().with(self.clone()))
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    /// True when a single log line contains every fragment
    pub fn contains(&self, fragments: &[&str]) -> bool {
        self.lines()
            .iter()
            .any(|line| fragments.iter().all(|fragment| line.contains(fragment)))
    }
}

struct LineVisitor(String);

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        _ = write!(self.0, "{}={} ", field.name(), value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        _ = write!(self.0, "{}={:?} ", field.name(), value);
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor(format!("{} ", event.metadata().level()));
        event.record(&mut visitor);
        self.lines.lock().unwrap().push(visitor.0);
    }
}
