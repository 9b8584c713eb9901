//! Connection & Readiness Manager
//!
//! A single dispatcher task owns every piece of mutable consumer state and
//! consumes broker events in the order they were emitted. Callers only see the
//! bounded-wait `connect` and the `ConsumerHandle` it returns.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::diagnostics::{Category, NO_CORRELATION_ID};
use crate::error::{BrokerError, ConsumerError};
use crate::handler::EventHandler;
use crate::kafka::broker::{BrokerClient, BrokerEvent, EventReceiver};
use crate::kafka::dispatch::DispatchPipeline;
use crate::kafka::rebalance::RebalanceCoordinator;
use crate::kafka::types::PartitionAssignment;

pub struct EventConsumer {
    config: ConsumerConfig,
    broker: Arc<dyn BrokerClient>,
    events: EventReceiver,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl EventConsumer {
    /// `events` must be the receiver handed out together with `broker`.
    pub fn new(config: ConsumerConfig, broker: Arc<dyn BrokerClient>, events: EventReceiver) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            config,
            broker,
            events,
            ready_tx,
            ready_rx,
        }
    }

    /// Readiness check that can be handed out before `connect`, e.g. to a
    /// probe route served while the consumer is still connecting.
    pub fn readiness_probe(&self) -> impl Fn() -> bool + Clone + Send + Sync + 'static {
        readiness_probe(&self.ready_rx)
    }

    /// Start consuming with `handler`, resolving once the broker reports ready.
    ///
    /// Fails with `ConsumerError::ConnectionTimeout` when readiness is not
    /// reached within the configured connect timeout, and only then. Connection
    /// errors reported by the broker before that are logged only.
    pub async fn connect(
        self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<ConsumerHandle, ConsumerError> {
        let connect_timeout = self.config.connect_timeout;
        let mut ready_rx = self.ready_rx;
        let (coordinator, assignment) =
            RebalanceCoordinator::new(self.broker.clone(), self.config.watermark_timeout);
        let pipeline = DispatchPipeline::new(&self.config, self.broker.clone(), handler);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        // The dispatcher listens before the connection is started so an early
        // ready signal cannot be missed.
        let dispatcher = Dispatcher {
            topics: self.config.topics.clone(),
            broker: self.broker.clone(),
            events: self.events,
            ready: self.ready_tx,
            coordinator,
            pipeline,
        };
        let task = tokio::spawn(dispatcher.run(shutdown_rx));

        info!(
            category = %Category::Lifecycle,
            correlation_id = NO_CORRELATION_ID,
            brokers = self.config.brokers.as_str(),
            group_id = self.config.group_id.as_str(),
            "Connecting consumer"
        );
        if let Err(e) = self.broker.connect() {
            error!(
                category = %Category::Lifecycle,
                correlation_id = NO_CORRELATION_ID,
                error = %e,
                "Broker connection failed to start"
            );
        }

        let became_ready = tokio::time::timeout(connect_timeout, async {
            let stopped = ready_rx.wait_for(|ready| *ready).await.is_err();
            if stopped {
                // Readiness can no longer arrive, the timeout decides the outcome
                warn!(
                    category = %Category::Lifecycle,
                    correlation_id = NO_CORRELATION_ID,
                    "Broker event channel closed before the consumer became ready"
                );
                std::future::pending::<()>().await;
            }
        })
        .await;

        match became_ready {
            Ok(()) => {
                info!(
                    category = %Category::Lifecycle,
                    correlation_id = NO_CORRELATION_ID,
                    "Consumer connected"
                );
                Ok(ConsumerHandle {
                    ready: ready_rx,
                    assignment,
                    shutdown: shutdown_tx,
                    task,
                })
            }
            Err(_) => {
                let failure = ConsumerError::ConnectionTimeout(connect_timeout);
                error!(
                    category = %Category::Lifecycle,
                    correlation_id = NO_CORRELATION_ID,
                    error = %failure,
                    "Consumer did not become ready"
                );
                if shutdown_tx.send(()).is_err() {
                    debug!("Dispatcher already stopped");
                }
                if let Err(e) = task.await {
                    warn!("Dispatcher failed while stopping: {}", e);
                }
                Err(failure)
            }
        }
    }
}

/// Handle to a connected consumer. Dropping it stops the consumer.
pub struct ConsumerHandle {
    ready: watch::Receiver<bool>,
    assignment: watch::Receiver<PartitionAssignment>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Snapshot of the partitions owned right now.
    pub fn assignment(&self) -> PartitionAssignment {
        self.assignment.borrow().clone()
    }

    /// Readiness check usable from outside the consumer, e.g. a probe route.
    pub fn readiness_probe(&self) -> impl Fn() -> bool + Clone + Send + Sync + 'static {
        readiness_probe(&self.ready)
    }

    /// Stop dispatching, let in-flight records finish, and wait for the
    /// dispatcher to exit.
    pub async fn shutdown(self) -> Result<(), ConsumerError> {
        if self.shutdown.send(()).is_err() {
            debug!("Dispatcher already stopped");
        }
        self.task
            .await
            .map_err(|e| ConsumerError::Broker(BrokerError::Join(e)))
    }
}

fn readiness_probe(
    ready: &watch::Receiver<bool>,
) -> impl Fn() -> bool + Clone + Send + Sync + 'static {
    let ready = ready.clone();
    move || *ready.borrow()
}

struct Dispatcher {
    topics: Vec<String>,
    broker: Arc<dyn BrokerClient>,
    events: EventReceiver,
    ready: watch::Sender<bool>,
    coordinator: RebalanceCoordinator,
    pipeline: DispatchPipeline,
}

impl Dispatcher {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            let event = tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!(
                        category = %Category::Lifecycle,
                        correlation_id = NO_CORRELATION_ID,
                        "Shutdown requested, stopping dispatcher"
                    );
                    break;
                }
                event = self.events.recv() => event,
            };

            match event {
                Some(event) => self.on_event(event),
                None => {
                    warn!(
                        category = %Category::Lifecycle,
                        correlation_id = NO_CORRELATION_ID,
                        "Broker event channel closed, stopping dispatcher"
                    );
                    break;
                }
            }
        }

        self.pipeline.shutdown().await;
        info!(
            category = %Category::Lifecycle,
            correlation_id = NO_CORRELATION_ID,
            "Dispatcher stopped"
        );
    }

    /// Never waits on partition workers, so one slow partition cannot hold up
    /// records of other partitions or later rebalances.
    fn on_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Ready => self.on_ready(),
            BrokerEvent::Record(record) => self.pipeline.dispatch(record),
            BrokerEvent::Rebalance(signal) => {
                let outcome = self.coordinator.handle(signal);
                self.pipeline.retire(&outcome.released);
            }
            BrokerEvent::Disconnected(reason) => {
                // No reconnection is attempted
                warn!(
                    category = %Category::Lifecycle,
                    correlation_id = NO_CORRELATION_ID,
                    reason = reason.as_str(),
                    "Consumer disconnected"
                );
            }
            BrokerEvent::Error(reason) => {
                error!(
                    category = %Category::Broker,
                    correlation_id = NO_CORRELATION_ID,
                    error = %ConsumerError::Unclassified(reason),
                    "Broker reported an error"
                );
            }
            BrokerEvent::Log {
                level,
                facility,
                message,
            } => log_broker_message(level, &facility, &message),
        }
    }

    fn on_ready(&mut self) {
        if *self.ready.borrow() {
            debug!("Ignoring repeated ready signal");
            return;
        }
        self.ready.send_replace(true);
        info!(
            category = %Category::Lifecycle,
            correlation_id = NO_CORRELATION_ID,
            topics = ?self.topics,
            "Broker ready, subscribing"
        );

        if let Err(e) = self.broker.subscribe(&self.topics) {
            error!(
                category = %Category::Lifecycle,
                correlation_id = NO_CORRELATION_ID,
                error = %e,
                "Failed to subscribe"
            );
            return;
        }
        if let Err(e) = self.broker.consume() {
            error!(
                category = %Category::Lifecycle,
                correlation_id = NO_CORRELATION_ID,
                error = %e,
                "Failed to start consuming"
            );
        }
    }
}

fn log_broker_message(level: tracing::Level, facility: &str, message: &str) {
    if level == tracing::Level::ERROR {
        error!(category = %Category::Broker, correlation_id = NO_CORRELATION_ID, facility, "{}", message);
    } else if level == tracing::Level::WARN {
        warn!(category = %Category::Broker, correlation_id = NO_CORRELATION_ID, facility, "{}", message);
    } else if level == tracing::Level::INFO {
        info!(category = %Category::Broker, correlation_id = NO_CORRELATION_ID, facility, "{}", message);
    } else {
        debug!(category = %Category::Broker, correlation_id = NO_CORRELATION_ID, facility, "{}", message);
    }
}
