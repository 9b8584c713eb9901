use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use event_consumer::config::ConsumerConfig;
use event_consumer::error::ConsumerError;
use event_consumer::kafka::test_utils::{
    json_record, partition, wait_until, LogCapture, MockBroker, RecordingHandler,
};
use event_consumer::kafka::broker::EventReceiver;
use event_consumer::kafka::types::PartitionOffset;
use event_consumer::kafka::{BrokerEvent, ConsumerHandle, EventConsumer, RebalanceSignal};
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(2);

fn test_config() -> ConsumerConfig {
    ConsumerConfig::new("localhost:9092", "test-group", vec!["user".to_string()])
}

async fn connected(
    broker: &Arc<MockBroker>,
    events: EventReceiver,
    handler: &Arc<RecordingHandler>,
) -> ConsumerHandle {
    connected_with(test_config(), broker, events, handler).await
}

async fn connected_with(
    config: ConsumerConfig,
    broker: &Arc<MockBroker>,
    events: EventReceiver,
    handler: &Arc<RecordingHandler>,
) -> ConsumerHandle {
    EventConsumer::new(config, broker.clone(), events)
        .connect(handler.clone())
        .await
        .expect("consumer should connect")
}

#[tokio::test(start_paused = true)]
async fn connect_resolves_shortly_after_ready() {
    let (broker, events) = MockBroker::ready_after(Duration::from_millis(100));
    let handler = Arc::new(RecordingHandler::new());

    let started = Instant::now();
    let handle = connected(&broker, events, &handler).await;

    assert!(started.elapsed() <= Duration::from_millis(110));
    assert!(handle.is_ready());
    assert_eq!(broker.connect_calls(), 1);
    assert_eq!(broker.subscriptions(), vec![vec!["user".to_string()]]);
    assert!(broker.is_consuming());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_when_never_ready() {
    let (broker, events) = MockBroker::never_ready();
    let handler = Arc::new(RecordingHandler::new());

    let started = Instant::now();
    let result = EventConsumer::new(test_config(), broker.clone(), events)
        .connect(handler)
        .await;
    let elapsed = started.elapsed();

    match result {
        Err(ConsumerError::ConnectionTimeout(timeout)) => {
            assert_eq!(timeout, Duration::from_millis(3000))
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("connect should not resolve without a ready signal"),
    }
    assert!(elapsed >= Duration::from_millis(3000));
    assert!(elapsed < Duration::from_millis(3100));
    assert!(broker.subscriptions().is_empty());
    assert!(!broker.is_consuming());
}

#[tokio::test(start_paused = true)]
async fn closed_event_channel_still_times_out() {
    let capture = LogCapture::new();
    let _guard = capture.install();

    let (broker, _unused) = MockBroker::never_ready();
    let (sender, events) = tokio::sync::mpsc::unbounded_channel();
    drop(sender);
    let handler = Arc::new(RecordingHandler::new());

    let started = Instant::now();
    let result = EventConsumer::new(test_config(), broker, events)
        .connect(handler)
        .await;

    match result {
        Err(ConsumerError::ConnectionTimeout(timeout)) => {
            assert_eq!(timeout, Duration::from_millis(3000))
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("connect should not resolve without a ready signal"),
    }
    assert!(started.elapsed() >= Duration::from_millis(3000));
    assert!(capture.contains(&["channel closed before the consumer became ready"]));
}

#[tokio::test(start_paused = true)]
async fn readiness_is_observable_while_connecting() {
    let (broker, events) = MockBroker::ready_after(Duration::from_millis(100));
    let handler = Arc::new(RecordingHandler::new());

    let consumer = EventConsumer::new(test_config(), broker, events);
    let is_ready = consumer.readiness_probe();
    assert!(!is_ready());

    let handle = consumer.connect(handler).await.unwrap();
    assert!(is_ready());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connect_honours_configured_timeout() {
    let (broker, events) = MockBroker::ready_after(Duration::from_millis(800));
    let handler = Arc::new(RecordingHandler::new());
    let mut config = test_config();
    config.connect_timeout = Duration::from_millis(500);

    let started = Instant::now();
    let result = EventConsumer::new(config, broker, events).connect(handler).await;

    assert!(matches!(result, Err(ConsumerError::ConnectionTimeout(_))));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(510));
}

#[tokio::test]
async fn successful_record_commits_next_offset() {
    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new());
    let handle = connected(&broker, events, &handler).await;

    broker.deliver(json_record("user", 0, 41, "g1"));

    assert!(wait_until(|| !broker.commits().is_empty(), WAIT).await);
    assert_eq!(
        broker.commits(),
        vec![PartitionOffset::new(partition("user", 0), 42)]
    );
    assert_eq!(handler.handled_events()[0].correlation_id(), "g1");

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_record_is_logged_and_not_committed() {
    let capture = LogCapture::new();
    let _guard = capture.install();

    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new().failing_on(&[41]));
    let handle = connected(&broker, events, &handler).await;

    broker.deliver(json_record("user", 0, 41, "g1"));

    assert!(
        wait_until(
            || capture.contains(&["ERROR", "correlation_id=g1", "offset=41", "boom"]),
            WAIT
        )
        .await,
        "missing failure log in {:?}",
        capture.lines()
    );

    handle.shutdown().await.unwrap();
    assert_eq!(handler.handled_offsets(), vec![41]);
    assert!(broker.commit_attempts().is_empty());
}

#[tokio::test]
async fn failure_does_not_block_following_records() {
    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new().failing_on(&[10]).panicking_on(&[20]));
    let handle = connected(&broker, events, &handler).await;

    broker.deliver(json_record("user", 0, 10, "a"));
    broker.deliver(json_record("user", 0, 11, "b"));
    broker.deliver(json_record("user", 1, 20, "c"));
    broker.deliver(json_record("user", 1, 21, "d"));

    assert!(wait_until(|| broker.commits().len() == 2, WAIT).await);
    handle.shutdown().await.unwrap();

    let mut handled = handler.handled_offsets();
    handled.sort();
    assert_eq!(handled, vec![10, 11, 20, 21]);

    let committed: Vec<i64> = broker.commit_attempts().iter().map(|c| c.offset()).collect();
    assert!(!committed.contains(&11));
    assert!(!committed.contains(&21));
    assert_eq!(
        broker.committed_offsets(),
        HashMap::from([(partition("user", 0), 12), (partition("user", 1), 22)])
    );
}

#[tokio::test]
async fn every_handled_record_is_covered_by_a_commit() {
    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new().delaying(0, Duration::from_millis(50)));
    let handle = connected(&broker, events, &handler).await;

    for offset in 0..20 {
        broker.deliver(json_record("user", (offset % 3) as i32, offset, "g"));
    }

    assert!(wait_until(|| broker.commits().len() == 20, WAIT).await);
    handle.shutdown().await.unwrap();

    let committed = broker.committed_offsets();
    for event in handler.handled_events() {
        let cursor = committed[&partition(&event.topic, event.partition)];
        assert!(cursor >= event.offset + 1);
    }

    // Commits never move backwards within a partition
    for n in 0..3 {
        let cursors: Vec<i64> = broker
            .commits()
            .iter()
            .filter(|c| c.partition_number() == n)
            .map(|c| c.offset())
            .collect();
        assert!(cursors.windows(2).all(|w| w[0] < w[1]), "{cursors:?}");
    }
}

#[tokio::test]
async fn commit_failure_does_not_stop_consumption() {
    let (broker, events) = MockBroker::new();
    broker.fail_commits(true);
    let handler = Arc::new(RecordingHandler::new());
    let handle = connected(&broker, events, &handler).await;

    broker.deliver(json_record("user", 0, 1, "a"));
    assert!(wait_until(|| broker.commit_attempts().len() == 1, WAIT).await);

    broker.fail_commits(false);
    broker.deliver(json_record("user", 0, 2, "b"));
    assert!(wait_until(|| broker.commits().len() == 1, WAIT).await);

    handle.shutdown().await.unwrap();
    assert_eq!(broker.commit_attempts().len(), 2);
    assert_eq!(broker.committed_offsets()[&partition("user", 0)], 3);
}

#[tokio::test]
async fn assignment_is_tracked_and_probed() {
    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new());
    let handle = connected(&broker, events, &handler).await;

    broker.rebalance(RebalanceSignal::Assign(vec![partition("user", 0)]));

    assert!(wait_until(|| !broker.watermark_queries().is_empty(), WAIT).await);
    assert!(handle.assignment().contains(&partition("user", 0)));
    assert_eq!(handle.assignment().len(), 1);
    assert_eq!(broker.watermark_queries(), vec![partition("user", 0)]);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn rejected_assignment_does_not_stop_later_rebalances() {
    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new());
    let handle = connected(&broker, events, &handler).await;

    broker.fail_next_assign();
    broker.rebalance(RebalanceSignal::Assign(vec![partition("user", 0)]));
    broker.rebalance(RebalanceSignal::Error("Local: Erroneous state".to_string()));
    broker.rebalance(RebalanceSignal::Assign(vec![partition("user", 1)]));

    assert!(wait_until(|| handle.assignment().contains(&partition("user", 1)), WAIT).await);
    assert!(!handle.assignment().contains(&partition("user", 0)));
    assert_eq!(broker.assigns().len(), 2);

    // Records keep flowing after the failed rebalance
    broker.deliver(json_record("user", 1, 5, "g5"));
    assert!(wait_until(|| broker.commits().len() == 1, WAIT).await);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn revoked_partitions_are_released() {
    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new());
    let handle = connected(&broker, events, &handler).await;

    broker.rebalance(RebalanceSignal::Assign(vec![
        partition("user", 0),
        partition("user", 1),
    ]));
    broker.deliver(json_record("user", 0, 1, "a"));
    broker.rebalance(RebalanceSignal::Revoke(vec![partition("user", 0)]));

    assert!(wait_until(|| broker.unassigns().len() == 1, WAIT).await);
    assert!(wait_until(|| !handle.assignment().contains(&partition("user", 0)), WAIT).await);
    assert!(handle.assignment().contains(&partition("user", 1)));
    // The record queued before the revocation was still finished
    assert!(wait_until(|| broker.commits().len() == 1, WAIT).await);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn broker_errors_are_logged_and_consumption_continues() {
    let capture = LogCapture::new();
    let _guard = capture.install();

    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new());
    let handle = connected(&broker, events, &handler).await;

    broker.emit(BrokerEvent::Error("Local: Broker transport failure".to_string()));
    broker.emit(BrokerEvent::Disconnected("all brokers down".to_string()));
    broker.deliver(json_record("user", 0, 7, "g7"));

    assert!(wait_until(|| broker.commits().len() == 1, WAIT).await);
    assert!(capture.contains(&["category=broker", "unclassified consumer error"]));
    assert!(capture.contains(&["category=lifecycle", "Consumer disconnected"]));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_in_flight_records() {
    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new().delaying(3, Duration::from_millis(100)));
    let handle = connected(&broker, events, &handler).await;

    broker.deliver(json_record("user", 0, 3, "a"));
    broker.deliver(json_record("user", 0, 4, "b"));
    assert!(wait_until(|| !handler.handled_offsets().is_empty(), WAIT).await);

    handle.shutdown().await.unwrap();

    assert_eq!(handler.handled_offsets(), vec![3, 4]);
    assert_eq!(broker.committed_offsets()[&partition("user", 0)], 5);
}

#[tokio::test]
async fn repeated_ready_signal_subscribes_once() {
    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new());
    let handle = connected(&broker, events, &handler).await;

    broker.emit(BrokerEvent::Ready);
    broker.deliver(json_record("user", 0, 1, "a"));
    assert!(wait_until(|| broker.commits().len() == 1, WAIT).await);

    assert_eq!(broker.subscriptions().len(), 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn hung_partition_does_not_stall_other_partitions() {
    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new().delaying(0, Duration::from_secs(3600)));
    let mut config = test_config();
    config.partition_queue_size = 4;
    let handle = connected_with(config, &broker, events, &handler).await;

    for offset in 0..1002 {
        broker.deliver(json_record("user", 0, offset, "stuck"));
    }
    broker.deliver(json_record("user", 1, 7, "g7"));

    assert!(wait_until(|| !broker.commits().is_empty(), WAIT).await);
    assert_eq!(
        broker.commits(),
        vec![PartitionOffset::new(partition("user", 1), 8)]
    );
    // Fetching stops for the partition that cannot keep up
    assert_eq!(broker.paused(), vec![partition("user", 0)]);
    assert!(handle.is_ready());
}

#[tokio::test]
async fn revoking_a_hung_partition_does_not_stall_rebalances() {
    let (broker, events) = MockBroker::new();
    let handler = Arc::new(RecordingHandler::new().delaying(0, Duration::from_secs(3600)));
    let handle = connected(&broker, events, &handler).await;

    broker.rebalance(RebalanceSignal::Assign(vec![
        partition("user", 0),
        partition("user", 1),
    ]));
    broker.deliver(json_record("user", 0, 0, "stuck"));
    assert!(wait_until(|| handler.handled_offsets() == vec![0], WAIT).await);

    broker.rebalance(RebalanceSignal::Revoke(vec![partition("user", 0)]));
    broker.deliver(json_record("user", 1, 7, "g7"));
    broker.rebalance(RebalanceSignal::Assign(vec![
        partition("user", 1),
        partition("user", 2),
    ]));

    assert!(wait_until(|| handle.assignment().contains(&partition("user", 2)), WAIT).await);
    assert!(wait_until(|| broker.commits().len() == 1, WAIT).await);
    assert_eq!(
        broker.commits(),
        vec![PartitionOffset::new(partition("user", 1), 8)]
    );
    assert!(!handle.assignment().contains(&partition("user", 0)));
    assert_eq!(broker.unassigns(), vec![vec![partition("user", 0)]]);
}
