// Kafka module - broker capability, rebalance coordination and record dispatch
pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod context;
pub mod dispatch;
pub mod offset_tracker;
pub mod rebalance;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Public API
pub use broker::{BrokerClient, BrokerEvent, RebalanceSignal};
pub use client::KafkaBroker;
pub use config::ConsumerConfigBuilder;
pub use consumer::{ConsumerHandle, EventConsumer};
