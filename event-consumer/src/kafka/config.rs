use rdkafka::ClientConfig;

use crate::config::ConsumerConfig;

/// rdkafka configuration builder for group consumers with manual commits.
///
/// Auto commit and auto offset store are forced off in `build`, whatever was
/// passed to `set`: an offset is only committed once its record was handled.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Create a config builder for a group consumer.
    ///
    /// Sets: socket.timeout.ms, session.timeout.ms, heartbeat.interval.ms,
    /// max.poll.interval.ms on top of the mandatory manual-commit settings.
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    pub fn from_consumer_config(config: &ConsumerConfig) -> Self {
        Self::new(&config.brokers, &config.group_id)
            .with_tls(config.tls)
            .with_offset_reset(config.offset_reset.as_str())
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    /// Override offset reset policy
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Build the final configuration
    pub fn build(mut self) -> ClientConfig {
        self.config
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffsetReset;

    #[test]
    fn test_consumer_config_is_translated() {
        let mut consumer_config =
            ConsumerConfig::new("kafka:9092", "mailer", vec!["user".to_string()]);
        consumer_config.offset_reset = OffsetReset::Latest;
        consumer_config.tls = true;

        let config = ConsumerConfigBuilder::from_consumer_config(&consumer_config).build();

        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(config.get("group.id"), Some("mailer"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
    }

    #[test]
    fn test_auto_commit_cannot_be_enabled() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "group")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "true")
            .build();

        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
    }

    #[test]
    fn test_defaults() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "group").build();

        assert_eq!(config.get("session.timeout.ms"), Some("60000"));
        assert_eq!(config.get("max.poll.interval.ms"), Some("300000"));
        assert_eq!(config.get("security.protocol"), None);
        // No stats callback is installed, so librdkafka must not emit statistics
        assert_eq!(config.get("statistics.interval.ms"), None);
    }

    #[test]
    fn test_custom_settings_are_kept() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "group")
            .set("session.timeout.ms", "30000")
            .build();

        assert_eq!(config.get("session.timeout.ms"), Some("30000"));
    }
}
