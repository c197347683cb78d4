use std::time::Duration;

use rdkafka::ClientConfig;

/// Kafka consumer configuration builder for the group consumer.
///
/// Offsets are stored and committed by the service itself: a record only becomes
/// committable after its batch was processed or dead-lettered, so librdkafka's
/// automatic offset store and automatic commit are both disabled.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("partition.assignment.strategy", "cooperative-sticky")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
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

    /// Where to start when the group has no committed offset (earliest, latest)
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Emit librdkafka statistics to the consumer context at this interval
    pub fn with_statistics_interval(mut self, interval: Duration) -> Self {
        self.config
            .set("statistics.interval.ms", interval.as_millis().to_string());
        self
    }

    /// Set maximum time between poll() calls before consumer leaves group
    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Kafka producer configuration builder, shared by the output and dead letter producers
pub struct ProducerConfigBuilder {
    config: ClientConfig,
}

impl ProducerConfigBuilder {
    pub fn new(bootstrap_servers: &str) -> Self {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("statistics.interval.ms", "10000");

        Self { config }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Maximum time between producer batches during low traffic
    pub fn with_linger_ms(mut self, ms: u32) -> Self {
        self.config.set("linger.ms", ms.to_string());
        self
    }

    /// Time before we stop retrying producing a message
    pub fn with_message_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("message.timeout.ms", ms.to_string());
        self
    }

    /// none, gzip, snappy, lz4, zstd
    pub fn with_compression_codec(mut self, codec: &str) -> Self {
        self.config.set("compression.codec", codec);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_defaults_disable_automatic_offset_handling() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "tx-stream").build();

        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(config.get("group.id"), Some("tx-stream"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(
            config.get("partition.assignment.strategy"),
            Some("cooperative-sticky")
        );
    }

    #[test]
    fn test_consumer_overrides() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "tx-stream")
            .with_tls(true)
            .with_offset_reset("latest")
            .with_statistics_interval(Duration::from_secs(10))
            .build();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("statistics.interval.ms"), Some("10000"));
    }

    #[test]
    fn test_tls_disabled_leaves_protocol_unset() {
        let config = ProducerConfigBuilder::new("kafka:9092")
            .with_tls(false)
            .with_linger_ms(20)
            .with_compression_codec("snappy")
            .build();

        assert_eq!(config.get("security.protocol"), None);
        assert_eq!(config.get("linger.ms"), Some("20"));
        assert_eq!(config.get("compression.codec"), Some("snappy"));
    }
}
