use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::ConfigError;
use crate::kafka::config::{ConsumerConfigBuilder, ProducerConfigBuilder};
use crate::kafka::coordinator::CoordinatorConfig;
use crate::kafka::partition_worker::PartitionWorkerConfig;
use crate::retry::RetryPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    /// Batches that may wait in each partition's queue before the poll loop blocks
    #[envconfig(from = "PARTITION_QUEUE_CAPACITY", default = "10")]
    pub partition_queue_capacity: usize,

    #[envconfig(from = "MAX_RECORDS_PER_POLL", default = "500")]
    pub max_records_per_poll: usize,

    #[envconfig(from = "POLL_TIMEOUT_MS", default = "1000")]
    pub poll_timeout: EnvMsDuration,

    #[envconfig(from = "AUTO_COMMIT_INTERVAL_MS", default = "5000")]
    pub auto_commit_interval: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(from = "SHUTDOWN_TIMEOUT_SECS", default = "30")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_HOSTS", default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "tx-stream")]
    pub kafka_consumer_group: String,

    #[envconfig(from = "KAFKA_CONSUMER_TOPIC", default = "transactions")]
    pub kafka_consumer_topic: String,

    /// earliest, latest
    #[envconfig(from = "KAFKA_CONSUMER_OFFSET_RESET", default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(from = "KAFKA_TLS", default = "false")]
    pub kafka_tls: bool,

    #[envconfig(from = "KAFKA_OUTPUT_TOPIC", default = "transactions_stored")]
    pub kafka_output_topic: String,

    #[envconfig(from = "KAFKA_DLQ_TOPIC", default = "transactions_dlq")]
    pub kafka_dlq_topic: String,

    #[envconfig(from = "KAFKA_PRODUCER_LINGER_MS", default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(from = "KAFKA_MESSAGE_TIMEOUT_MS", default = "20000")]
    pub kafka_message_timeout_ms: u32,

    /// none, gzip, snappy, lz4, zstd
    #[envconfig(from = "KAFKA_COMPRESSION_CODEC", default = "none")]
    pub kafka_compression_codec: String,

    #[envconfig(from = "KAFKA_STATISTICS_INTERVAL_MS", default = "10000")]
    pub kafka_statistics_interval: EnvMsDuration,

    /// Longest a slow partition may hold up the poll loop before the member is evicted
    #[envconfig(from = "KAFKA_MAX_POLL_INTERVAL_MS", default = "300000")]
    pub kafka_max_poll_interval_ms: u32,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryPolicyConfig {
    /// Processing attempts per batch before it is dead-lettered
    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "3")]
    pub max_attempts: u32,

    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL_MS", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL_MS")]
    pub maximum_interval: Option<EnvMsDuration>,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("KAFKA_HOSTS", &self.kafka.kafka_hosts),
            ("KAFKA_CONSUMER_GROUP", &self.kafka.kafka_consumer_group),
            ("KAFKA_CONSUMER_TOPIC", &self.kafka.kafka_consumer_topic),
            ("KAFKA_OUTPUT_TOPIC", &self.kafka.kafka_output_topic),
            ("KAFKA_DLQ_TOPIC", &self.kafka.kafka_dlq_topic),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(name));
            }
        }

        if self.partition_queue_capacity == 0 {
            return Err(ConfigError::Zero("PARTITION_QUEUE_CAPACITY"));
        }
        if self.max_records_per_poll == 0 {
            return Err(ConfigError::Zero("MAX_RECORDS_PER_POLL"));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(ConfigError::Zero("RETRY_MAX_ATTEMPTS"));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let mut builder = RetryPolicy::build(
            self.retry_policy.max_attempts,
            self.retry_policy.initial_interval.0,
        )
        .backoff_coefficient(self.retry_policy.backoff_coefficient);

        if let Some(maximum) = self.retry_policy.maximum_interval {
            builder = builder.maximum_interval(maximum.0);
        }

        builder.provide()
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            worker: PartitionWorkerConfig {
                queue_capacity: self.partition_queue_capacity,
                retry_policy: self.retry_policy(),
            },
            max_records_per_poll: self.max_records_per_poll,
            auto_commit_interval: self.auto_commit_interval.0,
        }
    }

    pub fn consumer_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::new(&self.kafka.kafka_hosts, &self.kafka.kafka_consumer_group)
            .with_tls(self.kafka.kafka_tls)
            .with_offset_reset(&self.kafka.kafka_consumer_offset_reset)
            .with_statistics_interval(self.kafka.kafka_statistics_interval.0)
            .with_max_poll_interval_ms(self.kafka.kafka_max_poll_interval_ms)
            .build()
    }

    pub fn producer_config(&self) -> ClientConfig {
        ProducerConfigBuilder::new(&self.kafka.kafka_hosts)
            .with_tls(self.kafka.kafka_tls)
            .with_linger_ms(self.kafka.kafka_producer_linger_ms)
            .with_message_timeout_ms(self.kafka.kafka_message_timeout_ms)
            .with_compression_codec(&self.kafka.kafka_compression_codec)
            .build()
    }

    pub fn shutdown_timeout(&self) -> time::Duration {
        time::Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// How long leaving the group may take. Kept below the shutdown timeout so
    /// the blocking close loop gives up before the service stops waiting on it.
    pub fn close_timeout(&self) -> time::Duration {
        let shutdown_timeout = self.shutdown_timeout();
        shutdown_timeout - shutdown_timeout / 10
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
