// Kafka module - partition-level consumption on top of a consumer group client
pub mod client;
pub mod config;
pub mod coordinator;
pub mod group_client;
pub mod offset_tracker;
pub mod partition_worker;
pub mod producer;
pub mod types;

// Public API
pub use client::{GroupClient, OffsetCommitter, RebalanceListener};
pub use config::{ConsumerConfigBuilder, ProducerConfigBuilder};
pub use coordinator::{CoordinatorConfig, GroupCoordinator};
pub use group_client::KafkaGroupClient;
pub use offset_tracker::OffsetTracker;
