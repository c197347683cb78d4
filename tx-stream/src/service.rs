use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dead_letter::KafkaDeadLetterSink;
use crate::error::ConsumerError;
use crate::kafka::producer::create_producer;
use crate::kafka::{
    GroupClient, GroupCoordinator, KafkaGroupClient, OffsetTracker, RebalanceListener,
};
use crate::processor::TransactionProcessor;

/// Wires the consumer group client, the coordinator and its collaborators
pub struct TxStreamService {
    config: Config,
    coordinator: Arc<GroupCoordinator>,
    client: KafkaGroupClient,
}

impl TxStreamService {
    /// Build every component and join the consumer group. Must be called within a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for consumer topic '{}' and group '{}'",
                config.kafka.kafka_consumer_topic, config.kafka.kafka_consumer_group
            )
        })?;

        let producer = Arc::new(
            create_producer(&config.producer_config())
                .with_context(|| format!("Failed to create producer for {}", config.kafka.kafka_hosts))?,
        );

        let processor = Arc::new(TransactionProcessor::new(
            producer.clone(),
            config.kafka.kafka_output_topic.clone(),
        ));
        let dead_letter = Arc::new(KafkaDeadLetterSink::new(
            producer,
            config.kafka.kafka_dlq_topic.clone(),
        ));
        let offsets = Arc::new(OffsetTracker::new());

        let coordinator = Arc::new(GroupCoordinator::new(
            processor,
            dead_letter,
            offsets.clone(),
            config.coordinator_config(),
        ));

        let client = KafkaGroupClient::new(
            &config.consumer_config(),
            &config.kafka.kafka_consumer_topic,
            coordinator.clone(),
            offsets,
            config.poll_timeout.0,
            config.close_timeout(),
        )
        .with_context(|| {
            format!(
                "Failed to create consumer for topic '{}'",
                config.kafka.kafka_consumer_topic
            )
        })?;

        Ok(Self {
            config,
            coordinator,
            client,
        })
    }

    /// Consume until `shutdown` is cancelled or the client fails, then leave the group.
    ///
    /// Leaving the group revokes every owned partition, which drains the
    /// workers and commits their offsets through the regular revoke path.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            coordinator,
            client,
        } = self;

        info!(
            topic = %config.kafka.kafka_consumer_topic,
            group = %config.kafka.kafka_consumer_group,
            "Starting poll loop"
        );

        let result = coordinator.poll_loop(&client, &shutdown).await;
        match &result {
            Ok(()) => info!("Poll loop stopped"),
            Err(ConsumerError::Canceled) if shutdown.is_cancelled() => {
                info!("Poll loop canceled by shutdown")
            }
            Err(e) => error!(error = ?e, "Poll loop failed"),
        }

        let shutdown_timeout = config.shutdown_timeout();
        if tokio::time::timeout(shutdown_timeout, client.close())
            .await
            .is_err()
        {
            warn!(timeout = ?shutdown_timeout, "Timed out leaving the consumer group");
        }

        abandon_remaining_partitions(&coordinator).await;

        // librdkafka may still run rebalance callbacks while the consumer is destroyed
        if let Err(e) = tokio::task::spawn_blocking(move || drop(client)).await {
            warn!(error = ?e, "Failed to release the consumer");
        }

        match result {
            Ok(()) => Ok(()),
            Err(ConsumerError::Canceled) if shutdown.is_cancelled() => Ok(()),
            Err(e) => Err(e).context("Consumer stopped unexpectedly"),
        }
    }
}

/// Partitions still assigned after close could not be revoked in time. They are
/// handed to `on_lost`, which stops their workers and forgets their marks, so
/// nothing is committed for them when the consumer is finally destroyed.
async fn abandon_remaining_partitions(coordinator: &GroupCoordinator) {
    let remaining = coordinator.assigned_partitions();
    if remaining.is_empty() {
        return;
    }

    warn!(
        partition_count = remaining.len(),
        "Partitions still assigned after close, treating them as lost"
    );
    coordinator.on_lost(&remaining).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kafka::types::Partition;
    use crate::kafka::CoordinatorConfig;
    use crate::test_utils::{RecordingDeadLetterSink, RecordingProcessor};

    #[tokio::test]
    async fn test_partitions_left_after_close_are_dropped_without_marks() {
        let offsets = Arc::new(OffsetTracker::new());
        let coordinator = GroupCoordinator::new(
            Arc::new(RecordingProcessor::new()),
            Arc::new(RecordingDeadLetterSink::new()),
            offsets.clone(),
            CoordinatorConfig::default(),
        );
        let p0 = Partition::new("transactions".to_string(), 0);
        coordinator.on_assigned(&[p0.clone()]).await;

        offsets.mark(&p0, 5);
        assert_eq!(offsets.pending_commits().get(&p0), Some(&5));

        abandon_remaining_partitions(&coordinator).await;

        assert_eq!(coordinator.worker_count(), 0);
        assert_eq!(offsets.marked_offset(&p0), None);
        assert!(offsets.pending_commits().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_to_abandon_after_clean_close() {
        let offsets = Arc::new(OffsetTracker::new());
        let coordinator = GroupCoordinator::new(
            Arc::new(RecordingProcessor::new()),
            Arc::new(RecordingDeadLetterSink::new()),
            offsets,
            CoordinatorConfig::default(),
        );

        abandon_remaining_partitions(&coordinator).await;
        assert_eq!(coordinator.worker_count(), 0);
    }
}
