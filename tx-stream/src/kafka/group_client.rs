//! rdkafka implementation of [`GroupClient`].
//!
//! librdkafka only serves rebalance callbacks from inside `poll`, so every poll
//! runs on a blocking thread and the consumer context drives the async
//! [`RebalanceListener`] to completion with `Handle::block_on`. A rebalance
//! therefore cannot start while the poll loop is busy routing batches, and the
//! listener sees one event at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientConfig, ClientContext, Offset, Statistics, TopicPartitionList};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::error::{CommitError, ConsumerError};
use crate::kafka::client::{GroupClient, OffsetCommitter, RebalanceListener};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::{ConsumedRecord, FetchError, Fetches, Partition};
use crate::metrics_consts::{
    CONSUMER_LAG, FETCH_ERRORS_COUNTER, OFFSET_COMMITS_COUNTER, OFFSET_COMMIT_FAILURES_COUNTER,
    REBALANCE_EVENTS_COUNTER, RECORDS_FETCHED_COUNTER,
};

pub struct GroupConsumerContext {
    listener: Arc<dyn RebalanceListener>,
    offsets: Arc<OffsetTracker>,
    /// Handle to the async runtime for executing async callbacks from sync context
    rt_handle: Handle,
}

impl GroupConsumerContext {
    pub fn new(
        listener: Arc<dyn RebalanceListener>,
        offsets: Arc<OffsetTracker>,
        rt_handle: Handle,
    ) -> Self {
        Self {
            listener,
            offsets,
            rt_handle,
        }
    }
}

fn to_partitions(tpl: &TopicPartitionList) -> Vec<Partition> {
    tpl.elements().into_iter().map(Partition::from).collect()
}

impl ClientContext for GroupConsumerContext {
    fn stats(&self, stats: Statistics) {
        for (topic, topic_stats) in stats.topics {
            for (partition, partition_stats) in topic_stats.partitions {
                // librdkafka reports -1 for the internal UA partition and for unknown lag
                if partition < 0 || partition_stats.consumer_lag < 0 {
                    continue;
                }
                metrics::gauge!(
                    CONSUMER_LAG,
                    "topic" => topic.clone(),
                    "partition" => partition.to_string()
                )
                .set(partition_stats.consumer_lag as f64);
            }
        }
    }
}

impl ConsumerContext for GroupConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                // cooperative-sticky sends these whenever group membership changes
                if tpl.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }

                let partitions = to_partitions(tpl);
                if base_consumer.assignment_lost() {
                    metrics::counter!(REBALANCE_EVENTS_COUNTER, "event_type" => "lost")
                        .increment(1);
                    warn!("Assignment lost for {} partitions", partitions.len());
                    self.rt_handle.block_on(self.listener.on_lost(&partitions));
                } else {
                    metrics::counter!(REBALANCE_EVENTS_COUNTER, "event_type" => "revoke")
                        .increment(1);
                    info!("Revoking {} partitions", partitions.len());
                    let committer = RebalanceCommitter {
                        consumer: base_consumer,
                        offsets: &self.offsets,
                    };
                    self.rt_handle
                        .block_on(self.listener.on_revoked(&committer, &partitions));
                }
            }
            Rebalance::Assign(tpl) => {
                debug!("Pre-rebalance assign event for {} partitions", tpl.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                if tpl.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    return;
                }

                metrics::counter!(REBALANCE_EVENTS_COUNTER, "event_type" => "assign").increment(1);
                info!("Assigned {} partitions", tpl.count());
                let partitions = to_partitions(tpl);
                self.rt_handle.block_on(self.listener.on_assigned(&partitions));
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}

/// Commit every pending mark of `offsets` synchronously
fn commit_tracked_offsets<C: ConsumerContext>(
    consumer: &BaseConsumer<C>,
    offsets: &OffsetTracker,
) -> Result<(), CommitError> {
    let pending = offsets.pending_commits();
    if pending.is_empty() {
        return Ok(());
    }

    let mut tpl = TopicPartitionList::new();
    for (partition, offset) in &pending {
        tpl.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(*offset),
        )
        .map_err(CommitError::rejected)?;
    }

    if let Err(e) = consumer.commit(&tpl, CommitMode::Sync) {
        metrics::counter!(OFFSET_COMMIT_FAILURES_COUNTER).increment(1);
        return Err(CommitError::rejected(e));
    }

    offsets.mark_committed(&pending);
    metrics::counter!(OFFSET_COMMITS_COUNTER).increment(1);
    debug!("Committed marked offsets for {} partitions", pending.len());
    Ok(())
}

/// Committer handed to the listener while a revocation is in progress. It
/// borrows the consumer the callback was invoked with and commits on the
/// callback's own thread.
struct RebalanceCommitter<'a> {
    consumer: &'a BaseConsumer<GroupConsumerContext>,
    offsets: &'a OffsetTracker,
}

#[async_trait]
impl OffsetCommitter for RebalanceCommitter<'_> {
    async fn commit_marked_offsets(&self) -> Result<(), CommitError> {
        commit_tracked_offsets(self.consumer, self.offsets)
    }
}

pub struct KafkaGroupClient {
    consumer: Arc<BaseConsumer<GroupConsumerContext>>,
    topic: String,
    offsets: Arc<OffsetTracker>,
    poll_timeout: Duration,
    close_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaGroupClient {
    /// Create the consumer and subscribe to `topic`. Must be called within a tokio runtime.
    pub fn new(
        config: &ClientConfig,
        topic: &str,
        listener: Arc<dyn RebalanceListener>,
        offsets: Arc<OffsetTracker>,
        poll_timeout: Duration,
        close_timeout: Duration,
    ) -> Result<Self, KafkaError> {
        let context = GroupConsumerContext::new(listener, offsets.clone(), Handle::current());
        let consumer: BaseConsumer<GroupConsumerContext> = config.create_with_context(context)?;
        consumer.subscribe(&[topic])?;

        info!(topic = topic, "Subscribed to topic");

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: topic.to_string(),
            offsets,
            poll_timeout,
            close_timeout,
            closed: AtomicBool::new(false),
        })
    }
}

/// Poll until `max_records` are collected or the poll timeout expires.
/// Only the first record is waited for; after that whatever is buffered is taken.
fn poll_batch<C: ConsumerContext>(
    consumer: &BaseConsumer<C>,
    topic: &str,
    max_records: usize,
    poll_timeout: Duration,
) -> Result<Fetches, ConsumerError> {
    let deadline = Instant::now() + poll_timeout;
    let mut records = Vec::new();
    let mut errors = Vec::new();

    while records.len() < max_records {
        let wait = if records.is_empty() {
            deadline.saturating_duration_since(Instant::now())
        } else {
            Duration::ZERO
        };

        match consumer.poll(wait) {
            None => break,
            Some(Ok(message)) => records.push(ConsumedRecord::from_borrowed_message(&message)),
            Some(Err(KafkaError::Canceled)) => return Err(ConsumerError::Canceled),
            Some(Err(KafkaError::MessageConsumptionFatal(code))) => {
                error!("Fatal consumer error: {:?}", code);
                return Err(ConsumerError::ClientClosed);
            }
            Some(Err(e)) => errors.push(fetch_error(topic, e)),
        }
    }

    Ok(Fetches::from_records(records, errors))
}

/// Keep the partition on errors that name one, so they are logged against it
fn fetch_error(topic: &str, error: KafkaError) -> FetchError {
    let partition = match &error {
        KafkaError::PartitionEOF(partition) => {
            Some(Partition::new(topic.to_string(), *partition))
        }
        _ => None,
    };
    FetchError::new(partition, anyhow::Error::new(error))
}

#[async_trait]
impl OffsetCommitter for KafkaGroupClient {
    async fn commit_marked_offsets(&self) -> Result<(), CommitError> {
        let consumer = self.consumer.clone();
        let offsets = self.offsets.clone();

        tokio::task::spawn_blocking(move || commit_tracked_offsets(&consumer, &offsets))
            .await
            .map_err(|e| CommitError::TaskFailed(e.to_string()))?
    }
}

#[async_trait]
impl GroupClient for KafkaGroupClient {
    async fn poll_records(&self, max_records: usize) -> Result<Fetches, ConsumerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumerError::ClientClosed);
        }

        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let poll_timeout = self.poll_timeout;
        let fetches = tokio::task::spawn_blocking(move || {
            poll_batch(&consumer, &topic, max_records, poll_timeout)
        })
        .await
        .map_err(|e| {
            error!("Poll task failed: {}", e);
            ConsumerError::ClientClosed
        })??;

        metrics::counter!(RECORDS_FETCHED_COUNTER)
            .increment(u64::try_from(fetches.record_count()).unwrap_or_default());
        if !fetches.errors.is_empty() {
            metrics::counter!(FETCH_ERRORS_COUNTER)
                .increment(u64::try_from(fetches.errors.len()).unwrap_or_default());
        }

        Ok(fetches)
    }

    fn allow_rebalance(&self) {
        // Rebalance callbacks only run inside poll, nothing is held back between polls
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let consumer = self.consumer.clone();
        let close_timeout = self.close_timeout;
        let released = tokio::task::spawn_blocking(move || {
            consumer.unsubscribe();

            // Keep serving callbacks so the final revocation runs through the listener.
            // Records still delivered here are never marked and will be redelivered.
            let deadline = Instant::now() + close_timeout;
            while Instant::now() < deadline {
                if let Some(Err(e)) = consumer.poll(Duration::from_millis(100)) {
                    debug!("Error while closing consumer: {}", e);
                }
                match consumer.assignment() {
                    Ok(tpl) if tpl.count() == 0 => return true,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Failed to read assignment while closing: {}", e);
                        return false;
                    }
                }
            }
            false
        })
        .await;

        match released {
            Ok(true) => info!("Consumer left the group"),
            Ok(false) => warn!("Consumer still owned partitions when closing timed out"),
            Err(e) => error!("Close task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::error::RDKafkaErrorCode;

    use super::*;

    #[test]
    fn test_to_partitions() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("transactions", 0);
        tpl.add_partition("transactions", 3);

        let partitions = to_partitions(&tpl);

        assert_eq!(
            partitions,
            vec![
                Partition::new("transactions".to_string(), 0),
                Partition::new("transactions".to_string(), 3),
            ]
        );
    }

    #[test]
    fn test_partition_eof_keeps_its_partition() {
        let error = fetch_error("transactions", KafkaError::PartitionEOF(4));

        assert_eq!(
            error.partition,
            Some(Partition::new("transactions".to_string(), 4))
        );
        assert!(error.error.to_string().contains("Partition EOF"));
    }

    #[test]
    fn test_client_wide_poll_error_has_no_partition() {
        let error = fetch_error(
            "transactions",
            KafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure),
        );

        assert!(error.partition.is_none());
    }

    #[test]
    fn test_empty_tpl_has_no_partitions() {
        let tpl = TopicPartitionList::new();
        assert_eq!(tpl.count(), 0);
        assert!(to_partitions(&tpl).is_empty());
    }
}
