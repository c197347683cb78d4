//! Partition Worker - one task per owned partition
//!
//! Each assigned partition gets its own worker with a bounded queue, so:
//! 1. Records of a partition are processed one batch at a time, in fetch order
//! 2. Partitions are processed in parallel
//! 3. A slow partition pushes back on the poll loop instead of buffering without bound
//!
//! A worker is supervised through an explicit stop signal and its join handle.
//! Whoever stops a worker must wait for the handle before treating the
//! partition as released.

use std::sync::Arc;

use anyhow::Error;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dead_letter::DeadLetterSink;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::{FetchedBatch, Partition, Record};
use crate::processor::RecordProcessor;
use crate::retry::RetryPolicy;

/// Lifecycle of a partition worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for, or processing, batches
    Running,
    /// Stop was requested while a batch was in flight; finishing that batch
    Draining,
    Stopped,
}

/// Configuration for partition workers
#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Number of batches that may wait in a partition's queue
    pub queue_capacity: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Collaborators a worker needs to bring a batch to a terminal outcome
#[derive(Clone)]
pub struct BatchHandlers {
    pub processor: Arc<dyn RecordProcessor>,
    pub dead_letter: Arc<dyn DeadLetterSink>,
    pub offsets: Arc<OffsetTracker>,
}

/// Handle to the worker task of a single partition
pub struct PartitionWorker {
    partition: Partition,
    sender: mpsc::Sender<FetchedBatch>,
    stop: CancellationToken,
    state: watch::Receiver<WorkerState>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    /// Create the queue and start the worker task. Must be called within a tokio runtime.
    pub fn spawn(
        partition: Partition,
        handlers: BatchHandlers,
        config: &PartitionWorkerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (state_tx, state) = watch::channel(WorkerState::Running);
        let stop = CancellationToken::new();

        let runner = BatchRunner {
            partition: partition.clone(),
            handlers,
            retry_policy: config.retry_policy.clone(),
            rng: StdRng::from_entropy(),
        };
        let handle = tokio::spawn(run_worker(runner, receiver, stop.clone(), state_tx));

        Self {
            partition,
            sender,
            stop,
            state,
            handle: Some(handle),
        }
    }

    /// Get a clone of the sender for use outside of registry guards
    ///
    /// Callers release the registry guard before awaiting on `send`, so a full
    /// queue never blocks rebalance handling.
    pub fn sender(&self) -> mpsc::Sender<FetchedBatch> {
        self.sender.clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Signal the worker to stop. Returns immediately.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for the worker task to finish
    pub async fn wait_stopped(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    error = ?e,
                    "Partition worker panicked"
                );
            }
        }
    }

    /// Stop the worker and wait until it is quiescent
    pub async fn shutdown(mut self) {
        self.stop();
        self.wait_stopped().await;
        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            "Partition worker shut down"
        );
    }
}

async fn run_worker(
    mut runner: BatchRunner,
    mut receiver: mpsc::Receiver<FetchedBatch>,
    stop: CancellationToken,
    state: watch::Sender<WorkerState>,
) {
    let partition = runner.partition.clone();
    info!(
        topic = partition.topic(),
        partition = partition.partition_number(),
        "Starting partition worker"
    );

    loop {
        let batch = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Stop requested while idle"
                );
                break;
            }
            batch = receiver.recv() => match batch {
                Some(batch) => batch,
                None => {
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        "Queue closed"
                    );
                    break;
                }
            },
        };

        let processing = runner.process_batch(batch);
        tokio::pin!(processing);

        let stopping = tokio::select! {
            biased;
            _ = &mut processing => false,
            _ = stop.cancelled() => {
                state.send_replace(WorkerState::Draining);
                info!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Stop requested mid-batch, draining in-flight batch"
                );
                processing.await;
                true
            }
        };

        if stopping {
            break;
        }
    }

    state.send_replace(WorkerState::Stopped);
    info!(
        topic = partition.topic(),
        partition = partition.partition_number(),
        "Partition worker stopped"
    );
}

struct BatchRunner {
    partition: Partition,
    handlers: BatchHandlers,
    retry_policy: RetryPolicy,
    rng: StdRng,
}

impl BatchRunner {
    /// Bring a batch to a terminal outcome and mark it.
    ///
    /// Exhausted batches are dead-lettered; a failing dead letter sink is logged
    /// and the batch is marked anyway.
    async fn process_batch(&mut self, batch: FetchedBatch) {
        let Some(high_offset) = batch.high_offset() else {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                "Ignoring empty batch"
            );
            return;
        };

        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            record_count = batch.len(),
            first_offset = ?batch.first_offset(),
            high_offset = high_offset,
            "Processing batch"
        );

        let records = batch.to_records();
        match self.process_with_retry(&records).await {
            Ok(attempts) => {
                debug!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    attempts = attempts,
                    "Batch processed"
                );
            }
            Err(e) => {
                error!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    record_count = records.len(),
                    high_offset = high_offset,
                    error = ?e,
                    "Processing failed permanently, sending batch to dead letter sink"
                );
                if let Err(dlq_error) = self.handlers.dead_letter.send(&records).await {
                    error!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        error = ?dlq_error,
                        "Dead letter handoff failed"
                    );
                }
            }
        }

        self.handlers.offsets.mark(&self.partition, high_offset + 1);
    }

    /// Run the processor until it succeeds or the retry policy gives up.
    /// Returns the number of attempts on success, the last error otherwise.
    async fn process_with_retry(&mut self, records: &[Record]) -> Result<u32, Error> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.handlers.processor.process_records(records).await {
                Ok(()) => return Ok(attempt),
                Err(e) => e,
            };

            let decision = self.retry_policy.decide(attempt, &error, &mut self.rng);
            if !decision.retry {
                return Err(error);
            }

            warn!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                attempt = attempt,
                max_attempts = self.retry_policy.max_attempts,
                wait = ?decision.wait,
                error = ?error,
                "Batch processing failed, retrying"
            );
            tokio::time::sleep(decision.wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{
        batch, fast_retry_policy, wait_until, RecordingDeadLetterSink, RecordingProcessor,
    };

    fn test_partition() -> Partition {
        Partition::new("transactions".to_string(), 0)
    }

    fn spawn_worker(
        processor: Arc<RecordingProcessor>,
        dead_letter: Arc<RecordingDeadLetterSink>,
        offsets: Arc<OffsetTracker>,
        queue_capacity: usize,
    ) -> PartitionWorker {
        PartitionWorker::spawn(
            test_partition(),
            BatchHandlers {
                processor,
                dead_letter,
                offsets,
            },
            &PartitionWorkerConfig {
                queue_capacity,
                retry_policy: fast_retry_policy(3),
            },
        )
    }

    #[tokio::test]
    async fn test_successful_batch_is_marked_without_dead_letter() {
        let processor = Arc::new(RecordingProcessor::new());
        let dead_letter = Arc::new(RecordingDeadLetterSink::new());
        let offsets = Arc::new(OffsetTracker::new());
        let worker = spawn_worker(processor.clone(), dead_letter.clone(), offsets.clone(), 10);

        worker
            .sender()
            .send(batch(&test_partition(), 0, &[("k1", "v1")]))
            .await
            .unwrap();

        let partition = test_partition();
        assert!(wait_until(|| offsets.marked_offset(&partition) == Some(1)).await);
        assert_eq!(processor.attempts(), 1);
        assert!(dead_letter.sent().is_empty());

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_batch_is_dead_lettered_once_and_marked() {
        let processor = Arc::new(RecordingProcessor::always_failing());
        let dead_letter = Arc::new(RecordingDeadLetterSink::new());
        let offsets = Arc::new(OffsetTracker::new());
        let worker = spawn_worker(processor.clone(), dead_letter.clone(), offsets.clone(), 10);

        let fetched = batch(&test_partition(), 5, &[("k1", "v1"), ("k2", "v2")]);
        let expected = fetched.to_records();
        worker.sender().send(fetched).await.unwrap();

        let partition = test_partition();
        assert!(wait_until(|| offsets.marked_offset(&partition) == Some(7)).await);
        assert_eq!(processor.attempts(), 3);
        assert_eq!(dead_letter.sent(), vec![expected]);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovers_within_attempts() {
        let processor = Arc::new(RecordingProcessor::failing_first(2));
        let dead_letter = Arc::new(RecordingDeadLetterSink::new());
        let offsets = Arc::new(OffsetTracker::new());
        let worker = spawn_worker(processor.clone(), dead_letter.clone(), offsets.clone(), 10);

        worker
            .sender()
            .send(batch(&test_partition(), 10, &[("k1", "v1")]))
            .await
            .unwrap();

        let partition = test_partition();
        assert!(wait_until(|| offsets.marked_offset(&partition) == Some(11)).await);
        assert_eq!(processor.attempts(), 3);
        assert!(dead_letter.sent().is_empty());

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_dead_letter_sink_still_marks() {
        let processor = Arc::new(RecordingProcessor::always_failing());
        let dead_letter = Arc::new(RecordingDeadLetterSink::failing());
        let offsets = Arc::new(OffsetTracker::new());
        let worker = spawn_worker(processor, dead_letter.clone(), offsets.clone(), 10);

        worker
            .sender()
            .send(batch(&test_partition(), 0, &[("k1", "v1")]))
            .await
            .unwrap();

        let partition = test_partition();
        assert!(wait_until(|| offsets.marked_offset(&partition) == Some(1)).await);
        assert_eq!(dead_letter.sent().len(), 1);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_batches_processed_in_queue_order() {
        let processor = Arc::new(RecordingProcessor::new());
        let dead_letter = Arc::new(RecordingDeadLetterSink::new());
        let offsets = Arc::new(OffsetTracker::new());
        let worker = spawn_worker(processor.clone(), dead_letter, offsets.clone(), 10);

        let sender = worker.sender();
        for i in 0..5_i64 {
            let key = format!("k{i}");
            sender
                .send(batch(&test_partition(), i, &[(key.as_str(), "v")]))
                .await
                .unwrap();
        }

        let partition = test_partition();
        assert!(wait_until(|| offsets.marked_offset(&partition) == Some(5)).await);
        assert_eq!(processor.processed_keys(), vec!["k0", "k1", "k2", "k3", "k4"]);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_batch_is_ignored() {
        let processor = Arc::new(RecordingProcessor::new());
        let dead_letter = Arc::new(RecordingDeadLetterSink::new());
        let offsets = Arc::new(OffsetTracker::new());
        let worker = spawn_worker(processor.clone(), dead_letter, offsets.clone(), 10);

        worker
            .sender()
            .send(FetchedBatch::new(test_partition(), vec![]))
            .await
            .unwrap();
        worker.shutdown().await;

        assert_eq!(processor.attempts(), 0);
        assert_eq!(offsets.marked_offset(&test_partition()), None);
    }

    #[tokio::test]
    async fn test_stop_mid_batch_drains_before_stopping() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let processor = Arc::new(RecordingProcessor::new().with_gate("", gate.clone()));
        let dead_letter = Arc::new(RecordingDeadLetterSink::new());
        let offsets = Arc::new(OffsetTracker::new());
        let mut worker = spawn_worker(processor.clone(), dead_letter, offsets.clone(), 10);

        worker
            .sender()
            .send(batch(&test_partition(), 0, &[("k1", "v1")]))
            .await
            .unwrap();
        assert!(wait_until(|| processor.attempts() == 1).await);

        worker.stop();
        let mut state = worker.state.clone();
        state
            .wait_for(|s| *s == WorkerState::Draining)
            .await
            .unwrap();
        assert_eq!(offsets.marked_offset(&test_partition()), None);

        gate.add_permits(1);
        tokio::time::timeout(Duration::from_secs(5), worker.wait_stopped())
            .await
            .unwrap();

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(offsets.marked_offset(&test_partition()), Some(1));
    }

    #[tokio::test]
    async fn test_stop_while_idle_leaves_queued_batches_unmarked() {
        let processor = Arc::new(RecordingProcessor::new());
        let dead_letter = Arc::new(RecordingDeadLetterSink::new());
        let offsets = Arc::new(OffsetTracker::new());
        let mut worker = spawn_worker(processor.clone(), dead_letter, offsets.clone(), 10);

        worker.stop();
        worker.wait_stopped().await;
        assert_eq!(worker.state(), WorkerState::Stopped);

        // The receiver is gone once the task exits
        let result = worker
            .sender()
            .send(batch(&test_partition(), 0, &[("k1", "v1")]))
            .await;
        assert!(result.is_err());
        assert_eq!(processor.attempts(), 0);
        assert_eq!(offsets.marked_offset(&test_partition()), None);
    }
}
