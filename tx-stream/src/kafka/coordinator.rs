//! Group Coordinator - owns the partition workers of this group member
//!
//! Workers are created when partitions are assigned and stopped, fully drained,
//! when they are revoked or lost. The poll loop only reads the registry: it
//! routes fetched batches to existing workers and drops batches for partitions
//! that have no worker any more.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dead_letter::DeadLetterSink;
use crate::error::ConsumerError;
use crate::kafka::client::{GroupClient, OffsetCommitter, RebalanceListener};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::partition_worker::{
    BatchHandlers, PartitionWorker, PartitionWorkerConfig, WorkerState,
};
use crate::kafka::types::{FetchedBatch, Partition};
use crate::processor::RecordProcessor;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub worker: PartitionWorkerConfig,
    /// Upper bound on records requested per poll
    pub max_records_per_poll: usize,
    /// How often the poll loop commits offsets that are already marked
    pub auto_commit_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker: PartitionWorkerConfig::default(),
            max_records_per_poll: 500,
            auto_commit_interval: Duration::from_secs(5),
        }
    }
}

pub struct GroupCoordinator {
    workers: DashMap<Partition, PartitionWorker>,
    handlers: BatchHandlers,
    config: CoordinatorConfig,
}

impl GroupCoordinator {
    pub fn new(
        processor: Arc<dyn RecordProcessor>,
        dead_letter: Arc<dyn DeadLetterSink>,
        offsets: Arc<OffsetTracker>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            handlers: BatchHandlers {
                processor,
                dead_letter,
                offsets,
            },
            config,
        }
    }

    pub fn offsets(&self) -> &Arc<OffsetTracker> {
        &self.handlers.offsets
    }

    /// Partitions that currently have a worker, sorted
    pub fn assigned_partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> =
            self.workers.iter().map(|entry| entry.key().clone()).collect();
        partitions.sort();
        partitions
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_state(&self, partition: &Partition) -> Option<WorkerState> {
        self.workers.get(partition).map(|worker| worker.state())
    }

    /// Stop the workers of `partitions` and wait until every one of them is quiescent.
    ///
    /// Workers leave the registry before the wait, so the poll loop drops any
    /// batch fetched for these partitions in the meantime.
    pub async fn kill_workers(&self, partitions: &[Partition]) {
        let stopping: Vec<PartitionWorker> = partitions
            .iter()
            .filter_map(|partition| match self.workers.remove(partition) {
                Some((_, worker)) => {
                    worker.stop();
                    Some(worker)
                }
                None => {
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        "No worker to stop for partition"
                    );
                    None
                }
            })
            .collect();

        if stopping.is_empty() {
            return;
        }

        let started = Instant::now();
        let count = stopping.len();
        join_all(stopping.into_iter().map(PartitionWorker::shutdown)).await;

        info!(
            worker_count = count,
            elapsed = ?started.elapsed(),
            "Partition workers stopped"
        );
    }

    /// Fetch and route batches until `shutdown` is cancelled or the client fails.
    ///
    /// Returns `Ok(())` if cancellation is observed between polls,
    /// `ConsumerError::Canceled` if it interrupts a fetch or a blocked push, and
    /// `ConsumerError::ClientClosed` once the client is closed.
    pub async fn poll_loop<C>(
        &self,
        client: &C,
        shutdown: &CancellationToken,
    ) -> Result<(), ConsumerError>
    where
        C: GroupClient + ?Sized,
    {
        let mut last_commit = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, leaving poll loop");
                return Ok(());
            }

            let fetches = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested during fetch");
                    return Err(ConsumerError::Canceled);
                }
                fetches = client.poll_records(self.config.max_records_per_poll) => fetches?,
            };

            for fetch_error in &fetches.errors {
                match &fetch_error.partition {
                    Some(partition) => warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        error = ?fetch_error.error,
                        "Fetch error for partition, skipping"
                    ),
                    None => warn!(error = ?fetch_error.error, "Fetch error, skipping"),
                }
            }

            for batch in fetches.batches {
                self.route_batch(batch, shutdown).await?;
            }

            if last_commit.elapsed() >= self.config.auto_commit_interval {
                if let Err(e) = client.commit_marked_offsets().await {
                    warn!(error = ?e, "Periodic offset commit failed");
                }
                last_commit = Instant::now();
            }

            client.allow_rebalance();
        }
    }

    /// Push a batch into its partition's queue, waiting while the queue is full
    async fn route_batch(
        &self,
        batch: FetchedBatch,
        shutdown: &CancellationToken,
    ) -> Result<(), ConsumerError> {
        let sender = match self.workers.get(batch.partition()) {
            Some(worker) => worker.sender(),
            None => {
                warn!(
                    topic = batch.partition().topic(),
                    partition = batch.partition().partition_number(),
                    record_count = batch.len(),
                    "No worker for partition, dropping batch"
                );
                return Ok(());
            }
        };

        if sender.capacity() == 0 {
            debug!(
                topic = batch.partition().topic(),
                partition = batch.partition().partition_number(),
                "Partition queue full, waiting"
            );
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(ConsumerError::Canceled),
            sent = sender.send(batch) => {
                if let Err(rejected) = sent {
                    warn!(
                        topic = rejected.0.partition().topic(),
                        partition = rejected.0.partition().partition_number(),
                        "Partition worker stopped before the batch was queued, dropping batch"
                    );
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl RebalanceListener for GroupCoordinator {
    async fn on_assigned(&self, assigned: &[Partition]) {
        for partition in assigned {
            match self.workers.entry(partition.clone()) {
                Entry::Occupied(_) => {
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        "Partition already has a worker"
                    );
                }
                Entry::Vacant(slot) => {
                    info!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        "Partition assigned, starting worker"
                    );
                    slot.insert(PartitionWorker::spawn(
                        partition.clone(),
                        self.handlers.clone(),
                        &self.config.worker,
                    ));
                }
            }
        }
    }

    async fn on_revoked(&self, committer: &dyn OffsetCommitter, revoked: &[Partition]) {
        for partition in revoked {
            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Partition revoked"
            );
        }

        self.kill_workers(revoked).await;

        if let Err(e) = committer.commit_marked_offsets().await {
            warn!(error = ?e, "Failed to commit offsets of revoked partitions");
        }

        for partition in revoked {
            self.handlers.offsets.clear_partition(partition);
        }
    }

    async fn on_lost(&self, lost: &[Partition]) {
        for partition in lost {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Partition lost"
            );
        }

        self.kill_workers(lost).await;

        for partition in lost {
            self.handlers.offsets.clear_partition(partition);
        }
    }
}
