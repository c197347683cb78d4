use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use crate::dead_letter::DeadLetterSink;
use crate::error::{CommitError, ConsumerError};
use crate::kafka::client::{GroupClient, OffsetCommitter};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::{ConsumedRecord, FetchedBatch, Fetches, Partition, Record};
use crate::processor::RecordProcessor;
use crate::retry::RetryPolicy;

/// Build a batch with consecutive offsets starting at `first_offset`
pub fn batch(partition: &Partition, first_offset: i64, entries: &[(&str, &str)]) -> FetchedBatch {
    let records = entries
        .iter()
        .zip(first_offset..)
        .map(|((key, value), offset)| ConsumedRecord {
            key: Some(key.as_bytes().to_vec()),
            value: Some(value.as_bytes().to_vec()),
            topic: partition.topic().to_string(),
            partition: partition.partition_number(),
            offset,
        })
        .collect();

    FetchedBatch::new(partition.clone(), records)
}

/// Same shape as the default policy, with millisecond backoff
pub fn fast_retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::build(max_attempts, Duration::from_millis(1)).provide()
}

/// Poll `condition` until it holds, for at most five seconds
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Test implementation of RecordProcessor that tracks calls
pub struct RecordingProcessor {
    attempts: AtomicUsize,
    remaining_failures: AtomicUsize,
    processed: Mutex<Vec<Vec<Record>>>,
    gate: Option<(Vec<u8>, Arc<Semaphore>)>,
}

impl Default for RecordingProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::failing_first(0)
    }

    /// Fail the first `failures` attempts, then succeed
    pub fn failing_first(failures: usize) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            remaining_failures: AtomicUsize::new(failures),
            processed: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    /// Batches whose first key starts with `key_prefix` wait for a permit of
    /// `gate` on every attempt
    pub fn with_gate(mut self, key_prefix: &str, gate: Arc<Semaphore>) -> Self {
        self.gate = Some((key_prefix.as_bytes().to_vec(), gate));
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Batches that were processed successfully, in processing order
    pub fn processed(&self) -> Vec<Vec<Record>> {
        self.processed.lock().unwrap().clone()
    }

    /// Keys of every successfully processed record, in processing order
    pub fn processed_keys(&self) -> Vec<String> {
        self.processed()
            .iter()
            .flatten()
            .map(|record| String::from_utf8_lossy(&record.key).into_owned())
            .collect()
    }
}

#[async_trait]
impl RecordProcessor for RecordingProcessor {
    async fn process_records(&self, records: &[Record]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some((prefix, gate)) = &self.gate {
            let gated = records
                .first()
                .is_some_and(|record| record.key.starts_with(prefix));
            if gated {
                gate.acquire().await?.forget();
            }
        }

        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                match remaining {
                    0 => None,
                    usize::MAX => Some(usize::MAX),
                    n => Some(n - 1),
                }
            })
            .is_ok();
        if failed {
            return Err(anyhow!("processing failed"));
        }

        self.processed.lock().unwrap().push(records.to_vec());
        Ok(())
    }
}

/// Test implementation of DeadLetterSink that records every handoff
#[derive(Default)]
pub struct RecordingDeadLetterSink {
    sent: Mutex<Vec<Vec<Record>>>,
    fail: bool,
}

impl RecordingDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records handoffs but reports every one of them as failed
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<Vec<Record>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetterSink {
    async fn send(&self, records: &[Record]) -> Result<()> {
        self.sent.lock().unwrap().push(records.to_vec());
        if self.fail {
            return Err(anyhow!("dead letter topic unavailable"));
        }
        Ok(())
    }
}

/// Feeds poll results to a [`MockGroupClient`]
pub struct PollScript {
    tx: mpsc::UnboundedSender<Result<Fetches, ConsumerError>>,
}

impl PollScript {
    pub fn push_batches(&self, batches: Vec<FetchedBatch>) {
        self.push(Ok(Fetches::new(batches, vec![])));
    }

    pub fn push(&self, result: Result<Fetches, ConsumerError>) {
        self.tx.send(result).unwrap();
    }
}

/// GroupClient whose polls return scripted results. A poll waits until a
/// result is pushed; once the script is dropped every poll reports the
/// client as closed.
pub struct MockGroupClient {
    script: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Fetches, ConsumerError>>>,
    offsets: Arc<OffsetTracker>,
    poll_count: AtomicUsize,
    allow_rebalance_count: AtomicUsize,
    commits: Mutex<Vec<HashMap<Partition, i64>>>,
    fail_commits: AtomicBool,
    closed: AtomicBool,
}

impl MockGroupClient {
    pub fn new(offsets: Arc<OffsetTracker>) -> (Self, PollScript) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self {
            script: tokio::sync::Mutex::new(rx),
            offsets,
            poll_count: AtomicUsize::new(0),
            allow_rebalance_count: AtomicUsize::new(0),
            commits: Mutex::new(Vec::new()),
            fail_commits: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        (client, PollScript { tx })
    }

    pub fn poll_count(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }

    pub fn allow_rebalance_count(&self) -> usize {
        self.allow_rebalance_count.load(Ordering::SeqCst)
    }

    /// Offsets written by each successful commit, in commit order
    pub fn commits(&self) -> Vec<HashMap<Partition, i64>> {
        self.commits.lock().unwrap().clone()
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OffsetCommitter for MockGroupClient {
    async fn commit_marked_offsets(&self) -> Result<(), CommitError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(CommitError::rejected(io::Error::other(
                "coordinator not available",
            )));
        }

        let pending = self.offsets.pending_commits();
        self.offsets.mark_committed(&pending);
        self.commits.lock().unwrap().push(pending);
        Ok(())
    }
}

#[async_trait]
impl GroupClient for MockGroupClient {
    async fn poll_records(&self, _max_records: usize) -> Result<Fetches, ConsumerError> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(ConsumerError::ClientClosed);
        }

        let mut script = self.script.lock().await;
        script.recv().await.unwrap_or(Err(ConsumerError::ClientClosed))
    }

    fn allow_rebalance(&self) {
        self.allow_rebalance_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
