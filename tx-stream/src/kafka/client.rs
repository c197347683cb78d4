//! The consumer group client capability the coordinator is built on.
//!
//! The coordinator never talks to the broker directly: it polls through
//! [`GroupClient`], commits through [`OffsetCommitter`], and reacts to the
//! ownership changes the client reports through [`RebalanceListener`].
//! Marking offsets goes through the shared `OffsetTracker`.

use async_trait::async_trait;

use crate::error::{CommitError, ConsumerError};
use crate::kafka::types::{Fetches, Partition};

#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Commit every marked offset that has not been committed yet
    async fn commit_marked_offsets(&self) -> Result<(), CommitError>;
}

#[async_trait]
pub trait GroupClient: OffsetCommitter {
    /// Fetch up to `max_records` records, grouped per partition.
    ///
    /// Returns `ConsumerError::ClientClosed` once the client is closed and
    /// `ConsumerError::Canceled` if the fetch itself was canceled.
    async fn poll_records(&self, max_records: usize) -> Result<Fetches, ConsumerError>;

    /// Let a rebalance held back since the last poll proceed
    fn allow_rebalance(&self);

    /// Leave the group. Owned partitions are revoked through the listener
    /// before this returns.
    async fn close(&self);
}

/// Receives ownership changes from the client.
///
/// The client guarantees the three callbacks are invoked one at a time, never
/// concurrently with each other.
#[async_trait]
pub trait RebalanceListener: Send + Sync {
    async fn on_assigned(&self, assigned: &[Partition]);

    /// Partitions are being handed to another member. `committer` is valid for
    /// the duration of the callback.
    async fn on_revoked(&self, committer: &dyn OffsetCommitter, revoked: &[Partition]);

    /// Ownership is already gone; nothing may be committed for these partitions
    async fn on_lost(&self, lost: &[Partition]);
}
