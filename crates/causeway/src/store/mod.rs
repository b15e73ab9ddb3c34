//! Storage abstraction for checkpoints and uniqueness records.
//!
//! This module provides the [`Store`] trait that abstracts over different
//! storage backends. Two implementations are provided:
//!
//! - [`MemoryStore`] — in-process storage for tests and single-node use
//! - [`PgStore`] — PostgreSQL storage for production (requires the
//!   `postgres` feature)

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::future::Future;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::flow::FlowRef;
use crate::notary::{ResourceRef, TxId, UniquenessRecord};

/// Durable storage for flow checkpoints and uniqueness records.
///
/// The checkpoint table is mutated only by the single state machine owning
/// a given flow, so no cross-flow locking is required there — but
/// [`Store::save_checkpoint`] must be atomic: the checkpoint embeds the
/// action intents it commits the flow to, and either the whole snapshot
/// lands or none of it does. Implementations must also enforce strictly
/// monotonic sequences per flow and reject regressions with
/// [`Error::CheckpointRegression`](crate::Error::CheckpointRegression).
///
/// The uniqueness record table is mutated by arbitrarily many concurrent
/// requesters; all mutation goes through the race-free
/// [`Store::insert_uniqueness_record_if_absent`] check-and-insert.
pub trait Store: Send + Sync + Clone + 'static {
    /// Atomically persist a flow's checkpoint (state + action intents +
    /// recorded side effects, in one write).
    fn save_checkpoint(
        &self,
        flow: &FlowRef,
        checkpoint: &Checkpoint,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Load a flow's latest checkpoint, if any.
    fn load_checkpoint(
        &self,
        flow: &FlowRef,
    ) -> impl Future<Output = Result<Option<Checkpoint>>> + Send;

    /// Delete a flow's checkpoint; called when the flow reaches
    /// `Completed`, `Failed` or `Removed`. Deleting a missing checkpoint
    /// is not an error.
    fn delete_checkpoint(&self, flow: &FlowRef) -> impl Future<Output = Result<()>> + Send;

    /// Every flow that still holds a checkpoint; used at startup to
    /// reconstruct non-terminal flows.
    fn list_non_terminal_flows(&self) -> impl Future<Output = Result<Vec<FlowRef>>> + Send;

    /// Number of checkpoints currently held.
    fn checkpoint_count(&self) -> impl Future<Output = Result<usize>> + Send;

    /// Race-free check-and-insert of a uniqueness record.
    ///
    /// Returns `true` if the record was inserted (this requester won the
    /// reference), `false` if a record already existed. Records are
    /// immutable once written.
    fn insert_uniqueness_record_if_absent(
        &self,
        resource: &ResourceRef,
        record: &UniquenessRecord,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Read the uniqueness record for a resource reference, if any.
    fn uniqueness_record(
        &self,
        resource: &ResourceRef,
    ) -> impl Future<Output = Result<Option<UniquenessRecord>>> + Send;

    /// Record that a transaction has been notarised by this service, making
    /// its outputs known for reference-existence checks.
    fn record_notarised_tx(&self, tx_id: TxId) -> impl Future<Output = Result<()>> + Send;

    /// Whether a transaction has been notarised by this service.
    fn is_tx_notarised(&self, tx_id: TxId) -> impl Future<Output = Result<bool>> + Send;
}
