//! Durable flow checkpoints.
//!
//! A checkpoint is the explicit, serializable continuation of a flow: the
//! post-transition state, the batch of action intents still to execute, the
//! deduplication ids of side effects already durably recorded, and what to
//! do once the batch has drained. There is no language-level stack capture;
//! resuming a flow means loading its checkpoint and applying it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::{Action, DeduplicationId, FlowFailure};
use crate::notary::TxId;
use crate::transport::{MessageId, SessionId};

/// Lifecycle state of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum FlowStatus {
    /// Created but the start event has not been processed yet.
    Unstarted,
    /// Processing events.
    Active,
    /// Parked, waiting for an external result (or for an operator).
    Suspended { reason: SuspendReason },
    /// Finished successfully; checkpoint deleted.
    Completed,
    /// Finished with a propagated failure; checkpoint deleted.
    Failed,
    /// Removed by an operator.
    Removed,
}

impl FlowStatus {
    /// Terminal states never process further events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Removed
        )
    }
}

/// Why a flow is parked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum SuspendReason {
    /// Waiting for the next message on a session.
    AwaitingMessage { session: SessionId },
    /// Waiting for the uniqueness service's commit result.
    AwaitingCommit { tx_id: TxId },
    /// Held for operator inspection by the hospital; no automatic retry.
    Observation,
}

/// An action intent recorded in a checkpoint, paired with its
/// deduplication id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub dedup: DeduplicationId,
    pub action: Action<Value>,
}

/// What the machine does once a checkpoint's pending actions have drained.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "epilogue", rename_all = "kebab-case")]
pub enum Epilogue {
    /// Stay active and wait for the next event.
    Idle,
    /// Park until the corresponding result event arrives.
    Await { reason: SuspendReason },
    /// Delete the checkpoint and resolve the caller's handle.
    Complete { output: Value },
    /// Propagate the failure, delete the checkpoint, resolve the handle
    /// with an error.
    Fail { failure: FlowFailure },
}

/// Immutable, serializable continuation of a flow.
///
/// Invariants:
/// - `sequence` is strictly monotonic per flow; the store rejects regressions.
/// - a checkpoint is written together with the intents it commits the flow
///   to (`pending_actions`), in one atomic store call.
/// - replaying a checkpoint never re-executes an action whose deduplication
///   id appears in `recorded`; repeatable actions (commit requests, awaits)
///   are re-executed by design and never enter `recorded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u64,
    /// Post-transition flow state, serialized.
    pub state: Value,
    /// Action intents this checkpoint commits the flow to.
    pub pending_actions: Vec<PendingAction>,
    /// Deduplication ids of side effects already durably recorded.
    pub recorded: BTreeSet<DeduplicationId>,
    /// Inbound messages processed but not yet acknowledged.
    pub pending_acks: Vec<MessageId>,
    pub epilogue: Epilogue,
}

impl Checkpoint {
    /// True when every non-repeatable pending action has been recorded.
    pub fn fully_recorded(&self) -> bool {
        self.pending_actions
            .iter()
            .all(|p| p.action.is_repeatable() || self.recorded.contains(&p.dedup))
    }
}
