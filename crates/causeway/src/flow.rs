//! Core flow traits and types.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::ActionError;
use crate::notary::{CommitError, CommitRequest, TxId};
use crate::transport::{MessageId, PartyId, SessionId};

/// Pure flow logic: the transition function of a single flow type.
///
/// [`Flow::transition`] maps the current state and an incoming event to the
/// next state plus an ordered batch of [`Action`]s. It must be deterministic
/// and side-effect free; all side effects are expressed as actions executed
/// by the engine. The engine checkpoints the transition result before
/// executing the batch, so a crash or a triaged retry always resumes from a
/// consistent point.
///
/// # Correlation
///
/// Events are matched to flow instances via a correlation key:
///
/// ```text
/// correlation_key = (Flow::TYPE, FlowId)
/// ```
///
/// # Suspension
///
/// A batch containing [`Action::RequestCommit`] or [`Action::AwaitMessage`]
/// suspends the flow once the batch has executed; the flow resumes only when
/// the matching [`FlowEvent::CommitResult`] or [`FlowEvent::Message`] is
/// submitted. At most one suspending action may appear in a batch.
///
/// # Example
///
/// ```ignore
/// impl Flow for OrderFlow {
///     type State = OrderState;
///     type Message = OrderMessage;
///     type Output = String;
///
///     const TYPE: &'static str = "order";
///
///     fn transition(
///         id: &FlowId,
///         state: Self::State,
///         event: FlowEvent<Self::Message>,
///     ) -> Transition<Self::State, Self::Message, Self::Output> {
///         match event {
///             FlowEvent::Start { args: OrderMessage::Place { seller, .. } } => {
///                 let session = SessionId::derive(id, "order");
///                 Transition::to(OrderState::Pending)
///                     .with_action(Action::SendInitial {
///                         to: PartyId::new(seller),
///                         session,
///                         payload: OrderMessage::Quote { flow: id.to_string() },
///                     })
///                     .with_action(Action::AwaitMessage { session })
///             }
///             FlowEvent::Message { message_id, .. } => {
///                 Transition::to(OrderState::Done)
///                     .with_action(Action::AcknowledgeMessages {
///                         messages: vec![message_id],
///                     })
///                     .completing("confirmed".into())
///             }
///             _ => Transition::to(state),
///         }
///     }
/// }
/// ```
pub trait Flow: Send + Sync + 'static {
    /// The flow state captured in every checkpoint.
    ///
    /// `Default` provides the state of a flow that has not yet processed its
    /// start event.
    type State: Serialize + DeserializeOwned + Default + Send;

    /// Payload type for messages exchanged with counterparties and for the
    /// start arguments. Must be serializable for checkpoint storage.
    type Message: Serialize + DeserializeOwned + Send;

    /// The value a completed flow resolves its [`FlowHandle`](crate::FlowHandle) to.
    type Output: Serialize + DeserializeOwned + Send;

    /// Flow type identifier. Combined with [`FlowId`] to form a [`FlowRef`]
    /// correlation key. Must be stable across deployments.
    const TYPE: &'static str;

    /// Map the current state and an incoming event to the next state and the
    /// ordered actions to execute.
    ///
    /// Must be deterministic — re-running the same transition during
    /// crash-recovery replay must produce the same actions, which is why
    /// session identifiers should be derived with [`SessionId::derive`]
    /// rather than generated randomly.
    ///
    /// Only `Start`, `Message` and `CommitResult` events reach this
    /// function; `Resume`, `RetryRequest` and `Error` are handled by the
    /// engine itself.
    fn transition(
        id: &FlowId,
        state: Self::State,
        event: FlowEvent<Self::Message>,
    ) -> Transition<Self::State, Self::Message, Self::Output>;
}

/// Extracts the flow instance ID (business key) from a message.
///
/// Used by [`FlowManager::deliver`](crate::FlowManager::deliver) to route
/// incoming payloads to the right flow instance. Derivable for enums with
/// `#[derive(HasFlowId)]` and a `#[flow_id(field)]` attribute.
pub trait HasFlowId {
    /// Returns the flow instance ID this message is addressed to.
    fn flow_id(&self) -> FlowId;
}

/// A flow instance identifier (business key).
///
/// Use natural business keys rather than synthetic UUIDs where possible;
/// this makes correlation intuitive and idempotency natural.
///
/// # Example
///
/// ```
/// use causeway::FlowId;
///
/// let id = FlowId::new("grp-123");
/// assert_eq!(id.as_str(), "grp-123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(String);

impl FlowId {
    /// Create a new flow ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Consume the wrapper and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for FlowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for FlowId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Reference to a specific flow instance.
///
/// Combines flow type and instance ID into a single correlation key, used
/// throughout the engine and as the checkpoint store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRef {
    flow_type: String,
    flow_id: FlowId,
}

impl FlowRef {
    /// Create a new flow reference.
    pub fn new(flow_type: impl Into<String>, flow_id: impl Into<FlowId>) -> Self {
        Self {
            flow_type: flow_type.into(),
            flow_id: flow_id.into(),
        }
    }

    /// The flow type (e.g. "create-group").
    pub fn flow_type(&self) -> &str {
        &self.flow_type
    }

    /// The flow instance ID (business key).
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Consume and return the inner flow ID.
    pub fn into_flow_id(self) -> FlowId {
        self.flow_id
    }
}

impl std::fmt::Display for FlowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.flow_type, self.flow_id)
    }
}

impl<S: Into<String>> From<(&'static str, S)> for FlowRef {
    fn from((flow_type, flow_id): (&'static str, S)) -> Self {
        Self::new(flow_type, flow_id.into())
    }
}

/// An input driving a flow transition.
///
/// `Start`, `Message` and `CommitResult` reach [`Flow::transition`];
/// `Resume`, `RetryRequest` and `Error` are consumed by the engine:
///
/// - `Resume` re-drives a flow from its last checkpoint after a restart
/// - `RetryRequest` re-drives a flow parked for observation
/// - `Error` routes an asynchronous pipeline failure to the hospital
#[derive(Debug, Clone)]
pub enum FlowEvent<M> {
    /// First event of a flow's life, carrying the start arguments.
    Start { args: M },
    /// A message delivered by the transport on an open session.
    Message {
        session: SessionId,
        message_id: MessageId,
        payload: M,
    },
    /// Outcome of an asynchronous uniqueness commit previously requested
    /// with [`Action::RequestCommit`].
    CommitResult {
        tx_id: TxId,
        result: Result<(), CommitError>,
    },
    /// Synthetic event re-driving a flow from its last checkpoint.
    Resume,
    /// Operator-requested retry of a flow held for observation.
    RetryRequest,
    /// An error raised outside the flow's processing thread (e.g. in the
    /// commit pipeline); triaged by the hospital like any other failure.
    Error { error: ActionError },
}

impl<M> FlowEvent<M> {
    /// Short name used in logs and error signatures.
    pub fn name(&self) -> &'static str {
        match self {
            FlowEvent::Start { .. } => "start",
            FlowEvent::Message { .. } => "message-received",
            FlowEvent::CommitResult { .. } => "async-operation-result",
            FlowEvent::Resume => "resume",
            FlowEvent::RetryRequest => "retry-request",
            FlowEvent::Error { .. } => "error",
        }
    }
}

/// A discrete, named side effect issued by a transition.
///
/// Actions execute in batch order, fail-fast: a later action does not run
/// if an earlier one failed, with the exception of best-effort bookkeeping
/// ([`Action::AcknowledgeMessages`]) whose failures are swallowed.
///
/// Every action carries a deterministic deduplication identifier derived
/// from `(flow, checkpoint sequence, index in batch)` so that replays after
/// a crash or a triaged retry never duplicate an externally observed side
/// effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Action<M> {
    /// Open a session to a counterparty and deliver the first message.
    SendInitial {
        to: PartyId,
        session: SessionId,
        payload: M,
    },
    /// Deliver a message on an established session.
    Send { session: SessionId, payload: M },
    /// Acknowledge processed inbound messages. Best-effort: failures are
    /// swallowed and never block flow progress.
    AcknowledgeMessages { messages: Vec<MessageId> },
    /// Submit a commit request to the uniqueness service and suspend until
    /// its result arrives as a [`FlowEvent::CommitResult`].
    RequestCommit { request: CommitRequest },
    /// Suspend until the next message arrives on the given session.
    AwaitMessage { session: SessionId },
    /// Report a flow failure to interested parties. Engine-generated during
    /// error propagation; transitions never issue it directly.
    PropagateError { failure: FlowFailure },
}

impl<M> Action<M> {
    /// The action's stable name, used in logs, error signatures and
    /// deduplication identifiers.
    pub fn name(&self) -> &'static str {
        match self {
            Action::SendInitial { .. } => "send-initial-message",
            Action::Send { .. } => "send-message",
            Action::AcknowledgeMessages { .. } => "acknowledge-messages",
            Action::RequestCommit { .. } => "request-commit",
            Action::AwaitMessage { .. } => "await-message",
            Action::PropagateError { .. } => "propagate-error",
        }
    }

    /// Best-effort actions swallow their failures.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, Action::AcknowledgeMessages { .. })
    }

    /// Repeatable actions are re-executed on every replay instead of being
    /// recorded in the checkpoint's deduplication set. A lost in-flight
    /// commit request must be re-issued after a restart; the uniqueness
    /// service deduplicates by transaction id.
    pub fn is_repeatable(&self) -> bool {
        matches!(
            self,
            Action::RequestCommit { .. } | Action::AwaitMessage { .. }
        )
    }

    /// The suspension this action parks the flow in once the batch has
    /// executed, if any.
    pub fn suspension(&self) -> Option<crate::checkpoint::SuspendReason> {
        match self {
            Action::RequestCommit { request } => {
                Some(crate::checkpoint::SuspendReason::AwaitingCommit {
                    tx_id: request.tx_id,
                })
            }
            Action::AwaitMessage { session } => {
                Some(crate::checkpoint::SuspendReason::AwaitingMessage { session: *session })
            }
            _ => None,
        }
    }
}

/// Deterministic identifier attached to an outbound action so the transport
/// (or the uniqueness service) can deduplicate redeliveries.
///
/// Format: `{flow_type}:{flow_id}:{sequence}:{index}` — stable across
/// retries of the same checkpointed batch, unique across batches.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeduplicationId(String);

impl DeduplicationId {
    /// Derive the deduplication id for the `index`-th action of the batch
    /// checkpointed at `sequence`.
    pub fn derive(flow: &FlowRef, sequence: u64, index: usize) -> Self {
        Self(format!("{flow}:{sequence}:{index}"))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeduplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Structured failure of a flow, surfaced to the caller and, where
/// applicable, propagated to counterparties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct FlowFailure {
    pub message: String,
}

impl FlowFailure {
    /// Create a new failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// How a transition concludes once its action batch has executed.
#[derive(Debug, Clone)]
pub enum Outcome<O> {
    /// The flow stays alive and waits for its next event.
    Continue,
    /// The flow is finished; the checkpoint is deleted and the caller's
    /// handle resolves to the output.
    Complete(O),
    /// The flow failed; the failure is propagated and the handle resolves
    /// to an error.
    Fail(FlowFailure),
}

/// Result of a transition: the next state plus the ordered actions to
/// execute, and how the flow concludes afterwards.
///
/// # Example
///
/// ```ignore
/// // Send, then suspend until the counterparty replies
/// Transition::to(State::AwaitingReply)
///     .with_action(Action::SendInitial { to, session, payload })
///     .with_action(Action::AwaitMessage { session })
///
/// // Acknowledge and finish
/// Transition::to(State::Done)
///     .with_action(Action::AcknowledgeMessages { messages })
///     .completing("done".into())
/// ```
#[derive(Debug, Clone)]
pub struct Transition<S, M, O> {
    state: S,
    actions: Vec<Action<M>>,
    outcome: Outcome<O>,
}

impl<S, M, O> Transition<S, M, O> {
    /// Create a transition to the given next state with no actions.
    pub fn to(state: S) -> Self {
        Self {
            state,
            actions: vec![],
            outcome: Outcome::Continue,
        }
    }

    /// Append an action to the batch.
    pub fn with_action(mut self, action: Action<M>) -> Self {
        self.actions.push(action);
        self
    }

    /// Append multiple actions to the batch.
    pub fn with_actions(mut self, actions: impl IntoIterator<Item = Action<M>>) -> Self {
        self.actions.extend(actions);
        self
    }

    /// Complete the flow with the given output once the batch has executed.
    pub fn completing(mut self, output: O) -> Self {
        self.outcome = Outcome::Complete(output);
        self
    }

    /// Fail the flow once the batch has executed; the failure is propagated
    /// to the caller and counterparties.
    pub fn failing(mut self, failure: FlowFailure) -> Self {
        self.outcome = Outcome::Fail(failure);
        self
    }

    /// Borrow the next state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Borrow the action batch.
    pub fn actions(&self) -> &[Action<M>] {
        &self.actions
    }

    /// Borrow the outcome.
    pub fn outcome(&self) -> &Outcome<O> {
        &self.outcome
    }

    /// Consume the transition into its parts.
    pub(crate) fn into_parts(self) -> (S, Vec<Action<M>>, Outcome<O>) {
        (self.state, self.actions, self.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_id_roundtrip() {
        let id = FlowId::new("grp-1");
        assert_eq!(id.as_str(), "grp-1");
        assert_eq!(format!("{id}"), "grp-1");
        assert_eq!(id.clone().into_inner(), "grp-1");
    }

    #[test]
    fn flow_ref_display_and_equality() {
        let a = FlowRef::new("ping", "p-1");
        let b = FlowRef::new("ping", "p-1");
        let c = FlowRef::new("ping", "p-2");
        let d = FlowRef::new("pong", "p-1");

        assert_eq!(format!("{a}"), "ping:p-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn transition_builder_collects_actions_in_order() {
        let session = SessionId::derive(&FlowId::new("p-1"), "s");
        let t: Transition<i32, (), String> = Transition::to(1)
            .with_action(Action::AwaitMessage { session })
            .with_action(Action::AcknowledgeMessages { messages: vec![] });

        assert_eq!(*t.state(), 1);
        assert_eq!(t.actions().len(), 2);
        assert_eq!(t.actions()[0].name(), "await-message");
        assert_eq!(t.actions()[1].name(), "acknowledge-messages");
        assert!(matches!(t.outcome(), Outcome::Continue));
    }

    #[test]
    fn transition_completing_sets_outcome() {
        let t: Transition<i32, (), String> = Transition::to(2).completing("done".into());
        assert!(matches!(t.outcome(), Outcome::Complete(o) if o == "done"));
    }

    #[test]
    fn transition_failing_sets_outcome() {
        let t: Transition<i32, (), String> = Transition::to(2).failing(FlowFailure::new("boom"));
        assert!(matches!(t.outcome(), Outcome::Fail(f) if f.message == "boom"));
    }

    #[test]
    fn ack_is_best_effort_and_not_repeatable() {
        let ack: Action<()> = Action::AcknowledgeMessages { messages: vec![] };
        assert!(ack.is_best_effort());
        assert!(!ack.is_repeatable());
    }

    #[test]
    fn await_message_is_repeatable_and_suspending() {
        let session = SessionId::derive(&FlowId::new("p-1"), "s");
        let action: Action<()> = Action::AwaitMessage { session };
        assert!(action.is_repeatable());
        assert!(action.suspension().is_some());
    }

    #[test]
    fn deduplication_id_is_stable() {
        let flow = FlowRef::new("ping", "p-1");
        let a = DeduplicationId::derive(&flow, 3, 0);
        let b = DeduplicationId::derive(&flow, 3, 0);
        let c = DeduplicationId::derive(&flow, 3, 1);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "ping:p-1:3:0");
    }
}
