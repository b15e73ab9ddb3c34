//! Small flows exercising the engine's seams.
//!
//! Mirrors the shapes the calibration scenarios need: a one-shot send, a
//! send-then-await round trip, a flow suspending on a uniqueness commit,
//! and a flow that fails on arrival.

use causeway::{
    Action, CommitRequest, Flow, FlowEvent, FlowFailure, FlowId, HasFlowId, NonEmpty, PartyId,
    ResourceRef, SessionId, Transition, TxId,
};
use serde::{Deserialize, Serialize};

/// Sends one message to a counterparty and completes.
///
/// The whole life of the flow is a single transition, so a failing send is
/// retried from the initial checkpoint.
pub struct PingFlow;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingState {
    pub sent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, HasFlowId)]
#[flow_id(flow)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PingMessage {
    Kick { flow: String, to: String },
    Ping { flow: String },
}

impl PingFlow {
    pub fn session(id: &FlowId) -> SessionId {
        SessionId::derive(id, "ping")
    }
}

impl Flow for PingFlow {
    type State = PingState;
    type Message = PingMessage;
    type Output = String;

    const TYPE: &'static str = "ping";

    fn transition(
        id: &FlowId,
        state: Self::State,
        event: FlowEvent<Self::Message>,
    ) -> Transition<Self::State, Self::Message, Self::Output> {
        match event {
            FlowEvent::Start {
                args: PingMessage::Kick { to, .. },
            } => Transition::to(PingState { sent: true })
                .with_action(Action::SendInitial {
                    to: PartyId::new(to),
                    session: Self::session(id),
                    payload: PingMessage::Ping {
                        flow: id.to_string(),
                    },
                })
                .completing("message-sent".into()),
            _ => Transition::to(state),
        }
    }
}

/// Sends, suspends awaiting the reply, acknowledges it and completes.
pub struct RoundTripFlow;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoundTripPhase {
    #[default]
    Fresh,
    AwaitingReply,
    Done,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundTripState {
    pub phase: RoundTripPhase,
}

#[derive(Debug, Clone, Serialize, Deserialize, HasFlowId)]
#[flow_id(flow)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RoundTripMessage {
    Kick { flow: String, to: String },
    Ping { flow: String },
    Pong { flow: String },
}

impl RoundTripFlow {
    pub fn session(id: &FlowId) -> SessionId {
        SessionId::derive(id, "round-trip")
    }
}

impl Flow for RoundTripFlow {
    type State = RoundTripState;
    type Message = RoundTripMessage;
    type Output = String;

    const TYPE: &'static str = "round-trip";

    fn transition(
        id: &FlowId,
        state: Self::State,
        event: FlowEvent<Self::Message>,
    ) -> Transition<Self::State, Self::Message, Self::Output> {
        let session = Self::session(id);
        match event {
            FlowEvent::Start {
                args: RoundTripMessage::Kick { to, .. },
            } => Transition::to(RoundTripState {
                phase: RoundTripPhase::AwaitingReply,
            })
            .with_action(Action::SendInitial {
                to: PartyId::new(to),
                session,
                payload: RoundTripMessage::Ping {
                    flow: id.to_string(),
                },
            })
            .with_action(Action::AwaitMessage { session }),

            FlowEvent::Message {
                message_id,
                payload: RoundTripMessage::Pong { .. },
                ..
            } if state.phase == RoundTripPhase::AwaitingReply => Transition::to(RoundTripState {
                phase: RoundTripPhase::Done,
            })
            .with_action(Action::AcknowledgeMessages {
                messages: vec![message_id],
            })
            .completing("round-trip-complete".into()),

            _ => Transition::to(state),
        }
    }
}

/// Suspends on a uniqueness commit and completes (or fails) on its result.
pub struct CommitFlow;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitState {
    pub requested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, HasFlowId)]
#[flow_id(flow)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CommitMessage {
    Kick {
        flow: String,
        tx_id: TxId,
        inputs: Vec<ResourceRef>,
    },
}

impl Flow for CommitFlow {
    type State = CommitState;
    type Message = CommitMessage;
    type Output = String;

    const TYPE: &'static str = "commit";

    fn transition(
        id: &FlowId,
        state: Self::State,
        event: FlowEvent<Self::Message>,
    ) -> Transition<Self::State, Self::Message, Self::Output> {
        match event {
            FlowEvent::Start {
                args: CommitMessage::Kick { tx_id, inputs, .. },
            } => match NonEmpty::from_vec(inputs) {
                Some(inputs) => Transition::to(CommitState { requested: true }).with_action(
                    Action::RequestCommit {
                        request: CommitRequest::new(inputs, tx_id, PartyId::new(id.as_str())),
                    },
                ),
                None => Transition::to(state)
                    .failing(FlowFailure::new("commit flow needs at least one input")),
            },

            FlowEvent::CommitResult { result: Ok(()), .. } => {
                Transition::to(state).completing("committed".into())
            }
            FlowEvent::CommitResult {
                result: Err(error), ..
            } => Transition::to(state).failing(FlowFailure::new(format!("commit rejected: {error}"))),

            _ => Transition::to(state),
        }
    }
}

/// Fails on arrival; exercises the propagation path.
pub struct FailingFlow;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailingState {}

#[derive(Debug, Clone, Serialize, Deserialize, HasFlowId)]
#[flow_id(flow)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FailingMessage {
    Kick { flow: String },
}

impl Flow for FailingFlow {
    type State = FailingState;
    type Message = FailingMessage;
    type Output = String;

    const TYPE: &'static str = "failing";

    fn transition(
        _id: &FlowId,
        state: Self::State,
        event: FlowEvent<Self::Message>,
    ) -> Transition<Self::State, Self::Message, Self::Output> {
        match event {
            FlowEvent::Start { .. } => {
                Transition::to(state).failing(FlowFailure::new("deliberate failure"))
            }
            _ => Transition::to(state),
        }
    }
}
