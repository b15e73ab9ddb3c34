//! Message transport abstraction and the in-process loopback implementation.
//!
//! The engine treats the transport as an opaque, at-least-once, deduplicated
//! channel: redeliveries caused by crash-recovery replay carry the same
//! [`DeduplicationId`](crate::DeduplicationId), and suppressing them is the
//! transport's responsibility, not the state machine's.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::flow::{DeduplicationId, FlowId};

/// Identity of a counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId(String);

impl PartyId {
    /// Create a new party id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for PartyId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a communication session between two flows.
///
/// Sessions must be derivable deterministically from within a transition
/// (which is pure and replayed), so [`SessionId::derive`] computes a
/// name-based UUID from the flow id and a label instead of drawing
/// randomness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Deterministically derive a session id for a flow.
    ///
    /// The same `(flow, label)` pair always yields the same session id, so
    /// replaying a transition reproduces the session it originally opened.
    pub fn derive(flow: &FlowId, label: &str) -> Self {
        let name = format!("{}/{}", flow.as_str(), label);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of a single delivered message (UUID v7, time-ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh message id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Transport-level failures, classified as transient by the hospital.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("counterparty {0} unreachable")]
    Unreachable(PartyId),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Opaque message channel to counterparties.
///
/// Implementations must provide at-least-once delivery with deduplication
/// by the supplied [`DeduplicationId`]; the engine may re-send the same
/// logical message when replaying a checkpointed batch after a crash.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a session to a counterparty and deliver the first message.
    async fn send_initial(
        &self,
        to: &PartyId,
        session: SessionId,
        payload: Value,
        dedup: &DeduplicationId,
    ) -> Result<(), TransportError>;

    /// Deliver a message on an established session.
    async fn send(
        &self,
        session: SessionId,
        payload: Value,
        dedup: &DeduplicationId,
    ) -> Result<(), TransportError>;

    /// Acknowledge processed inbound messages.
    async fn acknowledge(&self, messages: &[MessageId]) -> Result<(), TransportError>;
}

/// A message the loopback transport has actually delivered (after
/// deduplication).
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub to: Option<PartyId>,
    pub session: SessionId,
    pub payload: Value,
    pub dedup: DeduplicationId,
}

#[derive(Default)]
struct LoopbackInner {
    delivered: Vec<DeliveredMessage>,
    seen: HashSet<DeduplicationId>,
    acknowledged: Vec<MessageId>,
}

/// In-process transport for tests and demos.
///
/// Records every unique delivery and suppresses redeliveries that carry an
/// already-seen deduplication id, which is exactly the contract the engine
/// relies on during crash-recovery replay.
#[derive(Default)]
pub struct LoopbackTransport {
    inner: Mutex<LoopbackInner>,
}

impl LoopbackTransport {
    /// Create a new loopback transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all unique deliveries so far.
    pub fn deliveries(&self) -> Vec<DeliveredMessage> {
        self.inner.lock().unwrap().delivered.clone()
    }

    /// Number of unique deliveries on the given session.
    pub fn delivery_count(&self, session: SessionId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .delivered
            .iter()
            .filter(|m| m.session == session)
            .count()
    }

    /// Message ids acknowledged so far.
    pub fn acknowledged(&self) -> Vec<MessageId> {
        self.inner.lock().unwrap().acknowledged.clone()
    }

    fn record(&self, message: DeliveredMessage) {
        let mut inner = self.inner.lock().unwrap();
        if inner.seen.insert(message.dedup.clone()) {
            inner.delivered.push(message);
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_initial(
        &self,
        to: &PartyId,
        session: SessionId,
        payload: Value,
        dedup: &DeduplicationId,
    ) -> Result<(), TransportError> {
        self.record(DeliveredMessage {
            to: Some(to.clone()),
            session,
            payload,
            dedup: dedup.clone(),
        });
        Ok(())
    }

    async fn send(
        &self,
        session: SessionId,
        payload: Value,
        dedup: &DeduplicationId,
    ) -> Result<(), TransportError> {
        self.record(DeliveredMessage {
            to: None,
            session,
            payload,
            dedup: dedup.clone(),
        });
        Ok(())
    }

    async fn acknowledge(&self, messages: &[MessageId]) -> Result<(), TransportError> {
        self.inner
            .lock()
            .unwrap()
            .acknowledged
            .extend_from_slice(messages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowRef;

    #[test]
    fn session_derivation_is_deterministic() {
        let flow = FlowId::new("p-1");
        assert_eq!(SessionId::derive(&flow, "a"), SessionId::derive(&flow, "a"));
        assert_ne!(SessionId::derive(&flow, "a"), SessionId::derive(&flow, "b"));
    }

    #[tokio::test]
    async fn loopback_deduplicates_redeliveries() {
        let transport = LoopbackTransport::new();
        let flow = FlowRef::new("ping", "p-1");
        let session = SessionId::derive(flow.flow_id(), "s");
        let dedup = DeduplicationId::derive(&flow, 1, 0);

        for _ in 0..3 {
            transport
                .send_initial(
                    &PartyId::new("charlie"),
                    session,
                    serde_json::json!({"ping": true}),
                    &dedup,
                )
                .await
                .unwrap();
        }

        assert_eq!(transport.deliveries().len(), 1);
        assert_eq!(transport.delivery_count(session), 1);
    }

    #[tokio::test]
    async fn loopback_records_distinct_dedup_ids() {
        let transport = LoopbackTransport::new();
        let flow = FlowRef::new("ping", "p-1");
        let session = SessionId::derive(flow.flow_id(), "s");

        for index in 0..2 {
            transport
                .send(
                    session,
                    serde_json::json!({}),
                    &DeduplicationId::derive(&flow, 1, index),
                )
                .await
                .unwrap();
        }

        assert_eq!(transport.deliveries().len(), 2);
    }
}
