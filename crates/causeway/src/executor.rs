//! Action execution.
//!
//! The [`ActionExecutor`] performs one discrete side effect given an
//! action; side effects are individually retryable and carry deduplication
//! identifiers so redeliveries are suppressed downstream. The engine's
//! default implementation, [`EngineExecutor`], wires actions to the
//! transport, the uniqueness service and the event router; tests wrap it
//! to inject faults at named actions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::ActionError;
use crate::flow::{Action, DeduplicationId, FlowEvent, FlowRef};
use crate::manager::EventRouter;
use crate::notary::NotaryService;
use crate::transport::Transport;

/// Context provided to action executors.
///
/// `dedup` is stable across retries of the same checkpointed batch and
/// unique across batches; pass it to external services that support
/// idempotency keys.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// The flow this action belongs to.
    pub flow: FlowRef,
    /// Sequence of the checkpoint that committed this action.
    pub sequence: u64,
    /// Current attempt (1-based; first retry is attempt 2).
    pub attempt: u32,
    /// Deduplication identifier for this action instance.
    pub dedup: DeduplicationId,
    /// When the owning checkpoint was written.
    pub enqueued_at: OffsetDateTime,
}

impl ActionContext {
    /// Idempotency key for external service calls; stable across retries.
    pub fn idempotency_key(&self) -> &str {
        self.dedup.as_str()
    }

    /// Returns `true` if this is a retry (attempt > 1).
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}

/// Executes one action. Implementations must be idempotent under retry or
/// rely on the deduplication id carried in the context.
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    async fn execute(&self, ctx: &ActionContext, action: &Action<Value>)
        -> Result<(), ActionError>;
}

/// The engine's default executor.
///
/// Routes sends and acknowledgments to the transport and commit requests
/// to the uniqueness service. Commit requests are fire-and-forget from the
/// executor's point of view: a task awaits the service and feeds the
/// outcome back through the event router while the flow sits suspended.
pub struct EngineExecutor {
    transport: Arc<dyn Transport>,
    notary: Arc<NotaryService>,
    router: EventRouter,
}

impl EngineExecutor {
    /// Create an executor over the given collaborators.
    pub fn new(
        transport: Arc<dyn Transport>,
        notary: Arc<NotaryService>,
        router: EventRouter,
    ) -> Self {
        Self {
            transport,
            notary,
            router,
        }
    }
}

#[async_trait]
impl ActionExecutor for EngineExecutor {
    async fn execute(
        &self,
        ctx: &ActionContext,
        action: &Action<Value>,
    ) -> Result<(), ActionError> {
        match action {
            Action::SendInitial {
                to,
                session,
                payload,
            } => self
                .transport
                .send_initial(to, *session, payload.clone(), &ctx.dedup)
                .await
                .map_err(|e| ActionError::network(action.name(), e)),

            Action::Send { session, payload } => self
                .transport
                .send(*session, payload.clone(), &ctx.dedup)
                .await
                .map_err(|e| ActionError::network(action.name(), e)),

            Action::AcknowledgeMessages { messages } => self
                .transport
                .acknowledge(messages)
                .await
                .map_err(|e| ActionError::network(action.name(), e)),

            Action::RequestCommit { request } => {
                let notary = Arc::clone(&self.notary);
                let router = self.router.clone();
                let flow = ctx.flow.clone();
                let request = request.clone();

                tokio::spawn(async move {
                    let tx_id = request.tx_id;
                    let event = match notary.commit(request).await {
                        Ok(outcome) => FlowEvent::CommitResult {
                            tx_id,
                            result: outcome,
                        },
                        Err(e) => FlowEvent::Error {
                            error: ActionError::storage("request-commit", &e),
                        },
                    };
                    if let Err(e) = router.submit(flow.flow_id(), event).await {
                        // The flow may have been removed while the commit
                        // was in flight; its next resume re-issues the
                        // request.
                        warn!(%flow, error = %e, "failed to deliver commit result");
                    }
                });
                Ok(())
            }

            // Pure suspension marker; resumption is driven by message
            // delivery.
            Action::AwaitMessage { .. } => Ok(()),

            Action::PropagateError { failure } => {
                warn!(flow = %ctx.flow, %failure, "propagating flow failure to counterparties");
                Ok(())
            }
        }
        .inspect(|_| debug!(flow = %ctx.flow, action = action.name(), dedup = %ctx.dedup, "action executed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_the_dedup_id() {
        let flow = FlowRef::new("ping", "p-1");
        let ctx = ActionContext {
            flow: flow.clone(),
            sequence: 1,
            attempt: 1,
            dedup: DeduplicationId::derive(&flow, 1, 0),
            enqueued_at: OffsetDateTime::UNIX_EPOCH,
        };

        assert_eq!(ctx.idempotency_key(), "ping:p-1:1:0");
        assert!(!ctx.is_retry());
    }
}
