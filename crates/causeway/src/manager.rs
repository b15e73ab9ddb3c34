//! Flow supervision: registry, event routing and the manager API.
//!
//! The [`FlowManager`] supervises the set of live flow machines: it starts
//! new flows, dispatches incoming events to the right machine, restarts
//! non-terminal flows from their checkpoints on process start, and exposes
//! the observability queries used by operational tooling.
//!
//! # Example
//!
//! ```ignore
//! let manager = FlowManager::builder(MemoryStore::new())
//!     .register::<CreateGroupFlow>()
//!     .register::<ModifyMembershipFlow>()
//!     .build()?;
//!
//! manager.resume_all_from_store().await?;
//!
//! let handle = manager.start::<CreateGroupFlow>("grp-1", args).await?;
//! let outcome = handle.result_within(Duration::from_secs(30)).await?;
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ActionError, Error, ErrorKind, Result};
use crate::executor::{ActionExecutor, EngineExecutor};
use crate::flow::{
    Action, Flow, FlowEvent, FlowFailure, FlowId, FlowRef, HasFlowId, Outcome,
};
use crate::hospital::{ErrorHospital, HospitalCounts, HospitalRecord};
use crate::machine::FlowMachine;
use crate::notary::{
    AcceptAllSignatures, NotaryConfig, NotaryService, RequestAuthenticator,
};
use crate::store::Store;
use crate::transport::{LoopbackTransport, MessageId, SessionId, Transport};

/// Result of a type-erased transition.
pub(crate) struct ErasedTransition {
    pub state: Value,
    pub actions: Vec<Action<Value>>,
    pub outcome: Outcome<Value>,
}

/// Type-erased flow entry for dynamic dispatch.
///
/// Allows the registry to hold different flow types in a single map while
/// the machines drive them through JSON-erased state and payloads.
pub(crate) trait FlowEntry: Send + Sync {
    /// The serialized default state of a fresh flow.
    fn initial_state(&self) -> std::result::Result<Value, serde_json::Error>;

    /// Evaluate the typed transition through the erasure boundary.
    fn transition(
        &self,
        id: &FlowId,
        state: Value,
        event: FlowEvent<Value>,
    ) -> std::result::Result<ErasedTransition, ActionError>;
}

fn transition_error(message: impl std::fmt::Display) -> ActionError {
    ActionError::new(ErrorKind::InvalidTransition, "transition", message.to_string())
}

fn erase_action<M: Serialize>(
    action: Action<M>,
) -> std::result::Result<Action<Value>, serde_json::Error> {
    Ok(match action {
        Action::SendInitial {
            to,
            session,
            payload,
        } => Action::SendInitial {
            to,
            session,
            payload: serde_json::to_value(payload)?,
        },
        Action::Send { session, payload } => Action::Send {
            session,
            payload: serde_json::to_value(payload)?,
        },
        Action::AcknowledgeMessages { messages } => Action::AcknowledgeMessages { messages },
        Action::RequestCommit { request } => Action::RequestCommit { request },
        Action::AwaitMessage { session } => Action::AwaitMessage { session },
        Action::PropagateError { failure } => Action::PropagateError { failure },
    })
}

/// Typed flow entry capturing concrete types at registration.
struct TypedFlowEntry<F: Flow>(PhantomData<F>);

impl<F: Flow> FlowEntry for TypedFlowEntry<F> {
    fn initial_state(&self) -> std::result::Result<Value, serde_json::Error> {
        serde_json::to_value(F::State::default())
    }

    fn transition(
        &self,
        id: &FlowId,
        state: Value,
        event: FlowEvent<Value>,
    ) -> std::result::Result<ErasedTransition, ActionError> {
        let state: F::State = if state.is_null() {
            F::State::default()
        } else {
            serde_json::from_value(state).map_err(transition_error)?
        };

        let event: FlowEvent<F::Message> = match event {
            FlowEvent::Start { args } => FlowEvent::Start {
                args: serde_json::from_value(args).map_err(transition_error)?,
            },
            FlowEvent::Message {
                session,
                message_id,
                payload,
            } => FlowEvent::Message {
                session,
                message_id,
                payload: serde_json::from_value(payload).map_err(transition_error)?,
            },
            FlowEvent::CommitResult { tx_id, result } => {
                FlowEvent::CommitResult { tx_id, result }
            }
            FlowEvent::Resume => FlowEvent::Resume,
            FlowEvent::RetryRequest => FlowEvent::RetryRequest,
            FlowEvent::Error { error } => FlowEvent::Error { error },
        };

        let (state, actions, outcome) = F::transition(id, state, event).into_parts();

        Ok(ErasedTransition {
            state: serde_json::to_value(state).map_err(transition_error)?,
            actions: actions
                .into_iter()
                .map(erase_action)
                .collect::<std::result::Result<_, _>>()
                .map_err(transition_error)?,
            outcome: match outcome {
                Outcome::Continue => Outcome::Continue,
                Outcome::Complete(output) => {
                    Outcome::Complete(serde_json::to_value(output).map_err(transition_error)?)
                }
                Outcome::Fail(failure) => Outcome::Fail(failure),
            },
        })
    }
}

struct RegisteredFlow {
    flow: FlowRef,
    events: mpsc::Sender<FlowEvent<Value>>,
}

/// Routes events to live flow machines.
///
/// Shared by the manager, the machines (for deregistration) and the
/// executor (for feeding asynchronous results back in).
#[derive(Clone, Default)]
pub struct EventRouter {
    inner: Arc<Mutex<HashMap<FlowId, RegisteredFlow>>>,
}

impl EventRouter {
    fn register(&self, flow: FlowRef, events: mpsc::Sender<FlowEvent<Value>>) {
        self.inner
            .lock()
            .unwrap()
            .insert(flow.flow_id().clone(), RegisteredFlow { flow, events });
    }

    pub(crate) fn deregister(&self, flow_id: &FlowId) -> Option<FlowRef> {
        self.inner
            .lock()
            .unwrap()
            .remove(flow_id)
            .map(|registered| registered.flow)
    }

    fn contains(&self, flow_id: &FlowId) -> bool {
        self.inner.lock().unwrap().contains_key(flow_id)
    }

    fn live_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Submit an event to a live flow. Applies backpressure when the
    /// flow's event queue is full.
    pub async fn submit(&self, flow_id: &FlowId, event: FlowEvent<Value>) -> Result<()> {
        let sender = {
            let inner = self.inner.lock().unwrap();
            inner
                .get(flow_id)
                .map(|registered| registered.events.clone())
        }
        .ok_or_else(|| Error::UnknownFlow(flow_id.to_string()))?;

        sender
            .send(event)
            .await
            .map_err(|_| Error::UnknownFlow(flow_id.to_string()))
    }
}

type ExecutorLayer = Box<dyn FnOnce(Arc<dyn ActionExecutor>) -> Arc<dyn ActionExecutor> + Send>;

/// Builder for constructing a [`FlowManager`].
///
/// Register flow types, then wire the collaborators (transport,
/// authenticator) and configuration before building.
pub struct FlowManagerBuilder<S: Store> {
    store: S,
    registry: HashMap<&'static str, Arc<dyn FlowEntry>>,
    duplicate_flow_type: Option<String>,
    config: EngineConfig,
    notary_config: NotaryConfig,
    transport: Option<Arc<dyn Transport>>,
    authenticator: Arc<dyn RequestAuthenticator>,
    executor_layers: Vec<ExecutorLayer>,
    hospital: Option<Arc<ErrorHospital>>,
}

impl<S: Store> FlowManagerBuilder<S> {
    fn new(store: S) -> Self {
        Self {
            store,
            registry: HashMap::new(),
            duplicate_flow_type: None,
            config: EngineConfig::default(),
            notary_config: NotaryConfig::default(),
            transport: None,
            authenticator: Arc::new(AcceptAllSignatures),
            executor_layers: vec![],
            hospital: None,
        }
    }

    /// Register a flow type. Each type can only be registered once;
    /// duplicates are reported at build time.
    pub fn register<F: Flow>(mut self) -> Self {
        if self.registry.contains_key(F::TYPE) {
            if self.duplicate_flow_type.is_none() {
                self.duplicate_flow_type = Some(F::TYPE.to_string());
            }
            return self;
        }
        self.registry
            .insert(F::TYPE, Arc::new(TypedFlowEntry::<F>(PhantomData)));
        self
    }

    /// Set the engine configuration. If not called, uses
    /// [`EngineConfig::default()`].
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the uniqueness service configuration.
    pub fn notary_config(mut self, config: NotaryConfig) -> Self {
        self.notary_config = config;
        self
    }

    /// Set the transport. Defaults to an in-process
    /// [`LoopbackTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the commit request authenticator. Defaults to
    /// [`AcceptAllSignatures`].
    pub fn authenticator(mut self, authenticator: Arc<dyn RequestAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Wrap the engine's action executor, e.g. to inject faults in tests
    /// or add instrumentation. Layers apply in registration order, the
    /// first layer closest to the engine executor.
    pub fn layer_executor(
        mut self,
        layer: impl FnOnce(Arc<dyn ActionExecutor>) -> Arc<dyn ActionExecutor> + Send + 'static,
    ) -> Self {
        self.executor_layers.push(Box::new(layer));
        self
    }

    /// Use a custom hospital (e.g. a custom staff table). Defaults to the
    /// standard staff with the configured retry budget.
    pub fn hospital(mut self, hospital: Arc<ErrorHospital>) -> Self {
        self.hospital = Some(hospital);
        self
    }

    /// Build the manager, spawning the uniqueness service worker. Must be
    /// called from within a Tokio runtime.
    pub fn build(self) -> Result<FlowManager<S>> {
        if let Some(flow_type) = self.duplicate_flow_type {
            return Err(Error::DuplicateFlowType(flow_type));
        }

        let router = EventRouter::default();
        let notary = NotaryService::spawn(
            self.store.clone(),
            self.notary_config,
            self.authenticator,
        );
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LoopbackTransport::new()));

        let mut executor: Arc<dyn ActionExecutor> = Arc::new(EngineExecutor::new(
            transport,
            Arc::clone(&notary),
            router.clone(),
        ));
        for layer in self.executor_layers {
            executor = layer(executor);
        }

        let hospital = self
            .hospital
            .unwrap_or_else(|| Arc::new(ErrorHospital::new(self.config.retry_policy.max_attempts)));

        let (shutdown, _) = watch::channel(false);

        info!(flows = self.registry.len(), "flow manager built");
        Ok(FlowManager {
            inner: Arc::new(ManagerInner {
                store: self.store,
                registry: self.registry,
                executor,
                hospital,
                workers: Arc::new(Semaphore::new(self.config.flow_workers.max(1))),
                config: self.config,
                router,
                notary,
                shutdown,
            }),
        })
    }
}

struct ManagerInner<S: Store> {
    store: S,
    registry: HashMap<&'static str, Arc<dyn FlowEntry>>,
    executor: Arc<dyn ActionExecutor>,
    hospital: Arc<ErrorHospital>,
    workers: Arc<Semaphore>,
    config: EngineConfig,
    router: EventRouter,
    notary: Arc<NotaryService>,
    shutdown: watch::Sender<bool>,
}

/// Supervisor for the set of live flow state machines.
///
/// Cheap to clone; all clones share the same machines, counters and
/// collaborators. Observability state (hospital counters, live flow and
/// checkpoint counts) is scoped to the manager's lifetime and reset only
/// by building a new manager.
pub struct FlowManager<S: Store> {
    inner: Arc<ManagerInner<S>>,
}

impl<S: Store> Clone for FlowManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Store> FlowManager<S> {
    /// Create a new manager builder over the given store.
    pub fn builder(store: S) -> FlowManagerBuilder<S> {
        FlowManagerBuilder::new(store)
    }

    /// Start a new flow and return a handle to its eventual outcome.
    ///
    /// Flow ids are unique across the engine; starting a second flow with
    /// a live id fails with [`Error::DuplicateFlow`].
    pub async fn start<F: Flow>(
        &self,
        id: impl Into<FlowId>,
        args: F::Message,
    ) -> Result<FlowHandle<F::Output>> {
        let entry = self
            .inner
            .registry
            .get(F::TYPE)
            .ok_or_else(|| Error::UnknownFlowType(F::TYPE.to_string()))?
            .clone();

        let flow_id: FlowId = id.into();
        let flow = FlowRef::new(F::TYPE, flow_id.clone());
        if self.inner.router.contains(&flow_id) {
            return Err(Error::DuplicateFlow(flow_id.to_string()));
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        self.spawn_machine(flow, entry, Some(completion_tx))?;

        let args = serde_json::to_value(args)?;
        self.inner
            .router
            .submit(&flow_id, FlowEvent::Start { args })
            .await?;

        Ok(FlowHandle {
            flow: flow_id,
            rx: completion_rx,
            _marker: PhantomData,
        })
    }

    /// Reconstruct every non-terminal flow from its last persisted
    /// checkpoint and re-drive it with a synthetic `Resume` event. Returns
    /// the number of flows resumed.
    ///
    /// Actions already durably recorded in a checkpoint are never
    /// re-executed; in-flight commit requests are re-issued (the
    /// uniqueness service deduplicates by transaction id).
    pub async fn resume_all_from_store(&self) -> Result<usize> {
        let flows = self.inner.store.list_non_terminal_flows().await?;
        let mut resumed = 0;

        for flow in flows {
            if self.inner.router.contains(flow.flow_id()) {
                continue;
            }
            let entry = self
                .inner
                .registry
                .get(flow.flow_type())
                .ok_or_else(|| Error::UnknownFlowType(flow.flow_type().to_string()))?
                .clone();

            let flow_id = flow.flow_id().clone();
            self.spawn_machine(flow, entry, None)?;
            self.inner.router.submit(&flow_id, FlowEvent::Resume).await?;
            resumed += 1;
        }

        info!(resumed, "resumed flows from store");
        Ok(resumed)
    }

    /// Submit an event to a live flow. Safe to call concurrently from any
    /// number of sources; a single flow's events are processed strictly in
    /// submission order.
    pub async fn submit(&self, flow_id: &FlowId, event: FlowEvent<Value>) -> Result<()> {
        self.inner.router.submit(flow_id, event).await
    }

    /// Deliver an inbound message, routing by the flow id embedded in the
    /// payload. Returns the delivery's message id.
    pub async fn deliver<M>(&self, session: SessionId, payload: M) -> Result<MessageId>
    where
        M: HasFlowId + Serialize,
    {
        let flow_id = payload.flow_id();
        let message_id = MessageId::generate();
        self.submit(
            &flow_id,
            FlowEvent::Message {
                session,
                message_id,
                payload: serde_json::to_value(payload)?,
            },
        )
        .await?;
        Ok(message_id)
    }

    /// Ask a flow parked for observation to retry from its checkpoint.
    pub async fn retry_flow(&self, flow_id: &FlowId) -> Result<()> {
        self.submit(flow_id, FlowEvent::RetryRequest).await
    }

    /// Remove a flow: stop its machine and delete its checkpoint.
    pub async fn remove_flow(&self, flow_id: &FlowId) -> Result<()> {
        let flow = self
            .inner
            .router
            .deregister(flow_id)
            .ok_or_else(|| Error::UnknownFlow(flow_id.to_string()))?;
        self.inner.store.delete_checkpoint(&flow).await?;
        warn!(%flow, "flow removed");
        Ok(())
    }

    /// Process-wide hospital counters.
    pub fn hospital_counts(&self) -> HospitalCounts {
        self.inner.hospital.counts()
    }

    /// A single flow's hospital record, if it was ever admitted.
    pub fn hospital_record(&self, flow_id: &FlowId) -> Option<HospitalRecord> {
        self.inner.hospital.record(flow_id)
    }

    /// Number of live (non-terminal) flow machines.
    pub fn live_flow_count(&self) -> usize {
        self.inner.router.live_count()
    }

    /// Number of checkpoints currently persisted.
    pub async fn checkpoint_count(&self) -> Result<usize> {
        self.inner.store.checkpoint_count().await
    }

    /// The uniqueness service handle.
    pub fn notary(&self) -> &Arc<NotaryService> {
        &self.inner.notary
    }

    /// Advisory estimate of the wait for a commit touching `num_states`
    /// states.
    pub fn estimated_commit_wait(&self, num_states: usize) -> Duration {
        self.inner.notary.estimated_wait(num_states)
    }

    /// Signal every flow machine to stop after its current step.
    pub fn shutdown(&self) {
        debug!("flow manager shutting down");
        let _ = self.inner.shutdown.send(true);
    }

    fn spawn_machine(
        &self,
        flow: FlowRef,
        entry: Arc<dyn FlowEntry>,
        completion: Option<oneshot::Sender<std::result::Result<Value, FlowFailure>>>,
    ) -> Result<()> {
        let initial_state = entry.initial_state()?;

        let (events_tx, events_rx) = mpsc::channel(self.inner.config.event_buffer.max(1));
        self.inner.router.register(flow.clone(), events_tx);

        let machine = FlowMachine::new(
            flow,
            entry,
            self.inner.store.clone(),
            Arc::clone(&self.inner.executor),
            Arc::clone(&self.inner.hospital),
            self.inner.config.clone(),
            self.inner.router.clone(),
            Arc::clone(&self.inner.workers),
            events_rx,
            self.inner.shutdown.subscribe(),
            completion,
            initial_state,
        );
        tokio::spawn(machine.run());
        Ok(())
    }
}

/// Handle to a started flow's eventual outcome.
///
/// Resolves to the flow's output, a structured failure for `Failed` flows,
/// or a timeout for flows parked past the caller's patience. A timed-out
/// caller does not cancel the flow or roll back committed side effects; the
/// hospital may still be retrying it (only the observability queries can
/// tell the difference).
#[derive(Debug)]
pub struct FlowHandle<O> {
    flow: FlowId,
    rx: oneshot::Receiver<std::result::Result<Value, FlowFailure>>,
    _marker: PhantomData<fn() -> O>,
}

impl<O: DeserializeOwned> FlowHandle<O> {
    /// The flow this handle tracks.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow
    }

    /// Wait for the flow's outcome.
    pub async fn result(self) -> Result<O> {
        let flow = self.flow;
        match self.rx.await {
            Ok(Ok(output)) => Ok(serde_json::from_value(output)?),
            Ok(Err(failure)) => Err(Error::FlowFailed(failure)),
            Err(_) => Err(Error::FlowInterrupted(flow.to_string())),
        }
    }

    /// Wait for the flow's outcome, giving up after `patience`.
    pub async fn result_within(self, patience: Duration) -> Result<O> {
        let flow = self.flow.clone();
        match tokio::time::timeout(patience, self.result()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ResultTimeout(flow.to_string())),
        }
    }
}
