//! Per-flow state machine execution.
//!
//! One `FlowMachine` task owns each live flow. It drains the flow's event
//! queue strictly in submission order, drives the pure transition function,
//! executes the resulting action batch, and persists checkpoints at the
//! suspension points. Failures anywhere in the pipeline are admitted to the
//! hospital, whose disposition decides whether the machine retries from the
//! last checkpoint, parks for observation, or propagates the failure.
//!
//! # Step anatomy
//!
//! 1. `transition(state, event)` produces the next state and action batch
//! 2. the checkpoint (state + action intents) is written atomically
//! 3. the batch executes in order, fail-fast, skipping actions already
//!    recorded; best-effort failures are swallowed
//! 4. the epilogue runs: stay active, park suspended, complete, or fail
//!
//! A discharge retry reloads the checkpoint from the store and re-applies
//! it; if the checkpoint write itself was the casualty, the original event
//! is re-driven through the transition instead. This is also exactly the
//! path a process restart takes, so crash recovery and hospital retries
//! share one code path.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, Epilogue, FlowStatus, PendingAction, SuspendReason};
use crate::config::EngineConfig;
use crate::error::ActionError;
use crate::executor::{ActionContext, ActionExecutor};
use crate::flow::{Action, DeduplicationId, FlowEvent, FlowFailure, FlowRef, Outcome};
use crate::hospital::{Disposition, ErrorHospital, FlowPhase};
use crate::manager::{EventRouter, FlowEntry};
use crate::store::Store;
use crate::transport::MessageId;

/// How a successful step leaves the flow.
enum Step {
    /// Active, waiting for the next event.
    Idle,
    /// Parked until the matching result event arrives.
    Suspended(SuspendReason),
    /// Finished; resolve the handle with the output.
    Completed(Value),
    /// The transition asked for failure; start propagation.
    Failing(FlowFailure),
}

/// What the triage loop is currently retrying.
enum Work {
    /// Run the transition for this event, checkpoint, then apply.
    Drive(FlowEvent<Value>),
    /// Re-apply the staged checkpoint (pending actions + epilogue).
    Apply,
}

pub(crate) struct FlowMachine<S: Store> {
    pub(crate) flow: FlowRef,
    pub(crate) entry: Arc<dyn FlowEntry>,
    pub(crate) store: S,
    pub(crate) executor: Arc<dyn ActionExecutor>,
    pub(crate) hospital: Arc<ErrorHospital>,
    pub(crate) config: EngineConfig,
    pub(crate) router: EventRouter,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) events: mpsc::Receiver<FlowEvent<Value>>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) completion: Option<oneshot::Sender<Result<Value, FlowFailure>>>,

    pub(crate) state: Value,
    pub(crate) sequence: u64,
    pub(crate) recorded: BTreeSet<DeduplicationId>,
    pub(crate) pending_acks: Vec<MessageId>,
    pub(crate) status: FlowStatus,
    pub(crate) retry_count: u32,
    phase: FlowPhase,
    staged: Option<Checkpoint>,
}

impl<S: Store> FlowMachine<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        flow: FlowRef,
        entry: Arc<dyn FlowEntry>,
        store: S,
        executor: Arc<dyn ActionExecutor>,
        hospital: Arc<ErrorHospital>,
        config: EngineConfig,
        router: EventRouter,
        workers: Arc<Semaphore>,
        events: mpsc::Receiver<FlowEvent<Value>>,
        shutdown: watch::Receiver<bool>,
        completion: Option<oneshot::Sender<Result<Value, FlowFailure>>>,
        initial_state: Value,
    ) -> Self {
        Self {
            flow,
            entry,
            store,
            executor,
            hospital,
            config,
            router,
            workers,
            events,
            shutdown,
            completion,
            state: initial_state,
            sequence: 0,
            recorded: BTreeSet::new(),
            pending_acks: vec![],
            status: FlowStatus::Unstarted,
            retry_count: 0,
            phase: FlowPhase::Normal,
            staged: None,
        }
    }

    /// Run the machine until the flow terminates, the manager shuts down,
    /// or the flow is removed (event channel closed).
    pub(crate) async fn run(mut self) {
        debug!(flow = %self.flow, "flow machine started");

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    // Bound cross-flow parallelism; the permit is released
                    // at every suspension point.
                    let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                        break;
                    };
                    let terminal = self.process(event).await;
                    drop(permit);
                    if terminal {
                        break;
                    }
                }
                changed = self.shutdown.changed() => {
                    // A dropped sender means the manager itself is gone.
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!(flow = %self.flow, "flow machine shutting down");
                        break;
                    }
                }
            }
        }

        self.router.deregister(self.flow.flow_id());
        debug!(flow = %self.flow, status = ?self.status, "flow machine stopped");
    }

    /// Process one event to quiescence. Returns `true` when the flow has
    /// reached a terminal state.
    async fn process(&mut self, event: FlowEvent<Value>) -> bool {
        debug!(flow = %self.flow, event = event.name(), "processing event");
        self.phase = FlowPhase::Normal;

        match event {
            FlowEvent::Resume | FlowEvent::RetryRequest => match self.reload().await {
                Ok(true) => self.run_work(Work::Apply).await,
                Ok(false) => {
                    debug!(flow = %self.flow, "nothing to resume");
                    false
                }
                Err(()) => {
                    self.park_observation();
                    false
                }
            },
            FlowEvent::Error { error } => self.process_error(error).await,
            event => self.run_work(Work::Drive(event)).await,
        }
    }

    /// The triage loop: execute work, admit failures, and follow the
    /// hospital's dispositions until the step succeeds or the flow parks.
    async fn run_work(&mut self, mut work: Work) -> bool {
        let drove_from = self.sequence;

        loop {
            let result = match &work {
                Work::Drive(event) => self.drive(event.clone()).await,
                Work::Apply => self.apply().await,
            };

            match result {
                Ok(Step::Idle) => {
                    self.step_succeeded();
                    self.status = FlowStatus::Active;
                    return false;
                }
                Ok(Step::Suspended(reason)) => {
                    self.step_succeeded();
                    debug!(flow = %self.flow, ?reason, "flow suspended");
                    self.status = FlowStatus::Suspended { reason };
                    return false;
                }
                Ok(Step::Completed(output)) => {
                    self.step_succeeded();
                    return self.finish(Ok(output));
                }
                Ok(Step::Failing(failure)) => {
                    return self.propagate(failure).await;
                }
                Err(error) => match self.hospital.admit(&self.flow, &error, self.phase) {
                    Disposition::Discharge => {
                        self.retry_count += 1;
                        let backoff = self.config.retry_policy.backoff_duration(self.retry_count);
                        debug!(
                            flow = %self.flow,
                            error = %error,
                            retry = self.retry_count,
                            ?backoff,
                            "discharged; retrying from last checkpoint"
                        );
                        tokio::time::sleep(backoff).await;

                        match self.reload().await {
                            Ok(_) => {
                                // If the failed step got its checkpoint down
                                // before dying, replay the checkpoint;
                                // otherwise re-drive the original event.
                                if matches!(work, Work::Drive(_)) && self.sequence > drove_from {
                                    work = Work::Apply;
                                }
                            }
                            Err(()) => {
                                self.park_observation();
                                return false;
                            }
                        }
                    }
                    Disposition::Observe => {
                        self.park_observation();
                        return false;
                    }
                    Disposition::Propagate => {
                        return self.propagate(FlowFailure::new(error.to_string())).await;
                    }
                    Disposition::Swallow => {
                        // Only reachable for errors already stamped
                        // best-effort; proceed as if the step succeeded.
                        self.status = FlowStatus::Active;
                        return false;
                    }
                },
            }
        }
    }

    /// Triage an error raised outside the processing thread (e.g. the
    /// commit pipeline failing while the flow sits suspended).
    async fn process_error(&mut self, error: ActionError) -> bool {
        warn!(flow = %self.flow, error = %error, "asynchronous failure reported");
        match self.hospital.admit(&self.flow, &error, FlowPhase::Normal) {
            Disposition::Discharge => {
                self.retry_count += 1;
                tokio::time::sleep(self.config.retry_policy.backoff_duration(self.retry_count))
                    .await;
                match self.reload().await {
                    Ok(true) => self.run_work(Work::Apply).await,
                    Ok(false) => false,
                    Err(()) => {
                        self.park_observation();
                        false
                    }
                }
            }
            Disposition::Observe => {
                self.park_observation();
                false
            }
            Disposition::Propagate => self.propagate(FlowFailure::new(error.to_string())).await,
            Disposition::Swallow => false,
        }
    }

    /// Evaluate the transition for an event, checkpoint the result, then
    /// apply it.
    async fn drive(&mut self, event: FlowEvent<Value>) -> Result<Step, ActionError> {
        if let FlowEvent::Message { message_id, .. } = &event {
            if !self.pending_acks.contains(message_id) {
                self.pending_acks.push(*message_id);
            }
        }

        let transition = self
            .entry
            .transition(self.flow.flow_id(), self.state.clone(), event)?;

        let sequence = self.sequence + 1;
        let mut suspend = None;
        let pending_actions: Vec<PendingAction> = transition
            .actions
            .iter()
            .enumerate()
            .map(|(index, action)| {
                if let Some(reason) = action.suspension() {
                    suspend = Some(reason);
                }
                PendingAction {
                    dedup: DeduplicationId::derive(&self.flow, sequence, index),
                    action: action.clone(),
                }
            })
            .collect();

        let epilogue = match (suspend, transition.outcome) {
            (Some(reason), _) => Epilogue::Await { reason },
            (None, Outcome::Continue) => Epilogue::Idle,
            (None, Outcome::Complete(output)) => Epilogue::Complete { output },
            (None, Outcome::Fail(failure)) => Epilogue::Fail { failure },
        };

        let checkpoint = Checkpoint {
            sequence,
            state: transition.state,
            pending_actions,
            recorded: self.recorded.clone(),
            pending_acks: self.pending_acks.clone(),
            epilogue,
        };

        // The checkpoint and the intent to execute its actions land
        // together, or not at all.
        self.store
            .save_checkpoint(&self.flow, &checkpoint)
            .await
            .map_err(|e| ActionError::storage("commit-checkpoint", &e))?;

        self.sequence = checkpoint.sequence;
        self.state = checkpoint.state.clone();
        self.staged = Some(checkpoint);
        self.apply().await
    }

    /// Execute the staged checkpoint's pending actions in order, fail-fast,
    /// then run its epilogue.
    async fn apply(&mut self) -> Result<Step, ActionError> {
        let checkpoint = self.staged.clone().ok_or_else(|| {
            ActionError::new(
                crate::error::ErrorKind::Internal,
                "apply-checkpoint",
                "no staged checkpoint",
            )
        })?;

        let mut dirty = false;
        for pending in &checkpoint.pending_actions {
            let repeatable = pending.action.is_repeatable();
            if !repeatable && self.recorded.contains(&pending.dedup) {
                continue;
            }

            let ctx = ActionContext {
                flow: self.flow.clone(),
                sequence: checkpoint.sequence,
                attempt: self.retry_count + 1,
                dedup: pending.dedup.clone(),
                enqueued_at: OffsetDateTime::now_utc(),
            };

            match self.executor.execute(&ctx, &pending.action).await {
                Ok(()) => {
                    if !repeatable {
                        self.recorded.insert(pending.dedup.clone());
                        dirty = true;
                    }
                    if let Action::AcknowledgeMessages { messages } = &pending.action {
                        self.pending_acks.retain(|m| !messages.contains(m));
                    }
                }
                Err(error) => {
                    let error = error.for_action(&pending.action);
                    if error.best_effort {
                        // Triaged and swallowed: no counters, no retry, the
                        // flow proceeds as if the bookkeeping succeeded.
                        self.hospital.admit(&self.flow, &error, self.phase);
                        if !repeatable {
                            self.recorded.insert(pending.dedup.clone());
                            dirty = true;
                        }
                        if let Action::AcknowledgeMessages { messages } = &pending.action {
                            self.pending_acks.retain(|m| !messages.contains(m));
                        }
                        continue;
                    }
                    return Err(error);
                }
            }
        }

        match checkpoint.epilogue {
            Epilogue::Idle => Ok(Step::Idle),
            Epilogue::Await { reason } => {
                if dirty {
                    // Persist the recorded side effects so a restart while
                    // suspended does not replay them. Repeatable actions
                    // (commit requests) stay pending: a resume must
                    // re-issue them.
                    let next = Checkpoint {
                        sequence: checkpoint.sequence + 1,
                        state: self.state.clone(),
                        pending_actions: checkpoint
                            .pending_actions
                            .iter()
                            .filter(|p| p.action.is_repeatable())
                            .cloned()
                            .collect(),
                        recorded: self.recorded.clone(),
                        pending_acks: self.pending_acks.clone(),
                        epilogue: Epilogue::Await {
                            reason: reason.clone(),
                        },
                    };
                    self.store
                        .save_checkpoint(&self.flow, &next)
                        .await
                        .map_err(|e| ActionError::storage("commit-checkpoint", &e))?;
                    self.sequence = next.sequence;
                    self.staged = Some(next);
                }
                Ok(Step::Suspended(reason))
            }
            Epilogue::Complete { output } => {
                self.store
                    .delete_checkpoint(&self.flow)
                    .await
                    .map_err(|e| ActionError::storage("delete-checkpoint", &e))?;
                Ok(Step::Completed(output))
            }
            Epilogue::Fail { failure } => Ok(Step::Failing(failure)),
        }
    }

    /// Reload the flow's continuation from the store.
    ///
    /// Failures of this path are the manager-level double fault: they are
    /// counted as `discharged_retry` and retried with the restart policy;
    /// exhausting it parks the flow. Returns `Ok(false)` when no checkpoint
    /// exists (the flow never got its first one down), after resetting the
    /// runtime state so the original event can be re-driven.
    async fn reload(&mut self) -> Result<bool, ()> {
        let mut failures = 0u32;
        loop {
            match self.store.load_checkpoint(&self.flow).await {
                Ok(Some(checkpoint)) => {
                    self.sequence = checkpoint.sequence;
                    self.state = checkpoint.state.clone();
                    self.recorded = checkpoint.recorded.clone();
                    self.pending_acks = checkpoint.pending_acks.clone();
                    self.staged = Some(checkpoint);
                    return Ok(true);
                }
                Ok(None) => {
                    self.sequence = 0;
                    self.recorded.clear();
                    self.pending_acks.clear();
                    self.staged = None;
                    self.state = self.entry.initial_state().map_err(|e| {
                        warn!(flow = %self.flow, error = %e, "initial state unavailable");
                    })?;
                    return Ok(false);
                }
                Err(error) => {
                    failures += 1;
                    self.hospital.note_restart_failure(&self.flow);
                    warn!(
                        flow = %self.flow,
                        error = %error,
                        failures,
                        "restart path failed"
                    );
                    if !self.config.restart_policy.should_retry(failures) {
                        return Err(());
                    }
                    tokio::time::sleep(self.config.restart_policy.backoff_duration(failures))
                        .await;
                }
            }
        }
    }

    /// Unwind the flow: report the failure and delete the checkpoint, with
    /// the propagation sub-loop's own retry budget. Always terminal.
    async fn propagate(&mut self, failure: FlowFailure) -> bool {
        self.phase = FlowPhase::Propagating;
        info!(flow = %self.flow, %failure, "propagating flow failure");

        let mut failures = 0u32;
        loop {
            match self.run_propagation(&failure).await {
                Ok(()) => {
                    self.hospital.note_propagated(&self.flow);
                    break;
                }
                Err(error) => {
                    self.hospital.admit(&self.flow, &error, FlowPhase::Propagating);
                    failures += 1;
                    if !self.config.propagation_policy.should_retry(failures) {
                        warn!(
                            flow = %self.flow,
                            error = %error,
                            "propagation budget exhausted; terminating flow"
                        );
                        self.hospital.note_propagated(&self.flow);
                        break;
                    }
                    tokio::time::sleep(
                        self.config.propagation_policy.backoff_duration(failures),
                    )
                    .await;
                }
            }
        }

        self.finish(Err(failure))
    }

    async fn run_propagation(&mut self, failure: &FlowFailure) -> Result<(), ActionError> {
        let action: Action<Value> = Action::PropagateError {
            failure: failure.clone(),
        };
        let ctx = ActionContext {
            flow: self.flow.clone(),
            sequence: self.sequence + 1,
            attempt: self.retry_count + 1,
            dedup: DeduplicationId::derive(&self.flow, self.sequence + 1, 0),
            enqueued_at: OffsetDateTime::now_utc(),
        };
        self.executor.execute(&ctx, &action).await?;
        self.store
            .delete_checkpoint(&self.flow)
            .await
            .map_err(|e| ActionError::storage("delete-checkpoint", &e))
    }

    fn step_succeeded(&mut self) {
        if self.retry_count > 0 {
            self.hospital.note_recovered(&self.flow);
            self.retry_count = 0;
        }
    }

    fn park_observation(&mut self) {
        self.status = FlowStatus::Suspended {
            reason: SuspendReason::Observation,
        };
        warn!(flow = %self.flow, "flow parked for observation");
    }

    fn finish(&mut self, outcome: Result<Value, FlowFailure>) -> bool {
        self.status = match &outcome {
            Ok(_) => FlowStatus::Completed,
            Err(_) => FlowStatus::Failed,
        };
        info!(flow = %self.flow, status = ?self.status, "flow finished");
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
        true
    }
}
