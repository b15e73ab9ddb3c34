//! Uniqueness commit service.
//!
//! Guarantees that every shared resource reference is successfully
//! committed by at most one transaction. Requests are drained by a single
//! worker task, so concurrent requests sharing a reference resolve with
//! exactly one winner; the store-level check-and-insert is the safety net
//! for distributed deployments sharing one record table.
//!
//! The service is invoked asynchronously from flows: the engine submits the
//! request via [`Action::RequestCommit`](crate::Action::RequestCommit),
//! suspends the flow, and delivers the outcome back as a
//! [`FlowEvent::CommitResult`](crate::FlowEvent::CommitResult).

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::transport::PartyId;

/// Transaction identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxId(Uuid);

impl TxId {
    /// Generate a fresh transaction id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for TxId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Reference to a shared state unit whose consumption must be globally
/// exclusive: the `index`-th output of the transaction that produced it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ResourceRef {
    pub tx_id: TxId,
    pub index: u32,
}

impl ResourceRef {
    /// Create a reference to output `index` of `tx_id`.
    pub fn new(tx_id: TxId, index: u32) -> Self {
        Self { tx_id, index }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.index)
    }
}

/// Validity interval for a commit request, evaluated against trusted time
/// before any record is written. `from` is inclusive, `until` exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: Option<OffsetDateTime>,
    pub until: Option<OffsetDateTime>,
}

impl TimeWindow {
    /// A window bounded on both sides.
    pub fn between(from: OffsetDateTime, until: OffsetDateTime) -> Self {
        Self {
            from: Some(from),
            until: Some(until),
        }
    }

    /// A window with only a lower bound.
    pub fn from_only(from: OffsetDateTime) -> Self {
        Self {
            from: Some(from),
            until: None,
        }
    }

    /// A window with only an upper bound.
    pub fn until_only(until: OffsetDateTime) -> Self {
        Self {
            from: None,
            until: Some(until),
        }
    }

    /// Whether `now` falls within the window.
    pub fn contains(&self, now: OffsetDateTime) -> bool {
        self.from.is_none_or(|from| from <= now) && self.until.is_none_or(|until| now < until)
    }
}

/// Opaque signature over a commit request, produced by the caller's
/// signing capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSignature(pub Vec<u8>);

/// A request to commit (consume) a set of resource references.
///
/// Owned by the calling flow for its duration; the service only reads it
/// and writes [`UniquenessRecord`]s. `references` are checked but never
/// consume a uniqueness slot. At least one input is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub inputs: NonEmpty<ResourceRef>,
    pub references: Vec<ResourceRef>,
    pub tx_id: TxId,
    pub requester: PartyId,
    pub signature: RequestSignature,
    pub time_window: Option<TimeWindow>,
}

impl CommitRequest {
    /// Build a minimal request with no references and no time window.
    pub fn new(inputs: NonEmpty<ResourceRef>, tx_id: TxId, requester: PartyId) -> Self {
        Self {
            inputs,
            references: vec![],
            tx_id,
            requester,
            signature: RequestSignature::default(),
            time_window: None,
        }
    }

    /// Attach reference inputs.
    pub fn with_references(mut self, references: impl IntoIterator<Item = ResourceRef>) -> Self {
        self.references.extend(references);
        self
    }

    /// Attach a time window.
    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    /// Attach the caller's request signature.
    pub fn with_signature(mut self, signature: RequestSignature) -> Self {
        self.signature = signature;
        self
    }

    /// Total number of states touched (inputs + references); used for wait
    /// estimation.
    pub fn state_count(&self) -> usize {
        self.inputs.len() + self.references.len()
    }
}

/// The record written for every committed resource reference. At most one
/// ever exists per reference; once written it is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniquenessRecord {
    pub resource: ResourceRef,
    pub committing_tx: TxId,
    pub requester: PartyId,
    pub recorded_at: OffsetDateTime,
}

/// Why a commit request was rejected. Nothing is written when any of these
/// are returned: requests are all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum CommitError {
    /// A requested input (or reference) has already been consumed by a
    /// different transaction.
    #[error("input state {resource} already committed by {committed_by}")]
    InputStateConflict {
        resource: ResourceRef,
        committed_by: TxId,
    },
    /// The current trusted time falls outside the request's time window.
    #[error("time window invalid")]
    TimeWindowInvalid,
    /// A reference input is not known to this service.
    #[error("input state {resource} unknown")]
    InputStateUnknown { resource: ResourceRef },
    /// The request signature failed verification.
    #[error("request signature invalid")]
    RequestSignatureInvalid,
}

/// Outcome of a commit request: success, or a structured rejection.
pub type CommitOutcome = std::result::Result<(), CommitError>;

/// Verifies request signatures. Cryptographic primitives are consumed as
/// an opaque capability; the engine never inspects signature bytes itself.
pub trait RequestAuthenticator: Send + Sync + 'static {
    fn verify(&self, request: &CommitRequest) -> bool;
}

/// Authenticator accepting every request; the default for tests and
/// single-process deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllSignatures;

impl RequestAuthenticator for AcceptAllSignatures {
    fn verify(&self, _request: &CommitRequest) -> bool {
        true
    }
}

impl<T: RequestAuthenticator + ?Sized> RequestAuthenticator for Arc<T> {
    fn verify(&self, request: &CommitRequest) -> bool {
        (**self).verify(request)
    }
}

/// Configuration for the uniqueness service.
#[derive(Debug, Clone)]
pub struct NotaryConfig {
    /// Capacity of the request queue. Default: 256.
    pub queue_capacity: usize,

    /// Assumed processing cost per state before any throughput has been
    /// observed; the fallback for wait estimation. Default: 2ms.
    pub base_state_cost: Duration,

    /// Smoothing factor for the exponentially weighted per-state cost
    /// estimate, in `(0, 1]`. Default: 0.2.
    pub eta_smoothing: f64,
}

impl Default for NotaryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            base_state_cost: Duration::from_millis(2),
            eta_smoothing: 0.2,
        }
    }
}

struct Job {
    request: CommitRequest,
    reply: oneshot::Sender<Result<CommitOutcome>>,
}

/// The uniqueness commit service.
///
/// Create with [`NotaryService::spawn`]; the returned handle is cheap to
/// clone behind an `Arc` and the worker task stops when the last handle is
/// dropped.
pub struct NotaryService {
    tx: mpsc::Sender<Job>,
    queued_states: Arc<AtomicUsize>,
    state_cost: Arc<Mutex<Option<f64>>>,
    config: NotaryConfig,
}

impl NotaryService {
    /// Spawn the service worker over the given store.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S, A>(store: S, config: NotaryConfig, authenticator: A) -> Arc<Self>
    where
        S: Store,
        A: RequestAuthenticator,
    {
        let (tx, mut rx) = mpsc::channel::<Job>(config.queue_capacity);
        let queued_states = Arc::new(AtomicUsize::new(0));
        let state_cost = Arc::new(Mutex::new(None::<f64>));

        let worker_queue = Arc::clone(&queued_states);
        let worker_cost = Arc::clone(&state_cost);
        let smoothing = config.eta_smoothing;
        tokio::spawn(async move {
            info!("uniqueness service started");
            while let Some(job) = rx.recv().await {
                let states = job.request.state_count();
                let started = Instant::now();
                let outcome = process_request(&store, &authenticator, &job.request).await;
                let elapsed = started.elapsed();

                worker_queue.fetch_sub(states, Ordering::Relaxed);
                let per_state = elapsed.as_secs_f64() / states.max(1) as f64;
                if per_state > 0.0 {
                    let mut cost = worker_cost.lock().unwrap();
                    *cost = Some(match *cost {
                        Some(prev) => prev + smoothing * (per_state - prev),
                        None => per_state,
                    });
                }

                let _ = job.reply.send(outcome);
            }
            info!("uniqueness service stopped");
        });

        Arc::new(Self {
            tx,
            queued_states,
            state_cost,
            config,
        })
    }

    /// Submit a commit request and wait for its outcome.
    ///
    /// The outer `Result` carries engine/storage failures; the inner
    /// [`CommitOutcome`] is the notarisation verdict.
    pub async fn commit(&self, request: CommitRequest) -> Result<CommitOutcome> {
        let states = request.state_count();
        self.queued_states.fetch_add(states, Ordering::Relaxed);

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Job {
                request,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            self.queued_states.fetch_sub(states, Ordering::Relaxed);
            return Err(Error::NotaryUnavailable);
        }

        reply_rx.await.map_err(|_| Error::NotaryUnavailable)?
    }

    /// Advisory estimate of how long a request touching `num_states` states
    /// would wait, given current queue depth and observed throughput. Never
    /// affects commit correctness.
    pub fn estimated_wait(&self, num_states: usize) -> Duration {
        let per_state = self
            .state_cost
            .lock()
            .unwrap()
            .unwrap_or_else(|| self.config.base_state_cost.as_secs_f64());
        let pending = self.queued_states.load(Ordering::Relaxed) + num_states;
        Duration::from_secs_f64(per_state * pending as f64)
    }
}

/// Validate and commit one request. Validation order: signature, time
/// window, references, inputs; nothing is written before every check has
/// passed, making the request all-or-nothing.
async fn process_request<S: Store, A: RequestAuthenticator>(
    store: &S,
    authenticator: &A,
    request: &CommitRequest,
) -> Result<CommitOutcome> {
    if !authenticator.verify(request) {
        warn!(tx = %request.tx_id, "commit rejected: bad request signature");
        return Ok(Err(CommitError::RequestSignatureInvalid));
    }

    if let Some(window) = &request.time_window {
        if !window.contains(OffsetDateTime::now_utc()) {
            debug!(tx = %request.tx_id, "commit rejected: outside time window");
            return Ok(Err(CommitError::TimeWindowInvalid));
        }
    }

    // References must exist (be known to this service) but are never
    // consumed. A reference already consumed by another transaction is a
    // conflict.
    for reference in &request.references {
        if let Some(record) = store.uniqueness_record(reference).await? {
            if record.committing_tx != request.tx_id {
                return Ok(Err(CommitError::InputStateConflict {
                    resource: *reference,
                    committed_by: record.committing_tx,
                }));
            }
        } else if !store.is_tx_notarised(reference.tx_id).await? {
            return Ok(Err(CommitError::InputStateUnknown {
                resource: *reference,
            }));
        }
    }

    // First pass: detect conflicts without writing anything.
    for input in request.inputs.iter() {
        if let Some(record) = store.uniqueness_record(input).await? {
            if record.committing_tx != request.tx_id {
                debug!(
                    tx = %request.tx_id,
                    resource = %input,
                    winner = %record.committing_tx,
                    "commit rejected: input state conflict"
                );
                return Ok(Err(CommitError::InputStateConflict {
                    resource: *input,
                    committed_by: record.committing_tx,
                }));
            }
        }
    }

    // Second pass: check-and-insert. A lost race here means another
    // service instance committed the reference between the passes; re-read
    // and report the winner unless it was this very transaction.
    let recorded_at = OffsetDateTime::now_utc();
    for input in request.inputs.iter() {
        let record = UniquenessRecord {
            resource: *input,
            committing_tx: request.tx_id,
            requester: request.requester.clone(),
            recorded_at,
        };
        if !store.insert_uniqueness_record_if_absent(input, &record).await? {
            match store.uniqueness_record(input).await? {
                Some(existing) if existing.committing_tx == request.tx_id => {}
                Some(existing) => {
                    return Ok(Err(CommitError::InputStateConflict {
                        resource: *input,
                        committed_by: existing.committing_tx,
                    }));
                }
                None => {
                    return Err(Error::storage(format!(
                        "uniqueness record for {input} vanished after losing insert race"
                    )));
                }
            }
        }
    }

    store.record_notarised_tx(request.tx_id).await?;
    debug!(tx = %request.tx_id, inputs = request.inputs.len(), "commit succeeded");
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_window_bounds() {
        let now = OffsetDateTime::now_utc();
        let window = TimeWindow::between(now - time::Duration::minutes(1), now + time::Duration::minutes(1));
        assert!(window.contains(now));
        assert!(!window.contains(now + time::Duration::minutes(2)));
        assert!(!window.contains(now - time::Duration::minutes(2)));

        assert!(TimeWindow::from_only(now).contains(now));
        assert!(!TimeWindow::until_only(now).contains(now)); // until is exclusive
    }

    #[test]
    fn request_state_count_includes_references() {
        let a = ResourceRef::new(TxId::random(), 0);
        let b = ResourceRef::new(TxId::random(), 1);
        let request = CommitRequest::new(
            NonEmpty::new(a),
            TxId::random(),
            PartyId::new("alice"),
        )
        .with_references([b]);

        assert_eq!(request.state_count(), 2);
    }

    #[tokio::test]
    async fn estimated_wait_grows_with_request_size() {
        let store = crate::store::MemoryStore::new();
        let notary = NotaryService::spawn(store, NotaryConfig::default(), AcceptAllSignatures);

        let small = notary.estimated_wait(1);
        let large = notary.estimated_wait(100);
        assert!(large > small);
        assert!(small > Duration::ZERO);
    }
}
