//! Scripted fault injection.
//!
//! The integration scenarios need failures at exact points and exact
//! counts ("fail the send action four times, then let it through"). A
//! [`FaultScript`] holds those counters; [`FaultInjectingExecutor`] and
//! [`FaultInjectingStore`] consult it by operation name before delegating
//! to the real implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use causeway::store::Store;
use causeway::{
    Action, ActionContext, ActionError, ActionExecutor, Checkpoint, ErrorKind, FlowRef,
    ResourceRef, TxId, UniquenessRecord,
};
use serde_json::Value;

struct Fault {
    /// `None` = fail every time.
    remaining: Option<u32>,
    kind: ErrorKind,
}

#[derive(Default)]
struct ScriptInner {
    faults: HashMap<String, Fault>,
    observed: HashMap<String, u32>,
}

/// Shared failure script, keyed by operation name (action names like
/// `"send-initial-message"`, or store operations like
/// `"commit-checkpoint"`).
#[derive(Default)]
pub struct FaultScript {
    inner: Mutex<ScriptInner>,
}

impl FaultScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the first `times` executions of `op` with `kind`, then let it
    /// through.
    pub fn fail_times(&self, op: &str, times: u32, kind: ErrorKind) {
        self.inner.lock().unwrap().faults.insert(
            op.to_string(),
            Fault {
                remaining: Some(times),
                kind,
            },
        );
    }

    /// Fail every execution of `op` with `kind`.
    pub fn fail_always(&self, op: &str, kind: ErrorKind) {
        self.inner.lock().unwrap().faults.insert(
            op.to_string(),
            Fault {
                remaining: None,
                kind,
            },
        );
    }

    /// How many times `op` has been attempted (injected failures included).
    pub fn observed(&self, op: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .observed
            .get(op)
            .copied()
            .unwrap_or(0)
    }

    fn check(&self, op: &str) -> Option<ErrorKind> {
        let mut inner = self.inner.lock().unwrap();
        *inner.observed.entry(op.to_string()).or_default() += 1;
        match inner.faults.get_mut(op) {
            Some(fault) => match &mut fault.remaining {
                Some(0) => None,
                Some(n) => {
                    *n -= 1;
                    Some(fault.kind)
                }
                None => Some(fault.kind),
            },
            None => None,
        }
    }
}

/// Executor wrapper failing scripted actions before they reach the engine
/// executor.
pub struct FaultInjectingExecutor {
    inner: Arc<dyn ActionExecutor>,
    script: Arc<FaultScript>,
}

impl FaultInjectingExecutor {
    /// Build a layer for `FlowManagerBuilder::layer_executor`.
    pub fn layer(
        script: Arc<FaultScript>,
    ) -> impl FnOnce(Arc<dyn ActionExecutor>) -> Arc<dyn ActionExecutor> + Send + 'static {
        move |inner| Arc::new(Self { inner, script })
    }
}

#[async_trait]
impl ActionExecutor for FaultInjectingExecutor {
    async fn execute(
        &self,
        ctx: &ActionContext,
        action: &Action<Value>,
    ) -> Result<(), ActionError> {
        if let Some(kind) = self.script.check(action.name()) {
            return Err(ActionError::new(kind, action.name(), "injected failure"));
        }
        self.inner.execute(ctx, action).await
    }
}

/// Store wrapper failing scripted checkpoint operations.
///
/// Operation names: `"commit-checkpoint"`, `"load-checkpoint"`,
/// `"delete-checkpoint"`. Uniqueness operations pass through untouched.
#[derive(Clone)]
pub struct FaultInjectingStore<S: Store> {
    inner: S,
    script: Arc<FaultScript>,
}

impl<S: Store> FaultInjectingStore<S> {
    pub fn new(inner: S, script: Arc<FaultScript>) -> Self {
        Self { inner, script }
    }

    fn injected(&self, op: &str) -> Option<causeway::Error> {
        self.script
            .check(op)
            .map(|_| causeway::Error::storage(format!("injected failure in {op}")))
    }
}

impl<S: Store> Store for FaultInjectingStore<S> {
    async fn save_checkpoint(&self, flow: &FlowRef, checkpoint: &Checkpoint) -> causeway::Result<()> {
        if let Some(err) = self.injected("commit-checkpoint") {
            return Err(err);
        }
        self.inner.save_checkpoint(flow, checkpoint).await
    }

    async fn load_checkpoint(&self, flow: &FlowRef) -> causeway::Result<Option<Checkpoint>> {
        if let Some(err) = self.injected("load-checkpoint") {
            return Err(err);
        }
        self.inner.load_checkpoint(flow).await
    }

    async fn delete_checkpoint(&self, flow: &FlowRef) -> causeway::Result<()> {
        if let Some(err) = self.injected("delete-checkpoint") {
            return Err(err);
        }
        self.inner.delete_checkpoint(flow).await
    }

    async fn list_non_terminal_flows(&self) -> causeway::Result<Vec<FlowRef>> {
        self.inner.list_non_terminal_flows().await
    }

    async fn checkpoint_count(&self) -> causeway::Result<usize> {
        self.inner.checkpoint_count().await
    }

    async fn insert_uniqueness_record_if_absent(
        &self,
        resource: &ResourceRef,
        record: &UniquenessRecord,
    ) -> causeway::Result<bool> {
        self.inner
            .insert_uniqueness_record_if_absent(resource, record)
            .await
    }

    async fn uniqueness_record(
        &self,
        resource: &ResourceRef,
    ) -> causeway::Result<Option<UniquenessRecord>> {
        self.inner.uniqueness_record(resource).await
    }

    async fn record_notarised_tx(&self, tx_id: TxId) -> causeway::Result<()> {
        self.inner.record_notarised_tx(tx_id).await
    }

    async fn is_tx_notarised(&self, tx_id: TxId) -> causeway::Result<bool> {
        self.inner.is_tx_notarised(tx_id).await
    }
}
