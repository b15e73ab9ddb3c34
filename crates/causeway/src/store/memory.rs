//! In-process store implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::checkpoint::Checkpoint;
use crate::error::{Error, Result};
use crate::flow::FlowRef;
use crate::notary::{ResourceRef, TxId, UniquenessRecord};

use super::Store;

#[derive(Default)]
struct MemoryInner {
    checkpoints: HashMap<FlowRef, Checkpoint>,
    uniqueness: HashMap<ResourceRef, UniquenessRecord>,
    notarised: HashSet<TxId>,
}

/// In-memory store for tests and single-node deployments.
///
/// Cheap to clone; all clones share the same state. Single-map mutation
/// under one lock gives the same atomicity the trait demands of durable
/// backends.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    async fn save_checkpoint(&self, flow: &FlowRef, checkpoint: &Checkpoint) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.checkpoints.get(flow) {
            if checkpoint.sequence <= existing.sequence {
                return Err(Error::CheckpointRegression {
                    flow: flow.to_string(),
                    attempted: checkpoint.sequence,
                    current: existing.sequence,
                });
            }
        }
        inner.checkpoints.insert(flow.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, flow: &FlowRef) -> Result<Option<Checkpoint>> {
        Ok(self.inner.lock().unwrap().checkpoints.get(flow).cloned())
    }

    async fn delete_checkpoint(&self, flow: &FlowRef) -> Result<()> {
        self.inner.lock().unwrap().checkpoints.remove(flow);
        Ok(())
    }

    async fn list_non_terminal_flows(&self) -> Result<Vec<FlowRef>> {
        Ok(self.inner.lock().unwrap().checkpoints.keys().cloned().collect())
    }

    async fn checkpoint_count(&self) -> Result<usize> {
        Ok(self.inner.lock().unwrap().checkpoints.len())
    }

    async fn insert_uniqueness_record_if_absent(
        &self,
        resource: &ResourceRef,
        record: &UniquenessRecord,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.uniqueness.contains_key(resource) {
            return Ok(false);
        }
        inner.uniqueness.insert(*resource, record.clone());
        Ok(true)
    }

    async fn uniqueness_record(&self, resource: &ResourceRef) -> Result<Option<UniquenessRecord>> {
        Ok(self.inner.lock().unwrap().uniqueness.get(resource).cloned())
    }

    async fn record_notarised_tx(&self, tx_id: TxId) -> Result<()> {
        self.inner.lock().unwrap().notarised.insert(tx_id);
        Ok(())
    }

    async fn is_tx_notarised(&self, tx_id: TxId) -> Result<bool> {
        Ok(self.inner.lock().unwrap().notarised.contains(&tx_id))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::Value;
    use time::OffsetDateTime;

    use super::*;
    use crate::checkpoint::Epilogue;
    use crate::transport::PartyId;

    fn checkpoint(sequence: u64) -> Checkpoint {
        Checkpoint {
            sequence,
            state: Value::Null,
            pending_actions: vec![],
            recorded: BTreeSet::new(),
            pending_acks: vec![],
            epilogue: Epilogue::Idle,
        }
    }

    #[tokio::test]
    async fn checkpoints_roundtrip_and_delete() {
        let store = MemoryStore::new();
        let flow = FlowRef::new("ping", "p-1");

        assert!(store.load_checkpoint(&flow).await.unwrap().is_none());

        store.save_checkpoint(&flow, &checkpoint(1)).await.unwrap();
        assert_eq!(
            store.load_checkpoint(&flow).await.unwrap().unwrap().sequence,
            1
        );
        assert_eq!(store.checkpoint_count().await.unwrap(), 1);
        assert_eq!(store.list_non_terminal_flows().await.unwrap(), vec![flow.clone()]);

        store.delete_checkpoint(&flow).await.unwrap();
        assert_eq!(store.checkpoint_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn checkpoint_sequences_are_strictly_monotonic() {
        let store = MemoryStore::new();
        let flow = FlowRef::new("ping", "p-1");

        store.save_checkpoint(&flow, &checkpoint(2)).await.unwrap();
        store.save_checkpoint(&flow, &checkpoint(3)).await.unwrap();

        // Same sequence is a regression too
        let err = store.save_checkpoint(&flow, &checkpoint(3)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CheckpointRegression {
                attempted: 3,
                current: 3,
                ..
            }
        ));

        let err = store.save_checkpoint(&flow, &checkpoint(1)).await.unwrap_err();
        assert!(matches!(err, Error::CheckpointRegression { .. }));
    }

    #[tokio::test]
    async fn uniqueness_insert_is_first_writer_wins() {
        let store = MemoryStore::new();
        let resource = ResourceRef::new(TxId::random(), 0);
        let record = |tx: TxId| UniquenessRecord {
            resource,
            committing_tx: tx,
            requester: PartyId::new("alice"),
            recorded_at: OffsetDateTime::now_utc(),
        };

        let winner = TxId::random();
        let loser = TxId::random();
        assert!(
            store
                .insert_uniqueness_record_if_absent(&resource, &record(winner))
                .await
                .unwrap()
        );
        assert!(
            !store
                .insert_uniqueness_record_if_absent(&resource, &record(loser))
                .await
                .unwrap()
        );

        // The original record is immutable
        let stored = store.uniqueness_record(&resource).await.unwrap().unwrap();
        assert_eq!(stored.committing_tx, winner);
    }

    #[tokio::test]
    async fn notarised_transactions_are_remembered() {
        let store = MemoryStore::new();
        let tx = TxId::random();

        assert!(!store.is_tx_notarised(tx).await.unwrap());
        store.record_notarised_tx(tx).await.unwrap();
        assert!(store.is_tx_notarised(tx).await.unwrap());
    }
}
