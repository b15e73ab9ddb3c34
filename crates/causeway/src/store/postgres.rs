//! PostgreSQL store implementation.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::Store;
use crate::checkpoint::Checkpoint;
use crate::error::{Error, Result};
use crate::flow::FlowRef;
use crate::notary::{ResourceRef, TxId, UniquenessRecord};
use crate::transport::PartyId;

/// PostgreSQL-backed store for production use.
///
/// # Database Schema
///
/// Requires tables in the `causeway` schema (see `migrations/`):
///
/// | Table                     | Purpose                                    |
/// |---------------------------|--------------------------------------------|
/// | `checkpoints`             | One row per live flow, `body` is the JSON checkpoint |
/// | `uniqueness_records`      | One immutable row per consumed resource ref |
/// | `notarised_transactions`  | Transactions notarised by this service     |
///
/// # Concurrency
///
/// A flow's checkpoint row is only ever written by the machine owning that
/// flow; [`save_checkpoint`](Store::save_checkpoint) still takes a
/// row-level lock so the monotonicity check and the write are one atomic
/// step. Uniqueness inserts rely on the primary key for first-writer-wins.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl Store for PgStore {
    async fn save_checkpoint(&self, flow: &FlowRef, checkpoint: &Checkpoint) -> Result<()> {
        let body = serde_json::to_value(checkpoint)?;
        let mut tx = self.pool.begin().await?;

        let current: Option<i64> = sqlx::query(
            r#"SELECT sequence FROM causeway.checkpoints
               WHERE flow_type = $1 AND flow_id = $2
               FOR UPDATE"#,
        )
        .bind(flow.flow_type())
        .bind(flow.flow_id().as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get("sequence"));

        if let Some(current) = current {
            if checkpoint.sequence <= current as u64 {
                return Err(Error::CheckpointRegression {
                    flow: flow.to_string(),
                    attempted: checkpoint.sequence,
                    current: current as u64,
                });
            }
        }

        sqlx::query(
            r#"INSERT INTO causeway.checkpoints (flow_type, flow_id, sequence, body)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (flow_type, flow_id)
               DO UPDATE SET sequence = EXCLUDED.sequence,
                             body = EXCLUDED.body,
                             updated_at = now()"#,
        )
        .bind(flow.flow_type())
        .bind(flow.flow_id().as_str())
        .bind(checkpoint.sequence as i64)
        .bind(body)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_checkpoint(&self, flow: &FlowRef) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"SELECT body FROM causeway.checkpoints
               WHERE flow_type = $1 AND flow_id = $2"#,
        )
        .bind(flow.flow_type())
        .bind(flow.flow_id().as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let body: serde_json::Value = row.get("body");
                Ok(Some(serde_json::from_value(body)?))
            }
            None => Ok(None),
        }
    }

    async fn delete_checkpoint(&self, flow: &FlowRef) -> Result<()> {
        sqlx::query(
            r#"DELETE FROM causeway.checkpoints
               WHERE flow_type = $1 AND flow_id = $2"#,
        )
        .bind(flow.flow_type())
        .bind(flow.flow_id().as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_non_terminal_flows(&self) -> Result<Vec<FlowRef>> {
        let rows = sqlx::query(
            r#"SELECT flow_type, flow_id FROM causeway.checkpoints
               ORDER BY updated_at"#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let flow_type: String = row.get("flow_type");
                let flow_id: String = row.get("flow_id");
                FlowRef::new(flow_type, flow_id)
            })
            .collect())
    }

    async fn checkpoint_count(&self) -> Result<usize> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS count FROM causeway.checkpoints"#)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(count as usize)
    }

    async fn insert_uniqueness_record_if_absent(
        &self,
        resource: &ResourceRef,
        record: &UniquenessRecord,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO causeway.uniqueness_records
               (origin_tx, output_index, committing_tx, requester, recorded_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(resource.tx_id.as_uuid())
        .bind(resource.index as i32)
        .bind(record.committing_tx.as_uuid())
        .bind(record.requester.as_str())
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn uniqueness_record(&self, resource: &ResourceRef) -> Result<Option<UniquenessRecord>> {
        let row = sqlx::query(
            r#"SELECT committing_tx, requester, recorded_at
               FROM causeway.uniqueness_records
               WHERE origin_tx = $1 AND output_index = $2"#,
        )
        .bind(resource.tx_id.as_uuid())
        .bind(resource.index as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let committing_tx: Uuid = row.get("committing_tx");
            let requester: String = row.get("requester");
            UniquenessRecord {
                resource: *resource,
                committing_tx: TxId::from(committing_tx),
                requester: PartyId::new(requester),
                recorded_at: row.get("recorded_at"),
            }
        }))
    }

    async fn record_notarised_tx(&self, tx_id: TxId) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO causeway.notarised_transactions (tx_id)
               VALUES ($1)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(tx_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_tx_notarised(&self, tx_id: TxId) -> Result<bool> {
        let row = sqlx::query(
            r#"SELECT 1 AS present FROM causeway.notarised_transactions
               WHERE tx_id = $1"#,
        )
        .bind(tx_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}
