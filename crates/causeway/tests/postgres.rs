#![cfg(feature = "postgres")]

//! PostgreSQL store integration tests.
//!
//! These need a reachable database: point `TEST_DATABASE_URL` at a scratch
//! database; the tests skip (pass vacuously) when it is unset. Migrations
//! are applied on connection and each test isolates itself with fresh
//! UUID-based keys, so the database can be reused across runs.

use std::collections::BTreeSet;

use causeway::{
    Checkpoint, Epilogue, Error, FlowRef, PartyId, PgStore, ResourceRef, Store, TxId,
    UniquenessRecord,
};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use uuid::Uuid;

async fn test_store() -> Option<PgStore> {
    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping postgres test: TEST_DATABASE_URL not set");
            return None;
        }
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect to TEST_DATABASE_URL");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("apply migrations");
    Some(PgStore::new(pool))
}

fn unique_flow() -> FlowRef {
    FlowRef::new("pg-test", Uuid::new_v4().to_string())
}

fn checkpoint(sequence: u64) -> Checkpoint {
    Checkpoint {
        sequence,
        state: serde_json::json!({ "phase": "testing" }),
        pending_actions: vec![],
        recorded: BTreeSet::new(),
        pending_acks: vec![],
        epilogue: Epilogue::Idle,
    }
}

#[tokio::test]
async fn checkpoints_roundtrip_and_delete() {
    let Some(store) = test_store().await else { return };
    let flow = unique_flow();

    assert!(store.load_checkpoint(&flow).await.unwrap().is_none());

    store.save_checkpoint(&flow, &checkpoint(1)).await.unwrap();
    let loaded = store.load_checkpoint(&flow).await.unwrap().unwrap();
    assert_eq!(loaded.sequence, 1);
    assert!(matches!(loaded.epilogue, Epilogue::Idle));

    store.save_checkpoint(&flow, &checkpoint(2)).await.unwrap();
    assert!(store.list_non_terminal_flows().await.unwrap().contains(&flow));

    store.delete_checkpoint(&flow).await.unwrap();
    assert!(store.load_checkpoint(&flow).await.unwrap().is_none());
}

#[tokio::test]
async fn checkpoint_regressions_are_rejected() {
    let Some(store) = test_store().await else { return };
    let flow = unique_flow();

    store.save_checkpoint(&flow, &checkpoint(3)).await.unwrap();

    let err = store.save_checkpoint(&flow, &checkpoint(3)).await.unwrap_err();
    assert!(matches!(err, Error::CheckpointRegression { .. }));
    let err = store.save_checkpoint(&flow, &checkpoint(1)).await.unwrap_err();
    assert!(matches!(err, Error::CheckpointRegression { .. }));

    // The rejected writes left the stored checkpoint untouched
    assert_eq!(
        store.load_checkpoint(&flow).await.unwrap().unwrap().sequence,
        3
    );
    store.delete_checkpoint(&flow).await.unwrap();
}

#[tokio::test]
async fn uniqueness_insert_is_first_writer_wins() {
    let Some(store) = test_store().await else { return };

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

    let stored = store.uniqueness_record(&resource).await.unwrap().unwrap();
    assert_eq!(stored.committing_tx, winner);
    assert_eq!(stored.requester, PartyId::new("alice"));
}

#[tokio::test]
async fn notarised_transactions_are_remembered() {
    let Some(store) = test_store().await else { return };

    let tx = TxId::random();
    assert!(!store.is_tx_notarised(tx).await.unwrap());
    store.record_notarised_tx(tx).await.unwrap();
    store.record_notarised_tx(tx).await.unwrap(); // idempotent
    assert!(store.is_tx_notarised(tx).await.unwrap());
}
