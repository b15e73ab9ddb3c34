//! Uniqueness service scenarios: commit exclusivity, validation order,
//! reference checks and wait estimation.

use std::time::Duration;

use causeway::{
    AcceptAllSignatures, CommitError, CommitRequest, MemoryStore, NonEmpty, NotaryConfig,
    NotaryService, PartyId, RequestAuthenticator, ResourceRef, Store, TimeWindow, TxId,
};
use test_utils::init_tracing;
use time::OffsetDateTime;

fn request(inputs: Vec<ResourceRef>, tx_id: TxId) -> CommitRequest {
    CommitRequest::new(
        NonEmpty::from_vec(inputs).expect("at least one input"),
        tx_id,
        PartyId::new("alice"),
    )
}

fn notary(store: MemoryStore) -> std::sync::Arc<NotaryService> {
    NotaryService::spawn(store, NotaryConfig::default(), AcceptAllSignatures)
}

#[tokio::test]
async fn successful_commit_writes_immutable_records() {
    init_tracing();
    let store = MemoryStore::new();
    let notary = notary(store.clone());

    let genesis = TxId::random();
    let tx = TxId::random();
    let inputs = vec![ResourceRef::new(genesis, 0), ResourceRef::new(genesis, 1)];

    let outcome = notary.commit(request(inputs.clone(), tx)).await.unwrap();
    assert_eq!(outcome, Ok(()));

    for input in &inputs {
        let record = store.uniqueness_record(input).await.unwrap().unwrap();
        assert_eq!(record.committing_tx, tx);
        assert_eq!(record.requester, PartyId::new("alice"));
    }
    assert!(store.is_tx_notarised(tx).await.unwrap());
}

#[tokio::test]
async fn recommitting_the_same_transaction_is_idempotent() {
    init_tracing();
    let notary = notary(MemoryStore::new());

    let tx = TxId::random();
    let inputs = vec![ResourceRef::new(TxId::random(), 0)];

    assert_eq!(notary.commit(request(inputs.clone(), tx)).await.unwrap(), Ok(()));
    // A replayed request (e.g. a flow re-issuing its commit after a
    // restart) gets the same verdict, not a conflict with itself.
    assert_eq!(notary.commit(request(inputs, tx)).await.unwrap(), Ok(()));
}

#[tokio::test]
async fn second_transaction_on_the_same_input_names_the_winner() {
    init_tracing();
    let notary = notary(MemoryStore::new());

    let shared = ResourceRef::new(TxId::random(), 0);
    let winner = TxId::random();
    let loser = TxId::random();

    assert_eq!(notary.commit(request(vec![shared], winner)).await.unwrap(), Ok(()));

    let outcome = notary.commit(request(vec![shared], loser)).await.unwrap();
    assert_eq!(
        outcome,
        Err(CommitError::InputStateConflict {
            resource: shared,
            committed_by: winner,
        })
    );
}

/// Scenario D: concurrent requests with overlapping inputs — exactly one
/// success, the loser's failure references the winner's transaction.
#[tokio::test]
async fn concurrent_overlapping_commits_resolve_to_one_winner() {
    init_tracing();
    let notary = notary(MemoryStore::new());

    let shared = ResourceRef::new(TxId::random(), 0);
    let tx_a = TxId::random();
    let tx_b = TxId::random();

    let (a, b) = tokio::join!(
        notary.commit(request(
            vec![shared, ResourceRef::new(TxId::random(), 0)],
            tx_a
        )),
        notary.commit(request(
            vec![shared, ResourceRef::new(TxId::random(), 0)],
            tx_b
        )),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let (winner_tx, loser_outcome) = match (&a, &b) {
        (Ok(()), Err(_)) => (tx_a, b.clone()),
        (Err(_), Ok(())) => (tx_b, a.clone()),
        other => panic!("expected exactly one success, got {other:?}"),
    };
    assert_eq!(
        loser_outcome,
        Err(CommitError::InputStateConflict {
            resource: shared,
            committed_by: winner_tx,
        })
    );
}

#[tokio::test]
async fn expired_time_window_rejects_before_any_write() {
    init_tracing();
    let store = MemoryStore::new();
    let notary = notary(store.clone());

    let input = ResourceRef::new(TxId::random(), 0);
    let now = OffsetDateTime::now_utc();
    let expired = TimeWindow::between(now - time::Duration::hours(2), now - time::Duration::hours(1));

    let outcome = notary
        .commit(request(vec![input], TxId::random()).with_time_window(expired))
        .await
        .unwrap();
    assert_eq!(outcome, Err(CommitError::TimeWindowInvalid));

    // All-or-nothing: the rejected request wrote nothing, so the input is
    // still free.
    assert!(store.uniqueness_record(&input).await.unwrap().is_none());
    assert_eq!(
        notary.commit(request(vec![input], TxId::random())).await.unwrap(),
        Ok(())
    );
}

#[tokio::test]
async fn open_time_window_is_accepted() {
    init_tracing();
    let notary = notary(MemoryStore::new());

    let now = OffsetDateTime::now_utc();
    let window = TimeWindow::between(now - time::Duration::minutes(5), now + time::Duration::minutes(5));
    let outcome = notary
        .commit(
            request(vec![ResourceRef::new(TxId::random(), 0)], TxId::random())
                .with_time_window(window),
        )
        .await
        .unwrap();
    assert_eq!(outcome, Ok(()));
}

struct RejectAllSignatures;

impl RequestAuthenticator for RejectAllSignatures {
    fn verify(&self, _request: &CommitRequest) -> bool {
        false
    }
}

#[tokio::test]
async fn invalid_signature_rejects_the_request() {
    init_tracing();
    let store = MemoryStore::new();
    let notary = NotaryService::spawn(store.clone(), NotaryConfig::default(), RejectAllSignatures);

    let input = ResourceRef::new(TxId::random(), 0);
    let outcome = notary.commit(request(vec![input], TxId::random())).await.unwrap();
    assert_eq!(outcome, Err(CommitError::RequestSignatureInvalid));
    assert!(store.uniqueness_record(&input).await.unwrap().is_none());
}

#[tokio::test]
async fn references_must_be_known_but_are_never_consumed() {
    init_tracing();
    let store = MemoryStore::new();
    let notary = notary(store.clone());

    let issuance = TxId::random();
    let reference = ResourceRef::new(issuance, 0);
    let input = ResourceRef::new(TxId::random(), 0);

    // Reference to a transaction this service has never seen
    let outcome = notary
        .commit(request(vec![input], TxId::random()).with_references([reference]))
        .await
        .unwrap();
    assert_eq!(outcome, Err(CommitError::InputStateUnknown { resource: reference }));

    // Notarise the issuance, making its outputs known
    assert_eq!(
        notary
            .commit(request(vec![ResourceRef::new(TxId::random(), 0)], issuance))
            .await
            .unwrap(),
        Ok(())
    );

    let tx = TxId::random();
    let outcome = notary
        .commit(request(vec![input], tx).with_references([reference]))
        .await
        .unwrap();
    assert_eq!(outcome, Ok(()));

    // The reference did not consume a uniqueness slot
    assert!(store.uniqueness_record(&reference).await.unwrap().is_none());
}

#[tokio::test]
async fn consumed_reference_is_a_conflict() {
    init_tracing();
    let notary = notary(MemoryStore::new());

    let shared = ResourceRef::new(TxId::random(), 0);
    let consumer = TxId::random();
    assert_eq!(notary.commit(request(vec![shared], consumer)).await.unwrap(), Ok(()));

    let outcome = notary
        .commit(
            request(vec![ResourceRef::new(TxId::random(), 0)], TxId::random())
                .with_references([shared]),
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Err(CommitError::InputStateConflict {
            resource: shared,
            committed_by: consumer,
        })
    );
}

#[tokio::test]
async fn estimated_wait_reflects_queue_pressure_and_never_blocks_commits() {
    init_tracing();
    let notary = notary(MemoryStore::new());

    let quiet = notary.estimated_wait(10);
    assert!(quiet > Duration::ZERO);

    // Estimation is advisory: commits keep succeeding regardless
    for _ in 0..5 {
        assert_eq!(
            notary
                .commit(request(vec![ResourceRef::new(TxId::random(), 0)], TxId::random()))
                .await
                .unwrap(),
            Ok(())
        );
    }
    assert!(notary.estimated_wait(100) > notary.estimated_wait(1));
}
