//! Forking branches of the in-memory history store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use oya_history::{
    AppendHistoryNodesRequest, BranchToken, Error, ForkBranchRequest, HistoryEvent, HistoryStore,
    InMemoryHistoryStore, TracingHistoryStore,
};
use proptest::prelude::*;

fn signal(id: i64) -> HistoryEvent {
    HistoryEvent::signaled(id, 1, format!("e{id}"), None, "client")
}

/// A branch holding one batch per entry of `batch_sizes`, ids from 1.
async fn seeded(store: &impl HistoryStore, batch_sizes: &[usize]) -> BranchToken {
    let token = store.new_branch(0).await.unwrap();
    let mut next = 1_i64;
    for size in batch_sizes {
        let events: Vec<HistoryEvent> = (0..*size)
            .map(|offset| signal(next + i64::try_from(offset).unwrap()))
            .collect();
        next += i64::try_from(*size).unwrap();
        store
            .append_history_nodes(AppendHistoryNodesRequest {
                branch_token: token.clone(),
                events,
                shard_id: 0,
            })
            .await
            .unwrap();
    }
    token
}

fn fork(base: &BranchToken, node: i64, info: &str) -> ForkBranchRequest {
    ForkBranchRequest {
        fork_branch_token: base.clone(),
        fork_node_id: node,
        info: info.to_string(),
        shard_id: 0,
    }
}

// ==========================================================================
// BEHAVIORAL TESTS
// ==========================================================================

#[tokio::test]
async fn should_reject_fork_at_first_event_or_past_the_end() {
    let store = InMemoryHistoryStore::new();
    let base = seeded(&store, &[3]).await;

    for node in [1, 5] {
        let err = store.fork_branch(fork(&base, node, "ns:wf:r")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidForkPoint { node_id, .. } if node_id == node));
    }
    assert_eq!(store.branch_count().await, 1);
}

#[tokio::test]
async fn should_reject_fork_of_unknown_branch() {
    let store = InMemoryHistoryStore::new();

    let err = store
        .fork_branch(fork(&BranchToken::new("missing"), 2, "ns:wf:r"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::BranchNotFound { .. }));
}

#[tokio::test]
async fn should_fork_through_tracing_wrapper() {
    let store = TracingHistoryStore::new(InMemoryHistoryStore::new());
    let base = seeded(&store, &[2, 2]).await;

    store.fork_branch(fork(&base, 3, "ns:wf:a")).await.unwrap();
    let err = store.fork_branch(fork(&base, 4, "ns:wf:a")).await.unwrap_err();

    assert!(matches!(err, Error::DuplicateGcInfo { info } if info == "ns:wf:a"));
}

// ==========================================================================
// PROPERTY TESTS
// ==========================================================================

proptest! {
    #[test]
    fn fork_keeps_exact_prefix_and_isolates_base(
        batch_sizes in prop::collection::vec(1_usize..4, 1..6),
        fork_seed in any::<prop::sample::Index>(),
    ) {
        let total = i64::try_from(batch_sizes.iter().sum::<usize>()).unwrap();
        // valid fork nodes are 2..=total + 1
        let span = usize::try_from(total).unwrap();
        let node = 2 + i64::try_from(fork_seed.index(span)).unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (forked_ids, base_ids) = runtime.block_on(async {
            let store = InMemoryHistoryStore::new();
            let base = seeded(&store, &batch_sizes).await;
            let forked = store.fork_branch(fork(&base, node, "ns:wf:p")).await.unwrap();
            store
                .append_history_nodes(AppendHistoryNodesRequest {
                    branch_token: forked.clone(),
                    events: vec![signal(node)],
                    shard_id: 0,
                })
                .await
                .unwrap();

            let ids = |events: Vec<HistoryEvent>| events.iter().map(|e| e.event_id).collect::<Vec<_>>();
            (
                ids(store.branch_events(&forked).await.unwrap()),
                ids(store.branch_events(&base).await.unwrap()),
            )
        });

        prop_assert_eq!(forked_ids, (1..=node).collect::<Vec<_>>());
        prop_assert_eq!(base_ids, (1..=total).collect::<Vec<_>>());
    }
}
