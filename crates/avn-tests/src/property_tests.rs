//! Property-based tests using proptest.
//!
//! Work queue bookkeeping under arbitrary schedules, and the end-to-end
//! rule that a node adopts a peer's chain exactly when it is heavier.

use crate::generators::{peer_id, TestChain};
use crate::harness::{eventually, test_sync_config, TestNode};
use avn_chain::ChainStore;
use avn_sync::{FetchQueue, SyncMode};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

// ============================================================================
// Fetch queue
// ============================================================================

#[derive(Debug, Clone)]
enum QueueOp {
    Queue(Vec<u64>),
    Reserve { peer: u8, max: usize },
    Complete(usize),
    Fail(usize),
}

fn arb_queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        prop::collection::vec(0u64..40, 1..8).prop_map(QueueOp::Queue),
        (1u8..4, 1usize..6).prop_map(|(peer, max)| QueueOp::Reserve { peer, max }),
        any::<prop::sample::Index>().prop_map(|i| QueueOp::Complete(i.index(usize::MAX))),
        any::<prop::sample::Index>().prop_map(|i| QueueOp::Fail(i.index(usize::MAX))),
    ]
}

proptest! {
    /// Every queued key is in exactly one state, is never handed out twice
    /// at once, and is never handed back to a peer that failed it.
    #[test]
    fn fetch_queue_bookkeeping(ops in prop::collection::vec(arb_queue_op(), 1..60)) {
        // Three peers can fail a key at most three times, so nothing is
        // parked with four retries.
        let queue: FetchQueue<u64> = FetchQueue::new(4);
        let mut known = HashSet::new();
        let mut in_flight: HashMap<u64, u8> = HashMap::new();
        let mut failed_by: HashMap<u64, HashSet<u8>> = HashMap::new();

        for op in ops {
            match op {
                QueueOp::Queue(keys) => {
                    known.extend(keys.iter().copied());
                    queue.queue(keys);
                }
                QueueOp::Reserve { peer, max } => {
                    let got = queue.reserve_for(&peer_id(peer), max);
                    prop_assert!(got.len() <= max);
                    for key in got {
                        prop_assert!(!in_flight.contains_key(&key));
                        let failed = failed_by.get(&key).is_some_and(|p| p.contains(&peer));
                        prop_assert!(!failed);
                        in_flight.insert(key, peer);
                    }
                }
                QueueOp::Complete(i) => {
                    let mut keys: Vec<u64> = in_flight.keys().copied().collect();
                    keys.sort_unstable();
                    if !keys.is_empty() {
                        let key = keys[i % keys.len()];
                        in_flight.remove(&key);
                        queue.complete(&key);
                    }
                }
                QueueOp::Fail(i) => {
                    let mut keys: Vec<u64> = in_flight.keys().copied().collect();
                    keys.sort_unstable();
                    if !keys.is_empty() {
                        let key = keys[i % keys.len()];
                        if let Some(peer) = in_flight.remove(&key) {
                            failed_by.entry(key).or_default().insert(peer);
                            queue.fail(&[key], &peer_id(peer));
                        }
                    }
                }
            }

            let stats = queue.stats();
            prop_assert_eq!(stats.in_flight, in_flight.len());
            prop_assert_eq!(stats.failed, 0);
            prop_assert_eq!(
                stats.pending + stats.in_flight + stats.completed + stats.failed,
                known.len()
            );
        }
    }
}

// ============================================================================
// Heaviest chain wins
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// A node syncs to a peer's branch exactly when the branch carries more
    /// total difficulty than its own chain.
    #[test]
    fn node_adopts_only_heavier_chain(
        local_len in 2u64..16,
        local_difficulty in 1u128..4,
        fork_offset in any::<prop::sample::Index>(),
        longer_by in 1u64..12,
        remote_difficulty in 1u128..4,
    ) {
        let local = TestChain::genesis().extend(local_len, 0, local_difficulty);
        let fork_at = fork_offset.index(local_len as usize) as u64;
        let remote = local.fork(fork_at, local_len - fork_at + longer_by, 7, remote_difficulty);
        let heavier = remote.td() > local.td();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        let (head, expected) = runtime.block_on(async {
            let node = TestNode::start(local.store(), test_sync_config(SyncMode::Full));
            let _conn = node.connect(1, &remote);
            let expected = if heavier { remote.head().hash() } else { local.head().hash() };
            if heavier {
                eventually(60, || node.chain.current_block().hash() == expected).await;
            } else {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            let head = node.chain.current_block().hash();
            node.stop().await;
            (head, expected)
        });
        prop_assert_eq!(head, expected);
    }
}
