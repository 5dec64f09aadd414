use std::sync::Arc;

use chain::MemoryChain;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::{TestPeer, chains, context, info_at, test_config};
use crate::{
    requester::BlockChunk,
    sync::{
        BlockFetcher, Component, HashBatch, SyncError, SyncStat, SyncerConfig, SyncerMessage,
        block_fetcher::{FetchState, FetchTask},
    },
};

struct Fixture {
    local: Arc<MemoryChain>,
    peer: Arc<MemoryChain>,
    stat: Arc<SyncStat>,
    state: FetchState<MemoryChain>,
}

/// Local 100, peer 150, shared up to 80.
fn fixture(config: SyncerConfig) -> Fixture {
    let (local, peer) = chains(100, 80, 150);
    let stat = Arc::new(SyncStat::new());
    let ctx = context(150, 100, Some(info_at(&local, 80)));
    let state = FetchState::new(&ctx, local.clone(), stat.clone(), &config).unwrap();

    Fixture {
        local,
        peer,
        stat,
        state,
    }
}

fn hashes(chain: &MemoryChain, from: u64, to: u64) -> HashBatch {
    HashBatch {
        start_no: from,
        hashes: (from..=to).map(|no| info_at(chain, no).hash).collect(),
    }
}

fn chunk(chain: &MemoryChain, from: u64, to: u64) -> BlockChunk {
    BlockChunk {
        blocks: chain.range(from, to),
        has_next: true,
    }
}

#[test]
fn test_hash_batches_split_into_tasks() {
    let Fixture { peer, mut state, .. } = fixture(test_config());

    state.add_hash_batch(hashes(&peer, 81, 100)).unwrap();
    state.add_hash_batch(hashes(&peer, 101, 105)).unwrap();

    let tasks: Vec<_> = std::iter::from_fn(|| state.next_request()).collect();
    assert_eq!(
        tasks,
        vec![
            FetchTask { start_no: 81, count: 10, retry: 0 },
            FetchTask { start_no: 91, count: 10, retry: 0 },
            FetchTask { start_no: 101, count: 5, retry: 0 },
        ]
    );
}

#[test]
fn test_hash_batch_gap_rejected() {
    let Fixture { peer, mut state, .. } = fixture(test_config());

    assert!(matches!(
        state.add_hash_batch(hashes(&peer, 82, 100)),
        Err(SyncError::Internal(_))
    ));
}

#[test]
fn test_reverse_order_chunks_are_buffered() {
    let Fixture { local, peer, stat, mut state } = fixture(test_config());
    state.add_hash_batch(hashes(&peer, 81, 100)).unwrap();
    let first = state.next_request().unwrap();
    let second = state.next_request().unwrap();

    let applied = state.on_fetched(second, Ok(chunk(&peer, 91, 100))).unwrap();

    assert_eq!(applied, 0);
    assert_eq!(local.best_no(), 100);
    assert_ne!(local.hash_at(91), peer.hash_at(91));
    assert_eq!(stat.snapshot().last_added, None);

    let applied = state.on_fetched(first, Ok(chunk(&peer, 81, 90))).unwrap();

    assert_eq!(applied, 20);
    assert_eq!(local.best_no(), 100);
    assert_eq!(local.hash_at(100), peer.hash_at(100));
    assert_eq!(stat.snapshot().last_added, Some(info_at(&peer, 100)));
    assert_eq!(stat.snapshot().max_requested, Some(100));
    assert_eq!(state.next_no(), 101);
}

#[test]
fn test_duplicate_chunk_applies_once() {
    let Fixture { local, peer, stat, mut state } = fixture(test_config());
    state.add_hash_batch(hashes(&peer, 81, 100)).unwrap();

    assert_eq!(state.handle_block_rsp(peer.range(81, 90)).unwrap(), 10);
    let before = stat.snapshot();

    assert_eq!(state.handle_block_rsp(peer.range(81, 90)).unwrap(), 0);
    assert_eq!(stat.snapshot(), before);
    assert_eq!(local.best_no(), 90);
}

#[test]
fn test_pushed_blocks_wait_for_hashes() {
    let Fixture { local, peer, mut state, .. } = fixture(test_config());

    assert_eq!(state.handle_block_rsp(peer.range(81, 90)).unwrap(), 0);
    assert_eq!(local.best_no(), 100);

    assert_eq!(state.add_hash_batch(hashes(&peer, 81, 100)).unwrap(), 10);
    assert_eq!(local.hash_at(90), peer.hash_at(90));
}

#[test]
fn test_blocks_from_wrong_branch_rejected() {
    let Fixture { local, peer, mut state, .. } = fixture(test_config());
    state.add_hash_batch(hashes(&peer, 81, 100)).unwrap();
    let task = state.next_request().unwrap();

    // Local blocks 81..=90 are on the other branch.
    let applied = state.on_fetched(task, Ok(chunk(&local, 81, 90))).unwrap();

    assert_eq!(applied, 0);
    assert_eq!(state.handle_block_rsp(local.range(81, 90)).unwrap(), 0);
    assert_eq!(local.best_no(), 100);

    let retried = state.next_request().unwrap();
    assert_eq!(retried, FetchTask { retry: 1, ..task });
}

#[test]
fn test_failed_task_retried_then_fatal() {
    let Fixture { peer, mut state, .. } = fixture(test_config());
    state.add_hash_batch(hashes(&peer, 81, 90)).unwrap();
    let task = state.next_request().unwrap();

    let timeout = || {
        Err(SyncError::Timeout {
            what: "get blocks by range",
            after: test_config().fetch_timeout,
        })
    };

    state.on_fetched(task, timeout()).unwrap();
    let retried = state.next_request().unwrap();
    assert_eq!(retried.retry, 1);

    let err = state.on_fetched(retried, timeout()).unwrap_err();
    assert!(
        matches!(err, SyncError::BlockFetchFailed { from: 81, to: 90, retries: 1, .. }),
        "{err}"
    );
}

#[test]
fn test_short_chunk_with_more_is_not_a_failure() {
    let Fixture { peer, mut state, .. } = fixture(test_config());
    state.add_hash_batch(hashes(&peer, 81, 90)).unwrap();
    let task = state.next_request().unwrap();

    let applied = state.on_fetched(task, Ok(chunk(&peer, 81, 84))).unwrap();

    assert_eq!(applied, 4);
    assert_eq!(
        state.next_request(),
        Some(FetchTask { start_no: 85, count: 6, retry: 0 })
    );
}

#[test]
fn test_pending_window_bounds_requests() {
    let config = SyncerConfig {
        max_pending_conn: 2,
        ..test_config()
    };
    let Fixture { peer, mut state, .. } = fixture(config);
    state.add_hash_batch(hashes(&peer, 81, 130)).unwrap();

    let first = state.next_request().unwrap();
    let second = state.next_request().unwrap();
    assert_eq!(state.next_request(), None);
    assert_eq!(state.running(), 2);

    // The second chunk arrives but cannot be applied, so the window stays full.
    state.on_fetched(second, Ok(chunk(&peer, 91, 100))).unwrap();
    assert_eq!(state.next_request(), None);

    state.on_fetched(first, Ok(chunk(&peer, 81, 90))).unwrap();
    assert_eq!(state.next_request().map(|task| task.start_no), Some(101));
}

#[test]
fn test_concurrency_bounds_requests() {
    let config = SyncerConfig {
        max_block_req_tasks: 2,
        ..test_config()
    };
    let Fixture { peer, mut state, .. } = fixture(config);
    state.add_hash_batch(hashes(&peer, 81, 130)).unwrap();

    assert!(state.next_request().is_some());
    assert!(state.next_request().is_some());
    assert_eq!(state.next_request(), None);
    assert_eq!(state.in_flight(), 2);
}

#[tokio::test]
async fn test_fetcher_applies_up_to_target() {
    let (local, peer_chain) = chains(100, 80, 150);
    let peer = Arc::new(TestPeer::new(peer_chain.clone()));
    peer.delayed_chunks.lock().insert(81);
    let ctx = context(150, 100, Some(info_at(&local, 80)));
    let (hand_off, hashes_rx) = mpsc::channel(4);
    let (syncer_tx, mut syncer_rx) = mpsc::unbounded_channel();

    let fetcher = BlockFetcher::start(&ctx, local.clone(), peer, &test_config(), hashes_rx, syncer_tx).unwrap();
    for (from, to) in [(81, 100), (101, 120), (121, 140), (141, 150)] {
        hand_off.send(hashes(&peer_chain, from, to)).await.unwrap();
    }

    match syncer_rx.recv().await.unwrap() {
        SyncerMessage::SyncStop { run, from_who, err } => {
            assert_eq!(run, Some(ctx.run));
            assert_eq!(from_who, Component::BlockFetcher);
            assert_eq!(err, None);
        }
        other => panic!("unexpected message {other:?}"),
    }

    assert_eq!(local.best_no(), 150);
    assert_eq!(local.hash_at(150), peer_chain.hash_at(150));
    assert_eq!(fetcher.stat().snapshot().last_added, Some(info_at(&peer_chain, 150)));
}

#[tokio::test]
async fn test_pushed_blocks_complete_run_without_peer() {
    let (local, peer_chain) = chains(100, 80, 150);
    let peer = Arc::new(TestPeer::new(peer_chain.clone()).silent_blocks_from(0));
    let ctx = context(150, 100, Some(info_at(&local, 80)));
    let (hand_off, hashes_rx) = mpsc::channel(4);
    let (syncer_tx, mut syncer_rx) = mpsc::unbounded_channel();

    let fetcher = BlockFetcher::start(&ctx, local.clone(), peer, &test_config(), hashes_rx, syncer_tx).unwrap();
    assert!(fetcher.push_blocks(peer_chain.range(81, 150)));
    for (from, to) in [(81, 100), (101, 120), (121, 140), (141, 150)] {
        hand_off.send(hashes(&peer_chain, from, to)).await.unwrap();
    }

    assert!(matches!(
        syncer_rx.recv().await.unwrap(),
        SyncerMessage::SyncStop { err: None, .. }
    ));
    assert_eq!(local.hash_at(150), peer_chain.hash_at(150));
}

#[tokio::test]
async fn test_closed_hash_stream_ends_run() {
    let (local, peer_chain) = chains(100, 80, 150);
    let peer = Arc::new(TestPeer::new(peer_chain.clone()));
    let ctx = context(150, 100, Some(info_at(&local, 80)));
    let (hand_off, hashes_rx) = mpsc::channel(4);
    let (syncer_tx, mut syncer_rx) = mpsc::unbounded_channel();

    let _fetcher = BlockFetcher::start(&ctx, local.clone(), peer, &test_config(), hashes_rx, syncer_tx).unwrap();
    hand_off.send(hashes(&peer_chain, 81, 100)).await.unwrap();
    drop(hand_off);

    match syncer_rx.recv().await.unwrap() {
        SyncerMessage::SyncStop { err, .. } => {
            assert_eq!(
                err,
                Some(SyncError::HashStreamEnded {
                    next_no: 101,
                    target_no: 150
                })
            );
        }
        other => panic!("unexpected message {other:?}"),
    }
    assert_eq!(local.best_no(), 100);
    assert_eq!(local.hash_at(100), peer_chain.hash_at(100));
}
