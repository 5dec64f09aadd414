use std::sync::{Arc, atomic::Ordering};

use chain::MemoryChain;
use containers::Block;
use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::sync::mpsc;

use super::{TestPeer, chains, context, info_at, test_config};
use crate::sync::{
    Finder, SyncError, SyncerConfig, SyncerMessage,
    finder::AncestorSearch,
};

fn full_scan_config() -> SyncerConfig {
    SyncerConfig {
        use_full_scan_only: true,
        ..test_config()
    }
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(37)]
#[case(80)]
#[case(99)]
#[case(100)]
#[tokio::test]
async fn test_full_scan_finds_fork_point(#[case] fork_at: u64) {
    let (local, peer_chain) = chains(100, fork_at, 150);
    let peer = Arc::new(TestPeer::new(peer_chain));
    let search = AncestorSearch::new(&context(150, 100, None), local.clone(), peer.clone(), &full_scan_config());

    let ancestor = search.find(&[]).await.unwrap();

    assert_eq!(ancestor, info_at(&local, fork_at));
    // Genesis check plus a binary search over 101 heights.
    assert!(peer.hash_probes.load(Ordering::SeqCst) <= 1 + 7);
    assert_eq!(peer.ancestor_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_light_scan_answers_in_one_round_trip() {
    let (local, peer_chain) = chains(100, 95, 150);
    let peer = Arc::new(TestPeer::new(peer_chain));
    let search = AncestorSearch::new(&context(150, 100, None), local.clone(), peer.clone(), &test_config());

    let ancestor = search.find(&[]).await.unwrap();

    assert_eq!(ancestor, info_at(&local, 95));
    assert_eq!(peer.ancestor_calls.load(Ordering::SeqCst), 1);
    assert_eq!(peer.hash_probes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_light_scan_miss_falls_back_to_full_scan() {
    let (local, peer_chain) = chains(100, 40, 150);
    let peer = Arc::new(TestPeer::new(peer_chain));
    let search = AncestorSearch::new(&context(150, 100, None), local.clone(), peer.clone(), &test_config());

    let ancestor = search.find(&[]).await.unwrap();

    assert_eq!(ancestor, info_at(&local, 40));
    assert_eq!(peer.ancestor_calls.load(Ordering::SeqCst), 1);
    assert!(peer.hash_probes.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_sparse_locator_narrows_full_scan() {
    let (local, peer_chain) = chains(100, 62, 150);
    let peer = Arc::new(TestPeer::new(peer_chain));
    let search = AncestorSearch::new(&context(150, 100, None), local.clone(), peer.clone(), &test_config());
    let locator = [100, 90, 70, 50, 0].map(|no| info_at(&local, no).hash);

    let ancestor = search.find(&locator).await.unwrap();

    assert_eq!(ancestor, info_at(&local, 62));
    // Only (50, 69] is left to search.
    assert!(peer.hash_probes.load(Ordering::SeqCst) <= 5);
}

#[tokio::test]
async fn test_unsupported_ancestor_request_uses_full_scan() {
    let (local, peer_chain) = chains(100, 80, 150);
    let peer = Arc::new(TestPeer::new(peer_chain).ancestor_unsupported());
    let search = AncestorSearch::new(&context(150, 100, None), local.clone(), peer, &test_config());

    assert_eq!(search.find(&[]).await.unwrap(), info_at(&local, 80));
}

#[tokio::test]
async fn test_different_genesis_is_different_chain() {
    let local = Arc::new(MemoryChain::generate(50, 1));
    let other = MemoryChain::new(Block::genesis(7));
    other.extend(80, 2);
    let ctx = context(80, 50, None);
    let peer = Arc::new(TestPeer::new(Arc::new(other)));
    let search = AncestorSearch::new(&ctx, local, peer, &test_config());

    let err = search.find(&[]).await.unwrap_err();

    assert_eq!(err, SyncError::DifferentChain { peer: ctx.peer_id });
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    let (local, peer_chain) = chains(100, 80, 150);
    let peer = Arc::new(TestPeer::new(peer_chain).silent());
    let search = AncestorSearch::new(&context(150, 100, None), local, peer, &test_config());

    let err = search.find(&[]).await.unwrap_err();

    assert!(matches!(err, SyncError::Timeout { .. }), "{err}");
}

#[tokio::test]
async fn test_finder_posts_result_to_syncer() {
    let (local, peer_chain) = chains(100, 80, 150);
    let peer = Arc::new(TestPeer::new(peer_chain));
    let ctx = context(150, 100, None);
    let (syncer_tx, mut syncer_rx) = mpsc::unbounded_channel();

    let _finder = Finder::start(&ctx, local.clone(), peer, &test_config(), Vec::new(), syncer_tx);

    match syncer_rx.recv().await.unwrap() {
        SyncerMessage::FinderResult { run, result } => {
            assert_eq!(run, ctx.run);
            assert_eq!(result, Ok(info_at(&local, 80)));
        }
        other => panic!("unexpected message {other:?}"),
    }
    assert_eq!(local.best_no(), 100);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_finder_posts_nothing() {
    let (local, peer_chain) = chains(100, 80, 150);
    let peer = Arc::new(TestPeer::new(peer_chain).silent());
    let (syncer_tx, mut syncer_rx) = mpsc::unbounded_channel();

    let mut finder = Finder::start(&context(150, 100, None), local, peer, &test_config(), Vec::new(), syncer_tx);
    finder.stop();
    finder.stop();

    assert!(syncer_rx.recv().await.is_none());
}
