use std::sync::{Arc, atomic::Ordering};

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::{TestPeer, chains, context, info_at, test_config};
use crate::sync::{
    Component, HashBatch, HashFetcher, SyncError, SyncerMessage,
    hash_fetcher::HashRangeFetch,
};

fn drain(rx: &mut mpsc::Receiver<HashBatch>) -> Vec<HashBatch> {
    let mut batches = Vec::new();
    while let Ok(batch) = rx.try_recv() {
        batches.push(batch);
    }
    batches
}

#[tokio::test]
async fn test_batches_cover_range_in_order() {
    let (local, peer_chain) = chains(100, 80, 150);
    let peer = Arc::new(TestPeer::new(peer_chain.clone()));
    let ctx = context(150, 100, Some(info_at(&local, 80)));
    let (hand_off, mut hashes) = mpsc::channel(16);

    let mut fetch = HashRangeFetch::new(&ctx, peer.clone(), &test_config()).unwrap();
    fetch.fetch_all(&hand_off).await.unwrap();

    let batches = drain(&mut hashes);
    let ranges: Vec<_> = batches.iter().map(|batch| (batch.start_no, batch.end_no())).collect();
    assert_eq!(ranges, vec![(81, 100), (101, 120), (121, 140), (141, 150)]);

    let resolved: Vec<_> = batches.into_iter().flat_map(|batch| batch.hashes).collect();
    let expected: Vec<_> = (81..=150).map(|no| info_at(&peer_chain, no).hash).collect();
    assert_eq!(resolved, expected);

    assert_eq!(peer.max_hash_count.load(Ordering::SeqCst), 20);
    assert_eq!(fetch.next_no(), 151);
}

#[tokio::test]
async fn test_short_response_fails() {
    // The peer is only at 140 but claims 150.
    let (local, peer_chain) = chains(100, 80, 140);
    let peer = Arc::new(TestPeer::new(peer_chain));
    let ctx = context(150, 100, Some(info_at(&local, 80)));
    let (hand_off, mut hashes) = mpsc::channel(16);

    let mut fetch = HashRangeFetch::new(&ctx, peer, &test_config()).unwrap();
    let err = fetch.fetch_all(&hand_off).await.unwrap_err();

    assert!(matches!(err, SyncError::MalformedResponse(_)), "{err}");
    // Batches resolved before the failure stay queued.
    assert_eq!(drain(&mut hashes).len(), 3);
    assert_eq!(fetch.next_no(), 141);
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_fails_run() {
    let (local, peer_chain) = chains(100, 80, 150);
    let peer = Arc::new(TestPeer::new(peer_chain).silent());
    let ctx = context(150, 100, Some(info_at(&local, 80)));
    let (hand_off, _hashes) = mpsc::channel(16);
    let (syncer_tx, mut syncer_rx) = mpsc::unbounded_channel();

    let _fetcher = HashFetcher::start(&ctx, peer, &test_config(), hand_off, syncer_tx).unwrap();

    match syncer_rx.recv().await.unwrap() {
        SyncerMessage::SyncStop { run, from_who, err } => {
            assert_eq!(run, Some(ctx.run));
            assert_eq!(from_who, Component::HashFetcher);
            assert!(matches!(err, Some(SyncError::Timeout { .. })));
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn test_completed_fetcher_asks_to_be_closed() {
    let (local, peer_chain) = chains(100, 80, 150);
    let peer = Arc::new(TestPeer::new(peer_chain));
    let ctx = context(150, 100, Some(info_at(&local, 80)));
    let (hand_off, mut hashes) = mpsc::channel(16);
    let (syncer_tx, mut syncer_rx) = mpsc::unbounded_channel();

    let _fetcher = HashFetcher::start(&ctx, peer, &test_config(), hand_off, syncer_tx).unwrap();

    match syncer_rx.recv().await.unwrap() {
        SyncerMessage::CloseFetcher { run, from_who } => {
            assert_eq!(run, ctx.run);
            assert_eq!(from_who, Component::HashFetcher);
        }
        other => panic!("unexpected message {other:?}"),
    }

    let mut count = 0;
    while let Some(batch) = hashes.recv().await {
        count += batch.hashes.len();
    }
    assert_eq!(count, 70);
}

#[test]
fn test_fetch_requires_ancestor() {
    let (_, peer_chain) = chains(100, 80, 150);
    let peer = Arc::new(TestPeer::new(peer_chain));

    assert!(matches!(
        HashRangeFetch::new(&context(150, 100, None), peer, &test_config()),
        Err(SyncError::Internal(_))
    ));
}
