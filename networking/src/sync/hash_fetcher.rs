use std::{sync::Arc, time::Duration};

use containers::BlockNo;
use libp2p_identity::PeerId;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{Component, HashBatch, RunId, SyncContext, SyncError, SyncerConfig, SyncerMessage};
use crate::requester::{PeerRequester, request_with_timeout};

/// Hash download task of one run.
pub struct HashFetcher {
    handle: Option<JoinHandle<()>>,
}

impl HashFetcher {
    /// Start fetching hashes from the context's ancestor up to its target.
    ///
    /// Resolved batches go to `hand_off`. On success the fetcher asks the
    /// syncer to close it; on failure it asks the syncer to stop the run.
    pub fn start<N: PeerRequester>(
        ctx: &SyncContext,
        network: Arc<N>,
        config: &SyncerConfig,
        hand_off: mpsc::Sender<HashBatch>,
        syncer_tx: mpsc::UnboundedSender<SyncerMessage>,
    ) -> Result<Self, SyncError> {
        let mut fetch = HashRangeFetch::new(ctx, network, config)?;
        let run = ctx.run;

        let handle = tokio::spawn(async move {
            let message = match fetch.fetch_all(&hand_off).await {
                Ok(()) => SyncerMessage::CloseFetcher {
                    run,
                    from_who: Component::HashFetcher,
                },
                Err(err) => {
                    warn!(run = %run, error = %err, "Hash fetch failed");
                    SyncerMessage::SyncStop {
                        run: Some(run),
                        from_who: Component::HashFetcher,
                        err: Some(err),
                    }
                }
            };

            if syncer_tx.send(message).is_err() {
                debug!(run = %run, "Syncer gone, dropping hash fetcher report");
            }
        });

        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Stop issuing requests. Batches already handed off stay readable.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for HashFetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cursor over the hashes `(ancestor, target]` of one peer.
pub struct HashRangeFetch<N> {
    network: Arc<N>,
    peer_id: PeerId,
    run: RunId,
    next_no: BlockNo,
    target_no: BlockNo,
    max_req_size: u64,
    fetch_timeout: Duration,
}

impl<N: PeerRequester> HashRangeFetch<N> {
    pub fn new(ctx: &SyncContext, network: Arc<N>, config: &SyncerConfig) -> Result<Self, SyncError> {
        let ancestor = ctx
            .ancestor()
            .ok_or_else(|| SyncError::Internal("hash fetch started without ancestor".into()))?;

        Ok(Self {
            network,
            peer_id: ctx.peer_id,
            run: ctx.run,
            next_no: ancestor.no + 1,
            target_no: ctx.target_no,
            max_req_size: config.max_hash_req_size.max(1),
            fetch_timeout: config.fetch_timeout,
        })
    }

    pub fn next_no(&self) -> BlockNo {
        self.next_no
    }

    /// Fetch the next batch. Returns `None` once the target is reached.
    pub async fn next_batch(&mut self) -> Result<Option<HashBatch>, SyncError> {
        if self.next_no > self.target_no {
            return Ok(None);
        }

        let count = self.max_req_size.min(self.target_no - self.next_no + 1);
        let hashes = request_with_timeout(
            "get hashes by range",
            self.fetch_timeout,
            self.network
                .get_hashes_by_range(self.peer_id, self.next_no, count),
        )
        .await?;

        if hashes.len() as u64 != count {
            return Err(SyncError::MalformedResponse(format!(
                "asked for {count} hashes from {}, got {}",
                self.next_no,
                hashes.len()
            )));
        }

        let batch = HashBatch {
            start_no: self.next_no,
            hashes,
        };
        self.next_no += count;

        debug!(
            run = %self.run,
            start_no = batch.start_no,
            end_no = batch.end_no(),
            "Fetched hash batch"
        );

        Ok(Some(batch))
    }

    /// Fetch every remaining batch into `hand_off`, waiting whenever the
    /// queue is full.
    pub async fn fetch_all(&mut self, hand_off: &mpsc::Sender<HashBatch>) -> Result<(), SyncError> {
        while let Some(batch) = self.next_batch().await? {
            hand_off
                .send(batch)
                .await
                .map_err(|_| SyncError::Internal("block fetcher stopped reading hashes".into()))?;
        }

        info!(run = %self.run, target_no = self.target_no, "Fetched all hashes");
        Ok(())
    }
}
