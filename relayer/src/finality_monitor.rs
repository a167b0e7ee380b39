//! Track submitted attestations until the attestation chain reports them final.
//!
//! Every submission is remembered (in memory and in the [Checkpoint]) by its transaction hash.
//! The monitor periodically looks the transaction up on the attestation chain. Once it carries
//! an [EVENT_BATCH_BLOCK_ATTESTED](crate::rpc::EVENT_BATCH_BLOCK_ATTESTED) event, one
//! [FinalityInfo] per attested block is saved to the [FinalityStore], the checkpoint height is
//! advanced, and subscribers are notified. Submissions that stay unresolved for longer than
//! the pending timeout are declared lost.

use crate::{
    checkpoint::Checkpoint,
    finality_store::FinalityStore,
    metrics::Metrics,
    rpc::{find_batch_attested, BatchAttested, ChainClient},
    types::{FinalityInfo, PendingAttestation},
    Error,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of each subscriber channel.
pub const FINALITY_BUFFER: usize = 100;

/// How often lost submissions are swept.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Watches the attestation chain for finality of submitted blocks.
pub struct FinalityMonitor<C> {
    chain: C,
    store: Arc<FinalityStore>,
    checkpoint: Arc<Checkpoint>,
    metrics: Metrics,
    poll_interval: Duration,
    pending_timeout: Duration,
    pending: Mutex<BTreeMap<String, PendingAttestation>>,
    subscribers: Mutex<Vec<mpsc::Sender<FinalityInfo>>>,
}

impl<C: ChainClient> FinalityMonitor<C> {
    /// Create a monitor, resuming every submission still pending in `checkpoint`.
    pub fn new(
        chain: C,
        store: Arc<FinalityStore>,
        checkpoint: Arc<Checkpoint>,
        metrics: Metrics,
        poll_interval: Duration,
        pending_timeout: Duration,
    ) -> Self {
        let pending = checkpoint.pending_attestations();
        if !pending.is_empty() {
            info!(
                component = "finality_monitor",
                count = pending.len(),
                "restored pending attestations"
            );
        }
        metrics.pending_attestations.set(pending.len() as i64);
        Self {
            chain,
            store,
            checkpoint,
            metrics,
            poll_interval,
            pending_timeout,
            pending: Mutex::new(pending),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Receive every block that becomes final from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<FinalityInfo> {
        let (sender, receiver) = mpsc::channel(FINALITY_BUFFER);
        self.subscribers.lock().push(sender);
        receiver
    }

    fn track(&self, pending: PendingAttestation) {
        debug!(
            component = "finality_monitor",
            tx_hash = %pending.tx_hash,
            chain_id = %pending.chain_id,
            height = pending.block_height,
            "tracking attestation"
        );
        self.checkpoint.add_pending_attestation(pending.clone());
        let mut tracked = self.pending.lock();
        tracked.insert(pending.tx_hash.clone(), pending);
        self.metrics.pending_attestations.set(tracked.len() as i64);
    }

    fn untrack(&self, tx_hash: &str) -> Option<PendingAttestation> {
        self.checkpoint.remove_pending_attestation(tx_hash);
        let mut tracked = self.pending.lock();
        let removed = tracked.remove(tx_hash);
        self.metrics.pending_attestations.set(tracked.len() as i64);
        removed
    }

    /// Track the submission of a single block.
    pub fn track_attestation(&self, tx_hash: &str, attestation_id: u64, chain_id: &str, height: u64) {
        self.track(PendingAttestation {
            tx_hash: tx_hash.to_string(),
            attestation_ids: Vec::new(),
            attestation_id,
            chain_id: chain_id.to_string(),
            block_height: height,
            start_height: height,
            end_height: height,
            submitted_at: Utc::now(),
        });
    }

    /// Track the submission of blocks `start..=end`.
    pub fn track_batch_attestation(
        &self,
        tx_hash: &str,
        attestation_ids: Vec<u64>,
        chain_id: &str,
        start: u64,
        end: u64,
    ) {
        self.track(PendingAttestation {
            tx_hash: tx_hash.to_string(),
            attestation_ids,
            attestation_id: 0,
            chain_id: chain_id.to_string(),
            block_height: start,
            start_height: start,
            end_height: end,
            submitted_at: Utc::now(),
        });
    }

    /// Record blocks `start..=end` as final without waiting for an event.
    pub async fn track_batch_attestation_finalized(
        &self,
        tx_hash: &str,
        attestation_ids: &[u64],
        chain_id: &str,
        start: u64,
        end: u64,
    ) -> Result<usize, Error> {
        let attested: Vec<(u64, u64)> = (start..=end).zip(attestation_ids.iter().copied()).collect();
        self.finalize(tx_hash, chain_id, &attested).await
    }

    /// Finality of (`chain_id`, `height`) as recorded in the store.
    pub fn finality_status(&self, chain_id: &str, height: u64) -> Result<Option<FinalityInfo>, Error> {
        self.store.get(chain_id, height)
    }

    /// Number of submissions awaiting finality.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Apply a [BatchAttested] event observed in transaction `tx_hash`.
    pub async fn handle_event(&self, tx_hash: &str, event: &BatchAttested) -> Result<usize, Error> {
        if let Some(pending) = self.untrack(tx_hash) {
            if pending.heights() != (event.start_height..=event.end_height) {
                warn!(
                    component = "finality_monitor",
                    tx_hash,
                    submitted_start = pending.start_height,
                    submitted_end = pending.end_height,
                    start_height = event.start_height,
                    end_height = event.end_height,
                    "attested range differs from submission"
                );
            }
        }
        let attested: Vec<(u64, u64)> = event.attested().collect();
        self.finalize(tx_hash, &event.chain_id, &attested).await
    }

    /// Save `(height, attestation_id)` pairs as final and notify subscribers of new records.
    async fn finalize(
        &self,
        tx_hash: &str,
        chain_id: &str,
        attested: &[(u64, u64)],
    ) -> Result<usize, Error> {
        let finalized_at = Utc::now().timestamp();
        let mut updated = Vec::new();
        for &(height, attestation_id) in attested {
            let info = FinalityInfo {
                attestation_id,
                chain_id: chain_id.to_string(),
                block_height: height,
                finalized: true,
                finalized_at,
                attestation_tx_hash: tx_hash.to_string(),
                ..Default::default()
            };
            if let Some(prior) = self.store.get(chain_id, height)? {
                if !info.supersedes(&prior) {
                    debug!(component = "finality_monitor", chain_id, height, "duplicate finality");
                    continue;
                }
            }
            self.store.save(&info)?;
            updated.push(info);
        }
        if let Some(highest) = attested.iter().map(|(height, _)| *height).max() {
            self.checkpoint.update_last_finality_block_height(highest);
        }
        self.untrack(tx_hash);
        if updated.is_empty() {
            return Ok(0);
        }

        self.metrics.finality_events.inc_by(updated.len() as u64);
        info!(
            component = "finality_monitor",
            chain_id,
            tx_hash,
            count = updated.len(),
            "blocks finalized"
        );
        let count = updated.len();
        self.notify(updated).await;
        Ok(count)
    }

    async fn notify(&self, infos: Vec<FinalityInfo>) {
        let subscribers = self.subscribers.lock().clone();
        for info in infos {
            for subscriber in &subscribers {
                // A dropped subscriber is pruned below
                let _ = subscriber.send(info.clone()).await;
            }
        }
        self.subscribers.lock().retain(|subscriber| !subscriber.is_closed());
    }

    /// Look up every pending submission once. Returns the number of blocks finalized.
    pub async fn poll(&self) -> Result<usize, Error> {
        let hashes: Vec<String> = self.pending.lock().keys().cloned().collect();
        let mut finalized = 0;
        for tx_hash in hashes {
            let Some(inclusion) = self.chain.tx(&tx_hash).await? else {
                continue;
            };
            if inclusion.result.code != 0 {
                warn!(
                    component = "finality_monitor",
                    tx_hash = %tx_hash,
                    code = inclusion.result.code,
                    log = %inclusion.result.log,
                    "attestation tx failed"
                );
                self.untrack(&tx_hash);
                continue;
            }
            match find_batch_attested(&inclusion.result.events) {
                Ok(Some(event)) => finalized += self.handle_event(&tx_hash, &event).await?,
                Ok(None) => debug!(component = "finality_monitor", tx_hash = %tx_hash, "not attested yet"),
                Err(e) => warn!(component = "finality_monitor", tx_hash = %tx_hash, error = %e, "ignoring event"),
            }
        }
        Ok(finalized)
    }

    /// Drop submissions made before `now - pending_timeout`.
    pub fn expire(&self, now: DateTime<Utc>) -> Vec<PendingAttestation> {
        let Ok(timeout) = chrono::Duration::from_std(self.pending_timeout) else {
            return Vec::new();
        };
        let expired: Vec<String> = self
            .pending
            .lock()
            .values()
            .filter(|pending| now - pending.submitted_at > timeout)
            .map(|pending| pending.tx_hash.clone())
            .collect();
        let mut lost = Vec::new();
        for tx_hash in expired {
            if let Some(pending) = self.untrack(&tx_hash) {
                warn!(
                    component = "finality_monitor",
                    tx_hash = %pending.tx_hash,
                    chain_id = %pending.chain_id,
                    start_height = pending.heights().start(),
                    end_height = pending.heights().end(),
                    "attestation lost"
                );
                lost.push(pending);
            }
        }
        lost
    }

    /// Poll and sweep until `shutdown` fires.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(monitor.poll_interval);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let start = tokio::time::Instant::now() + CLEANUP_INTERVAL;
            let mut cleanup = tokio::time::interval_at(start, CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = poll.tick() => {
                        if let Err(e) = monitor.poll().await {
                            warn!(component = "finality_monitor", error = %e, "poll failed");
                        }
                    },
                    _ = cleanup.tick() => {
                        monitor.expire(Utc::now());
                    },
                }
            }
            monitor.stop();
            debug!(component = "finality_monitor", "stopped");
        })
    }

    /// Close every subscriber channel.
    pub fn stop(&self) {
        self.subscribers.lock().clear();
    }
}
