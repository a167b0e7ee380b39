//! Execute forced transactions admitted on the attestation chain.
//!
//! The [ForcedTxMonitor] polls the attestation chain for forced transactions targeting the
//! source chain. The [Executor] broadcasts each one's payload to the source chain, waits for
//! it to be committed, and confirms the execution back to the attestation chain.

use crate::{
    metrics::Metrics,
    rpc::{AttestationClient, Broadcaster},
    types::ForcedTx,
    Error,
};
use parking_lot::Mutex;
use std::{
    cmp::Reverse,
    collections::{BTreeSet, HashMap},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the forced transaction channel.
pub const FORCED_TX_BUFFER: usize = 100;

/// Polls the attestation chain for forced transactions.
pub struct ForcedTxMonitor<A> {
    client: A,
    chain_id: String,
    poll_interval: Duration,
}

impl<A: AttestationClient> ForcedTxMonitor<A> {
    /// Create a monitor for forced transactions targeting `chain_id`.
    pub fn new(client: A, chain_id: &str, poll_interval: Duration) -> Self {
        Self {
            client,
            chain_id: chain_id.to_string(),
            poll_interval,
        }
    }

    /// Forced transactions not yet executed.
    pub async fn pending(&self) -> Result<Vec<ForcedTx>, Error> {
        self.client.pending_forced_txs(&self.chain_id).await
    }

    /// Emit each pending forced transaction the first time it is seen.
    pub fn subscribe(&self, shutdown: CancellationToken) -> (mpsc::Receiver<ForcedTx>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(FORCED_TX_BUFFER);
        let client = self.client.clone();
        let chain_id = self.chain_id.clone();
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut seen = BTreeSet::new();
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                let pending = match client.pending_forced_txs(&chain_id).await {
                    Ok(pending) => pending,
                    Err(e) => {
                        warn!(component = "forced_tx_monitor", error = %e, "failed to query forced txs");
                        continue;
                    }
                };

                // Forget ids that are no longer pending
                seen.retain(|id| pending.iter().any(|tx| tx.forced_tx_id == *id));
                for tx in pending {
                    if tx.executed || !seen.insert(tx.forced_tx_id) {
                        continue;
                    }
                    debug!(
                        component = "forced_tx_monitor",
                        id = tx.forced_tx_id,
                        priority = tx.priority,
                        tx_type = %tx.tx_type,
                        "new forced tx"
                    );
                    let sent = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        sent = sender.send(tx) => sent,
                    };
                    if sent.is_err() {
                        return;
                    }
                }
            }
            debug!(component = "forced_tx_monitor", "stopped");
        });
        (receiver, handle)
    }
}

/// Result of executing a forced transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Committed at `height` on the source chain and confirmed.
    Executed { tx_hash: String, height: u64 },
    /// Already executed.
    Skipped,
}

/// How far a forced transaction got before an attempt failed.
#[derive(Clone, Debug)]
enum Stage {
    Broadcast,
    Include { tx_hash: String },
    Confirm { tx_hash: String, height: u64 },
}

/// Broadcasts forced transactions to the source chain and confirms them.
pub struct Executor<B, A> {
    broadcaster: B,
    client: A,
    max_retries: u32,
    retry_delay: Duration,
    inclusion_timeout: Duration,
    metrics: Metrics,

    // Stage reached by an unfinished execution, so retries never rebroadcast
    stages: Mutex<HashMap<u64, Stage>>,
    completed: Mutex<BTreeSet<u64>>,
    last_error: Mutex<Option<String>>,
}

impl<B: Broadcaster, A: AttestationClient> Executor<B, A> {
    pub fn new(
        broadcaster: B,
        client: A,
        max_retries: u32,
        retry_delay: Duration,
        inclusion_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            broadcaster,
            client,
            max_retries,
            retry_delay,
            inclusion_timeout,
            metrics,
            stages: Mutex::new(HashMap::new()),
            completed: Mutex::new(BTreeSet::new()),
            last_error: Mutex::new(None),
        }
    }

    /// The most recent execution failure.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Whether `id` was executed by this executor.
    pub fn is_completed(&self, id: u64) -> bool {
        self.completed.lock().contains(&id)
    }

    /// Run `tx` from the stage its last attempt reached.
    async fn execute(&self, tx: &ForcedTx) -> Result<Outcome, Error> {
        let id = tx.forced_tx_id;
        let mut stage = self
            .stages
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or(Stage::Broadcast);
        loop {
            stage = match stage {
                Stage::Broadcast => {
                    let tx_hash = self.broadcaster.broadcast(&tx.transaction_data).await?;
                    debug!(component = "forced_tx_executor", id, tx_hash = %tx_hash, "broadcast");
                    Stage::Include { tx_hash }
                }
                Stage::Include { tx_hash } => {
                    let height = self
                        .broadcaster
                        .await_inclusion(&tx_hash, self.inclusion_timeout)
                        .await?;
                    Stage::Confirm { tx_hash, height }
                }
                Stage::Confirm { tx_hash, height } => {
                    self.client.confirm_execution(id, &tx_hash, height).await?;
                    self.stages.lock().remove(&id);
                    return Ok(Outcome::Executed { tx_hash, height });
                }
            };
            self.stages.lock().insert(id, stage.clone());
        }
    }

    /// Execute `tx`, retrying failed steps up to `max_retries` times in total.
    pub async fn execute_with_retry(
        &self,
        tx: &ForcedTx,
        shutdown: &CancellationToken,
    ) -> Result<Outcome, Error> {
        let id = tx.forced_tx_id;
        if tx.executed || self.is_completed(id) {
            debug!(component = "forced_tx_executor", id, "already executed");
            return Ok(Outcome::Skipped);
        }
        if tx.transaction_data.is_empty() {
            return Err(self.fail(id, 0, "empty transaction data".into()));
        }

        let attempts = self.max_retries.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match self.execute(tx).await {
                Ok(outcome) => {
                    self.completed.lock().insert(id);
                    self.metrics.forced_txs_executed.inc();
                    if let Outcome::Executed { tx_hash, height } = &outcome {
                        info!(
                            component = "forced_tx_executor",
                            id,
                            tx_hash = %tx_hash,
                            height,
                            attempt,
                            "forced tx executed"
                        );
                    }
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(component = "forced_tx_executor", id, attempt, error = %e, "forced tx attempt failed");
                    reason = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        return Err(self.fail(id, attempt, format!("cancelled after: {reason}")));
                    },
                    _ = tokio::time::sleep(self.retry_delay) => {},
                }
            }
        }
        Err(self.fail(id, attempts, reason))
    }

    fn fail(&self, id: u64, attempts: u32, reason: String) -> Error {
        let err = Error::ForcedTxExecutionFailed {
            id,
            attempts,
            reason,
        };
        warn!(component = "forced_tx_executor", error = %err, "forced tx left for next poll");
        self.metrics.forced_tx_failures.inc();
        *self.last_error.lock() = Some(err.to_string());
        err
    }

    /// Execute `txs` by descending priority, keeping submission order within a priority.
    pub async fn execute_batch(
        &self,
        txs: &[ForcedTx],
        shutdown: &CancellationToken,
    ) -> Vec<(u64, Result<Outcome, Error>)> {
        let mut ordered: Vec<&ForcedTx> = txs.iter().collect();
        ordered.sort_by_key(|tx| Reverse(tx.priority));
        let mut results = Vec::with_capacity(ordered.len());
        for tx in ordered {
            if shutdown.is_cancelled() {
                break;
            }
            results.push((tx.forced_tx_id, self.execute_with_retry(tx, shutdown).await));
        }
        results
    }
}
