//! The relayer service: wire the monitors, forwarder, and executor together.
//!
//! [Relayer::start] launches three workers that run until [Relayer::stop]:
//!
//! * Block forwarding batches new source chain blocks (filling any gap in heights) and submits
//!   them to the attestation chain.
//! * Finality relay folds every finalized block into the [RelayerStatus].
//! * Forced transactions are executed as they are announced and on every poll.
//!
//! Worker errors are recorded in the status and never stop the relayer, with one exception: a
//! batch that breaks height or id ordering is discarded and the workers are shut down.

use crate::{
    checkpoint::Checkpoint,
    config::{BroadcastMode, Config},
    finality_monitor::FinalityMonitor,
    finality_store::FinalityStore,
    forced_tx::{Executor, ForcedTxMonitor, Outcome},
    forwarder::{Forwarded, Forwarder},
    metrics::Metrics,
    monitor::ChainMonitor,
    rpc::{AttestationClient, Broadcaster, ChainClient},
    signer::Signer,
    types::{BlockData, FinalityInfo, ForcedTx, RelayerStatus},
    Error,
};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pending blocks are flushed at least this often.
pub const BATCH_INTERVAL: Duration = Duration::from_secs(5);

/// How long [Relayer::stop] waits for workers to exit.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a broadcast transaction may take to be committed.
pub const INCLUSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared, cloneable view of the [RelayerStatus].
#[derive(Clone, Debug, Default)]
pub struct StatusHandle(Arc<RwLock<RelayerStatus>>);

impl StatusHandle {
    pub fn new(source_chain_id: &str, attestation_chain_id: &str) -> Self {
        Self(Arc::new(RwLock::new(RelayerStatus {
            source_chain_id: source_chain_id.to_string(),
            attestation_chain_id: attestation_chain_id.to_string(),
            updated_at: Utc::now(),
            ..Default::default()
        })))
    }

    /// Copy of the current status.
    pub fn get(&self) -> RelayerStatus {
        self.0.read().clone()
    }

    /// Apply `f` and stamp the update time.
    pub fn update(&self, f: impl FnOnce(&mut RelayerStatus)) {
        let mut status = self.0.write();
        f(&mut status);
        status.updated_at = Utc::now();
    }

    /// Surface `err` as the last error.
    pub fn record_error(&self, err: &Error) {
        self.update(|status| status.last_error = err.to_string());
    }
}

/// Whether a failed call may succeed if repeated.
fn is_transient(err: &Error) -> bool {
    matches!(err, Error::RpcUnavailable(_))
}

/// Run `op` up to `attempts` times (at least once), waiting `delay` after each transient failure.
pub async fn retry<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    shutdown: &CancellationToken,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && is_transient(&e) => {
                warn!(attempt, error = %e, "retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(e),
                    _ = tokio::time::sleep(delay) => {},
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Endpoints the relayer talks to.
pub struct Clients<C, A, B> {
    /// The chain whose blocks are relayed.
    pub source: C,
    /// The attestation chain's node.
    pub attestation_chain: C,
    /// The attestation chain's module.
    pub attestation: A,
    /// Submits forced transactions to the source chain.
    pub broadcaster: B,
}

struct Inner<C, A, B, S> {
    config: Config,
    metrics: Metrics,
    source: ChainMonitor<C>,
    attestation: ChainMonitor<C>,
    forwarder: Forwarder<A, S>,
    finality: Arc<FinalityMonitor<C>>,
    forced: ForcedTxMonitor<A>,
    executor: Executor<B, A>,
    store: Arc<FinalityStore>,
    checkpoint: Arc<Checkpoint>,
    status: StatusHandle,
}

struct Running {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Relays blocks from a source chain to an attestation chain.
pub struct Relayer<C, A, B, S> {
    inner: Arc<Inner<C, A, B, S>>,
    running: Mutex<Option<Running>>,
}

impl<C, A, B, S> Relayer<C, A, B, S>
where
    C: ChainClient,
    A: AttestationClient,
    B: Broadcaster,
    S: Signer,
{
    pub fn new(
        config: Config,
        clients: Clients<C, A, B>,
        signer: Arc<S>,
        store: Arc<FinalityStore>,
        checkpoint: Arc<Checkpoint>,
        metrics: Metrics,
    ) -> Self {
        let source = ChainMonitor::new(
            clients.source,
            "source",
            &config.source_chain_id,
            config.block_poll_interval,
        );
        let attestation = ChainMonitor::new(
            clients.attestation_chain.clone(),
            "attestation",
            &config.attestation_chain_id,
            config.finality_poll_interval,
        );
        let forwarder = Forwarder::new(
            clients.attestation.clone(),
            signer,
            &config.relayer_address,
            &config.source_chain_id,
            metrics.clone(),
        );
        let finality = Arc::new(FinalityMonitor::new(
            clients.attestation_chain,
            store.clone(),
            checkpoint.clone(),
            metrics.clone(),
            config.finality_poll_interval,
            config.pending_attestation_timeout,
        ));
        let forced = ForcedTxMonitor::new(
            clients.attestation.clone(),
            &config.source_chain_id,
            config.forced_tx_poll_interval,
        );
        let executor = Executor::new(
            clients.broadcaster,
            clients.attestation,
            config.max_retries,
            config.retry_delay,
            INCLUSION_TIMEOUT,
            metrics.clone(),
        );
        let status = StatusHandle::new(&config.source_chain_id, &config.attestation_chain_id);
        Self {
            inner: Arc::new(Inner {
                config,
                metrics,
                source,
                attestation,
                forwarder,
                finality,
                forced,
                executor,
                store,
                checkpoint,
                status,
            }),
            running: Mutex::new(None),
        }
    }

    /// Copy of the current status.
    pub fn status(&self) -> RelayerStatus {
        self.inner.status.get()
    }

    /// A handle that observes status updates.
    pub fn status_handle(&self) -> StatusHandle {
        self.inner.status.clone()
    }

    pub fn store(&self) -> &Arc<FinalityStore> {
        &self.inner.store
    }

    pub fn checkpoint(&self) -> &Arc<Checkpoint> {
        &self.inner.checkpoint
    }

    /// Finality of (`chain_id`, `height`).
    pub fn finality_info(&self, chain_id: &str, height: u64) -> Result<Option<FinalityInfo>, Error> {
        self.inner.finality.finality_status(chain_id, height)
    }

    /// Number of attestations awaiting finality.
    pub fn pending_attestations_count(&self) -> usize {
        self.inner.finality.pending_count()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Resolves once the workers have been told to stop, either by the parent token or by an
    /// [Error::InternalInvariantViolation]. Resolves immediately if not running.
    pub async fn stopped(&self) {
        let shutdown = match self.running.lock().await.as_ref() {
            Some(running) => running.shutdown.clone(),
            None => return,
        };
        shutdown.cancelled().await;
    }

    /// Start relaying. Workers stop when `parent` is cancelled or [Relayer::stop] is called.
    pub async fn start(&self, parent: &CancellationToken) -> Result<(), Error> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let inner = &self.inner;
        info!(
            source_chain = %inner.config.source_chain_id,
            attestation_chain = %inner.config.attestation_chain_id,
            broadcast_mode = %inner.config.broadcast_mode,
            "starting relayer"
        );
        inner.source.start().await?;
        inner.attestation.start().await?;

        let shutdown = parent.child_token();
        let mut handles = Vec::new();
        let finalized = inner.finality.subscribe();
        handles.push(inner.finality.start(shutdown.clone()));
        let (forced, forced_handle) = inner.forced.subscribe(shutdown.clone());
        handles.push(forced_handle);
        inner
            .checkpoint
            .start(inner.config.checkpoint_interval, &shutdown);

        let resume = inner.resume_height();
        let (blocks, blocks_handle) = inner.source.subscribe_new_blocks(None, shutdown.clone());
        handles.push(blocks_handle);
        handles.push(tokio::spawn(
            inner.clone().forward_blocks(blocks, resume, shutdown.clone()),
        ));
        handles.push(tokio::spawn(
            inner.clone().relay_finality(finalized, shutdown.clone()),
        ));
        handles.push(tokio::spawn(
            inner.clone().execute_forced(forced, shutdown.clone()),
        ));

        inner.status.update(|status| status.running = true);
        *running = Some(Running { shutdown, handles });
        info!("relayer started");
        Ok(())
    }

    /// Stop every worker, save the checkpoint, and close the finality store.
    pub async fn stop(&self) -> Result<(), Error> {
        let Some(Running { shutdown, handles }) = self.running.lock().await.take() else {
            return Err(Error::NotRunning);
        };
        info!("stopping relayer");
        shutdown.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "worker panicked");
                    }
                }
            }
            Err(_) => warn!("timed out waiting for workers to stop"),
        }

        let inner = &self.inner;
        inner.finality.stop();
        if let Err(e) = inner.checkpoint.stop().await {
            error!(error = %e, "failed to save checkpoint");
        }
        if let Err(e) = inner.store.close() {
            error!(error = %e, "failed to close finality store");
        }
        inner.status.update(|status| status.running = false);
        info!("relayer stopped");
        Ok(())
    }
}

impl<C, A, B, S> Inner<C, A, B, S>
where
    C: ChainClient,
    A: AttestationClient,
    B: Broadcaster,
    S: Signer,
{
    /// Highest height already submitted according to the checkpoint.
    fn resume_height(&self) -> Option<u64> {
        let state = self.checkpoint.state();
        let submitted = state
            .pending_attestations
            .values()
            .map(|pending| *pending.heights().end())
            .max()
            .unwrap_or(0);
        let height = state.last_finality_block_height.max(submitted);
        if height > 0 {
            info!(component = "forwarder", height, "resuming from checkpoint");
            Some(height)
        } else {
            None
        }
    }

    async fn forward_blocks(
        self: Arc<Self>,
        mut blocks: mpsc::Receiver<BlockData>,
        resume: Option<u64>,
        shutdown: CancellationToken,
    ) {
        let mut queue = Queue {
            pending: Vec::new(),
            next: resume.map(|height| height + 1),
        };
        let start = tokio::time::Instant::now() + BATCH_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, BATCH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                block = blocks.recv() => {
                    let Some(block) = block else {
                        break;
                    };
                    self.enqueue(&mut queue, block, &shutdown).await;
                },
                _ = ticker.tick() => {
                    self.flush(&mut queue, &shutdown).await;
                },
            }
            let count = queue.pending.len();
            self.status.update(|status| status.pending_blocks_count = count);
        }
        if !queue.pending.is_empty() {
            info!(
                component = "forwarder",
                count = queue.pending.len(),
                "forwarding remaining blocks before shutdown"
            );
            self.flush(&mut queue, &shutdown).await;
        }
        debug!(component = "forwarder", "block forwarding stopped");
    }

    /// Queue `block`, first fetching any heights skipped since the last queued block.
    async fn enqueue(&self, queue: &mut Queue, block: BlockData, shutdown: &CancellationToken) {
        let height = block.block_height;
        let expected = *queue.next.get_or_insert(height);
        if height < expected {
            debug!(component = "forwarder", height, expected, "dropping block already queued");
            return;
        }
        if height > expected {
            warn!(
                component = "forwarder",
                start_height = expected,
                end_height = height - 1,
                "filling gap in block stream"
            );
        }
        for missing in expected..height {
            if shutdown.is_cancelled() {
                return;
            }
            match self.source.block(missing).await {
                Ok(block) => {
                    // A failed batch rewinds the queue, so the rest of the gap waits
                    if !self.push(queue, block, shutdown).await {
                        return;
                    }
                }
                Err(e @ (Error::Malformed(_) | Error::Serialization(_))) => {
                    warn!(component = "forwarder", height = missing, error = %e, "skipping undecodable block");

                    // Batches must stay contiguous, so forward what precedes the hole first
                    if !self.flush(queue, shutdown).await {
                        return;
                    }
                    queue.next = Some(missing + 1);
                }
                Err(e) => {
                    // The gap is retried when the next block arrives
                    warn!(component = "forwarder", height = missing, error = %e, "failed to fetch missing block");
                    return;
                }
            }
        }
        self.push(queue, block, shutdown).await;
    }

    /// Returns false if queuing `block` flushed a batch that could not be forwarded.
    async fn push(&self, queue: &mut Queue, block: BlockData, shutdown: &CancellationToken) -> bool {
        queue.next = Some(block.block_height + 1);
        queue.pending.push(block);
        if queue.pending.len() >= self.config.block_batch_size {
            return self.flush(queue, shutdown).await;
        }
        true
    }

    /// Forward every queued block. On failure the queue is rewound to the first height of
    /// the batch and false is returned.
    async fn flush(&self, queue: &mut Queue, shutdown: &CancellationToken) -> bool {
        let blocks = std::mem::take(&mut queue.pending);
        let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
            return true;
        };
        let (first, last) = (first.block_height, last.block_height);
        info!(
            component = "forwarder",
            count = blocks.len(),
            first_height = first,
            last_height = last,
            "forwarding blocks"
        );
        let result = retry(
            self.config.max_retries,
            self.config.retry_delay,
            shutdown,
            || async {
                match blocks.as_slice() {
                    [block] => self.forwarder.forward_block(block).await,
                    blocks => self.forwarder.batch_forward_blocks(blocks).await,
                }
            },
        )
        .await;
        match result {
            Ok(forwarded) => {
                self.track(&forwarded, first, last).await;
                self.status
                    .update(|status| status.last_block_forwarded = last);
                true
            }
            Err(e @ Error::InternalInvariantViolation(_)) => {
                self.metrics.forward_failures.inc();
                error!(component = "forwarder", first_height = first, last_height = last, error = %e, "discarding batch and shutting down");
                self.status.record_error(&e);
                shutdown.cancel();
                false
            }
            Err(e) => {
                self.metrics.forward_failures.inc();
                warn!(component = "forwarder", first_height = first, last_height = last, error = %e, "failed to forward blocks");
                self.status.record_error(&e);

                // Refetched as a gap once the next block arrives
                queue.next = Some(first);
                false
            }
        }
    }

    async fn track(&self, forwarded: &Forwarded, first: u64, last: u64) {
        let chain_id = &self.config.source_chain_id;
        if self.config.broadcast_mode == BroadcastMode::Sync && !forwarded.placeholder {
            if let Err(e) = self
                .finality
                .track_batch_attestation_finalized(
                    &forwarded.tx_hash,
                    &forwarded.attestation_ids,
                    chain_id,
                    first,
                    last,
                )
                .await
            {
                warn!(component = "forwarder", error = %e, "failed to record finality");
                self.status.record_error(&e);
            }
        } else {
            self.finality.track_batch_attestation(
                &forwarded.tx_hash,
                forwarded.attestation_ids.clone(),
                chain_id,
                first,
                last,
            );
        }
    }

    async fn relay_finality(
        self: Arc<Self>,
        mut finalized: mpsc::Receiver<FinalityInfo>,
        shutdown: CancellationToken,
    ) {
        loop {
            let info = tokio::select! {
                _ = shutdown.cancelled() => break,
                info = finalized.recv() => match info {
                    Some(info) => info,
                    None => break,
                },
            };
            info!(
                chain_id = %info.chain_id,
                height = info.block_height,
                attestation_id = info.attestation_id,
                "block finalized on attestation chain"
            );
            self.status.update(|status| {
                status.last_finality_received = info.block_height;
                status.finalized_blocks_count += 1;
            });
        }
        debug!("finality relay stopped");
    }

    async fn execute_forced(
        self: Arc<Self>,
        mut announced: mpsc::Receiver<ForcedTx>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.forced_tx_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                tx = announced.recv() => {
                    let Some(tx) = tx else {
                        break;
                    };
                    let result = self.executor.execute_with_retry(&tx, &shutdown).await;
                    self.record_forced(tx.forced_tx_id, result);
                },
                _ = ticker.tick() => {
                    let pending = match self.forced.pending().await {
                        Ok(pending) => pending,
                        Err(e) => {
                            warn!(component = "forced_tx_executor", error = %e, "failed to poll forced txs");
                            self.status.record_error(&e);
                            continue;
                        }
                    };
                    let count = pending.len();
                    self.status.update(|status| status.pending_forced_tx_count = count);
                    for (id, result) in self.executor.execute_batch(&pending, &shutdown).await {
                        self.record_forced(id, result);
                    }
                },
            }
        }
        debug!("forced tx execution stopped");
    }

    fn record_forced(&self, id: u64, result: Result<Outcome, Error>) {
        match result {
            Ok(Outcome::Executed { .. }) => self.status.update(|status| {
                status.last_forced_tx_processed = id;
                status.pending_forced_tx_count = status.pending_forced_tx_count.saturating_sub(1);
            }),
            Ok(Outcome::Skipped) => {}
            Err(e) => self.status.record_error(&e),
        }
    }
}

/// Blocks waiting to be forwarded.
struct Queue {
    pending: Vec<BlockData>,
    /// Height expected next, unknown until the first block arrives.
    next: Option<u64>,
}
