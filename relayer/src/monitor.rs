//! Follow the head of a chain.

use crate::{
    rpc::{ChainClient, ChainStatus},
    types::BlockData,
    Error,
};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the new block channel.
pub const NEW_BLOCK_BUFFER: usize = 100;

/// Watches one chain through a [ChainClient].
pub struct ChainMonitor<C> {
    client: C,
    name: &'static str,
    chain_id: String,
    poll_interval: Duration,
}

impl<C: ChainClient> ChainMonitor<C> {
    /// Create a monitor labelled `name` for the chain expected to be `chain_id`.
    pub fn new(client: C, name: &'static str, chain_id: &str, poll_interval: Duration) -> Self {
        Self {
            client,
            name,
            chain_id: chain_id.to_string(),
            poll_interval,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Check that the chain is reachable.
    pub async fn start(&self) -> Result<ChainStatus, Error> {
        let status = self.client.status().await?;
        if status.network != self.chain_id {
            warn!(
                monitor = self.name,
                expected = %self.chain_id,
                network = %status.network,
                "connected to unexpected network"
            );
        }
        info!(
            monitor = self.name,
            network = %status.network,
            latest_height = status.latest_height,
            "chain monitor started"
        );
        Ok(status)
    }

    pub async fn latest_height(&self) -> Result<u64, Error> {
        Ok(self.client.status().await?.latest_height)
    }

    /// The block at `height`, with its execution results.
    pub async fn block(&self, height: u64) -> Result<BlockData, Error> {
        self.client.block(height).await
    }

    /// Emit every block committed after `after` (or after the current head if `None`) in
    /// height order.
    ///
    /// A block that cannot be fetched is retried on the next poll. A block the node returns
    /// in a form that cannot be decoded is skipped. The channel closes when `shutdown` fires.
    pub fn subscribe_new_blocks(
        &self,
        after: Option<u64>,
        shutdown: CancellationToken,
    ) -> (mpsc::Receiver<BlockData>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(NEW_BLOCK_BUFFER);
        let client = self.client.clone();
        let name = self.name;
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut next = after.map(|height| height + 1);
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                let latest = match client.status().await {
                    Ok(status) => status.latest_height,
                    Err(e) => {
                        warn!(monitor = name, error = %e, "failed to query status");
                        continue;
                    }
                };
                let Some(mut height) = next else {
                    next = Some(latest + 1);
                    continue;
                };
                while height <= latest {
                    let block = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        block = client.block(height) => block,
                    };
                    match block {
                        Ok(block) => {
                            let sent = tokio::select! {
                                _ = shutdown.cancelled() => return,
                                sent = sender.send(block) => sent,
                            };
                            if sent.is_err() {
                                debug!(monitor = name, "block subscriber dropped");
                                return;
                            }
                        }
                        Err(e @ (Error::Malformed(_) | Error::Serialization(_))) => {
                            warn!(monitor = name, height, error = %e, "dropping undecodable block");
                        }
                        Err(e) => {
                            warn!(monitor = name, height, error = %e, "failed to fetch block");
                            break;
                        }
                    }
                    height += 1;
                }
                next = Some(height);
            }
            debug!(monitor = name, "block subscription stopped");
        });
        (receiver, handle)
    }
}
