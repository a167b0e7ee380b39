//! In-process chains used by tests.

use crate::{
    config::BroadcastMode,
    rpc::{
        AttestationClient, BroadcastResult, Broadcaster, ChainClient, ChainStatus,
        MsgSubmitBatchBlockAttestation, SubmitResult, TxInclusion,
    },
    types::{AttestationStatus, BlockData, ForcedTx, TxResult},
    Error,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

/// Hash a fake node assigns to `tx`.
pub fn tx_hash(tx: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(tx))
}

/// The block a fake node serves at `height`.
pub fn block(network: &str, height: u64) -> BlockData {
    BlockData {
        chain_id: network.to_string(),
        block_height: height,
        timestamp: height as i64,
        block_hash: height.to_be_bytes().to_vec(),
        app_hash: vec![0xaa; 4],
        block_header: format!("{{\"height\":\"{height}\"}}").into_bytes(),
        ..Default::default()
    }
}

#[derive(Default)]
struct ChainState {
    network: String,
    height: u64,
    fail_status: bool,
    missing_blocks: HashSet<u64>,
    malformed_blocks: HashSet<u64>,
    block_requests: Vec<u64>,
    broadcasts: Vec<Vec<u8>>,
    broadcast_failures: u32,
    inclusion_code: u32,
    txs: HashMap<String, TxInclusion>,
}

/// A CometBFT node whose head is moved by the test.
#[derive(Clone)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
}

impl FakeChain {
    pub fn new(network: &str, height: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                network: network.to_string(),
                height,
                ..Default::default()
            })),
        }
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().height = height;
    }

    pub fn fail_status(&self, fail: bool) {
        self.state.lock().fail_status = fail;
    }

    pub fn fail_block(&self, height: u64, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.missing_blocks.insert(height);
        } else {
            state.missing_blocks.remove(&height);
        }
    }

    pub fn malformed_block(&self, height: u64) {
        self.state.lock().malformed_blocks.insert(height);
    }

    pub fn fail_broadcasts(&self, count: u32) {
        self.state.lock().broadcast_failures = count;
    }

    /// Commit every later broadcast with `code`.
    pub fn set_inclusion_code(&self, code: u32) {
        self.state.lock().inclusion_code = code;
    }

    pub fn add_tx(&self, inclusion: TxInclusion) {
        self.state
            .lock()
            .txs
            .insert(inclusion.hash.clone(), inclusion);
    }

    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.state.lock().broadcasts.clone()
    }

    pub fn block_requests(&self) -> Vec<u64> {
        self.state.lock().block_requests.clone()
    }
}

impl ChainClient for FakeChain {
    async fn status(&self) -> Result<ChainStatus, Error> {
        let state = self.state.lock();
        if state.fail_status {
            return Err(Error::RpcUnavailable("connection refused".into()));
        }
        Ok(ChainStatus {
            network: state.network.clone(),
            latest_height: state.height,
        })
    }

    async fn block(&self, height: u64) -> Result<BlockData, Error> {
        let mut state = self.state.lock();
        state.block_requests.push(height);
        if state.missing_blocks.contains(&height) {
            return Err(Error::RpcUnavailable("connection reset".into()));
        }
        if state.malformed_blocks.contains(&height) {
            return Err(Error::Malformed(format!("block {height}")));
        }
        if height > state.height {
            return Err(Error::Rpc {
                code: -32603,
                message: format!("height {height} is not available"),
            });
        }
        Ok(block(&state.network, height))
    }

    async fn broadcast_tx(&self, _: BroadcastMode, tx: &[u8]) -> Result<BroadcastResult, Error> {
        let mut state = self.state.lock();
        if state.broadcast_failures > 0 {
            state.broadcast_failures -= 1;
            return Err(Error::RpcUnavailable("mempool unreachable".into()));
        }
        state.broadcasts.push(tx.to_vec());
        let hash = tx_hash(tx);
        let inclusion = TxInclusion {
            hash: hash.clone(),
            height: state.height,
            result: TxResult {
                code: state.inclusion_code,
                ..Default::default()
            },
        };
        state.txs.insert(hash.clone(), inclusion);
        Ok(BroadcastResult {
            hash,
            ..Default::default()
        })
    }

    async fn tx(&self, hash: &str) -> Result<Option<TxInclusion>, Error> {
        Ok(self.state.lock().txs.get(hash).cloned())
    }
}

impl Broadcaster for FakeChain {
    async fn broadcast(&self, tx: &[u8]) -> Result<String, Error> {
        let result = self.broadcast_tx(BroadcastMode::Sync, tx).await?;
        Ok(result.hash)
    }

    async fn await_inclusion(&self, tx_hash: &str, _: Duration) -> Result<u64, Error> {
        match self.state.lock().txs.get(tx_hash) {
            Some(inclusion) if inclusion.result.code != 0 => Err(Error::Rpc {
                code: i64::from(inclusion.result.code),
                message: "tx failed".into(),
            }),
            Some(inclusion) => Ok(inclusion.height),
            None => Err(Error::RpcUnavailable(format!("{tx_hash} not committed"))),
        }
    }
}

#[derive(Default)]
struct AttestationState {
    assign_ids: bool,
    reverse_ids: bool,
    next_id: u64,
    submissions: Vec<MsgSubmitBatchBlockAttestation>,
    submit_failures: u32,
    statuses: HashMap<(String, u64), AttestationStatus>,
    forced: Vec<ForcedTx>,
    confirmations: Vec<(u64, String, u64)>,
    confirm_failures: u32,
}

/// An attestation chain recording every submission.
#[derive(Clone)]
pub struct FakeAttestation {
    state: Arc<Mutex<AttestationState>>,
}

impl FakeAttestation {
    /// When `assign_ids` is false, submissions return no attestation ids.
    pub fn new(assign_ids: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(AttestationState {
                assign_ids,
                next_id: 1,
                ..Default::default()
            })),
        }
    }

    pub fn reverse_ids(&self) {
        self.state.lock().reverse_ids = true;
    }

    pub fn fail_submits(&self, count: u32) {
        self.state.lock().submit_failures = count;
    }

    pub fn fail_confirms(&self, count: u32) {
        self.state.lock().confirm_failures = count;
    }

    pub fn set_status(&self, chain_id: &str, height: u64, status: AttestationStatus) {
        self.state
            .lock()
            .statuses
            .insert((chain_id.to_string(), height), status);
    }

    pub fn add_forced(&self, tx: ForcedTx) {
        self.state.lock().forced.push(tx);
    }

    pub fn submissions(&self) -> Vec<MsgSubmitBatchBlockAttestation> {
        self.state.lock().submissions.clone()
    }

    /// Heights of every submitted attestation, in submission order.
    pub fn submitted_heights(&self) -> Vec<u64> {
        self.state
            .lock()
            .submissions
            .iter()
            .flat_map(|msg| msg.attestations.iter().map(|a| a.block_height))
            .collect()
    }

    pub fn confirmations(&self) -> Vec<(u64, String, u64)> {
        self.state.lock().confirmations.clone()
    }
}

impl AttestationClient for FakeAttestation {
    async fn submit_batch(
        &self,
        msg: &MsgSubmitBatchBlockAttestation,
    ) -> Result<SubmitResult, Error> {
        let mut state = self.state.lock();
        if state.submit_failures > 0 {
            state.submit_failures -= 1;
            return Err(Error::RpcUnavailable("attestation chain unreachable".into()));
        }
        state.submissions.push(msg.clone());
        let tx_hash = format!("ATT{}", state.submissions.len());
        let mut attestation_ids = Vec::new();
        if state.assign_ids {
            let count = msg.attestations.len() as u64;
            attestation_ids = (state.next_id..state.next_id + count).collect();
            state.next_id += count;
        }
        if state.reverse_ids {
            attestation_ids.reverse();
        }
        Ok(SubmitResult {
            tx_hash,
            finalized_count: attestation_ids.len() as u32,
            attestation_ids,
        })
    }

    async fn attestation_status(
        &self,
        chain_id: &str,
        height: u64,
    ) -> Result<AttestationStatus, Error> {
        Ok(self
            .state
            .lock()
            .statuses
            .get(&(chain_id.to_string(), height))
            .cloned()
            .unwrap_or_default())
    }

    async fn pending_forced_txs(&self, chain_id: &str) -> Result<Vec<ForcedTx>, Error> {
        Ok(self
            .state
            .lock()
            .forced
            .iter()
            .filter(|tx| tx.target_chain_id == chain_id && !tx.executed)
            .cloned()
            .collect())
    }

    async fn confirm_execution(&self, id: u64, tx_hash: &str, height: u64) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.confirm_failures > 0 {
            state.confirm_failures -= 1;
            return Err(Error::RpcUnavailable("attestation chain unreachable".into()));
        }
        if let Some(tx) = state.forced.iter_mut().find(|tx| tx.forced_tx_id == id) {
            if tx.executed {
                return Ok(());
            }
            tx.executed = true;
            tx.execution_tx_hash = tx_hash.to_string();
        }
        state.confirmations.push((id, tx_hash.to_string(), height));
        Ok(())
    }
}
