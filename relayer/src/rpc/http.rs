//! Clients for a CometBFT node's JSON-RPC endpoint and the attestation chain's REST gateway.
//!
//! Requests use the node's URI form (`GET /block?height=N`). Transactions are sent
//! hex-encoded (`tx=0x...`). Heights and gas amounts may be delivered as strings or numbers
//! and both are accepted.

use super::{
    await_tx, encode_tx, find_batch_attested, AttestationClient, BroadcastResult, Broadcaster,
    ChainClient, ChainStatus, MsgConfirmForcedTxExecution, MsgSubmitBatchBlockAttestation,
    SubmitResult, TxInclusion, MSG_CONFIRM_FORCED_TX, MSG_SUBMIT_BATCH,
};
use crate::{
    config::BroadcastMode,
    signer::Signer,
    types::{AttestationStatus, BlockData, Event, ForcedTx, TxResult},
    Error,
};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// How often inclusion of a broadcast transaction is checked.
const INCLUSION_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Unsigned(u64),
    Signed(i64),
    String(String),
}

fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Unsigned(value) => Ok(value),
        StringOrNumber::Signed(value) => u64::try_from(value).map_err(serde::de::Error::custom),
        StringOrNumber::String(value) => value.parse().map_err(serde::de::Error::custom),
    }
}

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Unsigned(value) => i64::try_from(value).map_err(serde::de::Error::custom),
        StringOrNumber::Signed(value) => Ok(value),
        StringOrNumber::String(value) => value.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
struct StatusResult {
    node_info: NodeInfo,
    sync_info: SyncInfo,
}

#[derive(Deserialize)]
struct NodeInfo {
    network: String,
}

#[derive(Deserialize)]
struct SyncInfo {
    #[serde(deserialize_with = "de_u64")]
    latest_block_height: u64,
}

#[derive(Deserialize)]
struct BlockResult {
    block_id: BlockId,
    block: Block,
}

#[derive(Deserialize)]
struct BlockId {
    hash: String,
}

#[derive(Deserialize)]
struct Block {
    header: serde_json::Value,
}

#[derive(Deserialize)]
struct Header {
    chain_id: String,
    #[serde(deserialize_with = "de_u64")]
    height: u64,
    time: DateTime<Utc>,
    #[serde(default)]
    app_hash: String,
}

#[derive(Deserialize)]
struct BlockResultsResult {
    #[serde(default)]
    txs_results: Option<Vec<WireTxResult>>,
    #[serde(default)]
    finalize_block_events: Option<Vec<Event>>,
    #[serde(default)]
    validator_updates: serde_json::Value,
    #[serde(default)]
    consensus_param_updates: serde_json::Value,
}

#[derive(Deserialize)]
struct WireTxResult {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    log: String,
    #[serde(default, deserialize_with = "de_i64")]
    gas_wanted: i64,
    #[serde(default, deserialize_with = "de_i64")]
    gas_used: i64,
    #[serde(default)]
    events: Option<Vec<Event>>,
}

impl From<WireTxResult> for TxResult {
    fn from(wire: WireTxResult) -> Self {
        Self {
            code: wire.code,
            data: wire.data.unwrap_or_default(),
            log: wire.log,
            gas_wanted: wire.gas_wanted,
            gas_used: wire.gas_used,
            events: wire.events.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct WireBroadcastResult {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    log: String,
    hash: String,
}

#[derive(Deserialize)]
struct WireTx {
    hash: String,
    #[serde(deserialize_with = "de_u64")]
    height: u64,
    tx_result: WireTxResult,
}

fn decode_hash(field: &str, value: &str) -> Result<Vec<u8>, Error> {
    hex::decode(value).map_err(|e| Error::Malformed(format!("{field}: {e}")))
}

/// A CometBFT node reached over its JSON-RPC URI endpoints.
#[derive(Clone)]
pub struct CometClient {
    http: reqwest::Client,
    endpoint: String,
}

impl CometClient {
    /// Create a client for the node at `endpoint` (e.g. `http://localhost:26657`).
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T, Error> {
        let url = format!("{}/{method}", self.endpoint);
        let response: RpcResponse<T> = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await?
            .json()
            .await?;
        if let Some(error) = response.error {
            let message = if error.data.is_empty() {
                error.message
            } else {
                format!("{}: {}", error.message, error.data)
            };
            return Err(Error::Rpc {
                code: error.code,
                message,
            });
        }
        response
            .result
            .ok_or_else(|| Error::Malformed(format!("{method} returned no result")))
    }
}

impl ChainClient for CometClient {
    async fn status(&self) -> Result<ChainStatus, Error> {
        let status: StatusResult = self.call("status", &[]).await?;
        Ok(ChainStatus {
            network: status.node_info.network,
            latest_height: status.sync_info.latest_block_height,
        })
    }

    async fn block(&self, height: u64) -> Result<BlockData, Error> {
        let params = [("height", height.to_string())];
        let (block, results): (BlockResult, BlockResultsResult) = futures::try_join!(
            self.call("block", &params),
            self.call("block_results", &params)
        )?;
        let header: Header = serde_json::from_value(block.block.header.clone())?;
        if header.height != height {
            return Err(Error::Malformed(format!(
                "requested block {height}, got {}",
                header.height
            )));
        }
        Ok(BlockData {
            chain_id: header.chain_id,
            block_height: header.height,
            timestamp: header.time.timestamp(),
            block_hash: decode_hash("block_id.hash", &block.block_id.hash)?,
            app_hash: decode_hash("app_hash", &header.app_hash)?,
            block_header: serde_json::to_vec(&block.block.header)?,
            tx_results: results
                .txs_results
                .unwrap_or_default()
                .into_iter()
                .map(TxResult::from)
                .collect(),
            finalize_block_events: results.finalize_block_events.unwrap_or_default(),
            validator_updates: results.validator_updates,
            consensus_param_updates: results.consensus_param_updates,
        })
    }

    async fn broadcast_tx(&self, mode: BroadcastMode, tx: &[u8]) -> Result<BroadcastResult, Error> {
        let method = match mode {
            BroadcastMode::Sync => "broadcast_tx_sync",
            BroadcastMode::Async => "broadcast_tx_async",
        };
        let result: WireBroadcastResult = self
            .call(method, &[("tx", format!("0x{}", hex::encode(tx)))])
            .await?;
        debug!(method, hash = %result.hash, code = result.code, "broadcast tx");
        Ok(BroadcastResult {
            code: result.code,
            data: result.data.unwrap_or_default(),
            log: result.log,
            hash: result.hash,
        })
    }

    async fn tx(&self, hash: &str) -> Result<Option<TxInclusion>, Error> {
        let hash = hash.trim_start_matches("0x");
        match self.call::<WireTx>("tx", &[("hash", format!("0x{hash}"))]).await {
            Ok(tx) => Ok(Some(TxInclusion {
                hash: tx.hash,
                height: tx.height,
                result: tx.tx_result.into(),
            })),
            Err(Error::Rpc { message, .. }) if message.contains("not found") => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Broadcaster for CometClient {
    async fn broadcast(&self, tx: &[u8]) -> Result<String, Error> {
        let result = self.broadcast_tx(BroadcastMode::Sync, tx).await?;
        if result.code != 0 {
            return Err(Error::Rpc {
                code: i64::from(result.code),
                message: result.log,
            });
        }
        Ok(result.hash)
    }

    async fn await_inclusion(&self, tx_hash: &str, timeout: Duration) -> Result<u64, Error> {
        let inclusion = await_tx(self, tx_hash, timeout, INCLUSION_POLL_INTERVAL).await?;
        if inclusion.result.code != 0 {
            return Err(Error::Rpc {
                code: i64::from(inclusion.result.code),
                message: inclusion.result.log,
            });
        }
        Ok(inclusion.height)
    }
}

#[derive(Deserialize)]
struct WireAttestationStatus {
    #[serde(default)]
    attested: bool,
    #[serde(default, deserialize_with = "de_u64")]
    attestation_id: u64,
    #[serde(default)]
    finalized: bool,
    #[serde(default, deserialize_with = "de_i64")]
    finalized_at: i64,
}

#[derive(Deserialize)]
struct ForcedTxsResponse {
    #[serde(default)]
    forced_txs: Vec<ForcedTx>,
}

/// Bytes signed to confirm a forced transaction execution.
pub fn confirm_payload(id: u64, tx_hash: &str, height: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + tx_hash.len());
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(tx_hash.as_bytes());
    payload.extend_from_slice(&height.to_be_bytes());
    payload
}

/// The attestation chain, reached through one of its nodes and its REST gateway.
pub struct RpcAttestationClient<S> {
    chain: CometClient,
    http: reqwest::Client,
    gateway: String,
    signer: Arc<S>,
    relayer: String,
    mode: BroadcastMode,
    inclusion_timeout: Duration,
}

impl<S> Clone for RpcAttestationClient<S> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            http: self.http.clone(),
            gateway: self.gateway.clone(),
            signer: self.signer.clone(),
            relayer: self.relayer.clone(),
            mode: self.mode,
            inclusion_timeout: self.inclusion_timeout,
        }
    }
}

impl<S: Signer> RpcAttestationClient<S> {
    /// Create a client broadcasting through `chain` and querying the gateway at `gateway`.
    ///
    /// In [BroadcastMode::Sync], submissions wait up to `inclusion_timeout` to be committed.
    pub fn new(
        chain: CometClient,
        gateway: &str,
        signer: Arc<S>,
        relayer: String,
        mode: BroadcastMode,
        inclusion_timeout: Duration,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(inclusion_timeout)
            .build()?;
        Ok(Self {
            chain,
            http,
            gateway: gateway.trim_end_matches('/').to_string(),
            signer,
            relayer,
            mode,
            inclusion_timeout,
        })
    }

    async fn broadcast(&self, tx: &[u8]) -> Result<BroadcastResult, Error> {
        let result = self.chain.broadcast_tx(self.mode, tx).await?;
        if result.code != 0 {
            return Err(Error::Rpc {
                code: i64::from(result.code),
                message: result.log,
            });
        }
        Ok(result)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, Error> {
        let url = format!("{}{path}", self.gateway);
        let response = self.http.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }
}

impl<S: Signer> AttestationClient for RpcAttestationClient<S> {
    async fn submit_batch(
        &self,
        msg: &MsgSubmitBatchBlockAttestation,
    ) -> Result<SubmitResult, Error> {
        let tx = encode_tx(MSG_SUBMIT_BATCH, msg)?;
        let broadcast = self.broadcast(&tx).await?;
        if self.mode == BroadcastMode::Async {
            return Ok(SubmitResult {
                tx_hash: broadcast.hash,
                ..Default::default()
            });
        }

        let inclusion = await_tx(
            &self.chain,
            &broadcast.hash,
            self.inclusion_timeout,
            INCLUSION_POLL_INTERVAL,
        )
        .await?;
        if inclusion.result.code != 0 {
            return Err(Error::Rpc {
                code: i64::from(inclusion.result.code),
                message: inclusion.result.log,
            });
        }
        let attested = find_batch_attested(&inclusion.result.events)?.unwrap_or_default();
        Ok(SubmitResult {
            tx_hash: broadcast.hash,
            attestation_ids: attested.attestation_ids,
            finalized_count: attested.finalized_count,
        })
    }

    async fn attestation_status(
        &self,
        chain_id: &str,
        height: u64,
    ) -> Result<AttestationStatus, Error> {
        let path = format!("/attestation/v1/status/{chain_id}/{height}");
        let Some(status) = self.get::<WireAttestationStatus>(&path).await? else {
            return Ok(AttestationStatus::default());
        };
        Ok(AttestationStatus {
            attested: status.attested,
            attestation_id: status.attestation_id,
            finalized: status.finalized,
            finalized_at: status.finalized_at,
        })
    }

    async fn pending_forced_txs(&self, chain_id: &str) -> Result<Vec<ForcedTx>, Error> {
        let path = format!("/attestation/v1/forced_txs/{chain_id}");
        let response = self.get::<ForcedTxsResponse>(&path).await?;
        Ok(response
            .map(|response| response.forced_txs)
            .unwrap_or_default()
            .into_iter()
            .filter(|tx| !tx.executed)
            .collect())
    }

    async fn confirm_execution(&self, id: u64, tx_hash: &str, height: u64) -> Result<(), Error> {
        let signature = self.signer.sign(&confirm_payload(id, tx_hash, height))?;
        let msg = MsgConfirmForcedTxExecution {
            relayer: self.relayer.clone(),
            forced_tx_id: id,
            execution_tx_hash: tx_hash.to_string(),
            execution_height: height,
            public_key: self.signer.public_key(),
            signature,
        };
        let tx = encode_tx(MSG_CONFIRM_FORCED_TX, &msg)?;
        match self.broadcast(&tx).await {
            Ok(_) => Ok(()),
            Err(Error::Rpc { message, .. }) if message.contains("already confirmed") => {
                debug!(id, "forced tx already confirmed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
