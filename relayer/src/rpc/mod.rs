//! Interfaces to the source chain and the attestation chain.
//!
//! The relayer only talks to chains through three traits:
//!
//! * [ChainClient]: read blocks and transactions from a CometBFT node and broadcast to it.
//! * [AttestationClient]: submit attestations to, and query, the attestation chain.
//! * [Broadcaster]: execute a preformed transaction on the source chain.
//!
//! [http] provides implementations backed by a node's JSON-RPC endpoint and the attestation
//! chain's REST gateway.

use crate::{
    config::BroadcastMode,
    types::{AttestationStatus, BlockData, Event, ForcedTx, TxResult},
    Error,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tracing::debug;

pub mod http;

/// Message submitting a batch of block attestations.
pub const MSG_SUBMIT_BATCH: &str = "attestation.v1.MsgSubmitBatchBlockAttestation";

/// Message confirming that a forced transaction was executed.
pub const MSG_CONFIRM_FORCED_TX: &str = "attestation.v1.MsgConfirmForcedTxExecution";

/// Event emitted by the attestation chain once a batch is attested.
pub const EVENT_BATCH_BLOCK_ATTESTED: &str = "attestation.v1.EventBatchBlockAttested";

/// Network and head of a chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainStatus {
    pub network: String,
    pub latest_height: u64,
}

/// Result of handing a transaction to a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    pub code: u32,
    pub data: String,
    pub log: String,
    pub hash: String,
}

/// A committed transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxInclusion {
    pub hash: String,
    pub height: u64,
    pub result: TxResult,
}

/// Outcome of [AttestationClient::submit_batch].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmitResult {
    pub tx_hash: String,
    /// Empty when the submission was broadcast without waiting for inclusion.
    pub attestation_ids: Vec<u64>,
    pub finalized_count: u32,
}

/// A CometBFT node.
pub trait ChainClient: Clone + Send + Sync + 'static {
    /// Network name and latest committed height.
    fn status(&self) -> impl Future<Output = Result<ChainStatus, Error>> + Send;

    /// The block at `height` together with its execution results.
    fn block(&self, height: u64) -> impl Future<Output = Result<BlockData, Error>> + Send;

    /// Hand `tx` to the node's mempool.
    fn broadcast_tx(
        &self,
        mode: BroadcastMode,
        tx: &[u8],
    ) -> impl Future<Output = Result<BroadcastResult, Error>> + Send;

    /// The committed transaction with `hash`, if the node knows it.
    fn tx(&self, hash: &str) -> impl Future<Output = Result<Option<TxInclusion>, Error>> + Send;
}

/// The attestation chain.
pub trait AttestationClient: Clone + Send + Sync + 'static {
    /// Submit a signed batch of attestations.
    fn submit_batch(
        &self,
        msg: &MsgSubmitBatchBlockAttestation,
    ) -> impl Future<Output = Result<SubmitResult, Error>> + Send;

    /// Attestation state of (`chain_id`, `height`).
    fn attestation_status(
        &self,
        chain_id: &str,
        height: u64,
    ) -> impl Future<Output = Result<AttestationStatus, Error>> + Send;

    /// Forced transactions targeting `chain_id` that have not been executed.
    fn pending_forced_txs(
        &self,
        chain_id: &str,
    ) -> impl Future<Output = Result<Vec<ForcedTx>, Error>> + Send;

    /// Report that forced transaction `id` was executed by `tx_hash` at `height`.
    ///
    /// Confirming the same `id` twice has no further effect.
    fn confirm_execution(
        &self,
        id: u64,
        tx_hash: &str,
        height: u64,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Executes transactions on the source chain.
pub trait Broadcaster: Clone + Send + Sync + 'static {
    /// Broadcast preformed transaction bytes, returning the transaction hash.
    fn broadcast(&self, tx: &[u8]) -> impl Future<Output = Result<String, Error>> + Send;

    /// Wait up to `timeout` for `tx_hash` to be committed, returning its height.
    fn await_inclusion(
        &self,
        tx_hash: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<u64, Error>> + Send;
}

/// Poll `client` every `interval` until `hash` is committed or `timeout` elapses.
pub async fn await_tx<C: ChainClient>(
    client: &C,
    hash: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<TxInclusion, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(inclusion) = client.tx(hash).await? {
            return Ok(inclusion);
        }
        if Instant::now() + interval > deadline {
            return Err(Error::RpcUnavailable(format!(
                "tx {hash} not committed within {timeout:?}"
            )));
        }
        debug!(hash, "waiting for tx");
        tokio::time::sleep(interval).await;
    }
}

/// Attestation of a single block, as signed and submitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockAttestation {
    pub block_height: u64,
    pub timestamp: i64,
    #[serde(with = "hex")]
    pub block_hash: Vec<u8>,
    #[serde(with = "hex")]
    pub app_hash: Vec<u8>,
    #[serde(with = "hex")]
    pub block_header: Vec<u8>,
    pub tx_results: Vec<TxResult>,
    pub finalize_block_events: Vec<Event>,
}

impl From<&BlockData> for BlockAttestation {
    fn from(block: &BlockData) -> Self {
        Self {
            block_height: block.block_height,
            timestamp: block.timestamp,
            block_hash: block.block_hash.clone(),
            app_hash: block.app_hash.clone(),
            block_header: block.block_header.clone(),
            tx_results: block.tx_results.clone(),
            finalize_block_events: block.finalize_block_events.clone(),
        }
    }
}

/// Signed submission of consecutive block attestations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MsgSubmitBatchBlockAttestation {
    pub relayer: String,
    pub chain_id: String,
    pub attestations: Vec<BlockAttestation>,
    #[serde(with = "hex")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

/// Signed confirmation of a forced transaction execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgConfirmForcedTxExecution {
    pub relayer: String,
    pub forced_tx_id: u64,
    pub execution_tx_hash: String,
    pub execution_height: u64,
    #[serde(with = "hex")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct TxEnvelope<'a, M> {
    #[serde(rename = "type")]
    kind: &'a str,
    value: &'a M,
}

/// Encode `msg` as attestation chain transaction bytes.
pub fn encode_tx<M: Serialize>(kind: &str, msg: &M) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(&TxEnvelope { kind, value: msg })?)
}

/// Attributes of an [EVENT_BATCH_BLOCK_ATTESTED] event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchAttested {
    pub chain_id: String,
    pub start_height: u64,
    pub end_height: u64,
    pub block_count: u64,
    pub finalized_count: u32,
    pub relayer: String,
    pub attestation_ids: Vec<u64>,
}

impl BatchAttested {
    /// Parse `event`, returning `None` if it is some other kind of event.
    pub fn from_event(event: &Event) -> Result<Option<Self>, Error> {
        if event.kind != EVENT_BATCH_BLOCK_ATTESTED {
            return Ok(None);
        }
        let required = |key: &str| {
            event
                .attribute(key)
                .ok_or_else(|| Error::Malformed(format!("{} is missing {key}", event.kind)))
        };
        fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error> {
            value
                .trim()
                .parse()
                .map_err(|_| Error::Malformed(format!("{key} is not a number: {value:?}")))
        }

        let attestation_ids: Vec<u64> = serde_json::from_str(required("attestation_ids")?)
            .map_err(|e| Error::Malformed(format!("attestation_ids: {e}")))?;
        let parsed = Self {
            chain_id: required("chain_id")?.to_string(),
            start_height: number("start_height", required("start_height")?)?,
            end_height: number("end_height", required("end_height")?)?,
            block_count: match event.attribute("block_count") {
                Some(value) => number("block_count", value)?,
                None => attestation_ids.len() as u64,
            },
            finalized_count: match event.attribute("finalized_count") {
                Some(value) => number("finalized_count", value)?,
                None => 0,
            },
            relayer: event.attribute("relayer").unwrap_or_default().to_string(),
            attestation_ids,
        };
        if parsed.end_height < parsed.start_height {
            return Err(Error::Malformed(format!(
                "end_height {} is below start_height {}",
                parsed.end_height, parsed.start_height
            )));
        }
        Ok(Some(parsed))
    }

    /// Heights and attestation ids covered by the event, lowest first.
    pub fn attested(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        (self.start_height..=self.end_height).zip(self.attestation_ids.iter().copied())
    }
}

/// Find the first [EVENT_BATCH_BLOCK_ATTESTED] among `events`.
pub fn find_batch_attested(events: &[Event]) -> Result<Option<BatchAttested>, Error> {
    for event in events {
        if let Some(parsed) = BatchAttested::from_event(event)? {
            return Ok(Some(parsed));
        }
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::EventAttribute;

    pub fn attested_event(chain_id: &str, start: u64, ids: &[u64]) -> Event {
        let end = start + ids.len() as u64 - 1;
        let attr = |key: &str, value: String| EventAttribute {
            key: key.into(),
            value,
            index: true,
        };
        Event {
            kind: EVENT_BATCH_BLOCK_ATTESTED.into(),
            attributes: vec![
                attr("chain_id", chain_id.into()),
                attr("start_height", start.to_string()),
                attr("end_height", end.to_string()),
                attr("block_count", ids.len().to_string()),
                attr("finalized_count", ids.len().to_string()),
                attr("relayer", "relayer".into()),
                attr("attestation_ids", serde_json::to_string(ids).unwrap()),
            ],
        }
    }

    #[test]
    fn test_batch_attested() {
        let event = attested_event("c", 10, &[100, 101, 102]);
        let parsed = BatchAttested::from_event(&event).unwrap().unwrap();
        assert_eq!(parsed.chain_id, "c");
        assert_eq!(parsed.block_count, 3);
        assert_eq!(parsed.finalized_count, 3);
        assert_eq!(
            parsed.attested().collect::<Vec<_>>(),
            vec![(10, 100), (11, 101), (12, 102)]
        );

        let other = Event {
            kind: "transfer".into(),
            attributes: Vec::new(),
        };
        assert_eq!(BatchAttested::from_event(&other).unwrap(), None);
        assert_eq!(
            find_batch_attested(&[other, event]).unwrap(),
            Some(parsed)
        );
    }

    #[test]
    fn test_batch_attested_malformed() {
        let mut event = attested_event("c", 10, &[1]);
        event.attributes.retain(|attr| attr.key != "end_height");
        assert!(matches!(
            BatchAttested::from_event(&event),
            Err(Error::Malformed(_))
        ));

        let mut event = attested_event("c", 10, &[1]);
        event.attributes[6].value = "[1,".into();
        assert!(matches!(
            BatchAttested::from_event(&event),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_encode_tx() {
        let msg = MsgConfirmForcedTxExecution {
            relayer: "r".into(),
            forced_tx_id: 4,
            execution_tx_hash: "AB".into(),
            execution_height: 9,
            public_key: vec![2],
            signature: vec![3],
        };
        let encoded = encode_tx(MSG_CONFIRM_FORCED_TX, &msg).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["type"], MSG_CONFIRM_FORCED_TX);
        assert_eq!(value["value"]["forced_tx_id"], 4);
        assert_eq!(value["value"]["public_key"], "02");
    }
}
