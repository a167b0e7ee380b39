//! Protobuf values stored by CometBFT that patching needs to read or rewrite.

use crate::Error;
use prost::Message;

/// Value of the `BS:H` key.
#[derive(Clone, PartialEq, Message)]
pub struct BlockStoreState {
    #[prost(int64, tag = "1")]
    pub base: i64,
    #[prost(int64, tag = "2")]
    pub height: i64,
}

/// Primary `tx_index` record, keyed by the CometBFT transaction hash.
#[derive(Clone, PartialEq, Message)]
pub struct TxResult {
    #[prost(int64, tag = "1")]
    pub height: i64,
    #[prost(uint32, tag = "2")]
    pub index: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub tx: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub result: Option<ExecTxResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ExecTxResult {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    #[prost(string, tag = "3")]
    pub log: String,
    #[prost(string, tag = "4")]
    pub info: String,
    #[prost(int64, tag = "5")]
    pub gas_wanted: i64,
    #[prost(int64, tag = "6")]
    pub gas_used: i64,
    #[prost(message, repeated, tag = "7")]
    pub events: Vec<Event>,
    #[prost(string, tag = "8")]
    pub codespace: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(message, repeated, tag = "2")]
    pub attributes: Vec<EventAttribute>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EventAttribute {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
    #[prost(bool, tag = "3")]
    pub index: bool,
}

/// Event emitted for every EVM transaction.
const ETHEREUM_TX_EVENT: &str = "ethereum_tx";

/// Attribute of [ETHEREUM_TX_EVENT] holding the Ethereum transaction hash.
const ETHEREUM_TX_HASH_ATTR: &str = "ethereumTxHash";

/// Decode a `BS:H` value.
pub fn decode_block_store_state(value: &[u8]) -> Result<BlockStoreState, Error> {
    Ok(BlockStoreState::decode(value)?)
}

/// Encode a `BS:H` value.
pub fn encode_block_store_state(state: &BlockStoreState) -> Vec<u8> {
    state.encode_to_vec()
}

/// Find the Ethereum transaction hash (`0x` + 64 hex characters) inside an encoded [TxResult].
///
/// Returns `Ok(None)` for transactions without an `ethereum_tx` event and an error if the record
/// does not decode or the hash is malformed.
pub fn extract_ethereum_tx_hash(value: &[u8]) -> Result<Option<String>, Error> {
    let tx = TxResult::decode(value)?;
    let Some(result) = tx.result else {
        return Ok(None);
    };
    let attr = result
        .events
        .iter()
        .filter(|event| event.r#type == ETHEREUM_TX_EVENT)
        .flat_map(|event| event.attributes.iter())
        .find(|attr| attr.key == ETHEREUM_TX_HASH_ATTR);
    let Some(attr) = attr else {
        return Ok(None);
    };

    let hash = if attr.value.starts_with("0x") {
        attr.value.clone()
    } else {
        format!("0x{}", attr.value)
    };
    if hash.len() != 66 {
        return Err(Error::Malformed(format!(
            "invalid ethereum tx hash length: {}",
            hash.len()
        )));
    }
    hex::decode(&hash[2..])
        .map_err(|e| Error::Malformed(format!("invalid ethereum tx hash hex: {e}")))?;
    Ok(Some(hash))
}
