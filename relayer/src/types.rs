//! Records exchanged between the relayer, its stores, and its control server.
//!
//! Field names are part of the external contract (checkpoint file, finality store values, and
//! HTTP responses all use them verbatim). Binary fields are hex strings in JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::{fmt, ops::RangeInclusive};

/// An attribute of an [Event].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub index: bool,
}

/// An ABCI event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<EventAttribute>,
}

impl Event {
    /// Value of the first attribute named `key`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| attr.value.as_str())
    }
}

/// Execution result of one transaction in a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    pub code: u32,
    /// Opaque result data, kept exactly as the node delivered it.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub gas_wanted: i64,
    #[serde(default)]
    pub gas_used: i64,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// A block fetched from the source chain, ready to be attested.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockData {
    pub chain_id: String,
    pub block_height: u64,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(with = "hex")]
    pub block_hash: Vec<u8>,
    #[serde(with = "hex")]
    pub app_hash: Vec<u8>,
    /// Raw header as returned by the node.
    #[serde(with = "hex")]
    pub block_header: Vec<u8>,
    #[serde(default)]
    pub tx_results: Vec<TxResult>,
    #[serde(default)]
    pub finalize_block_events: Vec<Event>,
    #[serde(default)]
    pub validator_updates: serde_json::Value,
    #[serde(default)]
    pub consensus_param_updates: serde_json::Value,
}

/// Attestation state of a block as seen by the attestation chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationStatus {
    pub attested: bool,
    #[serde(default)]
    pub attestation_id: u64,
    #[serde(default)]
    pub finalized: bool,
    /// Unix seconds (0 until finalized).
    #[serde(default)]
    pub finalized_at: i64,
}

/// Finality of one block, as persisted by the finality store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityInfo {
    pub attestation_id: u64,
    pub chain_id: String,
    pub block_height: u64,
    pub finalized: bool,
    /// Unix seconds.
    #[serde(default)]
    pub finalized_at: i64,
    #[serde(default)]
    pub validator_count: u32,
    #[serde(default, with = "hex", skip_serializing_if = "Vec::is_empty")]
    pub finality_signature: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub attestation_tx_hash: String,
    #[serde(default, with = "hex", skip_serializing_if = "Vec::is_empty")]
    pub finality_proof: Vec<u8>,
}

impl FinalityInfo {
    /// Returns true if `self` carries strictly more evidence than `prior` for the same block.
    ///
    /// A finalized record is never superseded by a non-finalized one.
    pub fn supersedes(&self, prior: &FinalityInfo) -> bool {
        if prior.finalized && !self.finalized {
            return false;
        }
        (self.finalized && !prior.finalized)
            || (!self.finality_signature.is_empty() && prior.finality_signature.is_empty())
            || (!self.finality_proof.is_empty() && prior.finality_proof.is_empty())
            || self.validator_count > prior.validator_count
    }
}

/// A submission to the attestation chain that has not been finalized yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAttestation {
    pub tx_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attestation_ids: Vec<u64>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attestation_id: u64,
    pub chain_id: String,
    pub block_height: u64,
    #[serde(default)]
    pub start_height: u64,
    #[serde(default)]
    pub end_height: u64,
    pub submitted_at: DateTime<Utc>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl PendingAttestation {
    /// Heights covered by the submission.
    pub fn heights(&self) -> RangeInclusive<u64> {
        if self.attestation_ids.is_empty() || self.end_height < self.start_height {
            return self.block_height..=self.block_height;
        }
        self.start_height..=self.end_height
    }

    /// Attestation id assigned to `height`, if the submission covers it.
    pub fn attestation_id_for(&self, height: u64) -> Option<u64> {
        if !self.heights().contains(&height) {
            return None;
        }
        if self.attestation_ids.is_empty() {
            return Some(self.attestation_id);
        }
        let offset = usize::try_from(height - self.heights().start()).ok()?;
        self.attestation_ids.get(offset).copied()
    }
}

/// Everything needed to resume relaying after a restart.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub last_finality_block_height: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub pending_attestations: std::collections::BTreeMap<String, PendingAttestation>,
    #[serde(default)]
    pub checkpointed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Kind of a [ForcedTx].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ForcedTxType {
    #[default]
    Normal,
    Governance,
    EscapeHatch,
    Emergency,
}

impl TryFrom<u8> for ForcedTxType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ForcedTxType::Normal),
            1 => Ok(ForcedTxType::Governance),
            2 => Ok(ForcedTxType::EscapeHatch),
            3 => Ok(ForcedTxType::Emergency),
            other => Err(format!("unknown forced tx type: {other}")),
        }
    }
}

impl From<ForcedTxType> for u8 {
    fn from(value: ForcedTxType) -> Self {
        match value {
            ForcedTxType::Normal => 0,
            ForcedTxType::Governance => 1,
            ForcedTxType::EscapeHatch => 2,
            ForcedTxType::Emergency => 3,
        }
    }
}

impl fmt::Display for ForcedTxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForcedTxType::Normal => "normal",
            ForcedTxType::Governance => "governance",
            ForcedTxType::EscapeHatch => "escape_hatch",
            ForcedTxType::Emergency => "emergency",
        };
        f.write_str(name)
    }
}

/// A transaction admitted on the attestation chain that must be executed on the source chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcedTx {
    pub forced_tx_id: u64,
    pub submitter: String,
    pub target_chain_id: String,
    #[serde(default)]
    pub target_chain_type: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub tx_type: ForcedTxType,
    /// Broadcastable transaction bytes.
    #[serde(with = "hex")]
    pub transaction_data: Vec<u8>,
    #[serde(default)]
    pub deadline: u64,
    #[serde(default)]
    pub submitted_at: i64,
    #[serde(default)]
    pub executed: bool,
    #[serde(default)]
    pub executed_at: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub execution_tx_hash: String,
}

/// Snapshot of the relayer's progress.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayerStatus {
    pub running: bool,
    pub source_chain_id: String,
    pub attestation_chain_id: String,
    pub last_block_forwarded: u64,
    pub last_finality_received: u64,
    pub last_forced_tx_processed: u64,
    pub pending_blocks_count: usize,
    pub pending_forced_tx_count: usize,
    pub finalized_blocks_count: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub updated_at: DateTime<Utc>,
}

/// Summary of the finality store for one chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityStoreStats {
    pub chain_id: String,
    pub total_blocks: u64,
    pub finalized_blocks: u64,
    pub pending_blocks: u64,
    pub latest_block: u64,
    pub latest_finalized: u64,
}
