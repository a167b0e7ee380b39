//! Relay source chain blocks to an attestation chain and track their finality.
//!
//! # Overview
//!
//! A [service::Relayer] watches a source chain through a [rpc::ChainClient], batches every new
//! block, signs the batch with a [signer::Signer], and submits it to the attestation chain
//! through an [rpc::AttestationClient]. The [finality_monitor::FinalityMonitor] tracks each
//! submission until the attestation chain reports it final, at which point the result is
//! persisted in the [finality_store::FinalityStore]. Forced transactions admitted on the
//! attestation chain are executed on the source chain by the [forced_tx::Executor].
//!
//! Progress (the highest finalized height and every in-flight submission) is snapshotted by
//! the [checkpoint::Checkpoint] so a restarted relayer neither skips nor re-forwards blocks.
//!
//! # Status
//!
//! `cronos-relayer` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

use thiserror::Error;

pub mod checkpoint;
pub mod config;
pub mod finality_monitor;
pub mod finality_store;
pub mod forced_tx;
pub mod forwarder;
pub mod metrics;
#[cfg(test)]
pub(crate) mod mocks;
pub mod monitor;
pub mod rpc;
pub mod server;
pub mod service;
pub mod signer;
pub mod telemetry;
pub mod types;

/// Errors that can occur while relaying.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    ConfigInvalid(String),
    #[error("rpc unavailable: {0}")]
    RpcUnavailable(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("forced tx {id} failed after {attempts} attempts: {reason}")]
    ForcedTxExecutionFailed {
        id: u64,
        attempts: u32,
        reason: String,
    },
    #[error("invariant violated: {0}")]
    InternalInvariantViolation(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("relayer not running")]
    NotRunning,
    #[error("relayer already running")]
    AlreadyRunning,
    #[error("store error: {0}")]
    Store(#[from] cronos_kv::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::RpcUnavailable(err.to_string())
    }
}
