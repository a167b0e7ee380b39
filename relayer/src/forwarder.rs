//! Submit source chain blocks to the attestation chain.

use crate::{
    metrics::Metrics,
    rpc::{AttestationClient, BlockAttestation, MsgSubmitBatchBlockAttestation},
    signer::Signer,
    types::{AttestationStatus, BlockData},
    Error,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of forwarding blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Forwarded {
    /// Hash of the attestation transaction.
    pub tx_hash: String,
    /// One id per forwarded block, in block order.
    pub attestation_ids: Vec<u64>,
    /// The attestation chain returned no ids and block heights stand in for them.
    pub placeholder: bool,
}

/// Bytes signed for a batch: the chain id followed by the JSON encoding of each attestation.
pub fn batch_payload(chain_id: &str, attestations: &[BlockAttestation]) -> Result<Vec<u8>, Error> {
    let mut payload = chain_id.as_bytes().to_vec();
    for attestation in attestations {
        payload.extend_from_slice(&serde_json::to_vec(attestation)?);
    }
    Ok(payload)
}

/// Returns an error unless every value is exactly one more than the previous.
pub fn ensure_consecutive(what: &str, values: impl IntoIterator<Item = u64>) -> Result<(), Error> {
    let mut previous: Option<u64> = None;
    for value in values {
        if let Some(previous) = previous {
            if previous.checked_add(1) != Some(value) {
                return Err(Error::InternalInvariantViolation(format!(
                    "{what} not consecutive: {value} follows {previous}"
                )));
            }
        }
        previous = Some(value);
    }
    Ok(())
}

/// Signs and submits blocks of one source chain.
pub struct Forwarder<A, S> {
    client: A,
    signer: Arc<S>,
    relayer: String,
    chain_id: String,
    metrics: Metrics,
}

impl<A: AttestationClient, S: Signer> Forwarder<A, S> {
    /// Create a forwarder for `chain_id`. An empty `relayer` uses the signer's address.
    pub fn new(client: A, signer: Arc<S>, relayer: &str, chain_id: &str, metrics: Metrics) -> Self {
        let relayer = if relayer.is_empty() {
            signer.address()
        } else {
            relayer.to_string()
        };
        Self {
            client,
            signer,
            relayer,
            chain_id: chain_id.to_string(),
            metrics,
        }
    }

    pub fn client(&self) -> &A {
        &self.client
    }

    /// Submit a single block.
    pub async fn forward_block(&self, block: &BlockData) -> Result<Forwarded, Error> {
        self.batch_forward_blocks(std::slice::from_ref(block)).await
    }

    /// Submit consecutive blocks in one transaction.
    pub async fn batch_forward_blocks(&self, blocks: &[BlockData]) -> Result<Forwarded, Error> {
        let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
            return Err(Error::InternalInvariantViolation("empty batch".into()));
        };
        if let Some(block) = blocks.iter().find(|block| block.chain_id != self.chain_id) {
            return Err(Error::InternalInvariantViolation(format!(
                "block {} belongs to {}, not {}",
                block.block_height, block.chain_id, self.chain_id
            )));
        }
        ensure_consecutive("block heights", blocks.iter().map(|b| b.block_height))?;

        let attestations: Vec<BlockAttestation> = blocks.iter().map(BlockAttestation::from).collect();
        let signature = self
            .signer
            .sign(&batch_payload(&self.chain_id, &attestations)?)?;
        let msg = MsgSubmitBatchBlockAttestation {
            relayer: self.relayer.clone(),
            chain_id: self.chain_id.clone(),
            attestations,
            public_key: self.signer.public_key(),
            signature,
        };
        let result = self.client.submit_batch(&msg).await?;

        let (attestation_ids, placeholder) = if result.attestation_ids.is_empty() {
            warn!(
                component = "forwarder",
                start_height = first.block_height,
                end_height = last.block_height,
                tx_hash = %result.tx_hash,
                "attestation ids unavailable, using block heights as placeholder ids"
            );
            (blocks.iter().map(|b| b.block_height).collect(), true)
        } else {
            if result.attestation_ids.len() != blocks.len() {
                return Err(Error::InternalInvariantViolation(format!(
                    "{} attestation ids returned for {} blocks",
                    result.attestation_ids.len(),
                    blocks.len()
                )));
            }
            ensure_consecutive("attestation ids", result.attestation_ids.iter().copied())?;
            (result.attestation_ids, false)
        };

        self.metrics.blocks_forwarded.inc_by(blocks.len() as u64);
        self.metrics
            .last_block_forwarded
            .set(i64::try_from(last.block_height).unwrap_or(i64::MAX));
        debug!(
            component = "forwarder",
            start_height = first.block_height,
            end_height = last.block_height,
            tx_hash = %result.tx_hash,
            "forwarded blocks"
        );
        Ok(Forwarded {
            tx_hash: result.tx_hash,
            attestation_ids,
            placeholder,
        })
    }

    /// Attestation state of (`chain_id`, `height`) on the attestation chain.
    pub async fn attestation_status(
        &self,
        chain_id: &str,
        height: u64,
    ) -> Result<AttestationStatus, Error> {
        self.client.attestation_status(chain_id, height).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{block, FakeAttestation},
        signer::{verify, MnemonicSigner},
    };

    const CHAIN: &str = "cronos_777-1";

    fn forwarder(client: FakeAttestation) -> (Forwarder<FakeAttestation, MnemonicSigner>, Metrics) {
        let signer = Arc::new(MnemonicSigner::from_mnemonic("test mnemonic").unwrap());
        let metrics = Metrics::default();
        (
            Forwarder::new(client, signer, "", CHAIN, metrics.clone()),
            metrics,
        )
    }

    #[test]
    fn test_ensure_consecutive() {
        ensure_consecutive("x", [4, 5, 6]).unwrap();
        ensure_consecutive("x", []).unwrap();
        assert!(ensure_consecutive("x", [4, 6]).is_err());
        assert!(ensure_consecutive("x", [5, 4]).is_err());
        assert!(ensure_consecutive("x", [u64::MAX, 0]).is_err());
    }

    #[tokio::test]
    async fn test_batch_is_signed() {
        let client = FakeAttestation::new(true);
        let (forwarder, metrics) = forwarder(client.clone());
        let blocks: Vec<_> = (10..13).map(|h| block(CHAIN, h)).collect();
        let forwarded = forwarder.batch_forward_blocks(&blocks).await.unwrap();
        assert_eq!(forwarded.attestation_ids, vec![1, 2, 3]);
        assert!(!forwarded.placeholder);
        assert_eq!(metrics.blocks_forwarded.get(), 3);
        assert_eq!(metrics.last_block_forwarded.get(), 12);

        let submitted = &client.submissions()[0];
        assert_eq!(submitted.relayer.len(), 40);
        let payload = batch_payload(CHAIN, &submitted.attestations).unwrap();
        assert!(verify(&submitted.public_key, &payload, &submitted.signature));
        assert!(!verify(
            &submitted.public_key,
            &batch_payload("other", &submitted.attestations).unwrap(),
            &submitted.signature
        ));
    }

    #[tokio::test]
    async fn test_placeholder_ids() {
        let (forwarder, _) = forwarder(FakeAttestation::new(false));
        let forwarded = forwarder.forward_block(&block(CHAIN, 7)).await.unwrap();
        assert_eq!(forwarded.attestation_ids, vec![7]);
        assert!(forwarded.placeholder);
    }

    #[tokio::test]
    async fn test_rejects_gaps_and_foreign_blocks() {
        let client = FakeAttestation::new(true);
        let (forwarder, _) = forwarder(client.clone());
        let gap = vec![block(CHAIN, 1), block(CHAIN, 3)];
        assert!(matches!(
            forwarder.batch_forward_blocks(&gap).await,
            Err(Error::InternalInvariantViolation(_))
        ));
        assert!(matches!(
            forwarder.forward_block(&block("other", 1)).await,
            Err(Error::InternalInvariantViolation(_))
        ));
        assert!(matches!(
            forwarder.batch_forward_blocks(&[]).await,
            Err(Error::InternalInvariantViolation(_))
        ));
        assert!(client.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unordered_ids() {
        let client = FakeAttestation::new(true);
        client.reverse_ids();
        let (forwarder, metrics) = forwarder(client);
        let blocks = vec![block(CHAIN, 1), block(CHAIN, 2)];
        assert!(matches!(
            forwarder.batch_forward_blocks(&blocks).await,
            Err(Error::InternalInvariantViolation(_))
        ));
        assert_eq!(metrics.blocks_forwarded.get(), 0);
    }

    #[tokio::test]
    async fn test_submit_errors_propagate() {
        let client = FakeAttestation::new(true);
        client.fail_submits(1);
        let (forwarder, _) = forwarder(client.clone());
        assert!(matches!(
            forwarder.forward_block(&block(CHAIN, 1)).await,
            Err(Error::RpcUnavailable(_))
        ));
        forwarder.forward_block(&block(CHAIN, 1)).await.unwrap();

        client.set_status(
            CHAIN,
            1,
            AttestationStatus {
                attested: true,
                attestation_id: 1,
                ..Default::default()
            },
        );
        let status = forwarder.attestation_status(CHAIN, 1).await.unwrap();
        assert!(status.attested);
        assert!(!forwarder.attestation_status(CHAIN, 2).await.unwrap().attested);
    }
}
