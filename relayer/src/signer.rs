//! Keys used to sign submissions to the attestation chain.

use crate::Error;
use p256::{
    ecdsa::{
        signature::{Signer as _, Verifier as _},
        Signature, SigningKey, VerifyingKey,
    },
    elliptic_curve::scalar::IsHigh,
};
use sha2::{Digest, Sha256};

/// Length of an address in bytes.
const ADDRESS_LENGTH: usize = 20;

/// Signs messages on behalf of the relayer.
pub trait Signer: Send + Sync + 'static {
    /// Address identifying the relayer on the attestation chain.
    fn address(&self) -> String;

    /// Public key that verifies [Signer::sign] output.
    fn public_key(&self) -> Vec<u8>;

    /// Sign `message`.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error>;
}

/// A P-256 ECDSA key derived from the SHA-256 of a mnemonic.
pub struct MnemonicSigner {
    signer: SigningKey,
    public_key: Vec<u8>,
    address: String,
}

impl MnemonicSigner {
    /// Derive the key for `mnemonic` (words are compared after collapsing whitespace).
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self, Error> {
        let words: Vec<&str> = mnemonic.split_whitespace().collect();
        if words.is_empty() {
            return Err(Error::ConfigInvalid("relayer_mnemonic is required".into()));
        }
        let seed = Sha256::digest(words.join(" ").as_bytes());
        let signer = SigningKey::from_slice(&seed).map_err(|e| Error::Signing(e.to_string()))?;
        let verifier = signer.verifying_key().to_owned();
        let public_key = verifier.to_encoded_point(true).to_bytes().to_vec();
        let digest = Sha256::digest(&public_key);
        let address = hex::encode(&digest[..ADDRESS_LENGTH]);
        Ok(Self {
            signer,
            public_key,
            address,
        })
    }
}

impl Signer for MnemonicSigner {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn public_key(&self) -> Vec<u8> {
        self.public_key.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        let signature: Signature = self.signer.sign(message);
        let signature = match signature.normalize_s() {
            Some(normalized) => normalized,
            None => signature,
        };
        Ok(signature.to_vec())
    }
}

/// Returns true if `signature` is a low-s P-256 signature of `message` by `public_key`.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    if signature.s().is_high().into() {
        return false;
    }
    let Ok(verifier) = VerifyingKey::from_sec1_bytes(public_key) else {
        return false;
    };
    verifier.verify(message, &signature).is_ok()
}
