//! Local ed25519 key custody
//!
//! [`LocalKeySigner`] is the in-process custodian used when the long-term key
//! is configured through [`KeySource::Env`] or [`KeySource::File`]. External
//! custodians implement [`SignerEffects`] themselves.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt;
use tessera_core::{
    Address, AuthorizationProof, KeySource, Result, SignerEffects, SignerError, TesseraError,
};
use zeroize::Zeroizing;

/// Derivation label recorded in proofs signed by [`LocalKeySigner`]
pub const ED25519_DERIVATION: &str = "ed25519";

/// Long-term ed25519 key held in process memory
pub struct LocalKeySigner {
    key: SigningKey,
}

impl LocalKeySigner {
    /// Signer from a raw 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Signer from a hex-encoded 32-byte seed
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim().trim_start_matches("0x"))
                .map_err(|e| TesseraError::config(format!("signing key is not hex: {e}")))?,
        );
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| TesseraError::config("signing key must be 32 bytes"))?,
        );
        Ok(Self::from_seed(*seed))
    }

    /// Load the key named by `source`
    pub fn from_key_source(source: &KeySource) -> Result<Self> {
        match source {
            KeySource::Env { var } => {
                let value = Zeroizing::new(std::env::var(var).map_err(|e| {
                    TesseraError::config(format!("signing key variable {var}: {e}"))
                })?);
                Self::from_hex(&value)
            }
            KeySource::File { path } => {
                let value = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
                    TesseraError::config(format!(
                        "signing key file {}: {e}",
                        path.display()
                    ))
                })?);
                Self::from_hex(&value)
            }
            KeySource::External { reference } => Err(TesseraError::config(format!(
                "key {reference:?} is held by an external custodian; supply its signer directly"
            ))),
        }
    }

    /// Address of the key
    pub fn address(&self) -> Address {
        address_of(&self.key.verifying_key())
    }

    /// Public verification key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SignerEffects for LocalKeySigner {
    async fn address(&self) -> std::result::Result<Address, SignerError> {
        Ok(LocalKeySigner::address(self))
    }

    async fn sign(&self, message: &[u8]) -> std::result::Result<Vec<u8>, SignerError> {
        Ok(self.key.sign(message).to_bytes().to_vec())
    }

    fn derivation_method(&self) -> &str {
        ED25519_DERIVATION
    }
}

/// Address derived from an ed25519 public key
pub fn address_of(key: &VerifyingKey) -> Address {
    Address::from_bytes(key.as_bytes())
}

/// Verify an ed25519 signature made by the key behind `address`
pub fn verify_signature(address: &Address, message: &[u8], signature: &[u8]) -> Result<()> {
    let key_bytes: [u8; 32] = address
        .to_bytes()?
        .try_into()
        .map_err(|_| TesseraError::invalid_delegation("address is not an ed25519 public key"))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| TesseraError::invalid_delegation(format!("invalid public key: {e}")))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| TesseraError::invalid_delegation(format!("malformed signature: {e}")))?;
    key.verify(message, &signature)
        .map_err(|_| TesseraError::invalid_delegation("signature verification failed"))
}

/// Full verification of a proof, as a node performs it: the signed text
/// must be canonical, must parse back to the same message, and must carry a
/// valid signature from the message's signer.
pub fn verify_proof(proof: &AuthorizationProof) -> Result<()> {
    proof.check_consistency()?;
    if proof.derivation_method() != ED25519_DERIVATION {
        return Err(TesseraError::invalid_delegation(format!(
            "unsupported derivation method {:?}",
            proof.derivation_method()
        )));
    }
    let reparsed = tessera_core::DelegationMessage::parse(proof.signed_message())?;
    if &reparsed != proof.message() {
        return Err(TesseraError::invalid_delegation(
            "signed text does not reconstruct the message",
        ));
    }
    verify_signature(
        proof.address(),
        proof.signed_message().as_bytes(),
        proof.signature(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;
    use tessera_core::{
        CapabilitySet, ContentAddressing, DelegationBuilder, Nonce, Sha256Addressing, Timestamp,
    };

    fn proof_from(signer: &LocalKeySigner, sign_with: &LocalKeySigner) -> AuthorizationProof {
        let message = DelegationBuilder::new(signer.address())
            .origin("session:aa")
            .nonce(Nonce::new("n-1").unwrap())
            .issued_at(Timestamp::from_millis(1_000).unwrap())
            .expires_at(Timestamp::from_millis(601_000).unwrap())
            .grants(&CapabilitySet::execution_for(
                Sha256Addressing.content_id(b"code"),
            ))
            .build()
            .unwrap();
        let signature = sign_with.key.sign(message.render().as_bytes()).to_bytes();
        AuthorizationProof::new(message, signature.to_vec(), ED25519_DERIVATION)
    }

    #[test]
    fn test_valid_proof_verifies() {
        let signer = LocalKeySigner::from_seed([7; 32]);
        assert!(verify_proof(&proof_from(&signer, &signer)).is_ok());
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let signer = LocalKeySigner::from_seed([7; 32]);
        let other = LocalKeySigner::from_seed([8; 32]);
        assert_matches!(
            verify_proof(&proof_from(&signer, &other)),
            Err(TesseraError::InvalidDelegation { .. })
        );
    }

    #[test]
    fn test_key_sources() {
        let seed_hex = hex::encode([3u8; 32]);
        let expected = LocalKeySigner::from_seed([3; 32]).address();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{seed_hex}").unwrap();
        let from_file = LocalKeySigner::from_key_source(&KeySource::File {
            path: file.path().to_path_buf(),
        })
        .unwrap();
        assert_eq!(from_file.address(), expected);

        let external = LocalKeySigner::from_key_source(&KeySource::External {
            reference: "ledger:0".into(),
        });
        assert_matches!(external, Err(TesseraError::Config { .. }));
        assert!(LocalKeySigner::from_hex("abcd").is_err());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let signer = LocalKeySigner::from_seed([9; 32]);
        let rendered = format!("{signer:?}");
        assert!(rendered.contains(signer.address().as_str()));
        assert!(!rendered.contains(&hex::encode([9u8; 32])));
    }
}
