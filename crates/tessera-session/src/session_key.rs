//! Ephemeral per-round session keys
//!
//! Every negotiation round generates a fresh keypair. Its URI is written into
//! each delegation message as the origin the grants are delegated to, and the
//! private half signs the per-node execution envelopes at dispatch. The key
//! is never persisted and is zeroized on drop.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use std::fmt;
use tessera_core::{Result, TesseraError};

/// Prefix of a session key URI
pub const SESSION_URI_PREFIX: &str = "session:";

/// Ephemeral ed25519 keypair owned by one negotiation round
pub struct SessionKeyPair {
    signing: SigningKey,
}

impl SessionKeyPair {
    /// Fresh keypair from the OS random source
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair, for reproducible tests
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Hex-encoded public key
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    /// URI naming this key as a delegation origin
    pub fn uri(&self) -> String {
        format!("{SESSION_URI_PREFIX}{}", self.public_key_hex())
    }

    /// Sign `message` with the session key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Recover the public key named by a session URI
pub fn public_key_from_uri(uri: &str) -> Result<VerifyingKey> {
    let encoded = uri
        .strip_prefix(SESSION_URI_PREFIX)
        .ok_or_else(|| TesseraError::invalid_delegation(format!("{uri:?} is not a session URI")))?;
    decode_public_key(encoded)
}

/// Verify a hex signature made by the hex-encoded session key
pub fn verify_session_signature(
    public_key_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<()> {
    let key = decode_public_key(public_key_hex)?;
    let bytes = hex::decode(signature_hex)
        .map_err(|e| TesseraError::invalid_delegation(format!("signature is not hex: {e}")))?;
    let signature = Signature::from_slice(&bytes)
        .map_err(|e| TesseraError::invalid_delegation(format!("malformed signature: {e}")))?;
    key.verify(message, &signature)
        .map_err(|_| TesseraError::invalid_delegation("session signature verification failed"))
}

fn decode_public_key(encoded: &str) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(encoded)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TesseraError::invalid_delegation("session key must be 32 hex bytes"))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| TesseraError::invalid_delegation(format!("invalid session key: {e}")))
}
