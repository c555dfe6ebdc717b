//! Signed delegation messages

use crate::delegation::DelegationMessage;
use crate::errors::{Result, TesseraError};
use crate::identifiers::Address;
use serde::{Deserialize, Serialize};

/// A delegation message together with the long-term key's signature over
/// its canonical text. Created once per node per negotiation round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationProof {
    message: DelegationMessage,
    signed_message: String,
    #[serde(with = "hex_bytes")]
    signature: Vec<u8>,
    derivation_method: String,
    address: Address,
}

impl AuthorizationProof {
    /// Bind a signature to the canonical rendering of `message`
    pub fn new(
        message: DelegationMessage,
        signature: Vec<u8>,
        derivation_method: impl Into<String>,
    ) -> Self {
        let signed_message = message.render();
        let address = message.address().clone();
        Self {
            message,
            signed_message,
            signature,
            derivation_method: derivation_method.into(),
            address,
        }
    }

    /// The structured message
    pub fn message(&self) -> &DelegationMessage {
        &self.message
    }

    /// The exact bytes that were signed
    pub fn signed_message(&self) -> &str {
        &self.signed_message
    }

    /// Raw signature bytes
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Hex-encoded signature
    pub fn signature_hex(&self) -> String {
        hex::encode(&self.signature)
    }

    /// How the signature was produced, e.g. `ed25519`
    pub fn derivation_method(&self) -> &str {
        &self.derivation_method
    }

    /// Address of the signer
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Check that the signed text is the canonical rendering of the message
    /// and that the claimed address is the message's signer. Deserialized
    /// proofs must pass this before any of their fields are trusted.
    pub fn check_consistency(&self) -> Result<()> {
        if self.signed_message != self.message.render() {
            return Err(TesseraError::invalid_delegation(
                "signed text differs from canonical message",
            ));
        }
        if &self.address != self.message.address() {
            return Err(TesseraError::invalid_delegation(
                "proof address differs from message signer",
            ));
        }
        Ok(())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySet;
    use crate::content::{ContentAddressing, Sha256Addressing};
    use crate::delegation::DelegationBuilder;
    use crate::identifiers::Nonce;
    use crate::time::Timestamp;

    fn message() -> DelegationMessage {
        DelegationBuilder::new("0x01".parse().unwrap())
            .origin("session:01")
            .nonce(Nonce::new("n1").unwrap())
            .issued_at(Timestamp::from_millis(0).unwrap())
            .expires_at(Timestamp::from_millis(600_000).unwrap())
            .grants(&CapabilitySet::execution_for(
                Sha256Addressing.content_id(b"x"),
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn test_proof_binds_canonical_text() {
        let proof = AuthorizationProof::new(message(), vec![1, 2, 3], "ed25519");
        assert_eq!(proof.signed_message(), message().render());
        assert_eq!(proof.signature_hex(), "010203");
        assert!(proof.check_consistency().is_ok());
    }

    #[test]
    fn test_tampered_json_detected() {
        let proof = AuthorizationProof::new(message(), vec![9], "ed25519");
        let json = serde_json::to_string(&proof).unwrap();
        let tampered = json.replace("Nonce: n1", "Nonce: n2");
        let decoded: AuthorizationProof = serde_json::from_str(&tampered).unwrap();
        assert!(decoded.check_consistency().is_err());
    }
}
