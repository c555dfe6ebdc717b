//! In-memory identity registry

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tessera_core::{
    AbilityKind, Address, AuthorizationProof, IdentityHandle, IdentityRegistry, RegistryError,
};
use tessera_session::verify_proof;

/// Registry that mints an identity for every valid provisioning proof
#[derive(Debug, Default)]
pub struct MockRegistry {
    minted: Mutex<Vec<(IdentityHandle, AuthorizationProof)>>,
    unavailable: Mutex<bool>,
}

impl MockRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    /// Identities minted so far, with the proofs that authorized them
    pub fn minted(&self) -> Vec<(IdentityHandle, AuthorizationProof)> {
        self.minted.lock().clone()
    }
}

#[async_trait]
impl IdentityRegistry for MockRegistry {
    async fn mint_delegated_identity(
        &self,
        proof: &AuthorizationProof,
    ) -> Result<IdentityHandle, RegistryError> {
        if *self.unavailable.lock() {
            return Err(RegistryError::Unavailable {
                reason: "registry offline".to_string(),
            });
        }
        verify_proof(proof).map_err(|e| RegistryError::Rejected {
            reason: e.to_string(),
        })?;
        let grants_signing = proof
            .message()
            .grants()
            .grants()
            .iter()
            .any(|g| g.ability == AbilityKind::SignWithIdentity);
        if !grants_signing {
            return Err(RegistryError::Rejected {
                reason: "proof does not delegate identity signing".to_string(),
            });
        }

        let mut minted = self.minted.lock();
        let mut hasher = Sha256::new();
        hasher.update(proof.signature());
        hasher.update((minted.len() as u64).to_be_bytes());
        let digest = hasher.finalize();
        let handle = IdentityHandle {
            token_id: format!("0x{}", hex::encode(digest)),
            public_key: hex::encode(Sha256::digest(digest)),
            address: Address::from_bytes(&digest[..20]),
        };
        minted.push((handle.clone(), proof.clone()));
        Ok(handle)
    }
}
