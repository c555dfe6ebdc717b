//! Signature provider
//!
//! Thin wrapper over the key custodian that turns a built
//! [`DelegationMessage`] into an [`AuthorizationProof`]. Each call reaches
//! the custodian exactly once: a refusal or an unavailable key surfaces
//! immediately as [`TesseraError::SigningFailed`] because retrying would
//! re-prompt a human.

use tessera_core::{Address, AuthorizationProof, DelegationMessage, Result, SignerEffects, TesseraError};
use tracing::{debug, warn};

/// Signs delegation messages with the long-term key
#[derive(Debug, Clone)]
pub struct SignatureProvider<S> {
    signer: S,
}

impl<S: SignerEffects> SignatureProvider<S> {
    /// Wrap a custodian
    pub fn new(signer: S) -> Self {
        Self { signer }
    }

    /// The wrapped custodian
    pub fn signer(&self) -> &S {
        &self.signer
    }

    /// Address of the long-term key
    pub async fn address(&self) -> Result<Address> {
        self.signer.address().await.map_err(|e| {
            warn!(error = %e, "key custodian did not report an address");
            TesseraError::from(e)
        })
    }

    /// Sign the canonical text of `message`
    pub async fn sign(&self, message: DelegationMessage) -> Result<AuthorizationProof> {
        let text = message.render();
        let signature = self.signer.sign(text.as_bytes()).await.map_err(|e| {
            warn!(error = %e, nonce = %message.nonce(), "delegation signing failed");
            TesseraError::from(e)
        })?;
        debug!(
            nonce = %message.nonce(),
            method = self.signer.derivation_method(),
            "delegation signed"
        );
        Ok(AuthorizationProof::new(
            message,
            signature,
            self.signer.derivation_method(),
        ))
    }
}
