//! Deterministic key custodian

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tessera_core::{Address, SignerEffects, SignerError};
use tessera_session::LocalKeySigner;

/// Custodian with a seeded ed25519 key that counts signing requests and can
/// be told to decline them
#[derive(Debug)]
pub struct TestSigner {
    inner: LocalKeySigner,
    declined: AtomicBool,
    sign_calls: AtomicUsize,
}

impl TestSigner {
    /// Signer from a raw seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            inner: LocalKeySigner::from_seed(seed),
            declined: AtomicBool::new(false),
            sign_calls: AtomicUsize::new(0),
        }
    }

    /// Signer whose seed is the SHA-256 of `seed`
    pub fn from_seed_string(seed: &str) -> Self {
        let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
        Self::from_seed(digest)
    }

    /// Make every following signing request fail as declined
    pub fn decline(&self) {
        self.declined.store(true, Ordering::SeqCst);
    }

    /// Number of signing requests received, declined ones included
    pub fn sign_count(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    /// Address of the key
    pub fn address(&self) -> Address {
        self.inner.address()
    }
}

#[async_trait]
impl SignerEffects for TestSigner {
    async fn address(&self) -> Result<Address, SignerError> {
        Ok(self.inner.address())
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        if self.declined.load(Ordering::SeqCst) {
            return Err(SignerError::Declined {
                reason: "user rejected the signature request".to_string(),
            });
        }
        self.inner.sign(message).await
    }

    fn derivation_method(&self) -> &str {
        self.inner.derivation_method()
    }
}
