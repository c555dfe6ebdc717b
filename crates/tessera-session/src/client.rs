//! High-level client
//!
//! [`QuorumClient`] wires the collaborators together and owns the session
//! cache. It is the entry point most callers need:
//!
//! ```ignore
//! let client = QuorumClient::new(config, LocalKeySigner::from_key_source(&config.key_source)?, transport)?;
//! let result = client.execute(code, serde_json::json!({ "amount": 1 })).await?;
//! ```

use crate::credentials::{SessionCache, SessionCredentialSet};
use crate::dispatcher::ActionDispatcher;
use crate::negotiator::SessionNegotiator;
use crate::provisioning;
use crate::retry::RetryPolicy;
use crate::signing::SignatureProvider;
use std::sync::Arc;
use tessera_core::{
    CapabilitySet, ClientConfig, Clock, ContentAddressing, ExecutionResult, IdentityHandle,
    IdentityRegistry, QuorumTransport, Result, Sha256Addressing, SignerEffects, SystemClock,
    TesseraError,
};
use tracing::{debug, info};

/// Session-authorization client for one network
pub struct QuorumClient<S, T, C = SystemClock, A = Sha256Addressing> {
    config: ClientConfig,
    signer: SignatureProvider<S>,
    transport: T,
    clock: C,
    addresser: A,
    retry: RetryPolicy,
    cache: SessionCache,
}

impl<S, T, C, A> std::fmt::Debug for QuorumClient<S, T, C, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, T> QuorumClient<S, T>
where
    S: SignerEffects,
    T: QuorumTransport,
{
    /// Client using the system clock and SHA-256 content addressing
    pub fn new(config: ClientConfig, signer: S, transport: T) -> Result<Self> {
        Self::with_effects(config, signer, transport, SystemClock, Sha256Addressing)
    }
}

impl<S, T, C, A> QuorumClient<S, T, C, A>
where
    S: SignerEffects,
    T: QuorumTransport,
    C: Clock,
    A: ContentAddressing,
{
    /// Client with explicit clock and content addressing
    pub fn with_effects(
        config: ClientConfig,
        signer: S,
        transport: T,
        clock: C,
        addresser: A,
    ) -> Result<Self> {
        config.validate()?;
        let retry = RetryPolicy::from_config(&config.retry);
        info!(network = %config.network.name, "quorum client ready");
        Ok(Self {
            config,
            signer: SignatureProvider::new(signer),
            transport,
            clock,
            addresser,
            retry,
            cache: SessionCache::new(),
        })
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Signature provider over the long-term key
    pub fn signer(&self) -> &SignatureProvider<S> {
        &self.signer
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Grants needed to execute exactly `code`
    pub fn execution_capabilities(&self, code: &[u8]) -> CapabilitySet {
        CapabilitySet::execution_for(self.addresser.content_id(code))
    }

    /// Negotiator borrowing this client's collaborators
    pub fn negotiator(&self) -> SessionNegotiator<'_, S, T, C> {
        SessionNegotiator::new(&self.signer, &self.transport, &self.clock, &self.config)
    }

    /// Dispatcher borrowing this client's collaborators
    pub fn dispatcher(&self) -> ActionDispatcher<'_, T, C, A> {
        ActionDispatcher::new(
            &self.transport,
            &self.clock,
            &self.addresser,
            self.config.clock_skew(),
        )
    }

    /// Most recently negotiated credential set
    pub fn cached_session(&self) -> Option<Arc<SessionCredentialSet>> {
        self.cache.current()
    }

    /// Drop the cached credential set
    pub fn invalidate_session(&self) {
        self.cache.invalidate();
    }

    /// Run one new round and cache its credentials
    pub async fn negotiate(&self, capabilities: &CapabilitySet) -> Result<Arc<SessionCredentialSet>> {
        let set = Arc::new(self.negotiator().negotiate(capabilities).await?);
        self.cache.publish(set.clone());
        Ok(set)
    }

    /// Run new rounds until one succeeds or the retry policy gives up
    pub async fn negotiate_with_retry(
        &self,
        capabilities: &CapabilitySet,
    ) -> Result<Arc<SessionCredentialSet>> {
        self.retry.execute(|| self.negotiate(capabilities)).await
    }

    /// Cached credentials for `capabilities` if still valid, otherwise a
    /// freshly negotiated set
    pub async fn session_for(
        &self,
        capabilities: &CapabilitySet,
    ) -> Result<Arc<SessionCredentialSet>> {
        if let Some(set) =
            self.cache
                .usable_for(capabilities, self.clock.now(), self.config.clock_skew())
        {
            debug!(round = %set.round_id(), "reusing cached session");
            return Ok(set);
        }
        self.negotiate_with_retry(capabilities).await
    }

    /// Execute `code` under credentials scoped to exactly that payload,
    /// negotiating them if needed. Credentials that expire between the
    /// cache check and dispatch trigger one renegotiation.
    pub async fn execute(&self, code: &[u8], params: serde_json::Value) -> Result<ExecutionResult> {
        let capabilities = self.execution_capabilities(code);
        let session = self.session_for(&capabilities).await?;
        match self.dispatcher().dispatch(code, params.clone(), &session).await {
            Err(TesseraError::CredentialExpired { expired_at, .. }) => {
                info!(%expired_at, "credentials expired before dispatch; renegotiating");
                self.cache.invalidate();
                let fresh = self.negotiate_with_retry(&capabilities).await?;
                self.dispatcher().dispatch(code, params, &fresh).await
            }
            other => other,
        }
    }

    /// Execute `code` under an explicit credential set, such as a wildcard
    /// development session
    pub async fn execute_with(
        &self,
        code: &[u8],
        params: serde_json::Value,
        session: &SessionCredentialSet,
    ) -> Result<ExecutionResult> {
        self.dispatcher().dispatch(code, params, session).await
    }

    /// Mint a delegated identity controlled by the long-term key
    pub async fn provision_identity<R>(&self, registry: &R) -> Result<IdentityHandle>
    where
        R: IdentityRegistry + ?Sized,
    {
        provisioning::provision_identity(
            &self.signer,
            &self.transport,
            &self.clock,
            registry,
            &self.config,
        )
        .await
    }
}
