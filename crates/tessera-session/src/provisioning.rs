//! Delegated identity provisioning
//!
//! Minting a delegated identity needs a single signed delegation granting
//! `SignWithIdentity` on every identity with the `SignAnything` scope. The
//! nonce comes from the first quorum member that answers; the registry is
//! expected to validate the proof the same way a node does. Discovery and
//! every nonce request are bounded by the per-node timeout.

use crate::signing::SignatureProvider;
use tessera_core::{
    AbilityKind, CapabilityGrant, CapabilitySet, ClientConfig, Clock, DelegationBuilder,
    IdentityHandle, IdentityRegistry, Nonce, QuorumTransport, ResourceId, Result, ScopeKind,
    SignerEffects, TesseraError,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Grants requested when minting a delegated identity
pub fn provisioning_grants() -> Result<CapabilitySet> {
    CapabilitySet::new(vec![CapabilityGrant::build(
        ResourceId::Wildcard,
        AbilityKind::SignWithIdentity,
        ScopeKind::SignAnything,
    )])
}

/// Origin written into provisioning delegations
pub fn provisioning_origin(config: &ClientConfig) -> String {
    format!("https://{}/", config.domain)
}

/// Sign a provisioning delegation and mint a delegated identity
pub async fn provision_identity<S, T, C, R>(
    signer: &SignatureProvider<S>,
    transport: &T,
    clock: &C,
    registry: &R,
    config: &ClientConfig,
) -> Result<IdentityHandle>
where
    S: SignerEffects,
    T: QuorumTransport,
    C: Clock,
    R: IdentityRegistry + ?Sized,
{
    let nonce = first_nonce(transport, config).await?;
    let address = signer.address().await?;
    let issued_at = clock.now();
    let expires_at = issued_at
        .checked_add(config.default_expiry())
        .ok_or_else(|| TesseraError::internal("expiry overflows the clock range"))?;

    let message = DelegationBuilder::new(address)
        .domain(&config.domain)
        .statement(&config.statement)
        .chain_id(config.network.chain_id)
        .origin(provisioning_origin(config))
        .nonce(nonce)
        .issued_at(issued_at)
        .expires_at(expires_at)
        .grants(&provisioning_grants()?)
        .max_window(config.max_expiry())
        .build()?;
    let proof = signer.sign(message).await?;

    let handle = registry.mint_delegated_identity(&proof).await.map_err(|e| {
        warn!(error = %e, "identity mint failed");
        TesseraError::from(e)
    })?;
    info!(token_id = %handle.token_id, address = %handle.address, "delegated identity minted");
    Ok(handle)
}

async fn first_nonce<T: QuorumTransport>(transport: &T, config: &ClientConfig) -> Result<Nonce> {
    let membership = match timeout(config.node_timeout(), transport.list_quorum_nodes()).await {
        Ok(result) => result?,
        Err(_) => {
            warn!("quorum discovery timed out");
            return Err(TesseraError::transport(None, "quorum discovery timed out"));
        }
    };
    let mut last_error = None;
    for node in membership.members.iter().chain(membership.standby.iter()) {
        match timeout(config.node_timeout(), transport.get_freshness_nonce(node)).await {
            Ok(Ok(nonce)) => return Ok(nonce),
            Ok(Err(e)) => {
                debug!(%node, error = %e, "nonce request failed; trying next node");
                last_error = Some(TesseraError::from(e));
            }
            Err(_) => {
                debug!(%node, "nonce request timed out; trying next node");
                last_error = Some(TesseraError::transport(Some(node.clone()), "timed out"));
            }
        }
    }
    Err(last_error.unwrap_or_else(|| TesseraError::transport(None, "quorum has no members")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ContentAddressing;

    #[test]
    fn test_provisioning_grants_are_wildcard_signing() {
        let grants = provisioning_grants().unwrap();
        assert_eq!(grants.len(), 1);
        let grant = grants.grants()[0];
        assert_eq!(grant.ability, AbilityKind::SignWithIdentity);
        assert_eq!(grant.scope, ScopeKind::SignAnything);
        assert_eq!(grant.resource_uri(), "identity://*");
        let cid = tessera_core::Sha256Addressing.content_id(b"code");
        assert!(!grants.authorizes_execution(&cid));
    }

    #[test]
    fn test_origin_uses_configured_domain() {
        let config = ClientConfig {
            domain: "app.example".into(),
            ..ClientConfig::default()
        };
        assert_eq!(provisioning_origin(&config), "https://app.example/");
    }
}
