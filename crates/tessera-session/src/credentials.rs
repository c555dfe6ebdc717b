//! Session credential sets and the session cache

use crate::round::{CompletedRound, RoundRecord};
use crate::session_key::SessionKeyPair;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    CapabilitySet, ContentId, NodeCredential, NodeId, Result, RoundId, TesseraError, Timestamp,
};
use tracing::debug;

/// Credentials from a single round, at least `threshold` of them, together
/// with the session key that round delegated to.
///
/// A set can only be built through [`SessionCredentialSet::assemble`], which
/// rejects any credential whose embedded proof does not belong to the round.
#[derive(Debug)]
pub struct SessionCredentialSet {
    record: RoundRecord,
    threshold: usize,
    credentials: BTreeMap<NodeId, NodeCredential>,
    session_key: SessionKeyPair,
    expires_at: Timestamp,
}

impl SessionCredentialSet {
    /// Audit `credentials` against `record` and bundle them.
    ///
    /// Fails with [`TesseraError::RoundMismatch`] if any credential was
    /// issued against a proof from another round, if two credentials name
    /// the same node, or if `session_key` is not the round's origin.
    pub fn assemble(
        record: RoundRecord,
        session_key: SessionKeyPair,
        threshold: usize,
        credentials: Vec<NodeCredential>,
    ) -> Result<Self> {
        if session_key.uri() != record.origin() {
            return Err(TesseraError::round_mismatch(format!(
                "session key is not the origin of round {}",
                record.round_id()
            )));
        }

        let mut by_node = BTreeMap::new();
        for credential in credentials {
            record.check_credential(&credential)?;
            let node = credential.node.clone();
            if by_node.insert(node.clone(), credential).is_some() {
                return Err(TesseraError::round_mismatch(format!(
                    "two credentials from {node}"
                )));
            }
        }
        if threshold == 0 || by_node.len() < threshold {
            return Err(TesseraError::quorum_unreachable(
                threshold,
                by_node.len(),
                record.nonce_count(),
                Vec::new(),
            ));
        }

        let expires_at = by_node
            .values()
            .map(|c| c.expires_at)
            .min()
            .unwrap_or(record.expires_at());
        debug!(
            round = %record.round_id(),
            credentials = by_node.len(),
            %expires_at,
            "credential set assembled"
        );
        Ok(Self {
            record,
            threshold,
            credentials: by_node,
            session_key,
            expires_at,
        })
    }

    /// Bundle the output of a completed round
    pub fn from_completed(round: CompletedRound, session_key: SessionKeyPair) -> Result<Self> {
        Self::assemble(round.record, session_key, round.threshold, round.credentials)
    }

    /// Round the credentials come from
    pub fn round_id(&self) -> RoundId {
        self.record.round_id()
    }

    /// Round summary
    pub fn record(&self) -> &RoundRecord {
        &self.record
    }

    /// Grants the set was negotiated for
    pub fn capabilities(&self) -> &CapabilitySet {
        self.record.capabilities()
    }

    /// Threshold the round was negotiated under
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Credentials in node order
    pub fn credentials(&self) -> impl Iterator<Item = &NodeCredential> {
        self.credentials.values()
    }

    /// Nodes holding a credential
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.credentials.keys()
    }

    /// Number of credentials
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Always false for an assembled set
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Round session key
    pub fn session_key(&self) -> &SessionKeyPair {
        &self.session_key
    }

    /// Earliest credential expiry
    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    /// Whether the set should be treated as expired at `now`, allowing for
    /// `skew` between local and node clocks
    pub fn is_expired_at(&self, now: Timestamp, skew: Duration) -> bool {
        now.checked_add(skew).map_or(true, |t| t >= self.expires_at)
    }

    /// [`TesseraError::CredentialExpired`] if the set is expired at `now`
    pub fn ensure_valid_at(&self, now: Timestamp, skew: Duration) -> Result<()> {
        if self.is_expired_at(now, skew) {
            Err(TesseraError::credential_expired(self.expires_at, now))
        } else {
            Ok(())
        }
    }

    /// Whether the set was negotiated for exactly `capabilities`
    pub fn covers(&self, capabilities: &CapabilitySet) -> bool {
        self.capabilities().same_grants(capabilities)
    }

    /// Whether the set authorizes executing `content_id`
    pub fn authorizes_execution(&self, content_id: &ContentId) -> bool {
        self.capabilities().authorizes_execution(content_id)
    }
}

/// Single-slot cache of the most recent credential set.
///
/// Readers take a cheap `Arc` clone; publishing a new set swaps the slot
/// without disturbing dispatches that still hold the previous one.
#[derive(Debug, Default)]
pub struct SessionCache {
    current: RwLock<Option<Arc<SessionCredentialSet>>>,
}

impl SessionCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently published set
    pub fn current(&self) -> Option<Arc<SessionCredentialSet>> {
        self.current.read().clone()
    }

    /// Cached set if it covers `capabilities` and is still valid at `now`
    pub fn usable_for(
        &self,
        capabilities: &CapabilitySet,
        now: Timestamp,
        skew: Duration,
    ) -> Option<Arc<SessionCredentialSet>> {
        self.current
            .read()
            .as_ref()
            .filter(|set| set.covers(capabilities) && !set.is_expired_at(now, skew))
            .cloned()
    }

    /// Replace the cached set, returning the previous one
    pub fn publish(&self, set: Arc<SessionCredentialSet>) -> Option<Arc<SessionCredentialSet>> {
        self.current.write().replace(set)
    }

    /// Drop the cached set
    pub fn invalidate(&self) {
        if let Some(previous) = self.current.write().take() {
            debug!(round = %previous.round_id(), "session cache invalidated");
        }
    }
}
