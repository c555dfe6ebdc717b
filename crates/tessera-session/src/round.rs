//! Negotiation round state machine
//!
//! A round moves `Idle -> AwaitingNonces -> AwaitingCredentials` and ends in
//! `Complete` or `Failed`. Transitions consume the round so a finished round
//! cannot be driven again; per-node events (`record_*`) mutate in place and
//! are rejected outside the phase they belong to.
//!
//! Every value a round produces is tagged with its [`RoundId`], and
//! [`RoundRecord::check_credential`] is the single place that decides
//! whether a credential belongs to a round.

use std::collections::{BTreeMap, BTreeSet};
use tessera_core::{
    Address, AuthorizationProof, CapabilitySet, NodeCredential, NodeFailure, NodeFailureReason,
    NodeId, Nonce, QuorumMembership, Result, RoundId, TesseraError, Timestamp,
};
use tracing::{debug, info, warn};

/// Phase of a negotiation round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationPhase {
    /// Created, quorum not yet known
    Idle,
    /// Collecting one freshness nonce per member
    AwaitingNonces,
    /// Collecting one credential per signed proof
    AwaitingCredentials,
    /// Threshold reached
    Complete,
    /// Terminal failure
    Failed,
}

impl NegotiationPhase {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationPhase::Complete | NegotiationPhase::Failed)
    }
}

/// Values fixed for the whole round and shared by every message in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundPolicy {
    /// Session key URI the grants are delegated to
    pub origin: String,
    /// Issuance time of every message
    pub issued_at: Timestamp,
    /// Expiry of every message
    pub expires_at: Timestamp,
}

/// Immutable summary of a round, used to audit credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRecord {
    round_id: RoundId,
    signer: Address,
    capabilities: CapabilitySet,
    policy: RoundPolicy,
    nonces: BTreeMap<NodeId, Nonce>,
}

impl RoundRecord {
    /// Round identifier
    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    /// Address of the long-term signer
    pub fn signer(&self) -> &Address {
        &self.signer
    }

    /// Grants negotiated in the round
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Session key URI
    pub fn origin(&self) -> &str {
        &self.policy.origin
    }

    /// Issuance time shared by every message
    pub fn issued_at(&self) -> Timestamp {
        self.policy.issued_at
    }

    /// Expiry shared by every message
    pub fn expires_at(&self) -> Timestamp {
        self.policy.expires_at
    }

    /// Nonce collected from `node`, if any
    pub fn nonce_for(&self, node: &NodeId) -> Option<&Nonce> {
        self.nonces.get(node)
    }

    /// Number of nonces collected
    pub fn nonce_count(&self) -> usize {
        self.nonces.len()
    }

    /// Check that `proof` is the delegation this round would have sent to
    /// `node`: same signer, origin, validity window and grants, bound to the
    /// nonce that node issued.
    pub fn check_proof(&self, node: &NodeId, proof: &AuthorizationProof) -> Result<()> {
        proof
            .check_consistency()
            .map_err(|e| TesseraError::round_mismatch(format!("{node}: {e}")))?;
        let message = proof.message();
        let mismatch = |what: &str| {
            Err(TesseraError::round_mismatch(format!(
                "{node}: proof {what} differs from round {}",
                self.round_id
            )))
        };

        if message.address() != &self.signer {
            return mismatch("signer");
        }
        if message.origin() != self.policy.origin {
            return mismatch("session origin");
        }
        if message.issued_at() != self.policy.issued_at
            || message.expires_at() != self.policy.expires_at
        {
            return mismatch("validity window");
        }
        if !message.grants().same_grants(&self.capabilities) {
            return mismatch("capabilities");
        }
        match self.nonces.get(node) {
            Some(nonce) if nonce == message.nonce() => Ok(()),
            Some(_) => mismatch("nonce"),
            None => Err(TesseraError::round_mismatch(format!(
                "{node} issued no nonce in round {}",
                self.round_id
            ))),
        }
    }

    /// Check that `credential` was issued by a member of this round against
    /// this round's proof and does not outlive it
    pub fn check_credential(&self, credential: &NodeCredential) -> Result<()> {
        self.check_proof(&credential.node, &credential.proof)?;
        if credential.expires_at > self.policy.expires_at {
            return Err(TesseraError::round_mismatch(format!(
                "{}: credential expiry {} extends past delegation expiry {}",
                credential.node, credential.expires_at, self.policy.expires_at
            )));
        }
        if credential.issued_at >= credential.expires_at {
            return Err(TesseraError::round_mismatch(format!(
                "{}: credential has an empty validity window",
                credential.node
            )));
        }
        Ok(())
    }
}

/// Credentials produced by a completed round
#[derive(Debug, Clone)]
pub struct CompletedRound {
    /// Round summary
    pub record: RoundRecord,
    /// Effective threshold
    pub threshold: usize,
    /// Valid credentials, one per node
    pub credentials: Vec<NodeCredential>,
}

/// A single negotiation round
#[derive(Debug)]
pub struct NegotiationRound {
    id: RoundId,
    phase: NegotiationPhase,
    signer: Address,
    capabilities: CapabilitySet,
    policy: RoundPolicy,
    membership: Option<QuorumMembership>,
    threshold: usize,
    nonces: BTreeMap<NodeId, Nonce>,
    proofs: BTreeMap<NodeId, AuthorizationProof>,
    credentials: BTreeMap<NodeId, NodeCredential>,
    failures: Vec<NodeFailure>,
    failure: Option<TesseraError>,
}

impl NegotiationRound {
    /// New idle round
    pub fn new(capabilities: CapabilitySet, signer: Address, policy: RoundPolicy) -> Result<Self> {
        if capabilities.is_empty() {
            return Err(TesseraError::invalid_delegation(
                "cannot negotiate an empty capability set",
            ));
        }
        if policy.issued_at >= policy.expires_at {
            return Err(TesseraError::invalid_delegation(
                "round expiry must follow issuance",
            ));
        }
        Ok(Self {
            id: RoundId::new(),
            phase: NegotiationPhase::Idle,
            signer,
            capabilities,
            policy,
            membership: None,
            threshold: 0,
            nonces: BTreeMap::new(),
            proofs: BTreeMap::new(),
            credentials: BTreeMap::new(),
            failures: Vec::new(),
            failure: None,
        })
    }

    /// Round identifier
    pub fn id(&self) -> RoundId {
        self.id
    }

    /// Current phase
    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Grants under negotiation
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Round-wide message values
    pub fn policy(&self) -> &RoundPolicy {
        &self.policy
    }

    /// Long-term signer address
    pub fn signer(&self) -> &Address {
        &self.signer
    }

    /// Quorum composition, once known
    pub fn membership(&self) -> Option<&QuorumMembership> {
        self.membership.as_ref()
    }

    /// Effective threshold, once known
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Nonces collected so far
    pub fn nonces(&self) -> &BTreeMap<NodeId, Nonce> {
        &self.nonces
    }

    /// Per-node failures observed so far
    pub fn failures(&self) -> &[NodeFailure] {
        &self.failures
    }

    /// Number of valid credentials collected
    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    /// Snapshot of the round for auditing credentials
    pub fn record(&self) -> RoundRecord {
        RoundRecord {
            round_id: self.id,
            signer: self.signer.clone(),
            capabilities: self.capabilities.clone(),
            policy: self.policy.clone(),
            nonces: self.nonces.clone(),
        }
    }

    /// Enter nonce collection with the quorum reported by the network.
    ///
    /// The effective threshold is the larger of the network's and the
    /// configured minimum.
    pub fn begin(mut self, membership: QuorumMembership, min_threshold: Option<usize>) -> Self {
        if let Err(e) = self.expect_phase(NegotiationPhase::Idle) {
            return self.fail(e);
        }
        let threshold = membership.threshold.max(min_threshold.unwrap_or(0));
        let reachable = membership.members.len() + membership.standby.len();
        self.threshold = threshold;
        self.membership = Some(membership);

        if threshold == 0 {
            return self.fail(TesseraError::internal("quorum reported a zero threshold"));
        }
        if threshold > reachable {
            let error = TesseraError::quorum_unreachable(threshold, 0, reachable, Vec::new());
            return self.fail(error);
        }
        info!(round = %self.id, threshold, reachable, "collecting freshness nonces");
        self.phase = NegotiationPhase::AwaitingNonces;
        self
    }

    /// Record a nonce from `node`
    pub fn record_nonce(&mut self, node: NodeId, nonce: Nonce) -> Result<()> {
        self.expect_phase(NegotiationPhase::AwaitingNonces)?;
        if self.nonces.contains_key(&node) {
            return Err(TesseraError::round_mismatch(format!(
                "{node} supplied a second nonce in round {}",
                self.id
            )));
        }
        debug!(round = %self.id, %node, "nonce received");
        self.nonces.insert(node, nonce);
        Ok(())
    }

    /// Record a node that will not contribute
    pub fn record_failure(&mut self, failure: NodeFailure) {
        warn!(round = %self.id, %failure, "node dropped from round");
        self.failures.push(failure);
    }

    /// Close nonce collection
    pub fn nonces_collected(mut self) -> Self {
        if let Err(e) = self.expect_phase(NegotiationPhase::AwaitingNonces) {
            return self.fail(e);
        }
        if self.nonces.len() < self.threshold {
            let error = self.threshold_failure(self.nonces.len());
            return self.fail(error);
        }
        self.phase = NegotiationPhase::AwaitingCredentials;
        self
    }

    /// Record the proof sent to `node`
    pub fn record_proof(&mut self, node: NodeId, proof: AuthorizationProof) -> Result<()> {
        self.expect_phase(NegotiationPhase::AwaitingCredentials)?;
        self.record().check_proof(&node, &proof)?;
        self.proofs.insert(node, proof);
        Ok(())
    }

    /// Validate and record a credential returned by `node`.
    ///
    /// The credential must name the node it came from, embed exactly the
    /// proof sent to that node, and expire no later than the delegation.
    pub fn record_credential(
        &mut self,
        node: &NodeId,
        credential: NodeCredential,
        now: Timestamp,
    ) -> Result<()> {
        self.expect_phase(NegotiationPhase::AwaitingCredentials)?;
        if &credential.node != node {
            return Err(TesseraError::round_mismatch(format!(
                "{node} returned a credential naming {}",
                credential.node
            )));
        }
        match self.proofs.get(node) {
            Some(sent) if *sent == credential.proof => {}
            Some(_) => {
                return Err(TesseraError::round_mismatch(format!(
                    "{node} returned a credential for a different proof"
                )))
            }
            None => {
                return Err(TesseraError::round_mismatch(format!(
                    "no proof was sent to {node} in round {}",
                    self.id
                )))
            }
        }
        if self.credentials.contains_key(node) {
            return Err(TesseraError::round_mismatch(format!(
                "{node} returned a second credential"
            )));
        }
        self.record().check_credential(&credential)?;
        if credential.expires_at <= now {
            return Err(TesseraError::credential_expired(credential.expires_at, now));
        }
        debug!(round = %self.id, %node, "credential accepted");
        self.credentials.insert(node.clone(), credential);
        Ok(())
    }

    /// Close credential collection
    pub fn complete(mut self) -> Self {
        if let Err(e) = self.expect_phase(NegotiationPhase::AwaitingCredentials) {
            return self.fail(e);
        }
        if self.credentials.len() < self.threshold {
            let error = self.threshold_failure(self.credentials.len());
            return self.fail(error);
        }
        info!(
            round = %self.id,
            credentials = self.credentials.len(),
            threshold = self.threshold,
            "round complete"
        );
        self.phase = NegotiationPhase::Complete;
        self
    }

    /// Terminal failure
    pub fn fail(mut self, error: TesseraError) -> Self {
        warn!(round = %self.id, phase = ?self.phase, error = %error, "round failed");
        self.phase = NegotiationPhase::Failed;
        self.failure = Some(error);
        self
    }

    /// Consume a terminal round
    pub fn into_outcome(self) -> Result<CompletedRound> {
        match self.phase {
            NegotiationPhase::Complete => Ok(CompletedRound {
                record: self.record(),
                threshold: self.threshold,
                credentials: self.credentials.into_values().collect(),
            }),
            NegotiationPhase::Failed => Err(self
                .failure
                .unwrap_or_else(|| TesseraError::internal("round failed without a cause"))),
            phase => Err(TesseraError::internal(format!(
                "round {} is still in {phase:?}",
                self.id
            ))),
        }
    }

    fn expect_phase(&self, expected: NegotiationPhase) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(TesseraError::internal(format!(
                "round {} is in {:?}, expected {expected:?}",
                self.id, self.phase
            )))
        }
    }

    /// Rejections alone make the threshold unreachable: report the first
    /// one. Otherwise the quorum simply did not answer.
    ///
    /// Capacity counts standby nodes as well as members, so a member that
    /// was replaced by a standby does not make a rejection look fatal.
    fn threshold_failure(&self, responded: usize) -> TesseraError {
        let (capacity, quorum_size) = match &self.membership {
            Some(membership) => {
                let contacted: BTreeSet<&NodeId> = membership
                    .members
                    .iter()
                    .chain(self.nonces.keys())
                    .chain(self.failures.iter().map(|f| &f.node))
                    .collect();
                (
                    membership.members.len() + membership.standby.len(),
                    contacted.len(),
                )
            }
            None => (0, 0),
        };
        let rejections: Vec<&NodeFailure> =
            self.failures.iter().filter(|f| f.is_rejection()).collect();

        if let Some(first) = rejections.first() {
            if capacity.saturating_sub(rejections.len()) < self.threshold {
                let diagnostic = match &first.reason {
                    NodeFailureReason::Rejected(diagnostic) => diagnostic.clone(),
                    other => format!("{other:?}"),
                };
                return TesseraError::authorization_rejected(Some(first.node.clone()), diagnostic);
            }
        }
        TesseraError::quorum_unreachable(
            self.threshold,
            responded,
            quorum_size,
            self.failures.clone(),
        )
    }
}
