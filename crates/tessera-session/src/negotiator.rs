//! Session negotiation
//!
//! One call to [`SessionNegotiator::negotiate`] runs one round:
//!
//! 1. Ask the transport for the current quorum and threshold.
//! 2. Fetch a freshness nonce from every member concurrently. Members that
//!    fail are replaced from the standby list while any remain.
//! 3. Build one delegation message per nonce, all sharing the round's
//!    session origin, validity window and grants, and sign each once.
//! 4. Exchange every proof for a credential concurrently and validate each
//!    credential against the round before accepting it.
//!
//! Each node request is bounded by the per-node timeout and the whole round,
//! custodian calls included, by the round deadline. Requests still pending
//! at the deadline are cancelled and recorded as such; a custodian that has
//! not finished signing by then fails the round as unavailable. A failed
//! round is never resumed: retry means a brand-new round.

use crate::credentials::SessionCredentialSet;
use crate::round::{NegotiationPhase, NegotiationRound, RoundPolicy};
use crate::session_key::SessionKeyPair;
use crate::signing::SignatureProvider;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;
use tessera_core::{
    CapabilitySet, ClientConfig, Clock, DelegationBuilder, DelegationMessage, NodeCredential,
    NodeFailure, NodeFailureReason, NodeId, Nonce, QuorumTransport, Result, SignerEffects,
    TesseraError, TransportError,
};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

type NodeOutcome<T> = (NodeId, std::result::Result<T, NodeFailureReason>);

/// Runs negotiation rounds against the quorum
pub struct SessionNegotiator<'a, S, T, C> {
    signer: &'a SignatureProvider<S>,
    transport: &'a T,
    clock: &'a C,
    config: &'a ClientConfig,
}

impl<'a, S, T, C> SessionNegotiator<'a, S, T, C>
where
    S: SignerEffects,
    T: QuorumTransport,
    C: Clock,
{
    /// Negotiator over borrowed collaborators
    pub fn new(
        signer: &'a SignatureProvider<S>,
        transport: &'a T,
        clock: &'a C,
        config: &'a ClientConfig,
    ) -> Self {
        Self {
            signer,
            transport,
            clock,
            config,
        }
    }

    /// Negotiate credentials for `capabilities` with the configured expiry
    pub async fn negotiate(&self, capabilities: &CapabilitySet) -> Result<SessionCredentialSet> {
        self.negotiate_with_expiry(capabilities, self.config.default_expiry())
            .await
    }

    /// Negotiate credentials for `capabilities` valid for `expiry`.
    ///
    /// `expiry` must lie within the configured bounds.
    pub async fn negotiate_with_expiry(
        &self,
        capabilities: &CapabilitySet,
        expiry: Duration,
    ) -> Result<SessionCredentialSet> {
        let bounds = self.config.expiry_bounds;
        if !(bounds.min_secs..=bounds.max_secs).contains(&expiry.as_secs()) {
            return Err(TesseraError::config(format!(
                "expiry of {}s is outside {}..={}s",
                expiry.as_secs(),
                bounds.min_secs,
                bounds.max_secs
            )));
        }

        let deadline = Instant::now() + self.config.round_deadline();
        let address = match timeout_at(deadline, self.signer.address()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TesseraError::signing_failed(
                    "key custodian did not report an address before the round deadline",
                ))
            }
        };
        let session_key = SessionKeyPair::generate();
        let issued_at = self.clock.now();
        let expires_at = issued_at
            .checked_add(expiry)
            .ok_or_else(|| TesseraError::internal("expiry overflows the clock range"))?;
        let round = NegotiationRound::new(
            capabilities.clone(),
            address,
            RoundPolicy {
                origin: session_key.uri(),
                issued_at,
                expires_at,
            },
        )?;
        info!(
            round = %round.id(),
            network = %self.config.network.name,
            grants = capabilities.len(),
            wildcard = capabilities.is_wildcard(),
            %expires_at,
            "starting negotiation round"
        );

        let membership = match timeout_at(deadline, self.transport.list_quorum_nodes()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TesseraError::transport(
                    None,
                    "quorum discovery did not finish before the round deadline",
                ))
            }
        };
        debug!(
            round = %round.id(),
            members = membership.members.len(),
            standby = membership.standby.len(),
            threshold = membership.threshold,
            "quorum discovered"
        );

        let round = round.begin(membership, self.config.network.min_threshold);
        let round = self.collect_nonces(round, deadline).await;
        let round = self.collect_credentials(round, deadline).await;
        let round = match round.phase() {
            NegotiationPhase::AwaitingCredentials => round.complete(),
            _ => round,
        };
        SessionCredentialSet::from_completed(round.into_outcome()?, session_key)
    }

    async fn collect_nonces(
        &self,
        mut round: NegotiationRound,
        deadline: Instant,
    ) -> NegotiationRound {
        if round.phase() != NegotiationPhase::AwaitingNonces {
            return round;
        }
        let Some(membership) = round.membership().cloned() else {
            return round.fail(TesseraError::internal("round has no membership"));
        };

        let mut standby: VecDeque<NodeId> = membership.standby.into();
        let mut in_flight: BTreeSet<NodeId> = membership.members.iter().cloned().collect();
        let mut pending: FuturesUnordered<_> = membership
            .members
            .into_iter()
            .map(|node| self.fetch_nonce(node))
            .collect();

        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((node, _))) if Instant::now() >= deadline => {
                    in_flight.insert(node);
                    cancel_in_flight(&mut round, &mut in_flight, "collecting nonces");
                    break;
                }
                Ok(Some((node, outcome))) => {
                    in_flight.remove(&node);
                    let failure = match outcome {
                        Ok(nonce) => round
                            .record_nonce(node.clone(), nonce)
                            .err()
                            .map(|e| NodeFailureReason::InvalidCredential(e.to_string())),
                        Err(reason) => Some(reason),
                    };
                    if let Some(reason) = failure {
                        round.record_failure(NodeFailure::new(node, reason));
                        if let Some(alternate) = standby.pop_front() {
                            debug!(round = %round.id(), node = %alternate, "substituting standby node");
                            in_flight.insert(alternate.clone());
                            pending.push(self.fetch_nonce(alternate));
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    cancel_in_flight(&mut round, &mut in_flight, "collecting nonces");
                    break;
                }
            }
        }

        round.nonces_collected()
    }

    async fn collect_credentials(
        &self,
        mut round: NegotiationRound,
        deadline: Instant,
    ) -> NegotiationRound {
        if round.phase() != NegotiationPhase::AwaitingCredentials {
            return round;
        }

        let nonces: Vec<(NodeId, Nonce)> = round
            .nonces()
            .iter()
            .map(|(node, nonce)| (node.clone(), nonce.clone()))
            .collect();
        let mut in_flight = BTreeSet::new();
        let mut pending = FuturesUnordered::new();

        for (node, nonce) in nonces {
            let message = match self.build_message(&round, nonce) {
                Ok(message) => message,
                Err(e) => return round.fail(e),
            };
            if Instant::now() >= deadline {
                return round.fail(signing_deadline_error());
            }
            let proof = match timeout_at(deadline, self.signer.sign(message)).await {
                Ok(Ok(proof)) => proof,
                Ok(Err(e)) => return round.fail(e),
                Err(_) => {
                    warn!(round = %round.id(), %node, "round deadline reached while signing");
                    return round.fail(signing_deadline_error());
                }
            };
            if let Err(e) = round.record_proof(node.clone(), proof.clone()) {
                return round.fail(e);
            }
            in_flight.insert(node.clone());
            pending.push(self.request_credential(node, proof));
        }

        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((node, _))) if Instant::now() >= deadline => {
                    in_flight.insert(node);
                    cancel_in_flight(&mut round, &mut in_flight, "collecting credentials");
                    break;
                }
                Ok(Some((node, outcome))) => {
                    in_flight.remove(&node);
                    let failure = match outcome {
                        Ok(credential) => round
                            .record_credential(&node, credential, self.clock.now())
                            .err()
                            .map(|e| NodeFailureReason::InvalidCredential(e.to_string())),
                        Err(reason) => Some(reason),
                    };
                    if let Some(reason) = failure {
                        round.record_failure(NodeFailure::new(node, reason));
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    cancel_in_flight(&mut round, &mut in_flight, "collecting credentials");
                    break;
                }
            }
        }

        round
    }

    fn build_message(&self, round: &NegotiationRound, nonce: Nonce) -> Result<DelegationMessage> {
        let policy = round.policy();
        DelegationBuilder::new(round.signer().clone())
            .domain(&self.config.domain)
            .statement(&self.config.statement)
            .chain_id(self.config.network.chain_id)
            .origin(policy.origin.clone())
            .nonce(nonce)
            .issued_at(policy.issued_at)
            .expires_at(policy.expires_at)
            .grants(round.capabilities())
            .max_window(self.config.max_expiry())
            .build()
    }

    async fn fetch_nonce(&self, node: NodeId) -> NodeOutcome<Nonce> {
        let result = match timeout(
            self.config.node_timeout(),
            self.transport.get_freshness_nonce(&node),
        )
        .await
        {
            Ok(Ok(nonce)) => Ok(nonce),
            Ok(Err(e)) => Err(failure_reason(e)),
            Err(_) => Err(NodeFailureReason::Timeout),
        };
        (node, result)
    }

    async fn request_credential(
        &self,
        node: NodeId,
        proof: tessera_core::AuthorizationProof,
    ) -> NodeOutcome<NodeCredential> {
        let result = match timeout(
            self.config.node_timeout(),
            self.transport.request_session_credential(&node, &proof),
        )
        .await
        {
            Ok(Ok(credential)) => Ok(credential),
            Ok(Err(e)) => Err(failure_reason(e)),
            Err(_) => Err(NodeFailureReason::Timeout),
        };
        (node, result)
    }
}

/// Record every request still pending at the round deadline as cancelled.
/// Answers that arrive at or after the deadline are discarded the same way.
fn cancel_in_flight(round: &mut NegotiationRound, in_flight: &mut BTreeSet<NodeId>, stage: &str) {
    warn!(round = %round.id(), pending = in_flight.len(), stage, "round deadline reached");
    for node in std::mem::take(in_flight) {
        round.record_failure(NodeFailure::new(node, NodeFailureReason::Cancelled));
    }
}

fn signing_deadline_error() -> TesseraError {
    TesseraError::signing_failed("key custodian did not finish signing before the round deadline")
}

fn failure_reason(err: TransportError) -> NodeFailureReason {
    match err {
        TransportError::Timeout { .. } => NodeFailureReason::Timeout,
        TransportError::Rejected { diagnostic, .. } => NodeFailureReason::Rejected(diagnostic),
        TransportError::Protocol { message, .. } => NodeFailureReason::InvalidCredential(message),
        TransportError::Unreachable { reason, .. } | TransportError::Discovery { reason } => {
            NodeFailureReason::Unreachable(reason)
        }
    }
}
