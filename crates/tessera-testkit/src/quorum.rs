//! In-memory quorum
//!
//! [`MockQuorum`] plays every node of a quorum inside the test process and
//! validates requests the way real nodes would: proofs are re-parsed from
//! their signed text and signature-checked, nonces are single use and bound
//! to the node that issued them, and execution requires a session-key
//! signature over a per-node envelope from the round the credential was
//! issued in.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    AuthorizationProof, Clock, ContentAddressing, ExecutionRequest, ExecutionResult,
    NodeCredential, NodeExecutionAuth, NodeId, Nonce, QuorumMembership, QuorumTransport,
    Sha256Addressing, TransportError,
};
use tessera_session::session_key::{public_key_from_uri, verify_session_signature};
use tessera_session::{execution_envelope, params_digest, verify_proof};

/// How a simulated node responds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBehavior {
    /// Answers every request correctly
    Healthy,
    /// Never answers nonce requests
    StallNonce,
    /// Issues nonces but never answers credential requests
    StallCredential,
    /// Refuses connections
    Unreachable,
    /// Validates the proof and then refuses the capability
    RejectCredential(String),
    /// Issues credentials that outlive the delegation they were issued for
    ExtendExpiry,
}

#[derive(Debug)]
struct QuorumState {
    behaviors: BTreeMap<NodeId, NodeBehavior>,
    outstanding_nonces: BTreeMap<NodeId, BTreeSet<Nonce>>,
    issued_tokens: BTreeMap<String, NodeId>,
    rng: ChaCha20Rng,
    deny_wildcard: bool,
    stall_discovery: bool,
    execution_rejection: Option<String>,
    nonce_requests: usize,
    credential_requests: usize,
    executions: Vec<ExecutionRequest>,
}

/// Simulated quorum with per-node behaviours and request counters
pub struct MockQuorum {
    members: Vec<NodeId>,
    standby: Vec<NodeId>,
    threshold: usize,
    clock: Arc<dyn Clock>,
    state: Mutex<QuorumState>,
}

impl MockQuorum {
    /// `size` healthy members named `node-1..=node-size`
    pub fn new(size: usize, threshold: usize, clock: Arc<dyn Clock>) -> Self {
        Self::with_standby(size, 0, threshold, clock)
    }

    /// Healthy members plus `standby` alternates named `standby-1..`
    pub fn with_standby(
        size: usize,
        standby: usize,
        threshold: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let members: Vec<NodeId> = (1..=size).map(|i| NodeId::new(format!("node-{i}"))).collect();
        let standby: Vec<NodeId> = (1..=standby)
            .map(|i| NodeId::new(format!("standby-{i}")))
            .collect();
        let behaviors = members
            .iter()
            .chain(standby.iter())
            .map(|node| (node.clone(), NodeBehavior::Healthy))
            .collect();
        Self {
            members,
            standby,
            threshold,
            clock,
            state: Mutex::new(QuorumState {
                behaviors,
                outstanding_nonces: BTreeMap::new(),
                issued_tokens: BTreeMap::new(),
                rng: ChaCha20Rng::seed_from_u64(42),
                deny_wildcard: false,
                stall_discovery: false,
                execution_rejection: None,
                nonce_requests: 0,
                credential_requests: 0,
                executions: Vec::new(),
            }),
        }
    }

    /// Member ids
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Member by one-based position
    pub fn node(&self, position: usize) -> NodeId {
        self.members[position - 1].clone()
    }

    /// Change how `node` responds
    pub fn set_behavior(&self, node: &NodeId, behavior: NodeBehavior) {
        self.state.lock().behaviors.insert(node.clone(), behavior);
    }

    /// Refuse credentials for wildcard grants
    pub fn deny_wildcard(&self, deny: bool) {
        self.state.lock().deny_wildcard = deny;
    }

    /// Never answer membership queries while set
    pub fn stall_discovery(&self, stall: bool) {
        self.state.lock().stall_discovery = stall;
    }

    /// Refuse every execution request with `diagnostic`
    pub fn reject_executions(&self, diagnostic: Option<&str>) {
        self.state.lock().execution_rejection = diagnostic.map(str::to_string);
    }

    /// Nonce requests received
    pub fn nonce_requests(&self) -> usize {
        self.state.lock().nonce_requests
    }

    /// Credential requests received
    pub fn credential_requests(&self) -> usize {
        self.state.lock().credential_requests
    }

    /// Execution requests received
    pub fn execute_calls(&self) -> usize {
        self.state.lock().executions.len()
    }

    /// Execution requests received, in order
    pub fn executions(&self) -> Vec<ExecutionRequest> {
        self.state.lock().executions.clone()
    }

    /// Total network calls of any kind except discovery
    pub fn total_calls(&self) -> usize {
        let state = self.state.lock();
        state.nonce_requests + state.credential_requests + state.executions.len()
    }

    fn behavior(&self, node: &NodeId) -> Result<NodeBehavior, TransportError> {
        self.state
            .lock()
            .behaviors
            .get(node)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable {
                node: node.clone(),
                reason: "unknown node".to_string(),
            })
    }

    fn rejected(node: &NodeId, diagnostic: impl Into<String>) -> TransportError {
        TransportError::Rejected {
            node: Some(node.clone()),
            diagnostic: diagnostic.into(),
        }
    }

    fn issue_credential(
        &self,
        node: &NodeId,
        proof: &AuthorizationProof,
        behavior: &NodeBehavior,
    ) -> Result<NodeCredential, TransportError> {
        verify_proof(proof).map_err(|e| Self::rejected(node, e.to_string()))?;
        let message = proof.message();
        let now = self.clock.now();
        if message.expires_at() <= now {
            return Err(Self::rejected(node, "delegation expired"));
        }

        let mut state = self.state.lock();
        let fresh = state
            .outstanding_nonces
            .get_mut(node)
            .map_or(false, |nonces| nonces.remove(message.nonce()));
        if !fresh {
            return Err(Self::rejected(node, "unknown or reused nonce"));
        }
        if state.deny_wildcard && message.grants().is_wildcard() {
            return Err(Self::rejected(
                node,
                "wildcard capabilities are not permitted on this network",
            ));
        }

        let expires_at = match behavior {
            NodeBehavior::ExtendExpiry => message
                .expires_at()
                .checked_add(Duration::from_secs(3_600))
                .unwrap_or(message.expires_at()),
            _ => message.expires_at(),
        };
        let token = format!("{node}:{}", &proof.signature_hex()[..16]);
        state.issued_tokens.insert(token.clone(), node.clone());
        tracing::debug!(%node, %expires_at, "mock node issued credential");
        Ok(NodeCredential {
            node: node.clone(),
            token,
            proof: proof.clone(),
            issued_at: now,
            expires_at,
        })
    }

    fn check_authorization(
        &self,
        request: &ExecutionRequest,
        params_digest: &str,
        auth: &NodeExecutionAuth,
    ) -> Result<(), TransportError> {
        let credential = &auth.credential;
        let node = &credential.node;
        if self.state.lock().issued_tokens.get(&credential.token) != Some(node) {
            return Err(Self::rejected(node, "session token was not issued by this node"));
        }
        if !credential
            .proof
            .message()
            .grants()
            .authorizes_execution(&request.content_id)
        {
            return Err(Self::rejected(
                node,
                "resource id not found in delegated capabilities",
            ));
        }
        if credential.expires_at <= self.clock.now() {
            return Err(Self::rejected(node, "session credential expired"));
        }
        let origin_key = public_key_from_uri(credential.proof.message().origin())
            .map_err(|e| Self::rejected(node, e.to_string()))?;
        if hex::encode(origin_key.as_bytes()) != auth.session_public_key {
            return Err(Self::rejected(node, "session key is not the delegation origin"));
        }
        let expected = execution_envelope(
            request.round_id,
            node,
            &request.content_id,
            params_digest,
            auth_expiry(request),
        );
        if auth.envelope != expected {
            return Err(Self::rejected(node, "execution envelope mismatch"));
        }
        verify_session_signature(&auth.session_public_key, auth.envelope.as_bytes(), &auth.signature)
            .map_err(|e| Self::rejected(node, e.to_string()))
    }
}

/// Envelope expiry shared by every authorization in a request: the
/// earliest credential expiry
fn auth_expiry(request: &ExecutionRequest) -> tessera_core::Timestamp {
    request
        .authorizations
        .iter()
        .map(|a| a.credential.expires_at)
        .min()
        .unwrap_or_else(|| tessera_core::Timestamp::from_millis(0).unwrap())
}

#[async_trait]
impl QuorumTransport for MockQuorum {
    async fn list_quorum_nodes(&self) -> Result<QuorumMembership, TransportError> {
        if self.state.lock().stall_discovery {
            return std::future::pending().await;
        }
        Ok(QuorumMembership {
            members: self.members.clone(),
            standby: self.standby.clone(),
            threshold: self.threshold,
        })
    }

    async fn get_freshness_nonce(&self, node: &NodeId) -> Result<Nonce, TransportError> {
        self.state.lock().nonce_requests += 1;
        match self.behavior(node)? {
            NodeBehavior::Unreachable => Err(TransportError::Unreachable {
                node: node.clone(),
                reason: "connection refused".to_string(),
            }),
            NodeBehavior::StallNonce => std::future::pending().await,
            _ => {
                let mut state = self.state.lock();
                let mut bytes = [0u8; 16];
                state.rng.fill_bytes(&mut bytes);
                let nonce = Nonce::new(format!("0x{}", hex::encode(bytes)))
                    .map_err(|e| TransportError::Protocol {
                        node: Some(node.clone()),
                        message: e.to_string(),
                    })?;
                state
                    .outstanding_nonces
                    .entry(node.clone())
                    .or_default()
                    .insert(nonce.clone());
                Ok(nonce)
            }
        }
    }

    async fn request_session_credential(
        &self,
        node: &NodeId,
        proof: &AuthorizationProof,
    ) -> Result<NodeCredential, TransportError> {
        self.state.lock().credential_requests += 1;
        let behavior = self.behavior(node)?;
        match &behavior {
            NodeBehavior::Unreachable => Err(TransportError::Unreachable {
                node: node.clone(),
                reason: "connection refused".to_string(),
            }),
            NodeBehavior::StallCredential => std::future::pending().await,
            NodeBehavior::RejectCredential(diagnostic) => {
                verify_proof(proof).map_err(|e| Self::rejected(node, e.to_string()))?;
                Err(Self::rejected(node, diagnostic.clone()))
            }
            _ => self.issue_credential(node, proof, &behavior),
        }
    }

    async fn execute_via_quorum(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, TransportError> {
        let rejection = {
            let mut state = self.state.lock();
            state.executions.push(request.clone());
            state.execution_rejection.clone()
        };
        if let Some(diagnostic) = rejection {
            return Err(TransportError::Rejected {
                node: request.authorizations.first().map(|a| a.credential.node.clone()),
                diagnostic,
            });
        }
        if Sha256Addressing.content_id(&request.code) != request.content_id {
            return Err(TransportError::Rejected {
                node: None,
                diagnostic: "content identifier does not match code".to_string(),
            });
        }

        let digest = params_digest(&request.params).map_err(|e| TransportError::Protocol {
            node: None,
            message: e.to_string(),
        })?;
        let mut responding = Vec::new();
        for auth in &request.authorizations {
            self.check_authorization(&request, &digest, auth)?;
            if !responding.contains(&auth.credential.node) {
                responding.push(auth.credential.node.clone());
            }
        }
        if responding.len() < self.threshold {
            return Err(TransportError::Rejected {
                node: None,
                diagnostic: format!(
                    "{} of {} required authorizations",
                    responding.len(),
                    self.threshold
                ),
            });
        }

        Ok(ExecutionResult {
            success: true,
            response: serde_json::json!({
                "content_id": request.content_id.to_string(),
                "params": request.params,
            }),
            logs: String::new(),
            responding_nodes: responding,
        })
    }
}
