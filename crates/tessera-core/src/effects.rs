//! Collaborator trait definitions
//!
//! The protocol core talks to three external collaborators, each behind a
//! narrow trait:
//!
//! - [`SignerEffects`]: the long-term key custodian
//! - [`QuorumTransport`]: JSON-RPC access to the quorum nodes
//! - [`IdentityRegistry`]: the registry that mints delegated identities
//!
//! No code in the workspace holds an untyped handle to any of them.

use crate::content::ContentId;
use crate::errors::TesseraError;
use crate::identifiers::{Address, NodeId, Nonce, RoundId};
use crate::proof::AuthorizationProof;
use crate::time::Timestamp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Key custodian errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SignerError {
    /// The custodian cannot be reached or the key is locked
    #[error("Signer unavailable: {reason}")]
    Unavailable {
        /// Reason for the failure
        reason: String,
    },
    /// A human or policy declined the request
    #[error("Signing declined: {reason}")]
    Declined {
        /// Reason for the refusal
        reason: String,
    },
}

impl From<SignerError> for TesseraError {
    fn from(err: SignerError) -> Self {
        TesseraError::signing_failed(err.to_string())
    }
}

/// Long-term key custodian
#[async_trait]
pub trait SignerEffects: Send + Sync {
    /// Address of the key
    async fn address(&self) -> Result<Address, SignerError>;

    /// Sign arbitrary bytes
    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError>;

    /// Label for how signatures are derived, recorded in each proof
    fn derivation_method(&self) -> &str;
}

#[async_trait]
impl<T: SignerEffects + ?Sized> SignerEffects for Arc<T> {
    async fn address(&self) -> Result<Address, SignerError> {
        (**self).address().await
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        (**self).sign(message).await
    }

    fn derivation_method(&self) -> &str {
        (**self).derivation_method()
    }
}

/// Transport errors, reported per node where possible
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum TransportError {
    /// Node could not be reached
    #[error("Node {node} unreachable: {reason}")]
    Unreachable {
        /// Target node
        node: NodeId,
        /// Reason for the failure
        reason: String,
    },
    /// Node did not respond in time
    #[error("Node {node} timed out after {timeout_ms}ms")]
    Timeout {
        /// Target node
        node: NodeId,
        /// Elapsed timeout
        timeout_ms: u64,
    },
    /// Node validated the request and refused it
    #[error("Node {} rejected request: {diagnostic}", .node.as_ref().map(|n| n.as_str()).unwrap_or("quorum"))]
    Rejected {
        /// Rejecting node, if identifiable
        node: Option<NodeId>,
        /// Node-supplied diagnostic
        diagnostic: String,
    },
    /// Response could not be decoded or violated the protocol
    #[error("Protocol error: {message}")]
    Protocol {
        /// Originating node, if identifiable
        node: Option<NodeId>,
        /// Error message
        message: String,
    },
    /// No quorum information is available
    #[error("Quorum discovery failed: {reason}")]
    Discovery {
        /// Reason for the failure
        reason: String,
    },
}

impl From<TransportError> for TesseraError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected { node, diagnostic } => {
                TesseraError::authorization_rejected(node, diagnostic)
            }
            TransportError::Unreachable { ref node, .. } | TransportError::Timeout { ref node, .. } => {
                TesseraError::transport(Some(node.clone()), err.to_string())
            }
            TransportError::Protocol { node, message } => TesseraError::transport(node, message),
            TransportError::Discovery { reason } => TesseraError::transport(None, reason),
        }
    }
}

/// Current quorum composition as reported by the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumMembership {
    /// Members contacted in every round
    pub members: Vec<NodeId>,
    /// Alternates used when a member fails to supply a nonce in time
    pub standby: Vec<NodeId>,
    /// Number of valid credentials required
    pub threshold: usize,
}

impl QuorumMembership {
    /// Membership without standby nodes
    pub fn new(members: Vec<NodeId>, threshold: usize) -> Self {
        Self {
            members,
            standby: Vec::new(),
            threshold,
        }
    }
}

/// A per-node session credential.
///
/// Each credential embeds the node-specific proof it was issued against so
/// that a credential set can be audited for round consistency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCredential {
    /// Issuing node
    pub node: NodeId,
    /// Opaque session token
    pub token: String,
    /// Proof the node validated before issuing
    pub proof: AuthorizationProof,
    /// Issuance time reported by the node
    pub issued_at: Timestamp,
    /// Expiry reported by the node; never later than the proof's expiry
    pub expires_at: Timestamp,
}

/// Execution-scoped authorization for one node.
///
/// Signed by the round's ephemeral session key over an envelope naming the
/// node, the payload and a digest of the parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExecutionAuth {
    /// Session credential for the node
    pub credential: NodeCredential,
    /// Hex-encoded session public key
    pub session_public_key: String,
    /// Envelope text that was signed
    pub envelope: String,
    /// Hex-encoded session key signature over `envelope`
    pub signature: String,
}

/// A request to execute content-addressed code on the quorum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Round the credentials come from
    pub round_id: RoundId,
    /// Identifier of `code`
    pub content_id: ContentId,
    /// Exact bytes to execute
    pub code: Vec<u8>,
    /// Parameters passed to the code
    pub params: serde_json::Value,
    /// One authorization per participating node
    pub authorizations: Vec<NodeExecutionAuth>,
}

/// Combined result returned by the quorum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the quorum reported success
    pub success: bool,
    /// Response payload
    pub response: serde_json::Value,
    /// Captured logs, if any
    pub logs: String,
    /// Nodes that contributed to the result
    pub responding_nodes: Vec<NodeId>,
}

/// Access to the quorum nodes
#[async_trait]
pub trait QuorumTransport: Send + Sync {
    /// Current quorum composition and threshold
    async fn list_quorum_nodes(&self) -> Result<QuorumMembership, TransportError>;

    /// Fresh nonce from `node` for one delegation message
    async fn get_freshness_nonce(&self, node: &NodeId) -> Result<Nonce, TransportError>;

    /// Exchange a proof for a session credential
    async fn request_session_credential(
        &self,
        node: &NodeId,
        proof: &AuthorizationProof,
    ) -> Result<NodeCredential, TransportError>;

    /// Run code on the quorum; threshold execution happens behind this call
    async fn execute_via_quorum(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, TransportError>;
}

#[async_trait]
impl<T: QuorumTransport + ?Sized> QuorumTransport for Arc<T> {
    async fn list_quorum_nodes(&self) -> Result<QuorumMembership, TransportError> {
        (**self).list_quorum_nodes().await
    }

    async fn get_freshness_nonce(&self, node: &NodeId) -> Result<Nonce, TransportError> {
        (**self).get_freshness_nonce(node).await
    }

    async fn request_session_credential(
        &self,
        node: &NodeId,
        proof: &AuthorizationProof,
    ) -> Result<NodeCredential, TransportError> {
        (**self).request_session_credential(node, proof).await
    }

    async fn execute_via_quorum(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, TransportError> {
        (**self).execute_via_quorum(request).await
    }
}

/// Handle to a minted delegated identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHandle {
    /// Registry token identifier
    pub token_id: String,
    /// Hex-encoded public key of the identity
    pub public_key: String,
    /// Address of the identity
    pub address: Address,
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum RegistryError {
    /// The registry refused to mint
    #[error("Mint rejected: {reason}")]
    Rejected {
        /// Reason for the refusal
        reason: String,
    },
    /// The registry could not be reached
    #[error("Registry unavailable: {reason}")]
    Unavailable {
        /// Reason for the failure
        reason: String,
    },
}

impl From<RegistryError> for TesseraError {
    fn from(err: RegistryError) -> Self {
        TesseraError::registry(err.to_string())
    }
}

/// Registry that mints long-lived delegated identities
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    /// Mint an identity controlled by the proof's signer
    async fn mint_delegated_identity(
        &self,
        proof: &AuthorizationProof,
    ) -> Result<IdentityHandle, RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_transport_errors_map_to_taxonomy() {
        let rejected: TesseraError = TransportError::Rejected {
            node: Some(NodeId::new("n1")),
            diagnostic: "resource id not found in capabilities".into(),
        }
        .into();
        assert_eq!(rejected.kind(), ErrorKind::AuthorizationRejected);
        assert_eq!(rejected.node(), Some(&NodeId::new("n1")));

        let timeout: TesseraError = TransportError::Timeout {
            node: NodeId::new("n2"),
            timeout_ms: 100,
        }
        .into();
        assert_eq!(timeout.kind(), ErrorKind::Transport);
        assert_eq!(timeout.node(), Some(&NodeId::new("n2")));

        let discovery: TesseraError = TransportError::Discovery {
            reason: "no peers".into(),
        }
        .into();
        assert!(discovery.is_retryable());
    }

    #[test]
    fn test_signer_errors_map_to_signing_failed() {
        let err: TesseraError = SignerError::Declined {
            reason: "user cancelled".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::SigningFailed);
        assert!(!err.is_retryable());
    }
}
