//! Unified error system for Tessera
//!
//! A single error type shared by every crate in the workspace. Variants carry
//! enough structure (kind plus originating node, where there is one) for a
//! caller to tell a malformed authorization apart from an unavailable
//! network.

use crate::content::ContentId;
use crate::identifiers::NodeId;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a single quorum member did not contribute to a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeFailureReason {
    /// The node did not answer within the per-node timeout
    Timeout,
    /// The node could not be reached at all
    Unreachable(String),
    /// The node validated the delegation but refused the requested capability
    Rejected(String),
    /// The node answered with a credential that failed local validation
    InvalidCredential(String),
    /// The request was still pending when the round deadline elapsed
    Cancelled,
}

/// A structured per-node failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    /// The member that failed
    pub node: NodeId,
    /// What went wrong
    pub reason: NodeFailureReason,
}

impl NodeFailure {
    /// Create a new node failure record
    pub fn new(node: NodeId, reason: NodeFailureReason) -> Self {
        Self { node, reason }
    }

    /// Whether the node explicitly rejected the requested capability
    pub fn is_rejection(&self) -> bool {
        matches!(self.reason, NodeFailureReason::Rejected(_))
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            NodeFailureReason::Timeout => write!(f, "{}: timed out", self.node),
            NodeFailureReason::Unreachable(reason) => {
                write!(f, "{}: unreachable ({reason})", self.node)
            }
            NodeFailureReason::Rejected(diagnostic) => {
                write!(f, "{}: rejected ({diagnostic})", self.node)
            }
            NodeFailureReason::InvalidCredential(reason) => {
                write!(f, "{}: invalid credential ({reason})", self.node)
            }
            NodeFailureReason::Cancelled => write!(f, "{}: cancelled at deadline", self.node),
        }
    }
}

/// Coarse classification of [`TesseraError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Key custodian unavailable or declined
    SigningFailed,
    /// Threshold not met before the round deadline
    QuorumUnreachable,
    /// Local scope invariant violated before any network call
    ScopeMismatch,
    /// A node refused the requested capability
    AuthorizationRejected,
    /// Credentials were past their validity window
    CredentialExpired,
    /// Credentials from different negotiation rounds were combined
    RoundMismatch,
    /// A delegation message could not be built or parsed
    InvalidDelegation,
    /// Transport collaborator failure
    Transport,
    /// Identity registry failure
    Registry,
    /// Invalid configuration
    Config,
    /// Internal invariant failure
    Internal,
}

/// Unified error type for all Tessera operations
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum TesseraError {
    /// The long-term key custodian is unavailable or declined to sign
    #[error("Signing failed: {reason}")]
    SigningFailed {
        /// Reason reported by the custodian
        reason: String,
    },

    /// Fewer than `threshold` members produced a valid credential in time
    #[error(
        "Quorum unreachable: {responded}/{quorum_size} valid responses, threshold {threshold}"
    )]
    QuorumUnreachable {
        /// Required number of valid credentials
        threshold: usize,
        /// Number of valid credentials actually collected
        responded: usize,
        /// Number of members contacted
        quorum_size: usize,
        /// Per-node failures observed during the round
        failures: Vec<NodeFailure>,
    },

    /// The credentials do not authorize execution of this exact payload
    #[error("Scope mismatch: credentials do not authorize execution of {content_id} (authorized: {authorized:?})")]
    ScopeMismatch {
        /// Identifier computed from the code about to be dispatched
        content_id: ContentId,
        /// Resource URIs the credentials were negotiated for
        authorized: Vec<String>,
    },

    /// A node validated the request but refused the requested capability
    #[error("Authorization rejected by {}: {diagnostic}", .node.as_ref().map(|n| n.as_str()).unwrap_or("quorum"))]
    AuthorizationRejected {
        /// Originating node, if the transport reported one
        node: Option<NodeId>,
        /// Node-supplied diagnostic
        diagnostic: String,
    },

    /// The credential set is past its validity window
    #[error("Credentials expired at {expired_at} (now {now})")]
    CredentialExpired {
        /// When the credential set stopped being valid
        expired_at: Timestamp,
        /// Clock reading at the time of the check
        now: Timestamp,
    },

    /// Credentials or proofs from different negotiation rounds were combined
    #[error("Round mismatch: {message}")]
    RoundMismatch {
        /// What did not line up
        message: String,
    },

    /// A delegation message was malformed or violated its construction rules
    #[error("Invalid delegation: {message}")]
    InvalidDelegation {
        /// Description of the violation
        message: String,
    },

    /// Transport collaborator failure outside of a quorum round
    #[error("Transport error{}: {message}", .node.as_ref().map(|n| format!(" ({n})")).unwrap_or_default())]
    Transport {
        /// Originating node, if any
        node: Option<NodeId>,
        /// Error message
        message: String,
    },

    /// Identity registry failure
    #[error("Registry error: {message}")]
    Registry {
        /// Error message
        message: String,
    },

    /// Invalid configuration
    #[error("Config error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Internal invariant failure
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl TesseraError {
    /// Create a signing failure
    pub fn signing_failed(reason: impl Into<String>) -> Self {
        Self::SigningFailed {
            reason: reason.into(),
        }
    }

    /// Create a quorum failure
    pub fn quorum_unreachable(
        threshold: usize,
        responded: usize,
        quorum_size: usize,
        failures: Vec<NodeFailure>,
    ) -> Self {
        Self::QuorumUnreachable {
            threshold,
            responded,
            quorum_size,
            failures,
        }
    }

    /// Create a scope mismatch error
    pub fn scope_mismatch(content_id: ContentId, authorized: Vec<String>) -> Self {
        Self::ScopeMismatch {
            content_id,
            authorized,
        }
    }

    /// Create an authorization rejection
    pub fn authorization_rejected(node: Option<NodeId>, diagnostic: impl Into<String>) -> Self {
        Self::AuthorizationRejected {
            node,
            diagnostic: diagnostic.into(),
        }
    }

    /// Create an expiry error
    pub fn credential_expired(expired_at: Timestamp, now: Timestamp) -> Self {
        Self::CredentialExpired { expired_at, now }
    }

    /// Create a round mismatch error
    pub fn round_mismatch(message: impl Into<String>) -> Self {
        Self::RoundMismatch {
            message: message.into(),
        }
    }

    /// Create an invalid delegation error
    pub fn invalid_delegation(message: impl Into<String>) -> Self {
        Self::InvalidDelegation {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(node: Option<NodeId>, message: impl Into<String>) -> Self {
        Self::Transport {
            node,
            message: message.into(),
        }
    }

    /// Create a registry error
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Coarse classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SigningFailed { .. } => ErrorKind::SigningFailed,
            Self::QuorumUnreachable { .. } => ErrorKind::QuorumUnreachable,
            Self::ScopeMismatch { .. } => ErrorKind::ScopeMismatch,
            Self::AuthorizationRejected { .. } => ErrorKind::AuthorizationRejected,
            Self::CredentialExpired { .. } => ErrorKind::CredentialExpired,
            Self::RoundMismatch { .. } => ErrorKind::RoundMismatch,
            Self::InvalidDelegation { .. } => ErrorKind::InvalidDelegation,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Registry { .. } => ErrorKind::Registry,
            Self::Config { .. } => ErrorKind::Config,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// The node this error originated from, if any
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Self::AuthorizationRejected { node, .. } | Self::Transport { node, .. } => {
                node.as_ref()
            }
            _ => None,
        }
    }

    /// Whether a caller may retry with a brand-new round.
    ///
    /// Only network availability problems qualify. Signing, scope and
    /// rejection failures need a human or a code fix first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QuorumUnreachable { .. } => true,
            Self::Transport { node, .. } => node.is_none(),
            _ => false,
        }
    }
}

/// Standard Result type for Tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;

impl From<std::io::Error> for TesseraError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization: {err}"))
    }
}
