//! Tessera Core
//!
//! Leaf crate of the Tessera workspace. It defines the values that flow
//! through the session-authorization protocol and the traits behind which
//! external collaborators live:
//!
//! - **Capability model**: `(resource, ability, scope)` grants bound to
//!   content identifiers ([`capability`], [`content`])
//! - **Delegation messages**: canonical, byte-exact authorization text and
//!   signed proofs over it ([`delegation`], [`proof`])
//! - **Collaborators**: signer, quorum transport and identity registry
//!   ([`effects`])
//! - **Ambient**: unified errors, identifiers, time and configuration
//!
//! The protocol itself (negotiation, credential sets, dispatch) lives in
//! `tessera-session`.

pub mod capability;
pub mod config;
pub mod content;
pub mod delegation;
pub mod effects;
pub mod errors;
pub mod identifiers;
pub mod proof;
pub mod time;

pub use capability::{
    resource_for_code, AbilityKind, CapabilityGrant, CapabilitySet, ResourceId, ScopeKind,
};
pub use config::{ClientConfig, ExpiryBounds, KeySource, NetworkConfig, NodeEndpoint, RetryConfig};
pub use content::{ContentAddressing, ContentId, Sha256Addressing};
pub use delegation::{DelegationBuilder, DelegationMessage};
pub use effects::{
    ExecutionRequest, ExecutionResult, IdentityHandle, IdentityRegistry, NodeCredential,
    NodeExecutionAuth, QuorumMembership, QuorumTransport, RegistryError, SignerEffects,
    SignerError, TransportError,
};
pub use errors::{ErrorKind, NodeFailure, NodeFailureReason, Result, TesseraError};
pub use identifiers::{Address, NodeId, Nonce, RoundId};
pub use proof::AuthorizationProof;
pub use time::{Clock, SystemClock, Timestamp};
