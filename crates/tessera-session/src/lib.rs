//! Tessera Session
//!
//! Negotiates capability-scoped session credentials with a threshold quorum
//! and dispatches execution requests under them.
//!
//! A negotiation round binds one ephemeral session key, one validity window
//! and one capability set to a freshness nonce per quorum member, signs one
//! delegation per member with the long-term key and collects a credential
//! from each. Credentials from different rounds are never combined, and
//! dispatch refuses any payload the credentials were not negotiated for
//! before the network is contacted.
//!
//! Most callers only need [`QuorumClient`].

pub mod client;
pub mod credentials;
pub mod dispatcher;
pub mod keys;
pub mod negotiator;
pub mod provisioning;
pub mod retry;
pub mod round;
pub mod session_key;
pub mod signing;

pub use client::QuorumClient;
pub use credentials::{SessionCache, SessionCredentialSet};
pub use dispatcher::{execution_envelope, params_digest, ActionDispatcher};
pub use keys::{verify_proof, LocalKeySigner, ED25519_DERIVATION};
pub use negotiator::SessionNegotiator;
pub use provisioning::provisioning_grants;
pub use retry::RetryPolicy;
pub use round::{CompletedRound, NegotiationPhase, NegotiationRound, RoundPolicy, RoundRecord};
pub use session_key::SessionKeyPair;
pub use signing::SignatureProvider;
