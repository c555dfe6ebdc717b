//! Action dispatch
//!
//! Before anything reaches the network the dispatcher recomputes the content
//! identifier from the exact bytes it was handed, checks that the credential
//! set authorizes that identifier, and checks expiry. Only then does it sign
//! a fresh execution envelope per node with the round's session key and hand
//! the request to the transport.
//!
//! The envelope binds the round, the node, the payload and a digest of the
//! parameters, so a node can check that the execution request comes from the
//! holder of the session key its credential was delegated to. The long-term
//! proofs are never resent as a second authorization.

use crate::credentials::SessionCredentialSet;
use std::time::Duration;
use tessera_core::content::digest;
use tessera_core::{
    Clock, ContentAddressing, ContentId, ExecutionRequest, ExecutionResult, NodeExecutionAuth,
    NodeId, Result, RoundId, TesseraError, Timestamp, TransportError,
};
use tracing::{debug, info, warn};

/// Envelope format version
pub const ENVELOPE_VERSION: &str = "tessera-execute:v1";

/// Hex SHA-256 of the compact JSON encoding of `params`
pub fn params_digest(params: &serde_json::Value) -> Result<String> {
    Ok(hex::encode(digest(&serde_json::to_vec(params)?)))
}

/// Text signed by the session key to authorize one execution on one node
pub fn execution_envelope(
    round_id: RoundId,
    node: &NodeId,
    content_id: &ContentId,
    params_digest: &str,
    expires_at: Timestamp,
) -> String {
    [
        ENVELOPE_VERSION.to_string(),
        format!("round:{round_id}"),
        format!("node:{node}"),
        format!("content:{content_id}"),
        format!("params:{params_digest}"),
        format!("expires:{expires_at}"),
    ]
    .join("\n")
}

/// Sends authorized execution requests to the quorum
pub struct ActionDispatcher<'a, T, C, A: ?Sized> {
    transport: &'a T,
    clock: &'a C,
    addresser: &'a A,
    clock_skew: Duration,
}

impl<'a, T, C, A> ActionDispatcher<'a, T, C, A>
where
    T: tessera_core::QuorumTransport,
    C: Clock,
    A: ContentAddressing + ?Sized,
{
    /// Dispatcher over borrowed collaborators
    pub fn new(transport: &'a T, clock: &'a C, addresser: &'a A, clock_skew: Duration) -> Self {
        Self {
            transport,
            clock,
            addresser,
            clock_skew,
        }
    }

    /// Execute `code` with `params` under `credentials`.
    ///
    /// Fails with [`TesseraError::ScopeMismatch`] or
    /// [`TesseraError::CredentialExpired`] without contacting the network.
    pub async fn dispatch(
        &self,
        code: &[u8],
        params: serde_json::Value,
        credentials: &SessionCredentialSet,
    ) -> Result<ExecutionResult> {
        let content_id = self.addresser.content_id(code);
        if !credentials.authorizes_execution(&content_id) {
            warn!(
                round = %credentials.round_id(),
                %content_id,
                "credentials do not authorize this payload"
            );
            return Err(TesseraError::scope_mismatch(
                content_id,
                credentials.capabilities().resource_uris(),
            ));
        }

        let now = self.clock.now();
        credentials.ensure_valid_at(now, self.clock_skew)?;

        let params_digest = params_digest(&params)?;
        let session_key = credentials.session_key();
        let session_public_key = session_key.public_key_hex();
        let authorizations: Vec<NodeExecutionAuth> = credentials
            .credentials()
            .map(|credential| {
                let envelope = execution_envelope(
                    credentials.round_id(),
                    &credential.node,
                    &content_id,
                    &params_digest,
                    credentials.expires_at(),
                );
                let signature = hex::encode(session_key.sign(envelope.as_bytes()));
                NodeExecutionAuth {
                    credential: credential.clone(),
                    session_public_key: session_public_key.clone(),
                    envelope,
                    signature,
                }
            })
            .collect();

        debug!(
            round = %credentials.round_id(),
            %content_id,
            nodes = authorizations.len(),
            "dispatching execution"
        );
        let request = ExecutionRequest {
            round_id: credentials.round_id(),
            content_id,
            code: code.to_vec(),
            params,
            authorizations,
        };

        match self.transport.execute_via_quorum(request).await {
            Ok(result) => {
                info!(
                    %content_id,
                    success = result.success,
                    responders = result.responding_nodes.len(),
                    "execution finished"
                );
                Ok(result)
            }
            Err(err) => {
                let rejected = matches!(err, TransportError::Rejected { .. });
                warn!(%content_id, rejected, error = %err, "execution failed");
                Err(err.into())
            }
        }
    }
}
