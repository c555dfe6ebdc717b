//! Dispatch under negotiated credentials

use assert_matches::assert_matches;
use serde_json::json;
use std::time::Duration;
use tessera_core::{
    AbilityKind, AuthorizationProof, CapabilityGrant, CapabilitySet, ContentAddressing,
    DelegationBuilder, QuorumTransport, ResourceId, ScopeKind, Sha256Addressing, TesseraError,
    TransportError,
};
use tessera_testkit::TestHarness;

const CODE: &[u8] = b"const go = async () => { LitActions.setResponse({ response: 'ok' }) }; go();";
const OTHER_CODE: &[u8] = b"const go = async () => { LitActions.setResponse({ response: 'other' }) }; go();";

#[tokio::test(start_paused = true)]
async fn test_dispatch_executes_authorized_payload() {
    let harness = TestHarness::new(5, 4);
    let client = harness.client();
    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();

    let result = client
        .execute_with(CODE, json!({ "amount": 3 }), &set)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.responding_nodes.len(), 5);
    assert_eq!(result.response["params"]["amount"], 3);
    let request = harness.quorum.executions().pop().unwrap();
    assert_eq!(request.content_id, Sha256Addressing.content_id(CODE));
    assert_eq!(request.round_id, set.round_id());
    assert!(request
        .authorizations
        .iter()
        .all(|a| a.session_public_key == set.session_key().public_key_hex()));
}

#[tokio::test(start_paused = true)]
async fn test_scope_mismatch_makes_no_network_call() {
    let harness = TestHarness::new(5, 4);
    let client = harness.client();
    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();
    let calls_before = harness.quorum.total_calls();

    let err = client
        .execute_with(OTHER_CODE, json!({}), &set)
        .await
        .unwrap_err();

    assert_matches!(
        err,
        TesseraError::ScopeMismatch { content_id, ref authorized }
            if content_id == Sha256Addressing.content_id(OTHER_CODE) && authorized.len() == 1
    );
    assert_eq!(harness.quorum.total_calls(), calls_before);
    assert_eq!(harness.quorum.execute_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_identifier_binds_exact_bytes() {
    let harness = TestHarness::new(3, 2);
    let client = harness.client();
    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();

    let mut padded = CODE.to_vec();
    padded.push(b'\n');
    let err = client.execute_with(&padded, json!({}), &set).await.unwrap_err();
    assert_matches!(err, TesseraError::ScopeMismatch { .. });
    assert_eq!(harness.quorum.execute_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wildcard_session_authorizes_any_payload() {
    let harness = TestHarness::new(3, 2);
    let client = harness.client();
    let wildcard = CapabilitySet::new(vec![CapabilityGrant::build(
        ResourceId::Wildcard,
        AbilityKind::ExecuteAction,
        ScopeKind::Unscoped,
    )])
    .unwrap();
    let set = client.negotiate(&wildcard).await.unwrap();

    for code in [CODE, OTHER_CODE] {
        let result = client.execute_with(code, json!(null), &set).await.unwrap();
        assert!(result.success);
    }
    assert_eq!(harness.quorum.execute_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_signing_grant_does_not_authorize_execution() {
    let harness = TestHarness::new(3, 2);
    let client = harness.client();
    let signing_only = CapabilitySet::new(vec![CapabilityGrant::build(
        ResourceId::Wildcard,
        AbilityKind::SignWithIdentity,
        ScopeKind::SignAnything,
    )])
    .unwrap();
    let set = client.negotiate(&signing_only).await.unwrap();

    let err = client.execute_with(CODE, json!({}), &set).await.unwrap_err();
    assert_matches!(err, TesseraError::ScopeMismatch { .. });
}

#[tokio::test(start_paused = true)]
async fn test_expired_credentials_rejected_locally() {
    let harness = TestHarness::new(5, 4);
    let client = harness.client();
    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();

    // inside the configured 30s skew of the 600s expiry
    harness.clock.advance(Duration::from_secs(580));
    let err = client.execute_with(CODE, json!({}), &set).await.unwrap_err();

    assert_matches!(
        err,
        TesseraError::CredentialExpired { expired_at, .. } if expired_at == set.expires_at()
    );
    assert_eq!(harness.quorum.execute_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_node_rejection_during_execution_carries_node() {
    let harness = TestHarness::new(3, 2);
    let client = harness.client();
    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();
    harness
        .quorum
        .reject_executions(Some("resource id not found in delegated capabilities"));

    let err = client.execute_with(CODE, json!({}), &set).await.unwrap_err();

    assert_matches!(
        err,
        TesseraError::AuthorizationRejected { node: Some(_), ref diagnostic }
            if diagnostic.contains("resource id not found")
    );
}

#[tokio::test(start_paused = true)]
async fn test_proofs_cannot_be_replayed() {
    let harness = TestHarness::new(3, 2);
    let client = harness.client();
    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();
    let credential = set.credentials().next().unwrap();

    let replay = harness
        .quorum
        .request_session_credential(&credential.node, &credential.proof)
        .await;
    assert_matches!(
        replay,
        Err(TransportError::Rejected { ref diagnostic, .. }) if diagnostic.contains("nonce")
    );
}

#[tokio::test(start_paused = true)]
async fn test_altered_proof_rejected_by_node() {
    let harness = TestHarness::new(3, 2);
    let client = harness.client();
    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();
    let original = &set.credentials().next().unwrap().proof;
    let node = harness.quorum.node(1);
    let nonce = harness.quorum.get_freshness_nonce(&node).await.unwrap();

    // same signature, different payload
    let message = DelegationBuilder::new(original.address().clone())
        .origin(original.message().origin())
        .nonce(nonce)
        .issued_at(original.message().issued_at())
        .expires_at(original.message().expires_at())
        .grants(&client.execution_capabilities(OTHER_CODE))
        .build()
        .unwrap();
    let forged = AuthorizationProof::new(
        message,
        original.signature().to_vec(),
        original.derivation_method(),
    );

    let result = harness.quorum.request_session_credential(&node, &forged).await;
    assert_matches!(result, Err(TransportError::Rejected { .. }));
}
