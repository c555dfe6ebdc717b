//! End-to-end client behaviour: caching, renegotiation, retry and
//! provisioning

use assert_matches::assert_matches;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    AbilityKind, ClientConfig, ScopeKind, Sha256Addressing, TesseraError, Timestamp,
};
use tessera_session::QuorumClient;
use tessera_testkit::{
    test_config, ManualClock, MockQuorum, MockRegistry, NodeBehavior, TestClient, TestHarness,
    TestSigner, TEST_EPOCH_MS,
};

const CODE: &[u8] = b"const go = async () => { LitActions.setResponse({ response: 'ok' }) }; go();";
const OTHER_CODE: &[u8] = b"const go = async () => { LitActions.setResponse({ response: 'other' }) }; go();";

#[tokio::test(start_paused = true)]
async fn test_execute_reuses_cached_session() {
    let harness = TestHarness::new(5, 4);
    let client = harness.client();

    client.execute(CODE, json!({ "n": 1 })).await.unwrap();
    client.execute(CODE, json!({ "n": 2 })).await.unwrap();

    assert_eq!(harness.quorum.credential_requests(), 5);
    assert_eq!(harness.quorum.execute_calls(), 2);
    assert_eq!(harness.signer.sign_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_new_payload_negotiates_new_round() {
    let harness = TestHarness::new(5, 4);
    let client = harness.client();

    client.execute(CODE, json!({})).await.unwrap();
    let first = client.cached_session().unwrap();
    client.execute(OTHER_CODE, json!({})).await.unwrap();
    let second = client.cached_session().unwrap();

    assert_ne!(first.round_id(), second.round_id());
    assert_eq!(harness.quorum.credential_requests(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_renegotiates_once_credentials_near_expiry() {
    let harness = TestHarness::new(5, 4);
    let client = harness.client();

    client.execute(CODE, json!({})).await.unwrap();
    let first = client.cached_session().unwrap();
    harness.clock.advance(Duration::from_secs(590));
    client.execute(CODE, json!({})).await.unwrap();
    let second = client.cached_session().unwrap();

    assert_ne!(first.round_id(), second.round_id());
    assert!(second.expires_at() > first.expires_at());
    assert_eq!(harness.quorum.execute_calls(), 2);
}

/// Client whose clock is separate from the quorum's, so the client's
/// readings can be stepped without the nodes seeing it
fn client_with_own_clock(clock: Arc<ManualClock>) -> (TestClient, Arc<MockQuorum>) {
    let quorum = Arc::new(MockQuorum::new(5, 4, Arc::new(ManualClock::at_test_epoch())));
    let client = QuorumClient::with_effects(
        test_config(),
        Arc::new(TestSigner::from_seed([21; 32])),
        quorum.clone(),
        clock,
        Sha256Addressing,
    )
    .unwrap();
    (client, quorum)
}

fn seconds_after_epoch(secs: i64) -> Timestamp {
    Timestamp::from_millis(TEST_EPOCH_MS + secs * 1_000).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_expiry_between_cache_check_and_dispatch_renegotiates_once() {
    let clock = Arc::new(ManualClock::at_test_epoch());
    let (client, quorum) = client_with_own_clock(clock.clone());
    let first = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();

    // valid at the cache check (560s + 30s skew), expired one read later
    clock.set(seconds_after_epoch(560));
    clock.advance_on_read(Duration::from_secs(20));
    let result = client.execute(CODE, json!({ "n": 1 })).await.unwrap();

    assert!(result.success);
    assert_eq!(quorum.credential_requests(), 10);
    assert_eq!(quorum.execute_calls(), 1);
    let second = client.cached_session().unwrap();
    assert_ne!(first.round_id(), second.round_id());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_expiry_at_dispatch_is_reported() {
    let clock = Arc::new(ManualClock::at_test_epoch());
    let (client, quorum) = client_with_own_clock(clock.clone());
    client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();

    // the renegotiated set is already stale by the time it is dispatched
    clock.set(seconds_after_epoch(560));
    clock.advance_on_read(Duration::from_secs(100));
    let err = client.execute(CODE, json!({})).await.unwrap_err();

    assert_matches!(err, TesseraError::CredentialExpired { .. });
    assert_eq!(quorum.credential_requests(), 10);
    assert_eq!(quorum.execute_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_runs_fresh_rounds_until_budget_exhausted() {
    let mut harness = TestHarness::new(5, 4);
    harness.config.retry.max_attempts = 2;
    for position in [1, 2] {
        harness
            .quorum
            .set_behavior(&harness.quorum.node(position), NodeBehavior::Unreachable);
    }
    let client = harness.client();

    let err = client.execute(CODE, json!({})).await.unwrap_err();

    assert_matches!(err, TesseraError::QuorumUnreachable { responded: 3, .. });
    assert_eq!(harness.quorum.nonce_requests(), 15);
    assert_eq!(harness.signer.sign_count(), 0);
    assert_eq!(harness.quorum.execute_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_when_quorum_heals() {
    let mut harness = TestHarness::new(3, 3);
    harness.config.retry.max_attempts = 3;
    let flaky = harness.quorum.node(3);
    harness.quorum.set_behavior(&flaky, NodeBehavior::StallCredential);
    let client = harness.client();
    let caps = client.execution_capabilities(CODE);

    let quorum = harness.quorum.clone();
    let healer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(6)).await;
        quorum.set_behavior(&flaky, NodeBehavior::Healthy);
    });
    let set = client.negotiate_with_retry(&caps).await.unwrap();
    healer.await.unwrap();

    assert_eq!(set.len(), 3);
    assert!(harness.signer.sign_count() > 3);
}

#[tokio::test(start_paused = true)]
async fn test_provision_identity_signs_wildcard_signing_grant() {
    let harness = TestHarness::new(3, 2);
    let client = harness.client();
    let registry = MockRegistry::new();

    let handle = client.provision_identity(&registry).await.unwrap();

    let minted = registry.minted();
    assert_eq!(minted.len(), 1);
    assert_eq!(minted[0].0, handle);
    let message = minted[0].1.message();
    assert_eq!(message.address(), &harness.signer.address());
    assert_eq!(message.origin(), "https://localhost/");
    let grants = message.grants().grants();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].ability, AbilityKind::SignWithIdentity);
    assert_eq!(grants[0].scope, ScopeKind::SignAnything);
    assert_eq!(harness.signer.sign_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_skips_unreachable_nodes_and_reports_registry_errors() {
    let harness = TestHarness::new(3, 2);
    harness
        .quorum
        .set_behavior(&harness.quorum.node(1), NodeBehavior::Unreachable);
    let client = harness.client();
    let registry = MockRegistry::new();
    registry.set_unavailable(true);

    let err = client.provision_identity(&registry).await.unwrap_err();

    assert_matches!(err, TesseraError::Registry { .. });
    assert_eq!(harness.quorum.nonce_requests(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_bounds_quorum_discovery() {
    let harness = TestHarness::new(3, 2);
    harness.quorum.stall_discovery(true);
    let client = harness.client();
    let registry = MockRegistry::new();

    let started = tokio::time::Instant::now();
    let err = client.provision_identity(&registry).await.unwrap_err();

    assert_matches!(err, TesseraError::Transport { node: None, .. });
    assert!(started.elapsed() <= harness.config.node_timeout());
    assert_eq!(harness.quorum.nonce_requests(), 0);
    assert!(registry.minted().is_empty());
}

#[test]
fn test_invalid_config_rejected_at_construction() {
    let config = ClientConfig {
        node_timeout_ms: 60_000,
        round_deadline_ms: 30_000,
        ..ClientConfig::default()
    };
    let harness = TestHarness::new(3, 2);
    let result = QuorumClient::new(
        config,
        TestSigner::from_seed([1; 32]),
        harness.quorum.clone(),
    );
    assert_matches!(result, Err(TesseraError::Config { .. }));
}
