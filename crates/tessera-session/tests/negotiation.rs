//! Negotiation rounds against a simulated quorum

use assert_matches::assert_matches;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tessera_core::{
    AbilityKind, Address, CapabilityGrant, CapabilitySet, NodeFailureReason, ResourceId,
    ScopeKind, Sha256Addressing, SignerEffects, SignerError, TesseraError,
};
use tessera_session::{verify_proof, LocalKeySigner, QuorumClient, ED25519_DERIVATION};
use tessera_testkit::{init_test_tracing, NodeBehavior, TestHarness};

const CODE: &[u8] = b"const go = async () => { LitActions.setResponse({ response: 'ok' }) }; go();";

/// Custodian that takes its time answering
struct SlowSigner {
    inner: LocalKeySigner,
    address_delay: Duration,
    sign_delay: Duration,
    sign_calls: AtomicUsize,
}

impl SlowSigner {
    fn new(address_delay: Duration, sign_delay: Duration) -> Self {
        Self {
            inner: LocalKeySigner::from_seed([11; 32]),
            address_delay,
            sign_delay,
            sign_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SignerEffects for SlowSigner {
    async fn address(&self) -> Result<Address, SignerError> {
        tokio::time::sleep(self.address_delay).await;
        Ok(self.inner.address())
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.sign_delay).await;
        SignerEffects::sign(&self.inner, message).await
    }

    fn derivation_method(&self) -> &str {
        ED25519_DERIVATION
    }
}

fn slow_client(
    harness: &TestHarness,
    signer: SlowSigner,
) -> QuorumClient<
    SlowSigner,
    std::sync::Arc<tessera_testkit::MockQuorum>,
    std::sync::Arc<tessera_testkit::ManualClock>,
> {
    QuorumClient::with_effects(
        harness.config.clone(),
        signer,
        harness.quorum.clone(),
        harness.clock.clone(),
        Sha256Addressing,
    )
    .unwrap()
}

fn wildcard_execution() -> CapabilitySet {
    CapabilitySet::new(vec![CapabilityGrant::build(
        ResourceId::Wildcard,
        AbilityKind::ExecuteAction,
        ScopeKind::Unscoped,
    )])
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_threshold_met_despite_one_stalled_member() {
    init_test_tracing();
    let harness = TestHarness::new(5, 4);
    let stalled = harness.quorum.node(5);
    harness
        .quorum
        .set_behavior(&stalled, NodeBehavior::StallCredential);
    let client = harness.client();

    let caps = client.execution_capabilities(CODE);
    let set = client.negotiate(&caps).await.unwrap();

    assert_eq!(set.len(), 4);
    assert_eq!(set.threshold(), 4);
    assert!(!set.nodes().any(|n| n == &stalled));
    assert_eq!(harness.signer.sign_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_two_stalled_members_make_quorum_unreachable() {
    let harness = TestHarness::new(5, 4);
    for position in [4, 5] {
        harness
            .quorum
            .set_behavior(&harness.quorum.node(position), NodeBehavior::StallCredential);
    }
    let client = harness.client();

    let caps = client.execution_capabilities(CODE);
    let err = client.negotiate(&caps).await.unwrap_err();

    assert_matches!(
        err,
        TesseraError::QuorumUnreachable {
            threshold: 4,
            responded: 3,
            quorum_size: 5,
            ref failures,
        } if failures.len() == 2
            && failures.iter().all(|f| f.reason == NodeFailureReason::Timeout)
    );
    assert!(err.is_retryable());
    assert!(client.cached_session().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_round_deadline_cancels_pending_requests() {
    let mut harness = TestHarness::new(5, 4);
    harness.config.round_deadline_ms = 8_000;
    harness.config.node_timeout_ms = 5_000;
    harness
        .quorum
        .set_behavior(&harness.quorum.node(5), NodeBehavior::StallNonce);
    harness
        .quorum
        .set_behavior(&harness.quorum.node(4), NodeBehavior::StallCredential);
    let client = harness.client();

    let caps = client.execution_capabilities(CODE);
    let err = client.negotiate(&caps).await.unwrap_err();

    let TesseraError::QuorumUnreachable { failures, .. } = &err else {
        panic!("expected QuorumUnreachable, got {err:?}");
    };
    let reasons: Vec<_> = failures.iter().map(|f| (f.node.as_str(), &f.reason)).collect();
    assert!(reasons.contains(&("node-5", &NodeFailureReason::Timeout)));
    assert!(reasons.contains(&("node-4", &NodeFailureReason::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn test_standby_replaces_unreachable_member() {
    let harness = TestHarness::with_standby(5, 1, 5);
    harness
        .quorum
        .set_behavior(&harness.quorum.node(2), NodeBehavior::Unreachable);
    let client = harness.client();

    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();

    let nodes: Vec<&str> = set.nodes().map(|n| n.as_str()).collect();
    assert_eq!(set.len(), 5);
    assert!(nodes.contains(&"standby-1"));
    assert!(!nodes.contains(&"node-2"));
}

#[tokio::test(start_paused = true)]
async fn test_every_proof_shares_round_values_and_has_its_own_nonce() {
    let harness = TestHarness::new(5, 4);
    let client = harness.client();

    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();

    let mut nonces = BTreeSet::new();
    for credential in set.credentials() {
        let message = credential.proof.message();
        verify_proof(&credential.proof).unwrap();
        assert_eq!(message.origin(), set.session_key().uri());
        assert_eq!(message.issued_at(), set.record().issued_at());
        assert_eq!(message.expires_at(), set.record().expires_at());
        assert!(message.grants().same_grants(set.capabilities()));
        assert_eq!(set.record().nonce_for(&credential.node), Some(message.nonce()));
        nonces.insert(message.nonce().clone());
    }
    assert_eq!(nonces.len(), set.len());
}

#[tokio::test(start_paused = true)]
async fn test_each_round_uses_fresh_session_key() {
    let harness = TestHarness::new(3, 2);
    let client = harness.client();
    let caps = client.execution_capabilities(CODE);

    let first = client.negotiate(&caps).await.unwrap();
    let second = client.negotiate(&caps).await.unwrap();

    assert_ne!(first.round_id(), second.round_id());
    assert_ne!(first.session_key().uri(), second.session_key().uri());
    let credential = second.credentials().next().unwrap();
    assert_matches!(
        first.record().check_credential(credential),
        Err(TesseraError::RoundMismatch { .. })
    );
}

#[tokio::test(start_paused = true)]
async fn test_declining_signer_is_asked_once() {
    let harness = TestHarness::new(5, 4);
    harness.signer.decline();
    let client = harness.client();

    let err = client
        .negotiate_with_retry(&client.execution_capabilities(CODE))
        .await
        .unwrap_err();

    assert_matches!(err, TesseraError::SigningFailed { .. });
    assert_eq!(harness.signer.sign_count(), 1);
    assert_eq!(harness.quorum.credential_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejections_that_sink_threshold_surface_as_rejection() {
    let harness = TestHarness::new(5, 4);
    for position in [1, 2] {
        harness.quorum.set_behavior(
            &harness.quorum.node(position),
            NodeBehavior::RejectCredential("capability not permitted for this account".into()),
        );
    }
    let client = harness.client();

    let err = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        TesseraError::AuthorizationRejected { node: Some(ref node), ref diagnostic }
            if ["node-1", "node-2"].contains(&node.as_str())
                && diagnostic.contains("not permitted")
    );
    assert!(!err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn test_single_rejection_within_tolerance() {
    let harness = TestHarness::new(5, 4);
    harness.quorum.set_behavior(
        &harness.quorum.node(3),
        NodeBehavior::RejectCredential("rate limited".into()),
    );
    let client = harness.client();

    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();
    assert_eq!(set.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_network_refusing_wildcards() {
    let harness = TestHarness::new(5, 4);
    harness.quorum.deny_wildcard(true);
    let client = harness.client();

    let err = client.negotiate(&wildcard_execution()).await.unwrap_err();
    assert_matches!(err, TesseraError::AuthorizationRejected { .. });

    let scoped = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();
    assert!(!scoped.capabilities().is_wildcard());
}

#[tokio::test(start_paused = true)]
async fn test_credentials_outliving_delegation_are_discarded() {
    let harness = TestHarness::new(5, 4);
    harness
        .quorum
        .set_behavior(&harness.quorum.node(1), NodeBehavior::ExtendExpiry);
    let client = harness.client();

    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();

    assert_eq!(set.len(), 4);
    assert!(set.credentials().all(|c| c.expires_at <= set.record().expires_at()));
}

#[tokio::test(start_paused = true)]
async fn test_configured_minimum_threshold_applies() {
    let mut harness = TestHarness::new(5, 3);
    harness.config.network.min_threshold = Some(5);
    harness
        .quorum
        .set_behavior(&harness.quorum.node(1), NodeBehavior::Unreachable);
    let client = harness.client();

    let err = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap_err();
    assert_matches!(err, TesseraError::QuorumUnreachable { threshold: 5, .. });
}

#[tokio::test(start_paused = true)]
async fn test_expiry_outside_bounds_rejected_before_network() {
    let harness = TestHarness::new(3, 2);
    let client = harness.client();

    let err = client
        .negotiator()
        .negotiate_with_expiry(
            &client.execution_capabilities(CODE),
            Duration::from_secs(60),
        )
        .await
        .unwrap_err();

    assert_matches!(err, TesseraError::Config { .. });
    assert_eq!(harness.quorum.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_empty_capabilities_rejected() {
    let harness = TestHarness::new(3, 2);
    let client = harness.client();

    let err = client.negotiate(&CapabilitySet::default()).await.unwrap_err();
    assert_matches!(err, TesseraError::InvalidDelegation { .. });
    assert_eq!(harness.quorum.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_round_deadline_bounds_signing() {
    let harness = TestHarness::new(5, 4);
    let deadline = Duration::from_millis(harness.config.round_deadline_ms);
    let client = slow_client(
        &harness,
        SlowSigner::new(Duration::ZERO, Duration::from_secs(10)),
    );

    let started = tokio::time::Instant::now();
    let err = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap_err();

    assert!(started.elapsed() <= deadline, "round ran {:?}", started.elapsed());
    assert_matches!(err, TesseraError::SigningFailed { ref reason } if reason.contains("deadline"));
    assert!(client.signer().signer().sign_calls.load(Ordering::SeqCst) < 5);
    assert_eq!(harness.quorum.credential_requests(), 0);
    assert!(client.cached_session().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_round_deadline_bounds_address_lookup() {
    let harness = TestHarness::new(3, 2);
    let deadline = Duration::from_millis(harness.config.round_deadline_ms);
    let client = slow_client(
        &harness,
        SlowSigner::new(Duration::from_secs(120), Duration::ZERO),
    );

    let started = tokio::time::Instant::now();
    let err = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap_err();

    assert!(started.elapsed() <= deadline);
    assert_matches!(err, TesseraError::SigningFailed { .. });
    assert_eq!(harness.quorum.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_signer_within_deadline_completes() {
    let harness = TestHarness::new(3, 2);
    let client = slow_client(
        &harness,
        SlowSigner::new(Duration::from_secs(1), Duration::from_secs(5)),
    );

    let set = client
        .negotiate(&client.execution_capabilities(CODE))
        .await
        .unwrap();
    assert_eq!(set.len(), 3);
}
