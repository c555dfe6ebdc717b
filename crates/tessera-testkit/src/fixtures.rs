//! Ready-made test setups

use crate::clock::ManualClock;
use crate::quorum::MockQuorum;
use crate::signer::TestSigner;
use std::sync::Arc;
use tessera_core::{ClientConfig, RetryConfig, Sha256Addressing};
use tessera_session::QuorumClient;

/// Client type produced by [`TestHarness::client`]
pub type TestClient =
    QuorumClient<Arc<TestSigner>, Arc<MockQuorum>, Arc<ManualClock>, Sha256Addressing>;

/// Configuration with short timeouts and no retries
pub fn test_config() -> ClientConfig {
    ClientConfig {
        round_deadline_ms: 30_000,
        node_timeout_ms: 5_000,
        clock_skew_ms: 30_000,
        retry: RetryConfig {
            max_attempts: 0,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        },
        ..ClientConfig::default()
    }
}

/// A signer, a clock and a quorum wired together
pub struct TestHarness {
    /// Shared manual clock, also used by the quorum
    pub clock: Arc<ManualClock>,
    /// Long-term key custodian
    pub signer: Arc<TestSigner>,
    /// Simulated quorum
    pub quorum: Arc<MockQuorum>,
    /// Client configuration
    pub config: ClientConfig,
}

impl TestHarness {
    /// `size` members with the given threshold
    pub fn new(size: usize, threshold: usize) -> Self {
        Self::with_standby(size, 0, threshold)
    }

    /// `size` members and `standby` alternates
    pub fn with_standby(size: usize, standby: usize, threshold: usize) -> Self {
        let clock = Arc::new(ManualClock::at_test_epoch());
        let quorum = Arc::new(MockQuorum::with_standby(
            size,
            standby,
            threshold,
            clock.clone(),
        ));
        Self {
            clock,
            signer: Arc::new(TestSigner::from_seed_string("tessera-test-signer")),
            quorum,
            config: test_config(),
        }
    }

    /// Client over this harness
    pub fn client(&self) -> TestClient {
        QuorumClient::with_effects(
            self.config.clone(),
            self.signer.clone(),
            self.quorum.clone(),
            self.clock.clone(),
            Sha256Addressing,
        )
        .unwrap()
    }
}
