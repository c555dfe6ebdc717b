//! Tessera Testing Infrastructure
//!
//! Deterministic collaborators for exercising the session protocol without
//! a network:
//!
//! - [`TestSigner`]: seeded ed25519 custodian that counts and can decline
//! - [`ManualClock`]: wall clock that only moves when told to
//! - [`MockQuorum`]: simulated nodes with configurable behaviour
//! - [`MockRegistry`]: identity registry that checks provisioning proofs
//!
//! ```ignore
//! use tessera_testkit::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn my_test() {
//!     let harness = TestHarness::new(5, 4);
//!     let client = harness.client();
//!     // ... test logic
//! }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod clock;
pub mod fixtures;
pub mod quorum;
pub mod registry;
pub mod signer;

pub use clock::{ManualClock, TEST_EPOCH_MS};
pub use fixtures::{test_config, TestClient, TestHarness};
pub use quorum::{MockQuorum, NodeBehavior};
pub use registry::MockRegistry;
pub use signer::TestSigner;

/// Install a test subscriber honouring `RUST_LOG`; later calls are no-ops
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
