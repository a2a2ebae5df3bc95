//! Fixed identities and logging for tests

use std::sync::{Arc, Once};

use chargenet_core::{Ed25519Signer, NodeId, Signer, SigningError, TrustPolicy, VerificationMode};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process
///
/// Honours `RUST_LOG`; output is captured per test.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Node id from a literal known to be valid
///
/// # Panics
///
/// Panics when `name` is not a valid node id.
pub fn node_id(name: &str) -> NodeId {
    NodeId::new(name).unwrap_or_else(|e| panic!("invalid test node id {:?}: {}", name, e))
}

/// Deterministic Ed25519 signer with key id `key-<seed>`
pub fn test_signer(seed: u8) -> Arc<Ed25519Signer> {
    Arc::new(Ed25519Signer::from_bytes(
        format!("key-{}", seed),
        &[seed; 32],
    ))
}

/// Trust policy in `mode` trusting every given signer under its key id
pub fn trust_policy(
    mode: VerificationMode,
    signers: &[&Arc<Ed25519Signer>],
) -> Result<TrustPolicy, SigningError> {
    signers.iter().try_fold(TrustPolicy::new(mode), |policy, signer| {
        policy.with_ed25519_key(signer.key_id().to_string(), &signer.public_key_bytes())
    })
}
