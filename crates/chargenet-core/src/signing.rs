//! Signing boundary
//!
//! Every envelope leaving a node passes through [`SigningBoundary::sign`], every
//! inbound envelope through [`SigningBoundary::verify`] before it reaches dispatch or
//! forwarding. Signatures cover the canonical digest from
//! [`EnvelopeCodec::signing_digest`], so relays may extend the network path and shrink
//! the timeout budget without invalidating them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::codec::EnvelopeCodec;
use crate::envelope::{Envelope, Signature, SignatureAlgorithm};
use crate::errors::SigningError;
use crate::outcome::Outcome;

// ----------------------------------------------------------------------------
// Signers
// ----------------------------------------------------------------------------

/// Produces detached signatures over an envelope digest
pub trait Signer: Send + Sync {
    /// Key id recorded next to the signature
    fn key_id(&self) -> &str;

    fn algorithm(&self) -> SignatureAlgorithm;

    /// Sign the 32-byte canonical digest
    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Vec<u8>, SigningError>;
}

/// Ed25519 signer
#[derive(Debug, Clone)]
pub struct Ed25519Signer {
    key_id: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519Signer {
    /// Generate a new random key
    pub fn generate<T: Into<String>>(key_id: T) -> Self {
        let mut rng = rand_core::OsRng;
        Self::generate_with_rng(key_id, &mut rng)
    }

    /// Generate a new key with a caller-supplied RNG
    pub fn generate_with_rng<T: Into<String>, R: RngCore + CryptoRng>(key_id: T, rng: &mut R) -> Self {
        let mut secret_bytes = [0u8; 32];
        rng.fill_bytes(&mut secret_bytes);
        Self::from_bytes(key_id, &secret_bytes)
    }

    /// Create from raw private key bytes
    pub fn from_bytes<T: Into<String>>(key_id: T, private_key: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(private_key);
        let verifying_key = signing_key.verifying_key();
        Self {
            key_id: key_id.into(),
            signing_key,
            verifying_key,
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.public_key_bytes())
    }
}

/// Hex SHA-256 of a public key, for logs and operator tooling
pub fn key_fingerprint(public_key: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(public_key))
}

impl Signer for Ed25519Signer {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ed25519
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Vec<u8>, SigningError> {
        Ok(self.signing_key.sign(digest).to_bytes().to_vec())
    }
}

// ----------------------------------------------------------------------------
// Trust Policy
// ----------------------------------------------------------------------------

/// How strictly inbound envelopes are checked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationMode {
    /// Signatures are ignored
    Disabled,
    /// Unsigned envelopes pass, signed envelopes must validate
    #[default]
    IfPresent,
    /// Every envelope must carry at least one valid signature
    Required,
}

/// Key material trusted by this node
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    mode: VerificationMode,
    keys: HashMap<String, VerifyingKey>,
}

impl TrustPolicy {
    pub fn new(mode: VerificationMode) -> Self {
        Self {
            mode,
            keys: HashMap::new(),
        }
    }

    /// Policy that accepts everything
    pub fn disabled() -> Self {
        Self::new(VerificationMode::Disabled)
    }

    /// Trust an Ed25519 public key under `key_id`
    pub fn with_ed25519_key<T: Into<String>>(
        mut self,
        key_id: T,
        public_key: &[u8; 32],
    ) -> Result<Self, SigningError> {
        let key = VerifyingKey::from_bytes(public_key).map_err(|e| SigningError::InvalidKey {
            reason: e.to_string(),
        })?;
        self.trust(key_id, key);
        Ok(self)
    }

    pub fn trust<T: Into<String>>(&mut self, key_id: T, key: VerifyingKey) {
        let key_id = key_id.into();
        debug!(%key_id, fingerprint = %key_fingerprint(key.as_bytes()), "Key trusted");
        self.keys.insert(key_id, key);
    }

    pub fn revoke(&mut self, key_id: &str) -> bool {
        self.keys.remove(key_id).is_some()
    }

    pub fn mode(&self) -> VerificationMode {
        self.mode
    }

    pub fn is_trusted(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    /// Check one signature against the digest
    pub fn check(&self, signature: &Signature, digest: &[u8; 32]) -> Result<(), SigningError> {
        if signature.algorithm != SignatureAlgorithm::Ed25519 {
            return Err(SigningError::UnsupportedAlgorithm {
                algorithm: signature.algorithm.as_str().to_string(),
            });
        }
        let key = self
            .keys
            .get(&signature.key_id)
            .ok_or_else(|| SigningError::UnknownKey {
                key_id: signature.key_id.clone(),
            })?;
        let invalid = || SigningError::InvalidSignature {
            key_id: signature.key_id.clone(),
        };
        let value = ed25519_dalek::Signature::from_slice(&signature.value).map_err(|_| invalid())?;
        key.verify(digest, &value).map_err(|_| invalid())
    }
}

// ----------------------------------------------------------------------------
// Signing Outcome
// ----------------------------------------------------------------------------

/// Result of signing or verifying one envelope
///
/// Never coerced to success: `ok` is false whenever the operation failed, and the
/// reasons are kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningOutcome {
    pub ok: bool,
    /// Keys that signed (sign) or validated (verify)
    pub key_ids: Vec<String>,
    pub errors: Vec<SigningError>,
}

impl SigningOutcome {
    pub fn success(key_ids: Vec<String>) -> Self {
        Self {
            ok: true,
            key_ids,
            errors: Vec::new(),
        }
    }

    pub fn failure(errors: Vec<SigningError>) -> Self {
        Self {
            ok: false,
            key_ids: Vec::new(),
            errors,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Describe a failed outcome as a `SignatureError`
    pub fn to_outcome(&self) -> Outcome {
        if self.ok {
            return Outcome::ok();
        }
        let reasons: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        Outcome::signature_error(reasons.join("; "))
    }
}

// ----------------------------------------------------------------------------
// Signing Boundary
// ----------------------------------------------------------------------------

/// Signs outbound and verifies inbound envelopes
pub struct SigningBoundary {
    signers: Vec<Arc<dyn Signer>>,
    policy: RwLock<Arc<TrustPolicy>>,
}

impl Default for SigningBoundary {
    fn default() -> Self {
        Self::new(TrustPolicy::default())
    }
}

impl SigningBoundary {
    pub fn new(policy: TrustPolicy) -> Self {
        Self {
            signers: Vec::new(),
            policy: RwLock::new(Arc::new(policy)),
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signers.push(signer);
        self
    }

    pub fn signer_count(&self) -> usize {
        self.signers.len()
    }

    /// Snapshot of the current trust policy
    pub fn policy(&self) -> Arc<TrustPolicy> {
        let guard = self.policy.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new trust policy; in-progress verifications keep their snapshot
    pub fn update_policy(&self, policy: TrustPolicy) {
        let mut guard = self.policy.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(policy);
        debug!(mode = ?guard.mode(), "Trust policy updated");
    }

    /// Attach one signature per configured signer
    ///
    /// A signer's earlier signature on the same envelope is replaced rather than
    /// duplicated, so signing twice yields the same envelope.
    pub fn sign(&self, envelope: &mut Envelope) -> SigningOutcome {
        if self.signers.is_empty() {
            return SigningOutcome::success(Vec::new());
        }

        let digest = match EnvelopeCodec::signing_digest(envelope) {
            Ok(digest) => digest,
            Err(e) => {
                return SigningOutcome::failure(vec![SigningError::Canonicalization {
                    reason: e.to_string(),
                }])
            }
        };

        let mut signed = Vec::with_capacity(self.signers.len());
        let mut errors = Vec::new();
        for signer in &self.signers {
            match signer.sign_digest(&digest) {
                Ok(value) => {
                    let signature = Signature::new(signer.key_id(), signer.algorithm(), value);
                    let signatures = &mut envelope.header_mut().signatures;
                    signatures.retain(|s| s.key_id != signature.key_id);
                    signatures.push(signature);
                    signed.push(signer.key_id().to_string());
                }
                Err(e) => {
                    warn!(key_id = signer.key_id(), error = %e, "Signer failed");
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            SigningOutcome::success(signed)
        } else {
            SigningOutcome {
                ok: false,
                key_ids: signed,
                errors,
            }
        }
    }

    /// Accept when at least one attached signature validates under the policy
    pub fn verify(&self, envelope: &Envelope) -> SigningOutcome {
        let policy = self.policy();
        if policy.mode() == VerificationMode::Disabled {
            return SigningOutcome::success(Vec::new());
        }

        let signatures = envelope.signatures();
        if signatures.is_empty() {
            return match policy.mode() {
                VerificationMode::Required => {
                    SigningOutcome::failure(vec![SigningError::MissingSignature])
                }
                _ => SigningOutcome::success(Vec::new()),
            };
        }

        let digest = match EnvelopeCodec::signing_digest(envelope) {
            Ok(digest) => digest,
            Err(e) => {
                return SigningOutcome::failure(vec![SigningError::Canonicalization {
                    reason: e.to_string(),
                }])
            }
        };

        let mut validated = Vec::new();
        let mut errors = Vec::new();
        for signature in signatures {
            match policy.check(signature, &digest) {
                Ok(()) => validated.push(signature.key_id.clone()),
                Err(e) => errors.push(e),
            }
        }

        if validated.is_empty() {
            debug!(
                request_id = %envelope.request_id(),
                failures = errors.len(),
                "No signature validated"
            );
            SigningOutcome::failure(errors)
        } else {
            SigningOutcome {
                ok: true,
                key_ids: validated,
                errors,
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
