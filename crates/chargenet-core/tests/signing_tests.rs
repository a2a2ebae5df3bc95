//! Signing boundary and trust policy behaviour across encode/decode

use std::sync::Arc;
use std::time::Duration;

use chargenet_core::{
    Action, Ed25519Signer, Envelope, EnvelopeCodec, JsonRequest, NodeId, RequestId,
    ResultCode, SigningBoundary, SigningError, TrustPolicy, VerificationMode,
};
use proptest::prelude::*;
use serde_json::json;

fn request(id: &str, payload: serde_json::Value) -> Envelope {
    JsonRequest::new(
        RequestId::new(id).unwrap(),
        NodeId::new("CSMS").unwrap(),
        Action::new("StatusNotification").unwrap(),
        payload,
    )
    .into()
}

fn boundary(seed: u8, mode: VerificationMode) -> (SigningBoundary, Arc<Ed25519Signer>) {
    let signer = Arc::new(Ed25519Signer::from_bytes(format!("key-{}", seed), &[seed; 32]));
    let policy = TrustPolicy::new(mode)
        .with_ed25519_key(format!("key-{}", seed), &signer.public_key_bytes())
        .unwrap();
    (
        SigningBoundary::new(policy).with_signer(signer.clone()),
        signer,
    )
}

#[test]
fn signature_survives_wire_and_relay_hops() {
    let (boundary, _) = boundary(1, VerificationMode::Required);
    let mut envelope = request("42", json!({"connectorId": 1, "status": "Available"}));
    assert!(boundary.sign(&mut envelope).is_ok());

    let frame = EnvelopeCodec::encode(&envelope).unwrap();
    let mut received = EnvelopeCodec::decode(&frame).unwrap();
    received.push_hop(NodeId::new("LC01").unwrap());
    received.set_timeout(Duration::from_millis(1_500));

    let outcome = boundary.verify(&received);
    assert!(outcome.is_ok());
    assert_eq!(outcome.key_ids, vec!["key-1".to_string()]);
}

#[test]
fn tampered_payload_fails_verification() {
    let (boundary, _) = boundary(2, VerificationMode::Required);
    let mut envelope = request("43", json!({"connectorId": 1}));
    boundary.sign(&mut envelope);

    if let Envelope::JsonRequest(m) = &mut envelope {
        m.payload = json!({"connectorId": 2});
    }

    let outcome = boundary.verify(&envelope);
    assert!(!outcome.is_ok());
    assert_eq!(outcome.to_outcome().code, ResultCode::SignatureError);
    assert!(matches!(
        outcome.errors.as_slice(),
        [SigningError::InvalidSignature { .. }]
    ));
}

#[test]
fn revoked_key_is_no_longer_trusted() {
    let (boundary, signer) = boundary(3, VerificationMode::Required);
    let mut envelope = request("44", json!({}));
    boundary.sign(&mut envelope);
    assert!(boundary.verify(&envelope).is_ok());

    let mut policy = (*boundary.policy()).clone();
    assert!(policy.revoke("key-3"));
    policy.trust("key-3-rotated", signer.verifying_key());
    boundary.update_policy(policy);

    let outcome = boundary.verify(&envelope);
    assert!(!outcome.is_ok());
    assert!(matches!(
        outcome.errors.as_slice(),
        [SigningError::UnknownKey { .. }]
    ));
}

#[test]
fn one_valid_signature_among_many_is_enough() {
    let (trusted, _) = boundary(4, VerificationMode::Required);
    let stranger = Arc::new(Ed25519Signer::from_bytes("stranger", &[9; 32]));

    let mut envelope = request("45", json!({}));
    SigningBoundary::default()
        .with_signer(stranger)
        .sign(&mut envelope);
    trusted.sign(&mut envelope);
    assert_eq!(envelope.signatures().len(), 2);

    let outcome = trusted.verify(&envelope);
    assert!(outcome.is_ok());
    assert_eq!(outcome.errors.len(), 1);
}

proptest! {
    /// Property: signing is idempotent and verify(sign(m)) holds for any payload
    #[test]
    fn sign_is_idempotent_and_verifies(
        seed in 1u8..=255,
        text in "[ -~]{0,64}",
        counter in any::<u32>(),
    ) {
        let (boundary, _) = boundary(seed, VerificationMode::Required);
        let mut envelope = request("p", json!({"text": text, "counter": counter}));

        prop_assert!(boundary.sign(&mut envelope).is_ok());
        let once = envelope.clone();
        prop_assert!(boundary.sign(&mut envelope).is_ok());

        prop_assert_eq!(&envelope, &once);
        prop_assert!(boundary.verify(&envelope).is_ok());
    }
}
