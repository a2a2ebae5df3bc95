//! Property-based tests for the envelope codec
//!
//! These tests verify that every envelope kind survives encode/decode unchanged,
//! that relay-side mutations never change the signing digest, and that arbitrary
//! input never panics the decoder.

use chargenet_core::{
    Action, BinaryRequest, BinaryResponse, Envelope, EnvelopeCodec, ErrorCode, ErrorInfo, Frame,
    Header, JsonRequest, JsonRequestError, JsonResponse, JsonResponseError, NetworkPath, NodeId,
    RequestId, ResultCode, Signature, SignatureAlgorithm, Timestamp,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;

/// Generate arbitrary identifier accepted by NodeId/RequestId
fn arb_identifier() -> impl Strategy<Value = String> {
    prop::string::string_regex(r"[A-Za-z0-9][A-Za-z0-9_.:-]{0,23}").unwrap()
}

fn arb_node_id() -> impl Strategy<Value = NodeId> {
    arb_identifier().prop_map(|id| NodeId::new(id).unwrap())
}

fn arb_request_id() -> impl Strategy<Value = RequestId> {
    arb_identifier().prop_map(|id| RequestId::new(id).unwrap())
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop::string::string_regex(r"[A-Z][A-Za-z]{0,31}")
        .unwrap()
        .prop_map(|name| Action::new(name).unwrap())
}

fn arb_path() -> impl Strategy<Value = NetworkPath> {
    prop::collection::vec(arb_node_id(), 0..5).prop_map(NetworkPath::from_hops)
}

fn arb_signature() -> impl Strategy<Value = Signature> {
    (
        arb_identifier(),
        prop::collection::vec(any::<u8>(), 0..96),
    )
        .prop_map(|(key_id, value)| Signature::new(key_id, SignatureAlgorithm::Ed25519, value))
}

fn arb_header() -> impl Strategy<Value = Header> {
    (
        arb_request_id(),
        arb_node_id(),
        arb_path(),
        0u64..=4_102_444_800_000,
        prop::collection::vec(arb_signature(), 0..3),
    )
        .prop_map(|(request_id, destination, network_path, millis, signatures)| Header {
            request_id,
            destination,
            network_path,
            timestamp: Timestamp::new(millis),
            signatures,
        })
}

/// JSON object payloads without floats (integers and strings survive exactly)
fn arb_json_object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(
        prop::string::string_regex(r"[a-z][A-Za-z]{0,11}").unwrap(),
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            ".{0,16}".prop_map(Value::from),
            Just(Value::Null),
        ],
        0..6,
    )
    .prop_map(|map| Value::Object(map.into_iter().collect()))
}

fn arb_timeout() -> impl Strategy<Value = Duration> {
    (0u64..=u32::MAX as u64).prop_map(Duration::from_millis)
}

fn arb_result() -> impl Strategy<Value = ResultCode> {
    (0u8..=8).prop_map(|code| ResultCode::from_u8(code).unwrap())
}

fn arb_error_info() -> impl Strategy<Value = ErrorInfo> {
    (
        prop_oneof![
            Just(ErrorCode::NotImplemented),
            Just(ErrorCode::InternalError),
            Just(ErrorCode::FormationViolation),
            Just(ErrorCode::SecurityError),
            Just(ErrorCode::GenericError),
        ],
        ".{0,32}",
        arb_json_object(),
    )
        .prop_map(|(code, description, details)| {
            ErrorInfo::new(code, description).with_details(details)
        })
}

/// Binary request or response
fn arb_binary_envelope() -> impl Strategy<Value = Envelope> {
    prop_oneof![
        (
            arb_header(),
            arb_action(),
            prop::collection::vec(any::<u8>(), 0..512),
            arb_timeout()
        )
            .prop_map(|(header, action, payload, timeout)| {
                Envelope::BinaryRequest(BinaryRequest {
                    header,
                    action,
                    payload,
                    timeout,
                })
            }),
        (
            arb_header(),
            prop::collection::vec(any::<u8>(), 0..512),
            arb_result()
        )
            .prop_map(|(header, payload, result)| {
                Envelope::BinaryResponse(BinaryResponse {
                    header,
                    payload,
                    result,
                })
            }),
    ]
}

/// Any of the six envelope kinds
fn arb_envelope() -> impl Strategy<Value = Envelope> {
    prop_oneof![
        (arb_header(), arb_action(), arb_json_object(), arb_timeout()).prop_map(
            |(header, action, payload, timeout)| Envelope::JsonRequest(JsonRequest {
                header,
                action,
                payload,
                timeout,
            })
        ),
        (arb_header(), arb_json_object(), arb_result()).prop_map(|(header, payload, result)| {
            Envelope::JsonResponse(JsonResponse {
                header,
                payload,
                result,
            })
        }),
        (arb_header(), arb_error_info()).prop_map(|(header, error)| {
            Envelope::JsonRequestError(JsonRequestError { header, error })
        }),
        (arb_header(), arb_error_info()).prop_map(|(header, error)| {
            Envelope::JsonResponseError(JsonResponseError { header, error })
        }),
        arb_binary_envelope(),
    ]
}

proptest! {
    /// Property: decode(encode(e)) == e for every kind
    #[test]
    fn encode_decode_preserves_envelope(envelope in arb_envelope()) {
        let frame = EnvelopeCodec::encode(&envelope).expect("encode should succeed");
        prop_assert_eq!(matches!(frame, Frame::Binary(_)), envelope.is_binary());

        let decoded = EnvelopeCodec::decode(&frame).expect("decode should succeed");
        prop_assert_eq!(decoded, envelope);
    }

    /// Property: the request id can be read without a full decode
    #[test]
    fn peek_finds_request_id(envelope in arb_envelope()) {
        let frame = EnvelopeCodec::encode(&envelope).unwrap();
        prop_assert_eq!(
            EnvelopeCodec::peek_request_id(&frame),
            Some(envelope.request_id().clone())
        );
    }

    /// Property: request id, hops, timeout budget and signatures never change the digest
    #[test]
    fn digest_ignores_relay_mutations(
        envelope in arb_envelope(),
        downstream_id in arb_request_id(),
        hop in arb_node_id(),
        timeout in arb_timeout(),
        signature in arb_signature(),
    ) {
        let before = EnvelopeCodec::signing_digest(&envelope).unwrap();

        let mut relayed = envelope.clone();
        relayed.header_mut().request_id = downstream_id;
        relayed.push_hop(hop);
        relayed.set_timeout(timeout);
        relayed.header_mut().signatures.push(signature);

        prop_assert_eq!(EnvelopeCodec::signing_digest(&relayed).unwrap(), before);
    }

    /// Property: the decoder rejects garbage without panicking
    #[test]
    fn decoder_never_panics_on_bytes(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = EnvelopeCodec::decode(&Frame::Binary(bytes));
    }

    #[test]
    fn decoder_never_panics_on_text(text in ".{0,256}") {
        let _ = EnvelopeCodec::decode(&Frame::Text(text));
    }

    /// Property: truncating a binary frame anywhere is a formation error
    #[test]
    fn truncated_binary_frames_are_rejected(
        envelope in arb_binary_envelope(),
        cut in any::<prop::sample::Index>(),
    ) {
        let bytes = match EnvelopeCodec::encode(&envelope).unwrap() {
            Frame::Binary(bytes) => bytes,
            Frame::Text(_) => unreachable!("binary kinds encode to binary frames"),
        };
        let end = cut.index(bytes.len());
        prop_assert!(EnvelopeCodec::decode_binary(&bytes[..end]).is_err());
    }
}

#[test]
fn payload_must_be_an_object() {
    let text = r#"[2,"1","CSMS",[],"Heartbeat",[1,2,3],{"timestamp":1}]"#;
    assert!(EnvelopeCodec::decode_text(text).is_err());

    let text = r#"[3,"1","CS1",[],"accepted",{"timestamp":1}]"#;
    assert!(EnvelopeCodec::decode_text(text).is_err());

    let expected: Envelope = JsonRequest::new(
        RequestId::new("1").unwrap(),
        NodeId::new("CSMS").unwrap(),
        Action::new("Heartbeat").unwrap(),
        json!({}),
    )
    .into();
    let decoded =
        EnvelopeCodec::decode_text(r#"[2,"1","CSMS",[],"Heartbeat",{},{"timestamp":1}]"#).unwrap();
    assert_eq!(decoded.kind(), expected.kind());
    assert_eq!(decoded.request_id(), expected.request_id());
    assert_eq!(decoded.timeout(), expected.timeout());
}
