//! Dispatch and forwarding tables driven through their public API

use chargenet_core::{
    handler_fn, typed_handler, Action, ChargenetError, DispatchTable, Envelope, EnvelopeCodec,
    ErrorCode, ForwardingConfig, ForwardingResult, ForwardingTable, Frame, JsonRequest,
    NetworkPath, NodeId, Payload, RejectReply, RelayContext, RequestContext, RequestId,
    ResultCode,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_test::block_on;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatResponse {
    current_time: u64,
}

fn node(id: &str) -> NodeId {
    NodeId::new(id).unwrap()
}

fn request(id: &str, action: &str) -> Envelope {
    let mut envelope: Envelope = JsonRequest::new(
        RequestId::new(id).unwrap(),
        node("CSMS"),
        Action::new(action).unwrap(),
        json!({}),
    )
    .into();
    envelope.push_hop(node("CS1"));
    envelope
}

fn table() -> DispatchTable {
    let mut table = DispatchTable::new();
    table.register(
        Action::new("Heartbeat").unwrap(),
        typed_handler(|_ctx: RequestContext, _req: HeartbeatRequest| async move {
            Ok::<_, ChargenetError>(HeartbeatResponse {
                current_time: 1_700_000_000,
            })
        }),
    );
    table.register(
        Action::new("Echo").unwrap(),
        handler_fn(|_ctx: RequestContext, payload: Payload| async move {
            Ok::<_, ChargenetError>(payload)
        }),
    );
    table
}

#[test]
fn dispatched_reply_is_a_wire_ready_response() {
    let reply = block_on(table().dispatch(&node("CSMS"), node("CS1"), &request("11", "Heartbeat")));

    let frame = EnvelopeCodec::encode(&reply).unwrap();
    let Frame::Text(text) = frame else {
        panic!("JSON replies encode to text frames");
    };
    let decoded = EnvelopeCodec::decode_text(&text).unwrap();
    match decoded {
        Envelope::JsonResponse(response) => {
            assert_eq!(response.header.request_id.as_str(), "11");
            assert_eq!(response.header.destination, node("CS1"));
            assert_eq!(response.result, ResultCode::Ok);
            assert_eq!(response.payload, json!({"currentTime": 1_700_000_000u64}));
        }
        other => panic!("expected a response, got {:?}", other),
    }
}

#[test]
fn unknown_action_gets_not_implemented_with_same_id() {
    let reply = block_on(table().dispatch(&node("CSMS"), node("CS1"), &request("7", "Ping")));

    assert_eq!(reply.request_id().as_str(), "7");
    let outcome = reply.reply_outcome();
    assert_eq!(outcome.error_code, Some(ErrorCode::NotImplemented));
    assert_eq!(outcome.description.as_deref(), Some("Unknown action Ping"));
}

#[test]
fn strict_forwarding_table_rejects_unfiltered_requests() {
    let table = ForwardingTable::new(&ForwardingConfig::strict());
    let ctx = RelayContext {
        request_id: RequestId::new("9").unwrap(),
        action: Action::new("Heartbeat").unwrap(),
        relay: node("LC01"),
        previous_hop: node("CS1"),
        next_hop: node("CSMS"),
        destination: node("CSMS"),
        network_path: NetworkPath::from_origin(node("CS1")),
    };

    let decision = block_on(
        table
            .pipeline_for("Heartbeat")
            .evaluate(ctx, Payload::Json(json!({}))),
    );
    assert_eq!(decision.result, ForwardingResult::Reject);
    assert!(matches!(
        decision.reject,
        Some(RejectReply::Response {
            result: ResultCode::Filtered,
            ..
        })
    ));
}
