//! Correlation through a connection
//!
//! Drives `Connection` over a recording transport: what gets written, how each
//! request resolves, and what is left in the pending table afterwards.

use std::sync::Arc;

use chargenet_core::{
    Action, ChargenetError, ErrorCode, Header, JsonRequest, JsonResponse, NodeConfig,
    RequestConfig, RequestId, ResultCode, TransportError,
};
use chargenet_harness::{node_id, RecordingTransport};
use chargenet_runtime::{CallOptions, Connection};
use futures::future::join_all;
use serde_json::json;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

fn connection(transport: Arc<RecordingTransport>) -> Arc<Connection> {
    let config = NodeConfig::testing(node_id("LC01")).into_shared();
    Connection::new(node_id("CSMS"), transport, config)
}

fn heartbeat(id: &str) -> chargenet_core::Envelope {
    JsonRequest::new(
        RequestId::new(id).unwrap(),
        node_id("CSMS"),
        Action::new("Heartbeat").unwrap(),
        json!({}),
    )
    .into()
}

fn accepted(id: &str) -> chargenet_core::Envelope {
    JsonResponse {
        header: Header::new(RequestId::new(id).unwrap(), node_id("LC01")),
        payload: json!({"currentTime": 1_700_000_000u64}),
        result: ResultCode::Ok,
    }
    .into()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_reply_completes_call_with_payload() {
    let transport = Arc::new(RecordingTransport::new());
    let conn = connection(Arc::clone(&transport));

    let in_flight = conn
        .start_request(heartbeat("1"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(transport.request_ids(), vec![RequestId::new("1").unwrap()]);

    assert!(conn.pending().resolve(accepted("1")));
    let response = in_flight.wait().await;

    assert!(response.is_ok());
    assert_eq!(
        response.json_payload(),
        Some(&json!({"currentTime": 1_700_000_000u64}))
    );
    assert!(conn.pending().is_empty());
}

#[tokio::test]
async fn test_written_timeout_matches_call_budget() {
    let transport = Arc::new(RecordingTransport::new());
    let conn = connection(Arc::clone(&transport));

    let _in_flight = conn
        .start_request(
            heartbeat("1"),
            CallOptions::new().with_timeout(Duration::from_millis(750)),
        )
        .await
        .unwrap();

    let written = transport.envelopes();
    assert_eq!(written[0].timeout(), Some(Duration::from_millis(750)));
}

#[tokio::test]
async fn test_cancel_after_write_keeps_frame_and_clears_slot() {
    let transport = Arc::new(RecordingTransport::new());
    let conn = connection(Arc::clone(&transport));
    let token = CancellationToken::new();

    let in_flight = conn
        .start_request(heartbeat("1"), CallOptions::new().with_cancel(token.clone()))
        .await
        .unwrap();
    token.cancel();
    let response = in_flight.wait().await;

    assert_eq!(response.outcome.code, ResultCode::Cancelled);
    assert_eq!(transport.frame_count(), 1);
    assert!(conn.pending().is_empty());
    assert!(!conn.pending().resolve(accepted("1")));
    assert_eq!(conn.stats().correlation.unmatched, 1);
}

#[tokio::test]
async fn test_duplicate_request_id_is_not_written() {
    let transport = Arc::new(RecordingTransport::new());
    let conn = connection(Arc::clone(&transport));

    let _first = conn
        .start_request(heartbeat("1"), CallOptions::new())
        .await
        .unwrap();
    let second = conn
        .send_request(heartbeat("1"), CallOptions::new())
        .await;

    assert_eq!(second.outcome.code, ResultCode::GenericError);
    assert_eq!(transport.frame_count(), 1);
    assert_eq!(conn.pending().len(), 1);
}

#[tokio::test]
async fn test_zero_budget_times_out_without_writing() {
    let transport = Arc::new(RecordingTransport::new());
    let conn = connection(Arc::clone(&transport));

    let response = conn
        .send_request(heartbeat("1"), CallOptions::new().with_timeout(Duration::ZERO))
        .await;

    assert_eq!(response.outcome.code, ResultCode::Timeout);
    assert_eq!(transport.frame_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out_and_late_reply_is_dropped() {
    let transport = Arc::new(RecordingTransport::new());
    let conn = connection(Arc::clone(&transport));

    let response = conn
        .send_request(
            heartbeat("1"),
            CallOptions::new().with_timeout(Duration::from_millis(200)),
        )
        .await;

    assert_eq!(response.outcome.code, ResultCode::Timeout);
    assert_eq!(response.runtime, Duration::from_millis(200));
    assert!(!conn.pending().resolve(accepted("1")));

    let stats = conn.stats();
    assert_eq!(stats.correlation.timed_out, 1);
    assert_eq!(stats.correlation.unmatched, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sends_write_whole_frames_in_call_order() {
    let transport = Arc::new(RecordingTransport::with_delay(Duration::from_millis(1)));
    let conn = connection(Arc::clone(&transport));

    let calls = (0..10).map(|n| {
        let conn = Arc::clone(&conn);
        async move {
            conn.send_request(
                heartbeat(&n.to_string()),
                CallOptions::new().with_timeout(Duration::from_millis(100)),
            )
            .await
        }
    });
    let responses = join_all(calls).await;

    assert!(responses
        .iter()
        .all(|response| response.outcome.code == ResultCode::Timeout));
    let written: Vec<String> = transport
        .request_ids()
        .iter()
        .map(|id| id.as_str().to_string())
        .collect();
    let expected: Vec<String> = (0..10).map(|n| n.to_string()).collect();
    assert_eq!(written, expected);
    assert_eq!(conn.stats().frames_sent, 10);
}

#[tokio::test(start_paused = true)]
async fn test_send_lock_timeout_reports_transport_error() {
    let transport = Arc::new(RecordingTransport::with_delay(Duration::from_secs(2)));
    let config = NodeConfig::testing(node_id("LC01"))
        .with_request(RequestConfig {
            default_timeout: Duration::from_secs(10),
            send_lock_timeout: Duration::from_millis(100),
        })
        .into_shared();
    let conn = Connection::new(node_id("CSMS"), transport, config);

    let slow = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.send(&heartbeat("1")).await })
    };
    tokio::task::yield_now().await;

    let err = conn.send(&heartbeat("2")).await.unwrap_err();
    assert!(matches!(
        err,
        ChargenetError::Transport(TransportError::SendLockTimeout { duration_ms: 100 })
    ));
    assert!(slow.await.unwrap().is_ok());
    assert_eq!(conn.stats().send_failures, 1);
}

#[tokio::test]
async fn test_write_failure_releases_the_slot() {
    let transport = Arc::new(RecordingTransport::new());
    transport.set_failing(true);
    let conn = connection(Arc::clone(&transport));

    let response = conn.send_request(heartbeat("1"), CallOptions::new()).await;

    assert_eq!(response.outcome.code, ResultCode::TransportFailure);
    assert_eq!(
        response.outcome.wire_error_code(),
        ErrorCode::TransportFailure
    );
    assert!(conn.pending().is_empty());
}

#[tokio::test]
async fn test_close_fails_every_pending_request() {
    let transport = Arc::new(RecordingTransport::new());
    let conn = connection(Arc::clone(&transport));

    let first = conn
        .start_request(heartbeat("1"), CallOptions::new())
        .await
        .unwrap();
    let second = conn
        .start_request(heartbeat("2"), CallOptions::new())
        .await
        .unwrap();
    conn.close().await;

    for in_flight in [first, second] {
        let response = in_flight.wait().await;
        assert_eq!(response.outcome.code, ResultCode::TransportFailure);
    }
    assert!(transport.is_closed());
    assert!(conn.is_closed());

    let after = conn.send_request(heartbeat("3"), CallOptions::new()).await;
    assert_eq!(after.outcome.code, ResultCode::TransportFailure);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_call_releases_the_slot() {
    let transport = Arc::new(RecordingTransport::new());
    let conn = connection(Arc::clone(&transport));

    let in_flight = conn
        .start_request(heartbeat("1"), CallOptions::new())
        .await
        .unwrap();
    drop(in_flight);
    assert!(conn.pending().is_empty());

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        conn.send_request(heartbeat("2"), CallOptions::new()),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(conn.pending().is_empty());
    assert_eq!(transport.frame_count(), 2);

    // The id is free for the next call.
    let _again = conn
        .start_request(heartbeat("2"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(conn.pending().len(), 1);
}
