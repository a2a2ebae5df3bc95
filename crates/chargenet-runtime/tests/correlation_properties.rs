//! Property tests for the pending table

use std::collections::HashMap;

use chargenet_core::{
    Envelope, Header, JsonResponse, LateResponsePolicy, NodeId, Outcome, RequestId, ResultCode,
};
use chargenet_runtime::PendingRequests;
use proptest::prelude::*;
use serde_json::json;
use tokio::time::Duration;

const SLOTS: u8 = 8;

fn id(n: u8) -> RequestId {
    RequestId::new(format!("req-{}", n)).unwrap()
}

fn reply(n: u8) -> Envelope {
    JsonResponse {
        header: Header::new(id(n), NodeId::new("CS1").unwrap()),
        payload: json!({}),
        result: ResultCode::Ok,
    }
    .into()
}

proptest! {
    /// Replies and local failures race for the same slots; the first one wins and
    /// the waiter observes exactly that resolution
    #[test]
    fn first_resolution_wins(ops in prop::collection::vec((0..SLOTS, any::<bool>()), 0..64)) {
        let pending = PendingRequests::new(LateResponsePolicy::Discard);
        let handles: Vec<_> = (0..SLOTS)
            .map(|n| pending.register(id(n), None, Duration::from_secs(60)).unwrap())
            .collect();

        let mut first: HashMap<u8, bool> = HashMap::new();
        for (n, as_reply) in ops {
            let applied = if as_reply {
                pending.resolve(reply(n))
            } else {
                pending.fail(&id(n), Outcome::transport_failure("link reset"))
            };
            prop_assert_eq!(applied, !first.contains_key(&n));
            first.entry(n).or_insert(as_reply);
        }

        let closed = pending.fail_all(Outcome::transport_failure("closed"));
        prop_assert_eq!(closed, SLOTS as usize - first.len());
        prop_assert!(pending.is_empty());

        for (n, handle) in handles.into_iter().enumerate() {
            let response = tokio_test::block_on(pending.wait(handle, None));
            let expected = match first.get(&(n as u8)) {
                Some(true) => ResultCode::Ok,
                _ => ResultCode::TransportFailure,
            };
            prop_assert_eq!(response.outcome.code, expected);
        }
    }
}
