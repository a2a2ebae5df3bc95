//! Chargenet Harness
//!
//! Test support shared by the runtime and by applications embedding it: in-memory
//! duplex links between nodes, a transport that records what was written, fixed
//! test identities and a tracing subscriber suitable for `cargo test`.

pub mod identity;
pub mod link;
pub mod recording;

pub use identity::{init_tracing, node_id, test_signer, trust_policy};
pub use link::{attach_raw, connect_nodes, duplex_link, ChannelTransport, LinkEnd};
pub use recording::RecordingTransport;
