//! Chargenet Runtime
//!
//! This crate runs the substrate defined in `chargenet-core` on top of async
//! transports:
//! - `Node`: routing, dispatch, relaying and signing for one networking node
//! - `Connection`: the send lock and pending-request table of one link
//! - `PendingRequests`: correlation of replies, timeouts and cancellation
//!
//! Transports are plugged in through the `Transport` trait; the reader side of a
//! link is a channel of decoded frames handed to `Node::attach`.

pub mod builder;
pub mod connection;
pub mod correlation;
pub mod node;
pub mod transport;

pub use builder::NodeBuilder;
pub use connection::{Connection, ConnectionStats, InFlight};
pub use correlation::{CallOptions, CallResponse, CorrelationStats, PendingHandle, PendingRequests};
pub use node::Node;
pub use transport::Transport;

// Re-export core types for convenience
pub use chargenet_core::{
    Action, ChargenetError, ChargenetResult, Envelope, Frame, NodeConfig, NodeId, Outcome,
    RequestId, ResultCode,
};
