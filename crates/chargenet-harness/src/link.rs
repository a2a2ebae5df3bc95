//! In-memory links
//!
//! A duplex link is a pair of bounded channels. Each end writes into the other end's
//! inbound channel; closing an end drops its sender, which the peer's reader loop
//! observes as a connection loss.

use std::sync::Arc;

use async_trait::async_trait;
use chargenet_core::{Frame, NodeId, TransportError};
use chargenet_runtime::{Connection, Node, Transport};
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

/// Transport writing into an in-memory channel
#[derive(Debug)]
pub struct ChannelTransport {
    sender: Mutex<Option<mpsc::Sender<Frame>>>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::Sender<Frame>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    async fn write(&self, frame: Frame) -> Result<(), TransportError> {
        let sender = self
            .sender
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError::SendFailed {
                reason: "link closed".to_string(),
            })?;
        trace!(size = frame.len(), "Link write");
        sender
            .send(frame)
            .await
            .map_err(|_| TransportError::SendFailed {
                reason: "peer hung up".to_string(),
            })
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.write(Frame::Text(text)).await
    }

    async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.write(Frame::Binary(bytes)).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sender.lock().await.take();
        Ok(())
    }
}

/// One side of a duplex link
#[derive(Debug)]
pub struct LinkEnd {
    pub transport: Arc<ChannelTransport>,
    pub inbound: mpsc::Receiver<Frame>,
}

impl LinkEnd {
    /// Write a frame to the other side
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.transport.send_frame(frame).await
    }

    /// Next frame written by the other side; `None` once it closed
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }
}

/// Two connected link ends with `capacity` frames of buffering per direction
pub fn duplex_link(capacity: usize) -> (LinkEnd, LinkEnd) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        LinkEnd {
            transport: Arc::new(ChannelTransport::new(b_tx)),
            inbound: a_rx,
        },
        LinkEnd {
            transport: Arc::new(ChannelTransport::new(a_tx)),
            inbound: b_rx,
        },
    )
}

/// Link two nodes; returns each node's connection to the other
pub fn connect_nodes(a: &Node, b: &Node) -> (Arc<Connection>, Arc<Connection>) {
    let (a_end, b_end) = duplex_link(64);
    let a_conn = a.attach(b.node_id().clone(), a_end.transport, a_end.inbound);
    let b_conn = b.attach(a.node_id().clone(), b_end.transport, b_end.inbound);
    (a_conn, b_conn)
}

/// Attach a scripted peer called `remote` to `node`
///
/// The returned end plays the peer: frames sent on it arrive at the node and frames
/// the node writes can be read from it.
pub fn attach_raw(node: &Node, remote: NodeId) -> LinkEnd {
    let (node_end, peer_end) = duplex_link(64);
    node.attach(remote, node_end.transport, node_end.inbound);
    peer_end
}
