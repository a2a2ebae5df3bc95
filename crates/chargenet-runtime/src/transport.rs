//! Transport seam
//!
//! A [`Transport`] writes whole frames to one remote peer. Inbound frames arrive on an
//! `mpsc::Receiver<Frame>` handed to [`Node::attach`](crate::Node::attach); the
//! channel closing is how a connection loss is observed.

use async_trait::async_trait;
use chargenet_core::{Frame, TransportError};

/// Outbound half of a persistent bidirectional connection
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Close the connection; later sends fail
    async fn close(&self) -> Result<(), TransportError>;

    /// Write one frame
    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        match frame {
            Frame::Text(text) => self.send_text(text).await,
            Frame::Binary(bytes) => self.send_binary(bytes).await,
        }
    }
}
