//! Transport that records every frame written to it

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::sync::Mutex;

use async_trait::async_trait;
use chargenet_core::{Envelope, EnvelopeCodec, Frame, RequestId, TransportError};
use chargenet_runtime::Transport;

/// Records frames instead of delivering them
///
/// An optional delay is applied to every write, which holds the connection's send
/// lock for that long.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    frames: Mutex<Vec<Frame>>,
    delay: Option<Duration>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make subsequent writes fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .map(|frames| frames.clone())
            .unwrap_or_default()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().map(|frames| frames.len()).unwrap_or(0)
    }

    /// Decoded envelopes, skipping anything that does not decode
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.frames()
            .iter()
            .filter_map(|frame| EnvelopeCodec::decode(frame).ok())
            .collect()
    }

    /// Request ids of the written envelopes, in write order
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.envelopes()
            .iter()
            .map(|envelope| envelope.request_id().clone())
            .collect()
    }

    fn record(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed {
                reason: "transport closed".to_string(),
            });
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed {
                reason: "write refused".to_string(),
            });
        }
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(frame);
        }
        Ok(())
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.pause().await;
        self.record(Frame::Text(text))
    }

    async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.pause().await;
        self.record(Frame::Binary(bytes))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
