//! In-crate test doubles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::connection::{CloseReason, Connection, FrameSink};
use crate::envelope::{decode_binary, decode_text, Envelope, Frame};
use crate::error::TransportError;
use crate::types::NodeId;

/// Records written frames; can be switched into a failing mode.
#[derive(Default)]
pub(crate) struct MockSink {
    frames: Mutex<Vec<Frame>>,
    pings: AtomicUsize,
    fail: AtomicBool,
    closed_with: Mutex<Option<CloseReason>>,
}

impl MockSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        let sink = Self::default();
        sink.set_failing(true);
        sink
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn frames(&self) -> Vec<Frame> {
        self.frames.lock().expect("lock").clone()
    }

    pub(crate) fn envelopes(&self) -> Vec<Envelope> {
        self.frames()
            .into_iter()
            .map(|frame| match frame {
                Frame::Text(text) => decode_text(&text, usize::MAX).expect("valid frame"),
                Frame::Binary(bytes) => decode_binary(&bytes, usize::MAX).expect("valid frame"),
            })
            .collect()
    }

    pub(crate) fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_with(&self) -> Option<CloseReason> {
        *self.closed_with.lock().expect("lock")
    }
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Io("broken pipe".to_string()));
        }
        self.frames.lock().expect("lock").push(frame);
        Ok(())
    }

    async fn send_ping(&self, _payload: Vec<u8>) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Io("broken pipe".to_string()));
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, reason: CloseReason) -> Result<(), TransportError> {
        *self.closed_with.lock().expect("lock") = Some(reason);
        Ok(())
    }
}

/// Connection for `node` backed by a fresh [`MockSink`].
pub(crate) fn mock_connection(node: &str) -> (Arc<Connection>, Arc<MockSink>) {
    mock_connection_with(node, MockSink::new())
}

pub(crate) fn mock_connection_with(node: &str, sink: MockSink) -> (Arc<Connection>, Arc<MockSink>) {
    let sink = Arc::new(sink);
    let conn = Connection::new(
        NodeId::parse(node).expect("valid node id"),
        None,
        "ocpp2.0.1",
        sink.clone(),
        Duration::ZERO,
    );
    (Arc::new(conn), sink)
}

pub(crate) fn node(id: &str) -> NodeId {
    NodeId::parse(id).expect("valid node id")
}
