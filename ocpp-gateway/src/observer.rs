//! Lifecycle and message notifications.
//!
//! Observers are called synchronously from the connection tasks, so they
//! should hand heavy work off to a channel or a spawned task. Every observer
//! sees every event; a failing or panicking observer is logged as an
//! internal error and does not stop the rest.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::connection::CloseReason;
use crate::types::{ConnectionId, NodeId, RequestId};

/// Something that happened on the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A node connected and was registered.
    Connected {
        /// Node identity.
        node_id: NodeId,
        /// New connection.
        connection_id: ConnectionId,
        /// Negotiated subprotocol.
        subprotocol: String,
    },
    /// A connection ended.
    Disconnected {
        /// Node identity.
        node_id: NodeId,
        /// Closed connection.
        connection_id: ConnectionId,
        /// Why it closed.
        reason: CloseReason,
    },
    /// A connection was forcibly removed from the registry.
    Evicted {
        /// Node identity.
        node_id: NodeId,
        /// Evicted connection.
        connection_id: ConnectionId,
        /// Why it was evicted.
        reason: CloseReason,
    },
    /// A request arrived from a node.
    RequestReceived {
        /// Sending node.
        node_id: NodeId,
        /// Request id.
        request_id: RequestId,
        /// Action name.
        action: String,
    },
    /// A reply arrived for no pending request.
    ReplyUnmatched {
        /// Sending node.
        node_id: NodeId,
        /// Request id carried by the reply.
        request_id: RequestId,
    },
    /// An inbound frame could not be decoded.
    DecodeFailed {
        /// Sending node.
        node_id: NodeId,
        /// Request id, if it could be recovered.
        request_id: Option<RequestId>,
        /// Decode error.
        error: String,
    },
}

impl GatewayEvent {
    fn name(&self) -> &'static str {
        match self {
            GatewayEvent::Connected { .. } => "connected",
            GatewayEvent::Disconnected { .. } => "disconnected",
            GatewayEvent::Evicted { .. } => "evicted",
            GatewayEvent::RequestReceived { .. } => "request_received",
            GatewayEvent::ReplyUnmatched { .. } => "reply_unmatched",
            GatewayEvent::DecodeFailed { .. } => "decode_failed",
        }
    }
}

/// Failure reported by an observer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ObserverError(pub String);

impl ObserverError {
    /// Wrap a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Receives gateway events.
pub trait GatewayObserver: Send + Sync + 'static {
    /// Handle one event.
    fn on_event(&self, event: &GatewayEvent) -> Result<(), ObserverError>;
}

impl<F> GatewayObserver for F
where
    F: Fn(&GatewayEvent) -> Result<(), ObserverError> + Send + Sync + 'static,
{
    fn on_event(&self, event: &GatewayEvent) -> Result<(), ObserverError> {
        self(event)
    }
}

/// Ordered set of observers.
#[derive(Clone, Default)]
pub struct ObserverList {
    observers: Vec<Arc<dyn GatewayObserver>>,
}

impl ObserverList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer.
    pub fn push(&mut self, observer: Arc<dyn GatewayObserver>) {
        self.observers.push(observer);
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Deliver `event` to every observer and return the failures.
    pub fn notify(&self, event: &GatewayEvent) -> Vec<ObserverError> {
        let mut failures = Vec::new();
        for observer in &self.observers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(event)))
                .unwrap_or_else(|_| Err(ObserverError::new("observer panicked")));
            if let Err(error) = result {
                tracing::error!(
                    event = event.name(),
                    error = %error,
                    code = "InternalError",
                    "observer failed"
                );
                failures.push(error);
            }
        }
        failures
    }
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("observers", &self.observers.len())
            .finish()
    }
}
