//! Outbound delivery with fail-over.
//!
//! Candidates come from the routing table in order. The first successful
//! write wins. A candidate whose write fails is presumed dead: it is evicted
//! from the registry and closed before the next candidate is tried, so later
//! lookups never hit it again.

use std::sync::Arc;

use crate::connection::CloseReason;
use crate::envelope::{Envelope, EnvelopeError};
use crate::error::SendResult;
use crate::observer::{GatewayEvent, ObserverList};
use crate::registry::ConnectionRegistry;
use crate::routing::RoutingTable;
use crate::types::NodeId;

/// Writes envelopes to the connection a destination resolves to.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    routes: Arc<RoutingTable>,
    observers: ObserverList,
    max_frame_size: usize,
}

impl Dispatcher {
    /// Create a dispatcher over the given registry and routing table.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        routes: Arc<RoutingTable>,
        observers: ObserverList,
        max_frame_size: usize,
    ) -> Self {
        Self {
            registry,
            routes,
            observers,
            max_frame_size,
        }
    }

    /// Send `envelope` to `destination`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the envelope cannot be encoded. Transport
    /// failures are reported through [`SendResult`].
    pub async fn send(&self, destination: &NodeId, envelope: &Envelope) -> Result<SendResult, EnvelopeError> {
        let candidates = self.routes.resolve(destination, &self.registry);
        if candidates.is_empty() {
            tracing::debug!(%destination, "no connection for destination");
            return Ok(SendResult::UnknownClient);
        }

        for candidate in candidates {
            let frame = envelope.encode(candidate.mode, self.max_frame_size)?;
            let conn = candidate.connection;
            match conn.send_frame(frame).await {
                Ok(()) => {
                    tracing::trace!(
                        %destination,
                        node_id = %conn.node_id(),
                        request_id = %envelope.request_id(),
                        "frame sent"
                    );
                    return Ok(SendResult::Success);
                }
                Err(e) => {
                    tracing::warn!(
                        %destination,
                        node_id = %conn.node_id(),
                        connection_id = %conn.id(),
                        error = %e,
                        "write failed, evicting connection"
                    );
                    let removed = self.registry.unregister(conn.node_id(), conn.id()).is_some();
                    if conn.close(CloseReason::WriteFailed) && removed {
                        self.observers.notify(&GatewayEvent::Evicted {
                            node_id: conn.node_id().clone(),
                            connection_id: conn.id(),
                            reason: CloseReason::WriteFailed,
                        });
                    }
                }
            }
        }
        Ok(SendResult::TransmissionFailed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::envelope::{Payload, RequestEnvelope};
    use crate::testing::{mock_connection, mock_connection_with, node, MockSink};
    use crate::types::{NetworkPath, NetworkingMode, RequestId};

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        routes: Arc<RoutingTable>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let routes = Arc::new(RoutingTable::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&routes),
            ObserverList::new(),
            1024 * 1024,
        );
        Fixture {
            registry,
            routes,
            dispatcher,
        }
    }

    fn request(destination: &str) -> Envelope {
        Envelope::Request(RequestEnvelope {
            request_id: RequestId::new("1"),
            action: "Reset".to_string(),
            destination: node(destination),
            network_path: NetworkPath::new(),
            networking_mode: NetworkingMode::Standard,
            payload: Payload::Json(json!({"type": "Immediate"})),
        })
    }

    #[tokio::test]
    async fn test_unknown_client() {
        let f = fixture();
        let result = f.dispatcher.send(&node("CS1"), &request("CS1")).await;
        assert_eq!(result, Ok(SendResult::UnknownClient));
    }

    #[tokio::test]
    async fn test_direct_send_uses_standard_framing() {
        let f = fixture();
        let (conn, sink) = mock_connection("CS1");
        f.registry.register(conn);

        let result = f.dispatcher.send(&node("CS1"), &request("CS1")).await;
        assert_eq!(result, Ok(SendResult::Success));
        let Envelope::Request(sent) = &sink.envelopes()[0] else {
            panic!("expected request");
        };
        assert_eq!(sent.networking_mode, NetworkingMode::Standard);
    }

    #[tokio::test]
    async fn test_hub_send_uses_extended_framing() {
        let f = fixture();
        let (hub, sink) = mock_connection("H");
        f.registry.register(hub);
        f.routes.add_route(node("CS1"), node("H"));

        let result = f.dispatcher.send(&node("CS1"), &request("CS1")).await;
        assert_eq!(result, Ok(SendResult::Success));
        let Envelope::Request(sent) = &sink.envelopes()[0] else {
            panic!("expected request");
        };
        assert_eq!(sent.networking_mode, NetworkingMode::NetworkingExtensions);
        assert_eq!(sent.destination, node("CS1"));
    }

    #[tokio::test]
    async fn test_failed_write_evicts_connection() {
        let f = fixture();
        let (conn, _) = mock_connection_with("CS1", MockSink::failing());
        f.registry.register(conn.clone());

        let result = f.dispatcher.send(&node("CS1"), &request("CS1")).await;
        assert_eq!(result, Ok(SendResult::TransmissionFailed));
        assert!(f.registry.lookup(&node("CS1")).is_none());
        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(CloseReason::WriteFailed));

        // The dead connection is gone; the next send does not retry it.
        let result = f.dispatcher.send(&node("CS1"), &request("CS1")).await;
        assert_eq!(result, Ok(SendResult::UnknownClient));
    }

    #[tokio::test]
    async fn test_oversized_envelope_is_an_error() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(RoutingTable::new()),
            ObserverList::new(),
            16,
        );
        let (conn, sink) = mock_connection("CS1");
        registry.register(conn.clone());

        let result = dispatcher.send(&node("CS1"), &request("CS1")).await;
        assert!(matches!(result, Err(EnvelopeError::FrameTooLarge { .. })));
        assert!(sink.frames().is_empty());
        assert!(!conn.is_closed());
    }
}
