//! # OCPP Gateway
//!
//! Transport and routing core of an OCPP central-system endpoint.
//!
//! This crate provides:
//! - **Lifecycle**: WebSocket upgrade validation, node identity binding and
//!   eviction of superseded connections
//! - **Routing**: direct delivery or single-hop relaying through a hub
//! - **Dispatcher**: fail-over across candidate connections with eviction of
//!   dead sockets
//! - **Correlation**: fire-and-forget and send-and-wait requests with
//!   per-call timeouts and cancellation
//! - **Envelope codec**: OCPP-J JSON framing and an equivalent binary framing

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Identifier types.
pub mod types;

/// Error types and send outcomes.
pub mod error;

/// Time abstraction.
pub mod time;

/// Gateway configuration.
pub mod config;

/// Wire envelope codec.
pub mod envelope;

/// Live connection handles.
pub mod connection;

/// Node id to connection registry.
pub mod registry;

/// Static hub routes.
pub mod routing;

/// Outbound delivery.
pub mod dispatcher;

/// Request/reply correlation.
pub mod correlation;

/// Inbound request handlers.
pub mod handlers;

/// Event observers.
pub mod observer;

/// HTTP Basic authentication.
pub mod auth;

/// Connection lifecycle.
pub mod lifecycle;

/// Gateway facade.
pub mod gateway;

mod session;

#[cfg(test)]
mod testing;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use auth::{AuthError, BasicCredentials, CredentialStore};
pub use config::GatewayConfig;
pub use connection::{CloseReason, Connection, ConnectionInfo, FrameSink};
pub use correlation::{CorrelationEngine, PendingRequest, PendingState};
pub use dispatcher::Dispatcher;
pub use envelope::{
    DecodeFailure, Envelope, EnvelopeError, ErrorCode, ErrorEnvelope, Frame, Payload,
    RequestEnvelope, ResponseEnvelope, WireFormat,
};
pub use error::{GatewayError, NodeIdError, RequestOutcome, SendResult, TransportError};
pub use gateway::{Gateway, GatewayBuilder};
pub use handlers::{HandlerError, HandlerRegistry, RequestContext, RequestHandler};
pub use lifecycle::{ConnectionLifecycle, UpgradeDecision, UpgradeRejection, UpgradeRequest};
pub use observer::{GatewayEvent, GatewayObserver, ObserverError, ObserverList};
pub use registry::ConnectionRegistry;
pub use routing::{RouteCandidate, RoutingTable};
pub use time::{TimeProvider, TokioTimeProvider};
pub use types::{ConnectionId, NetworkPath, NetworkingMode, NodeId, RequestId, RequestIdFactory};
