//! Inbound request handlers.
//!
//! Actions are dispatched through an explicit table from action name to
//! handler, built before the gateway starts. An action with no entry is
//! answered with `NotImplemented`.
//!
//! # Example
//!
//! ```rust
//! use ocpp_gateway::{HandlerRegistry, HandlerError, Payload, RequestContext};
//! use serde_json::json;
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register("Heartbeat", |_ctx: RequestContext, _payload: Payload| async move {
//!     Ok::<_, HandlerError>(Payload::Json(json!({"currentTime": "2024-01-01T00:00:00Z"})))
//! });
//! assert!(handlers.contains("Heartbeat"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::envelope::{ErrorCode, Payload};
use crate::gateway::Gateway;
use crate::types::{ConnectionId, NetworkPath, NetworkingMode, NodeId, RequestId};

/// Where an inbound request came from.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Node the request arrived from.
    pub node_id: NodeId,
    /// Connection the request arrived on.
    pub connection_id: ConnectionId,
    /// Request id; the reply carries the same id.
    pub request_id: RequestId,
    /// Action name.
    pub action: String,
    /// Framing the request arrived with.
    pub networking_mode: NetworkingMode,
    /// Destination field of an extended request, zero otherwise.
    pub destination: NodeId,
    /// Hops the request travelled through.
    pub network_path: NetworkPath,
    /// Gateway handle, for handlers that send requests of their own.
    pub gateway: Gateway,
}

/// A handler failure, answered with an error reply.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct HandlerError {
    /// Error code for the reply.
    pub code: ErrorCode,
    /// Description for the reply.
    pub description: String,
    /// Details for the reply.
    pub details: Value,
}

impl HandlerError {
    /// Error with empty details.
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    /// Attach details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// The action has no handler.
    pub fn not_implemented(action: &str) -> Self {
        Self::new(
            ErrorCode::NotImplemented,
            format!("action {action} is not implemented"),
        )
    }

    /// Unexpected failure inside a handler.
    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }
}

/// Handles one action.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the response payload for a request.
    async fn handle(&self, ctx: RequestContext, payload: Payload) -> Result<Payload, HandlerError>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(RequestContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, payload: Payload) -> Result<Payload, HandlerError> {
        self(ctx, payload).await
    }
}

/// Action name to handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `action`, replacing any previous one.
    pub fn register<H>(&mut self, action: impl Into<String>, handler: H) -> &mut Self
    where
        H: RequestHandler,
    {
        self.handlers.insert(action.into(), Arc::new(handler));
        self
    }

    /// Whether `action` has a handler.
    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered actions, sorted.
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }

    /// Run the handler for `ctx.action`.
    pub async fn dispatch(&self, ctx: RequestContext, payload: Payload) -> Result<Payload, HandlerError> {
        match self.handlers.get(&ctx.action) {
            Some(handler) => Arc::clone(handler).handle(ctx, payload).await,
            None => Err(HandlerError::not_implemented(&ctx.action)),
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}
