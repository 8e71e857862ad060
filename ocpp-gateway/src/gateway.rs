//! Gateway facade and operator API.
//!
//! [`Gateway`] owns the registry, routing table, credential store and
//! correlation engine, and runs the WebSocket listener. It is cheap to clone;
//! every clone drives the same endpoint.
//!
//! # Example
//!
//! ```rust,no_run
//! use ocpp_gateway::{GatewayBuilder, GatewayConfig, NodeId};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), ocpp_gateway::GatewayError> {
//! let gateway = GatewayBuilder::new()
//!     .config(GatewayConfig::default())
//!     .build();
//! let server = tokio::spawn(gateway.clone().run());
//!
//! let station = NodeId::parse("CS001")?;
//! let reply = gateway
//!     .send_json_and_wait(&station, "GetBaseReport", json!({"requestId": 1}), None)
//!     .await;
//! println!("{:?}", reply.outcome);
//!
//! gateway.shutdown();
//! let _ = server.await;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialStore;
use crate::config::GatewayConfig;
use crate::connection::{CloseReason, ConnectionInfo};
use crate::correlation::{CorrelationEngine, PendingRequest};
use crate::dispatcher::Dispatcher;
use crate::envelope::Payload;
use crate::error::{GatewayError, SendResult};
use crate::handlers::{HandlerRegistry, RequestHandler};
use crate::lifecycle::ConnectionLifecycle;
use crate::observer::{GatewayEvent, GatewayObserver, ObserverList};
use crate::registry::ConnectionRegistry;
use crate::routing::RoutingTable;
use crate::session;
use crate::time::{TimeProvider, TokioTimeProvider};
use crate::types::NodeId;

/// Builder for [`Gateway`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    handlers: HandlerRegistry,
    observers: ObserverList,
    time: Option<Arc<dyn TimeProvider>>,
    credentials: Vec<(NodeId, String)>,
    routes: Vec<(NodeId, NodeId)>,
}

impl GatewayBuilder {
    /// Builder with default configuration and no handlers.
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            handlers: HandlerRegistry::new(),
            observers: ObserverList::new(),
            time: None,
            credentials: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a handler for `action`.
    pub fn handler<H: RequestHandler>(mut self, action: impl Into<String>, handler: H) -> Self {
        self.handlers.register(action, handler);
        self
    }

    /// Replace the handler table.
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Add an observer.
    pub fn observer<O: GatewayObserver>(mut self, observer: O) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Use a custom time provider.
    pub fn time_provider(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.time = Some(time);
        self
    }

    /// Seed a credential.
    pub fn credential(mut self, node_id: NodeId, password: impl Into<String>) -> Self {
        self.credentials.push((node_id, password.into()));
        self
    }

    /// Seed a static route.
    pub fn route(mut self, destination: NodeId, hub: NodeId) -> Self {
        self.routes.push((destination, hub));
        self
    }

    /// Build the gateway. Nothing listens until [`Gateway::run`] or
    /// [`Gateway::serve`] is called.
    pub fn build(self) -> Gateway {
        let config = Arc::new(self.config);
        let time = self
            .time
            .unwrap_or_else(|| Arc::new(TokioTimeProvider::new()));
        let registry = Arc::new(ConnectionRegistry::new());
        let routes = Arc::new(RoutingTable::new());
        for (destination, hub) in self.routes {
            routes.add_route(destination, hub);
        }
        let credentials = Arc::new(CredentialStore::new());
        for (node_id, password) in self.credentials {
            credentials.add_or_update(node_id, password);
        }
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&routes),
            self.observers.clone(),
            config.max_frame_size,
        ));
        let correlation =
            CorrelationEngine::new(dispatcher, Arc::clone(&time), self.observers.clone());
        let lifecycle = ConnectionLifecycle::new(
            Arc::clone(&config),
            Arc::clone(&credentials),
            Arc::clone(&registry),
            self.observers.clone(),
        );

        Gateway {
            inner: Arc::new(GatewayInner {
                config,
                registry,
                routes,
                credentials,
                correlation,
                lifecycle,
                handlers: self.handlers,
                observers: self.observers,
                time,
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct GatewayInner {
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) routes: Arc<RoutingTable>,
    pub(crate) credentials: Arc<CredentialStore>,
    pub(crate) correlation: CorrelationEngine,
    pub(crate) lifecycle: ConnectionLifecycle,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) observers: ObserverList,
    pub(crate) time: Arc<dyn TimeProvider>,
    pub(crate) shutdown: CancellationToken,
}

/// Central-system endpoint.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub(crate) fn inner(&self) -> &GatewayInner {
        &self.inner
    }

    /// Configuration the gateway was built with.
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Bind `listen_addr` and serve until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Shutdown`] if the gateway was already shut
    /// down, or an error if the listener cannot be bound.
    pub async fn run(self) -> Result<(), GatewayError> {
        if self.is_shutdown() {
            return Err(GatewayError::Shutdown);
        }
        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Shutdown`] if the gateway was already shut
    /// down, or an error if the listener's address cannot be read.
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayError> {
        if self.is_shutdown() {
            return Err(GatewayError::Shutdown);
        }
        tracing::info!(addr = %listener.local_addr()?, "gateway listening");
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%remote_addr, error = %e, "failed to set TCP_NODELAY");
                        }
                        tracing::debug!(%remote_addr, "accepted socket");
                        tokio::spawn(session::run_session(self.clone(), stream, remote_addr));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        self.inner.time.sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        tracing::info!("gateway stopped accepting connections");
        Ok(())
    }

    /// Stop accepting connections and close every live connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for conn in self.inner.registry.connections() {
            conn.close(CloseReason::Shutdown);
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Route `destination` through `hub`.
    pub fn add_static_route(&self, destination: NodeId, hub: NodeId) {
        self.inner.routes.add_route(destination, hub);
    }

    /// Remove the route `destination -> hub`. Returns whether it existed.
    pub fn remove_static_route(&self, destination: &NodeId, hub: &NodeId) -> bool {
        self.inner.routes.remove_route(destination, hub)
    }

    /// All static routes, destination to hub.
    pub fn routes(&self) -> BTreeMap<NodeId, NodeId> {
        self.inner.routes.routes()
    }

    /// Set the password for `node_id`.
    pub fn add_or_update_credential(&self, node_id: NodeId, password: impl Into<String>) {
        self.inner.credentials.add_or_update(node_id, password);
    }

    /// Remove the credential for `node_id`. Returns whether it existed.
    pub fn remove_credential(&self, node_id: &NodeId) -> bool {
        self.inner.credentials.remove(node_id)
    }

    /// Send a JSON request without waiting for the reply.
    pub async fn send_json_request(&self, destination: &NodeId, action: &str, payload: Value) -> SendResult {
        self.inner
            .correlation
            .send_and_forget(destination, action, Payload::Json(payload))
            .await
    }

    /// Send a binary request without waiting for the reply.
    pub async fn send_binary_request(&self, destination: &NodeId, action: &str, payload: Vec<u8>) -> SendResult {
        self.inner
            .correlation
            .send_and_forget(destination, action, Payload::Binary(payload))
            .await
    }

    /// Send a JSON request and wait for its reply.
    ///
    /// `timeout` defaults to the configured request timeout.
    pub async fn send_json_and_wait(
        &self,
        destination: &NodeId,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> PendingRequest {
        self.send_and_wait(destination, action, Payload::Json(payload), timeout, None)
            .await
    }

    /// Send a binary request and wait for its reply.
    ///
    /// `timeout` defaults to the configured request timeout.
    pub async fn send_binary_and_wait(
        &self,
        destination: &NodeId,
        action: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> PendingRequest {
        self.send_and_wait(destination, action, Payload::Binary(payload), timeout, None)
            .await
    }

    /// Send a request and wait for its reply, the deadline or `cancel`.
    ///
    /// A cancelled request is removed from the pending table at once; a
    /// reply arriving later is dropped.
    pub async fn send_and_wait_with_cancel(
        &self,
        destination: &NodeId,
        action: &str,
        payload: Payload,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> PendingRequest {
        self.send_and_wait(destination, action, payload, timeout, Some(cancel))
            .await
    }

    async fn send_and_wait(
        &self,
        destination: &NodeId,
        action: &str,
        payload: Payload,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> PendingRequest {
        let timeout = timeout.unwrap_or(self.inner.config.default_request_timeout);
        self.inner
            .correlation
            .send_and_wait(destination, action, payload, timeout, cancel)
            .await
    }

    /// Nodes with a live connection.
    pub fn connected_nodes(&self) -> BTreeSet<NodeId> {
        self.inner.registry.all_node_ids()
    }

    /// Metadata of the connection bound to `node_id`.
    pub fn connection_info(&self, node_id: &NodeId) -> Option<ConnectionInfo> {
        self.inner.registry.lookup(node_id).map(|conn| conn.info())
    }

    /// Close the connection bound to `node_id`. Returns whether one existed.
    pub fn disconnect(&self, node_id: &NodeId) -> bool {
        let Some(conn) = self.inner.registry.lookup(node_id) else {
            return false;
        };
        if conn.close(CloseReason::Disconnected) {
            self.inner.observers.notify(&GatewayEvent::Evicted {
                node_id: node_id.clone(),
                connection_id: conn.id(),
                reason: CloseReason::Disconnected,
            });
        }
        true
    }

    /// Number of correlated requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.correlation.pending_count()
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("listen_addr", &self.inner.config.listen_addr)
            .field("connections", &self.inner.registry.len())
            .field("pending", &self.inner.correlation.pending_count())
            .finish()
    }
}
