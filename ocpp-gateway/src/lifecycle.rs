//! Upgrade validation and connection bookkeeping.
//!
//! ```text
//! HTTP upgrade ──► validate_upgrade ──► Reject(400 | 401, JSON body)
//!                                  └──► Accept(node id, subprotocol)
//!                                         └─► on_accepted: register, evict superseded
//! socket ends  ──► on_closed: unregister if still current
//! ```

use std::sync::Arc;

use serde_json::json;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};

use crate::auth::{AuthError, BasicCredentials, CredentialStore};
use crate::config::GatewayConfig;
use crate::connection::{CloseReason, Connection};
use crate::observer::{GatewayEvent, ObserverList};
use crate::registry::ConnectionRegistry;
use crate::types::NodeId;

/// The parts of an HTTP upgrade request the gateway looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request path, e.g. `/ocpp/CS001`.
    pub path: String,
    /// Offered subprotocols, in client order.
    pub subprotocols: Vec<String>,
    /// Raw `Authorization` header.
    pub authorization: Option<String>,
}

impl UpgradeRequest {
    /// Extract from a tungstenite handshake request.
    pub fn from_http(request: &Request) -> Self {
        let subprotocols = request
            .headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let authorization = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Self {
            path: request.uri().path().to_string(),
            subprotocols,
            authorization,
        }
    }

    /// Last non-empty path segment.
    pub fn last_path_segment(&self) -> Option<&str> {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
    }
}

/// HTTP status of a rejected upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectStatus {
    /// 400.
    BadRequest,
    /// 401.
    Unauthorized,
}

impl RejectStatus {
    /// Numeric HTTP status.
    pub fn code(&self) -> u16 {
        match self {
            RejectStatus::BadRequest => 400,
            RejectStatus::Unauthorized => 401,
        }
    }
}

/// Why an upgrade was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRejection {
    /// HTTP status to answer with.
    pub status: RejectStatus,
    /// Human-readable reason.
    pub reason: String,
}

impl UpgradeRejection {
    fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            status: RejectStatus::BadRequest,
            reason: reason.into(),
        }
    }

    fn unauthorized(reason: impl Into<String>) -> Self {
        Self {
            status: RejectStatus::Unauthorized,
            reason: reason.into(),
        }
    }

    /// JSON body `{"description": {"en": reason}}`.
    pub fn body(&self) -> String {
        json!({ "description": { "en": self.reason } }).to_string()
    }
}

/// Outcome of upgrade validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeDecision {
    /// Proceed with the upgrade.
    Accept {
        /// Identity to bind to the connection.
        node_id: NodeId,
        /// Subprotocol to answer with.
        subprotocol: String,
    },
    /// Refuse the upgrade.
    Reject(UpgradeRejection),
}

/// Accepts, registers and tears down connections.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    config: Arc<GatewayConfig>,
    credentials: Arc<CredentialStore>,
    registry: Arc<ConnectionRegistry>,
    observers: ObserverList,
}

impl ConnectionLifecycle {
    /// Create a lifecycle over the given registry and credential store.
    pub fn new(
        config: Arc<GatewayConfig>,
        credentials: Arc<CredentialStore>,
        registry: Arc<ConnectionRegistry>,
        observers: ObserverList,
    ) -> Self {
        Self {
            config,
            credentials,
            registry,
            observers,
        }
    }

    /// Decide whether to accept an upgrade.
    pub fn validate_upgrade(&self, request: &UpgradeRequest) -> UpgradeDecision {
        let Some(subprotocol) = self
            .config
            .select_subprotocol(request.subprotocols.iter().map(String::as_str))
        else {
            let reason = if request.subprotocols.is_empty() {
                "no subprotocol offered".to_string()
            } else {
                format!(
                    "none of the offered subprotocols are supported: {}",
                    request.subprotocols.join(", ")
                )
            };
            return UpgradeDecision::Reject(UpgradeRejection::bad_request(reason));
        };
        let subprotocol = subprotocol.to_string();

        let node_id = if self.config.require_authentication {
            match self.authenticate(request) {
                Ok(node_id) => node_id,
                Err(rejection) => return UpgradeDecision::Reject(rejection),
            }
        } else {
            match request.last_path_segment().map(NodeId::parse) {
                Some(Ok(node_id)) => node_id,
                Some(Err(e)) => {
                    return UpgradeDecision::Reject(UpgradeRejection::bad_request(format!(
                        "invalid node id in path: {e}"
                    )))
                }
                None => {
                    return UpgradeDecision::Reject(UpgradeRejection::bad_request(
                        "missing node id in path",
                    ))
                }
            }
        };

        UpgradeDecision::Accept {
            node_id,
            subprotocol,
        }
    }

    fn authenticate(&self, request: &UpgradeRequest) -> Result<NodeId, UpgradeRejection> {
        let header = request
            .authorization
            .as_deref()
            .ok_or(AuthError::MissingHeader)
            .map_err(|e| UpgradeRejection::unauthorized(e.to_string()))?;
        let credentials = BasicCredentials::parse(header)
            .map_err(|e| UpgradeRejection::unauthorized(e.to_string()))?;
        let node_id = self
            .credentials
            .verify(&credentials)
            .map_err(|e| UpgradeRejection::unauthorized(e.to_string()))?;

        // A path naming a different node than the credentials is refused.
        if let Some(Ok(path_node)) = request.last_path_segment().map(NodeId::parse) {
            if path_node != node_id {
                return Err(UpgradeRejection::unauthorized(
                    "path node id does not match credentials",
                ));
            }
        }
        Ok(node_id)
    }

    /// Register an accepted connection, evicting any previous connection
    /// for the same node.
    pub fn on_accepted(&self, connection: &Arc<Connection>) {
        tracing::info!(
            node_id = %connection.node_id(),
            connection_id = %connection.id(),
            subprotocol = connection.subprotocol(),
            "node connected"
        );
        if let Some(old) = self.registry.register(Arc::clone(connection)) {
            self.observers.notify(&GatewayEvent::Evicted {
                node_id: old.node_id().clone(),
                connection_id: old.id(),
                reason: CloseReason::Superseded,
            });
        }
        self.observers.notify(&GatewayEvent::Connected {
            node_id: connection.node_id().clone(),
            connection_id: connection.id(),
            subprotocol: connection.subprotocol().to_string(),
        });
    }

    /// Release a closed connection.
    ///
    /// The registry entry is removed only if it still points at this
    /// connection. `reason` is recorded unless the connection was already
    /// closed for another reason.
    pub fn on_closed(&self, connection: &Arc<Connection>, reason: CloseReason) {
        connection.close(reason);
        let reason = connection.close_reason().unwrap_or(reason);
        let was_current = self
            .registry
            .unregister(connection.node_id(), connection.id())
            .is_some();
        tracing::info!(
            node_id = %connection.node_id(),
            connection_id = %connection.id(),
            %reason,
            was_current,
            "node disconnected"
        );
        self.observers.notify(&GatewayEvent::Disconnected {
            node_id: connection.node_id().clone(),
            connection_id: connection.id(),
            reason,
        });
    }
}
