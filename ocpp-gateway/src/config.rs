//! Configuration structures for the gateway.

use std::net::SocketAddr;
use std::time::Duration;

/// Default port for the central-system WebSocket listener.
pub const DEFAULT_PORT: u16 = 9920;

/// Default maximum size of one WebSocket message (1MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Configuration for the gateway listener, connections and correlated sends.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: SocketAddr,

    /// Supported WebSocket subprotocols, in server preference order.
    pub subprotocols: Vec<String>,

    /// Require HTTP Basic credentials on upgrade.
    ///
    /// When disabled the node identity is taken from the last path segment
    /// of the upgrade URL.
    pub require_authentication: bool,

    /// Timeout applied to correlated sends that do not specify one.
    pub default_request_timeout: Duration,

    /// Maximum time a single socket write may take before it counts as failed.
    pub write_timeout: Duration,

    /// Maximum time allowed for the WebSocket handshake.
    pub handshake_timeout: Duration,

    /// Interval between WebSocket pings.
    ///
    /// Set to `Duration::ZERO` to disable pings.
    pub ping_interval: Duration,

    /// Maximum accepted size of one frame, in bytes.
    pub max_frame_size: usize,

    /// Capacity of the per-connection inbound request queue.
    pub request_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            subprotocols: vec![
                "ocpp2.1".to_string(),
                "ocpp2.0.1".to_string(),
                "ocpp1.6".to_string(),
            ],
            require_authentication: false,
            default_request_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            request_queue_capacity: 64,
        }
    }
}

impl GatewayConfig {
    /// Configuration for tests and local development: loopback on an
    /// ephemeral port with short timeouts and no pings.
    pub fn local_network() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            default_request_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            ping_interval: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Set the listen address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Replace the supported subprotocol list.
    pub fn with_subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable HTTP Basic authentication.
    pub fn with_authentication(mut self, required: bool) -> Self {
        self.require_authentication = required;
        self
    }

    /// Set the default timeout for correlated sends.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = timeout;
        self
    }

    /// Set the WebSocket ping interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the socket write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the per-connection inbound request queue capacity.
    pub fn with_request_queue_capacity(mut self, capacity: usize) -> Self {
        self.request_queue_capacity = capacity;
        self
    }

    /// Pick the subprotocol to use for a client offer.
    ///
    /// Returns the first entry of our preference list that the client
    /// offered, compared case-insensitively.
    pub fn select_subprotocol<'a, I>(&self, offered: I) -> Option<&str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let offered: Vec<&str> = offered.into_iter().map(str::trim).collect();
        self.subprotocols
            .iter()
            .find(|ours| offered.iter().any(|o| o.eq_ignore_ascii_case(ours)))
            .map(String::as_str)
    }
}
