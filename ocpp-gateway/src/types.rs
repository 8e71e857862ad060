//! Core identifier types for nodes, requests and connections.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::NodeIdError;

/// Maximum length of a node identity.
pub const MAX_NODE_ID_LEN: usize = 48;

/// Maximum length of a request id accepted on the wire.
pub const MAX_REQUEST_ID_LEN: usize = 36;

/// Identity of a charging station or networking hub.
///
/// The empty identity is the distinguished "zero" value meaning
/// "no destination"; it can only be built through [`NodeId::zero`].
///
/// # Examples
///
/// ```
/// use ocpp_gateway::NodeId;
///
/// let station = NodeId::parse("CS-0042").expect("valid id");
/// assert_eq!(station.as_str(), "CS-0042");
/// assert!(!station.is_zero());
/// assert!(NodeId::zero().is_zero());
/// assert!(NodeId::parse("bad/id").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// The "no destination" identity.
    pub fn zero() -> Self {
        Self(String::new())
    }

    /// Whether this is the "no destination" identity.
    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse and validate a node identity.
    ///
    /// # Errors
    ///
    /// Returns an error for empty or overlong ids and for ids containing
    /// whitespace, control characters, `/` or `:`.
    pub fn parse(s: &str) -> Result<Self, NodeIdError> {
        if s.is_empty() {
            return Err(NodeIdError::Empty);
        }
        if s.chars().count() > MAX_NODE_ID_LEN {
            return Err(NodeIdError::TooLong {
                len: s.chars().count(),
                max: MAX_NODE_ID_LEN,
            });
        }
        if let Some(c) = s
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || *c == '/' || *c == ':')
        {
            return Err(NodeIdError::InvalidCharacter(c));
        }
        Ok(Self(s.to_string()))
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            f.write_str("<none>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl TryFrom<String> for NodeId {
    type Error = NodeIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Ok(Self::zero());
        }
        Self::parse(&value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl std::str::FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Correlation id pairing a request with its response or error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Placeholder used when replying to a frame whose id could not be read.
    pub fn unknown() -> Self {
        Self("-1".to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Factory for request ids unique within this process.
///
/// # Examples
///
/// ```
/// use ocpp_gateway::RequestIdFactory;
///
/// let factory = RequestIdFactory::new();
/// let first = factory.next_id();
/// let second = factory.next_id();
/// assert_ne!(first, second);
/// ```
#[derive(Debug)]
pub struct RequestIdFactory {
    next: AtomicU64,
}

impl RequestIdFactory {
    /// Create a factory starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed).to_string())
    }
}

impl Default for RequestIdFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-unique id of one accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate a fresh connection id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How a message reaches its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NetworkingMode {
    /// Delivered on the destination's own connection.
    #[default]
    Standard,
    /// Relayed through a hub connected to this endpoint.
    NetworkingExtensions,
}

impl NetworkingMode {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            NetworkingMode::Standard => 0,
            NetworkingMode::NetworkingExtensions => 1,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(NetworkingMode::Standard),
            1 => Some(NetworkingMode::NetworkingExtensions),
            _ => None,
        }
    }
}

/// Ordered list of hops a message has travelled through.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    /// An empty path.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Path with the given hops, in order.
    pub fn from_hops(hops: Vec<NodeId>) -> Self {
        Self(hops)
    }

    /// Append a hop.
    pub fn push(&mut self, hop: NodeId) {
        self.0.push(hop);
    }

    /// Hops in travel order.
    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }

    /// Number of hops.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the path has no hops.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
