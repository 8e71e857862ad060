//! HTTP Basic authentication for node upgrades.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use thiserror::Error;

use crate::types::NodeId;

/// Reasons an `Authorization` header is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No `Authorization` header.
    #[error("missing Authorization header")]
    MissingHeader,

    /// The header does not use the Basic scheme.
    #[error("unsupported authorization scheme")]
    UnsupportedScheme,

    /// The credentials are not valid base64.
    #[error("credentials are not valid base64")]
    InvalidBase64,

    /// The decoded credentials are not UTF-8.
    #[error("credentials are not valid UTF-8")]
    InvalidUtf8,

    /// The decoded credentials have no `:` separator.
    #[error("credentials are missing the user/password separator")]
    MissingSeparator,

    /// Unknown node or wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Decoded `Authorization: Basic` credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    /// User id; the node identity.
    pub user: String,
    /// Password.
    pub password: String,
}

impl BasicCredentials {
    /// Build credentials.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Parse an `Authorization` header value.
    ///
    /// # Errors
    ///
    /// Fails if the scheme is not Basic or the token is malformed.
    pub fn parse(header: &str) -> Result<Self, AuthError> {
        let header = header.trim();
        let (scheme, token) = header.split_once(' ').ok_or(AuthError::UnsupportedScheme)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthError::UnsupportedScheme);
        }
        let decoded = STANDARD
            .decode(token.trim())
            .map_err(|_| AuthError::InvalidBase64)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidUtf8)?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or(AuthError::MissingSeparator)?;
        Ok(Self::new(user, password))
    }

    /// Encode as an `Authorization` header value.
    pub fn to_header_value(&self) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", self.user, self.password))
        )
    }
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Operator-maintained node id to password map.
#[derive(Default)]
pub struct CredentialStore {
    passwords: DashMap<NodeId, String>,
}

impl CredentialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the password for `node_id`.
    pub fn add_or_update(&self, node_id: NodeId, password: impl Into<String>) {
        self.passwords.insert(node_id, password.into());
    }

    /// Remove the credential for `node_id`. Returns whether one existed.
    pub fn remove(&self, node_id: &NodeId) -> bool {
        self.passwords.remove(node_id).is_some()
    }

    /// Whether `node_id` has a credential.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.passwords.contains_key(node_id)
    }

    /// Number of credentials.
    pub fn len(&self) -> usize {
        self.passwords.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }

    /// Check `credentials` and return the authenticated node id.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] for unknown nodes and wrong
    /// passwords alike.
    pub fn verify(&self, credentials: &BasicCredentials) -> Result<NodeId, AuthError> {
        let node_id =
            NodeId::parse(&credentials.user).map_err(|_| AuthError::InvalidCredentials)?;
        let matches = self
            .passwords
            .get(&node_id)
            .map(|expected| constant_time_eq(expected.as_bytes(), credentials.password.as_bytes()))
            .unwrap_or(false);
        if matches {
            Ok(node_id)
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("credentials", &self.passwords.len())
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
