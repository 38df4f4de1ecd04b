//! Partition key resolution.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// An opaque key identifying an isolated state partition.
///
/// Keys are only ever looked up exactly; they are never enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Create a new partition key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PartitionKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the gateway knows about an inbound request when picking its key.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The `{key}` segment of the request path
    pub path_key: String,
    /// Peer address of the connection, when the transport exposes it
    pub client_addr: Option<SocketAddr>,
}

impl RequestContext {
    pub fn new(path_key: impl Into<String>, client_addr: Option<SocketAddr>) -> Self {
        Self {
            path_key: path_key.into(),
            client_addr,
        }
    }
}

/// Maps an inbound request to the key its rate limit is tracked under.
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, ctx: &RequestContext) -> PartitionKey;
}

/// Rate limit by the named resource in the path.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathKeyResolver;

impl KeyResolver for PathKeyResolver {
    fn resolve(&self, ctx: &RequestContext) -> PartitionKey {
        PartitionKey::new(ctx.path_key.as_str())
    }
}

/// Rate limit by client IP address.
///
/// Falls back to the path key when the peer address is unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientAddrResolver;

impl KeyResolver for ClientAddrResolver {
    fn resolve(&self, ctx: &RequestContext) -> PartitionKey {
        match ctx.client_addr {
            Some(addr) => PartitionKey::new(addr.ip().to_string()),
            None => PartitionKey::new(ctx.path_key.as_str()),
        }
    }
}

/// Which request attribute the limiter key is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    #[default]
    Path,
    ClientAddr,
}

impl KeySource {
    /// Build the resolver for this source.
    pub fn resolver(&self) -> Box<dyn KeyResolver> {
        match self {
            KeySource::Path => Box::new(PathKeyResolver),
            KeySource::ClientAddr => Box::new(ClientAddrResolver),
        }
    }
}
