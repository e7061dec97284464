use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a single nsqd node: host plus its TCP and HTTP ports.
///
/// Equality and hashing consider only host and TCP port, so an address
/// discovered without an HTTP port compares equal to the same node
/// discovered through lookup.
#[derive(Debug, Clone, Eq)]
pub struct ServerAddress {
    host: String,
    port: u16,
    http_port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            http_port: 0,
        }
    }

    pub fn with_http_port(host: impl Into<String>, port: u16, http_port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            http_port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Base URL of the node's HTTP API.
    pub fn http_address(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.host == other.host
    }
}

impl Hash for ServerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
