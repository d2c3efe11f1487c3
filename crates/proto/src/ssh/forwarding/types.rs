//! Common types for remote port forwarding.

use std::fmt;

/// Bind address of a remote forwarding, as the server saw it.
///
/// Renders as `host:port`, which is also the form the peer echoes back in
/// `forwarded-tcpip` opens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardAddr {
    /// Host or IP address
    pub host: String,
    /// Port number; 0 means "let the server pick".
    pub port: u32,
}

impl ForwardAddr {
    /// Creates a new forward address.
    pub fn new(host: impl Into<String>, port: u32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// True when the server was asked to allocate the port.
    pub fn is_dynamic(&self) -> bool {
        self.port == 0
    }
}

impl fmt::Display for ForwardAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
