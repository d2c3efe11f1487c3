//! Client configuration.
//!
//! Configuration is built once, validated, and shared read-only for the life
//! of a connection attempt.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use wisp_proto::ssh::config::SshClientConfig;
//!
//! let config = SshClientConfig::builder()
//!     .with_host("example.com")
//!     .with_username("deploy")
//!     .with_password("hunter2")
//!     .with_keepalive_interval(Duration::from_secs(15))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.port, 22);
//! assert_eq!(config.keepalive_count_max, 3);
//! ```

use crate::ssh::agent::{Agent, UnixAgent};
use crate::ssh::keys::{HostHash, Signer};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wisp_platform::{WispError, WispResult};
use zeroize::Zeroizing;

/// Key exchange algorithms the codec can negotiate.
pub const SUPPORTED_KEX: &[&str] = &[
    "ecdh-sha2-nistp256",
    "ecdh-sha2-nistp384",
    "ecdh-sha2-nistp521",
    "diffie-hellman-group-exchange-sha256",
    "diffie-hellman-group14-sha1",
    "diffie-hellman-group-exchange-sha1",
    "diffie-hellman-group1-sha1",
];

/// Ciphers the codec can negotiate.
pub const SUPPORTED_CIPHER: &[&str] = &[
    "aes128-ctr",
    "aes192-ctr",
    "aes256-ctr",
    "aes128-gcm",
    "aes128-gcm@openssh.com",
    "aes256-gcm",
    "aes256-gcm@openssh.com",
    "aes256-cbc",
    "aes192-cbc",
    "aes128-cbc",
    "blowfish-cbc",
    "3des-cbc",
    "arcfour256",
    "arcfour128",
    "cast128-cbc",
    "arcfour",
];

/// Server host key algorithms the codec can verify.
pub const SUPPORTED_SERVER_HOST_KEY: &[&str] = &[
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "ssh-dss",
];

/// MAC algorithms the codec can negotiate.
pub const SUPPORTED_HMAC: &[&str] = &[
    "hmac-sha2-256",
    "hmac-sha2-512",
    "hmac-sha1",
    "hmac-md5",
    "hmac-sha2-256-96",
    "hmac-sha2-512-96",
    "hmac-ripemd160",
    "hmac-sha1-96",
    "hmac-md5-96",
];

/// Compression methods the codec can negotiate.
pub const SUPPORTED_COMPRESS: &[&str] = &["none", "zlib@openssh.com", "zlib"];

/// Compression preference used when no explicit list is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Leave it to the codec's defaults.
    #[default]
    Default,
    /// Prefer zlib, fall back to none.
    Enabled,
    /// Require zlib.
    Forced,
    /// Never compress.
    Disabled,
}

/// Algorithm preferences handed to the codec. `None` means codec defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Algorithms {
    /// Key exchange
    pub kex: Option<Vec<String>>,
    /// Ciphers
    pub cipher: Option<Vec<String>>,
    /// Server host key algorithms
    pub server_host_key: Option<Vec<String>>,
    /// MACs
    pub hmac: Option<Vec<String>>,
    /// Compression
    pub compress: Option<Vec<String>>,
}

impl Algorithms {
    fn validate(&self) -> WispResult<()> {
        check_list(&self.kex, SUPPORTED_KEX, "key exchange")?;
        check_list(&self.cipher, SUPPORTED_CIPHER, "cipher")?;
        check_list(&self.server_host_key, SUPPORTED_SERVER_HOST_KEY, "server host key")?;
        check_list(&self.hmac, SUPPORTED_HMAC, "HMAC")?;
        check_list(&self.compress, SUPPORTED_COMPRESS, "compression")
    }

    fn apply_compression(&mut self, compression: Compression) {
        if self.compress.is_some() {
            return;
        }
        let list: &[&str] = match compression {
            Compression::Default => return,
            Compression::Enabled => &["zlib@openssh.com", "zlib", "none"],
            Compression::Forced => &["zlib@openssh.com", "zlib"],
            Compression::Disabled => &["none"],
        };
        self.compress = Some(list.iter().map(|s| s.to_string()).collect());
    }
}

fn check_list(list: &Option<Vec<String>>, supported: &[&str], what: &str) -> WispResult<()> {
    for name in list.iter().flatten() {
        if !supported.contains(&name.as_str()) {
            return Err(WispError::Config(format!(
                "Unsupported {} algorithm: {}",
                what, name
            )));
        }
    }
    Ok(())
}

/// Decides whether to trust the server host key.
///
/// Receives the key digest as a hex string (see [`HostHash`]).
pub type HostVerifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Client configuration.
#[derive(Clone)]
pub struct SshClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Resolve the host to an IPv4 address only.
    pub force_ipv4: bool,
    /// Resolve the host to an IPv6 address only.
    pub force_ipv6: bool,
    /// Keep-alive ping interval; zero disables keep-alive.
    pub keepalive_interval: Duration,
    /// Unanswered pings tolerated before the connection is declared dead.
    pub keepalive_count_max: u32,
    /// Time allowed from connect to successful authentication; zero disables.
    pub ready_timeout: Duration,
    /// Login name.
    pub username: String,
    /// Password, if password authentication should be tried.
    pub password: Option<Zeroizing<String>>,
    /// Private key for publickey (and hostbased) authentication.
    pub private_key: Option<Arc<dyn Signer>>,
    /// Client host name for hostbased authentication.
    pub local_hostname: Option<String>,
    /// Client user name for hostbased authentication.
    pub local_username: Option<String>,
    /// Try keyboard-interactive authentication.
    pub try_keyboard: bool,
    /// Agent for agent-based authentication and forwarding.
    pub agent: Option<Arc<dyn Agent>>,
    /// Upper bound on a single agent call.
    pub agent_timeout: Duration,
    /// Request agent forwarding on every session channel.
    pub agent_forward: bool,
    /// Refuse OpenSSH extensions on non-OpenSSH servers.
    pub strict_vendor: bool,
    /// Algorithm preferences.
    pub algorithms: Algorithms,
    /// Digest applied to the host key before verification.
    pub host_hash: HostHash,
    /// Host key verifier; `None` accepts any key.
    pub host_verifier: Option<HostVerifier>,
}

impl SshClientConfig {
    /// Starts a builder with defaults.
    pub fn builder() -> SshClientConfigBuilder {
        SshClientConfigBuilder::new()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> WispResult<()> {
        if self.username.is_empty() {
            return Err(WispError::Config("Invalid username".to_string()));
        }
        if self.agent_timeout.is_zero() {
            return Err(WispError::Config("Invalid agent timeout".to_string()));
        }
        if self.agent_forward && self.agent.is_none() {
            return Err(WispError::Config(
                "You must set a valid agent path to allow agent forwarding".to_string(),
            ));
        }
        self.algorithms.validate()
    }

    /// Agent forwarding is requested on session channels when the caller
    /// asks for it and an agent is available.
    pub fn agent_forward_for(&self, requested: bool) -> bool {
        self.agent.is_some() && (self.agent_forward || requested)
    }
}

impl fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("force_ipv4", &self.force_ipv4)
            .field("force_ipv6", &self.force_ipv6)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_count_max", &self.keepalive_count_max)
            .field("ready_timeout", &self.ready_timeout)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|k| k.key_type().to_string()))
            .field("local_hostname", &self.local_hostname)
            .field("local_username", &self.local_username)
            .field("try_keyboard", &self.try_keyboard)
            .field("agent", &self.agent.is_some())
            .field("agent_timeout", &self.agent_timeout)
            .field("agent_forward", &self.agent_forward)
            .field("strict_vendor", &self.strict_vendor)
            .field("algorithms", &self.algorithms)
            .field("host_hash", &self.host_hash)
            .field("host_verifier", &self.host_verifier.is_some())
            .finish()
    }
}

/// Builder for [`SshClientConfig`].
pub struct SshClientConfigBuilder {
    config: SshClientConfig,
    compression: Compression,
    host_hash: Option<String>,
}

impl SshClientConfigBuilder {
    /// Creates a builder with defaults: `localhost:22`, keep-alive off with a
    /// count of 3, 20 second ready timeout, 10 second agent timeout, strict
    /// vendor checks on.
    pub fn new() -> Self {
        Self {
            config: SshClientConfig {
                host: "localhost".to_string(),
                port: 22,
                force_ipv4: false,
                force_ipv6: false,
                keepalive_interval: Duration::ZERO,
                keepalive_count_max: 3,
                ready_timeout: Duration::from_secs(20),
                username: String::new(),
                password: None,
                private_key: None,
                local_hostname: None,
                local_username: None,
                try_keyboard: false,
                agent: None,
                agent_timeout: Duration::from_secs(10),
                agent_forward: false,
                strict_vendor: true,
                algorithms: Algorithms::default(),
                host_hash: HostHash::None,
                host_verifier: None,
            },
            compression: Compression::Default,
            host_hash: None,
        }
    }

    /// Server host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Server port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Resolve to IPv4 only.
    pub fn with_force_ipv4(mut self, force: bool) -> Self {
        self.config.force_ipv4 = force;
        self
    }

    /// Resolve to IPv6 only.
    pub fn with_force_ipv6(mut self, force: bool) -> Self {
        self.config.force_ipv6 = force;
        self
    }

    /// Keep-alive interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Unanswered keep-alives tolerated.
    pub fn with_keepalive_count_max(mut self, count: u32) -> Self {
        self.config.keepalive_count_max = count;
        self
    }

    /// Handshake plus authentication deadline.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.ready_timeout = timeout;
        self
    }

    /// Login name.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    /// Password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Private key.
    pub fn with_private_key(mut self, key: Arc<dyn Signer>) -> Self {
        self.config.private_key = Some(key);
        self
    }

    /// Client host and user for hostbased authentication.
    pub fn with_hostbased(
        mut self,
        local_hostname: impl Into<String>,
        local_username: impl Into<String>,
    ) -> Self {
        self.config.local_hostname = Some(local_hostname.into()).filter(|s| !s.is_empty());
        self.config.local_username = Some(local_username.into()).filter(|s| !s.is_empty());
        self
    }

    /// Try keyboard-interactive.
    pub fn with_try_keyboard(mut self, enabled: bool) -> Self {
        self.config.try_keyboard = enabled;
        self
    }

    /// Agent implementation.
    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.config.agent = Some(agent);
        self
    }

    /// Agent listening on a Unix socket.
    pub fn with_agent_socket(self, path: impl Into<PathBuf>) -> Self {
        self.with_agent(Arc::new(UnixAgent::new(path)))
    }

    /// Time allowed for each agent call before it counts as failed.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.config.agent_timeout = timeout;
        self
    }

    /// Forward the agent on every session.
    pub fn with_agent_forward(mut self, enabled: bool) -> Self {
        self.config.agent_forward = enabled;
        self
    }

    /// Strict vendor checks for OpenSSH extensions.
    pub fn with_strict_vendor(mut self, strict: bool) -> Self {
        self.config.strict_vendor = strict;
        self
    }

    /// Algorithm preferences.
    pub fn with_algorithms(mut self, algorithms: Algorithms) -> Self {
        self.config.algorithms = algorithms;
        self
    }

    /// Compression preference, used when no explicit list is set.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Host key digest by name (`sha1`, `sha256`, `sha512`).
    pub fn with_host_hash(mut self, name: impl Into<String>) -> Self {
        self.host_hash = Some(name.into());
        self
    }

    /// Host key verifier.
    pub fn with_host_verifier<F>(mut self, verifier: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.config.host_verifier = Some(Arc::new(verifier));
        self
    }

    /// Validates and returns the configuration.
    pub fn build(mut self) -> WispResult<SshClientConfig> {
        if let Some(name) = self.host_hash.take() {
            self.config.host_hash = HostHash::from_name(&name)?;
        }
        self.config.algorithms.apply_compression(self.compression);
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SshClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SshClientConfig::builder()
            .with_username("alice")
            .build()
            .unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 22);
        assert_eq!(config.keepalive_interval, Duration::ZERO);
        assert_eq!(config.keepalive_count_max, 3);
        assert_eq!(config.ready_timeout, Duration::from_secs(20));
        assert_eq!(config.agent_timeout, Duration::from_secs(10));
        assert!(config.strict_vendor);
        assert_eq!(config.host_hash, HostHash::None);
        assert!(config.algorithms.compress.is_none());
    }

    #[test]
    fn test_zero_agent_timeout_rejected() {
        let err = SshClientConfig::builder()
            .with_username("alice")
            .with_agent_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: Invalid agent timeout");
    }

    #[test]
    fn test_username_required() {
        let err = SshClientConfig::builder().build().unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: Invalid username");
    }

    #[test]
    fn test_agent_forward_needs_agent() {
        let err = SshClientConfig::builder()
            .with_username("alice")
            .with_agent_forward(true)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("valid agent path"));

        let config = SshClientConfig::builder()
            .with_username("alice")
            .with_agent_socket("/tmp/agent.sock")
            .with_agent_forward(true)
            .build()
            .unwrap();
        assert!(config.agent_forward_for(false));
    }

    #[test]
    fn test_unsupported_algorithm() {
        let err = SshClientConfig::builder()
            .with_username("alice")
            .with_algorithms(Algorithms {
                cipher: Some(vec!["aes128-ctr".to_string(), "rot13".to_string()]),
                ..Algorithms::default()
            })
            .build()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: Unsupported cipher algorithm: rot13"
        );
    }

    #[test]
    fn test_compression_lists() {
        let forced = SshClientConfig::builder()
            .with_username("alice")
            .with_compression(Compression::Forced)
            .build()
            .unwrap();
        assert_eq!(
            forced.algorithms.compress,
            Some(vec!["zlib@openssh.com".to_string(), "zlib".to_string()])
        );

        let off = SshClientConfig::builder()
            .with_username("alice")
            .with_compression(Compression::Disabled)
            .build()
            .unwrap();
        assert_eq!(off.algorithms.compress, Some(vec!["none".to_string()]));
    }

    #[test]
    fn test_host_hash_and_debug_redaction() {
        let config = SshClientConfig::builder()
            .with_username("alice")
            .with_password("s3cret")
            .with_host_hash("sha256")
            .build()
            .unwrap();
        assert_eq!(config.host_hash, HostHash::Sha256);
        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));

        assert!(SshClientConfig::builder()
            .with_username("alice")
            .with_host_hash("crc32")
            .build()
            .is_err());
    }
}
