//! SSH connection-layer vocabulary (RFC 4254).
//!
//! This module names the things the session controller asks the codec for:
//! - Channel types: session, direct-tcpip, direct-streamlocal, forwarded-tcpip,
//!   x11, auth-agent
//! - Channel open failure reasons
//! - Parameters for pty, x11 and direct-tcpip requests
//! - Options accepted by `exec` and `shell`
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::connection::{ChannelType, PtyOptions};
//!
//! assert_eq!(ChannelType::Session.name(), "session");
//! assert_eq!(PtyOptions::default().term, "vt100");
//! ```

/// Receive window advertised for every channel we open or accept (2 MB).
pub const LOCAL_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Maximum packet size advertised for every channel we open or accept (32 KB).
pub const LOCAL_PACKET_SIZE: u32 = 32 * 1024;

/// Channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    /// Session channel (shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (local port forwarding).
    DirectTcpip,
    /// Direct Unix-socket channel (OpenSSH extension).
    DirectStreamLocal,
    /// Forwarded TCP/IP channel (remote port forwarding).
    ForwardedTcpip,
    /// X11 channel.
    X11,
    /// Agent forwarding channel (OpenSSH extension).
    AuthAgent,
}

impl ChannelType {
    /// Returns the channel type name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip => "direct-tcpip",
            ChannelType::DirectStreamLocal => "direct-streamlocal@openssh.com",
            ChannelType::ForwardedTcpip => "forwarded-tcpip",
            ChannelType::X11 => "x11",
            ChannelType::AuthAgent => "auth-agent@openssh.com",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "session" => Some(ChannelType::Session),
            "direct-tcpip" => Some(ChannelType::DirectTcpip),
            "direct-streamlocal@openssh.com" => Some(ChannelType::DirectStreamLocal),
            "forwarded-tcpip" => Some(ChannelType::ForwardedTcpip),
            "x11" => Some(ChannelType::X11),
            "auth-agent@openssh.com" => Some(ChannelType::AuthAgent),
            _ => None,
        }
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}

/// Endpoints of a `direct-tcpip` open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectTcpip {
    /// Originator address
    pub src_addr: String,
    /// Originator port
    pub src_port: u32,
    /// Destination host
    pub dst_addr: String,
    /// Destination port
    pub dst_port: u32,
}

/// Pseudo-terminal parameters for a `pty-req`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyOptions {
    /// Terminal rows
    pub rows: u32,
    /// Terminal columns
    pub cols: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Value of TERM
    pub term: String,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 80,
            width: 640,
            height: 480,
            term: "vt100".to_string(),
        }
    }
}

/// Caller-facing x11 options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X11Options {
    /// Forward a single connection only.
    pub single: bool,
    /// X11 screen number.
    pub screen: u32,
}

/// Fully resolved `x11-req` parameters, including the generated cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Request {
    /// Forward a single connection only.
    pub single: bool,
    /// Authentication protocol.
    pub protocol: String,
    /// Hex-encoded authentication cookie.
    pub cookie: String,
    /// X11 screen number.
    pub screen: u32,
}

impl X11Request {
    /// Builds a request with a fresh random MIT-MAGIC-COOKIE-1.
    pub fn new(options: X11Options) -> Self {
        let cookie: [u8; 16] = rand::random();
        Self {
            single: options.single,
            protocol: "MIT-MAGIC-COOKIE-1".to_string(),
            cookie: hex::encode(cookie),
            screen: options.screen,
        }
    }
}

/// Options for [`SshClient::exec`](crate::ssh::client::SshClient::exec).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    /// Environment variables, sent before any other request.
    pub env: Vec<(String, String)>,
    /// Allocate a pseudo-terminal first.
    pub pty: Option<PtyOptions>,
    /// Request x11 forwarding first.
    pub x11: Option<X11Options>,
    /// Request agent forwarding for this channel.
    pub agent_forward: bool,
    /// Keep our side open after the peer sends EOF.
    pub allow_half_open: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            pty: None,
            x11: None,
            agent_forward: false,
            allow_half_open: true,
        }
    }
}

impl ExecOptions {
    /// Requests a default pseudo-terminal.
    pub fn with_pty(mut self) -> Self {
        self.pty = Some(PtyOptions::default());
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }
}

/// Options for [`SshClient::shell`](crate::ssh::client::SshClient::shell).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOptions {
    /// Pseudo-terminal to allocate; `None` starts a shell without one.
    pub pty: Option<PtyOptions>,
    /// Environment variables, sent before any other request.
    pub env: Vec<(String, String)>,
    /// Request x11 forwarding first.
    pub x11: Option<X11Options>,
    /// Request agent forwarding for this channel.
    pub agent_forward: bool,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            pty: Some(PtyOptions::default()),
            env: Vec::new(),
            x11: None,
            agent_forward: false,
        }
    }
}
