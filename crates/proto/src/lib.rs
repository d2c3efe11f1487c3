//! SSH client session controller for the wisp toolkit.
//!
//! This crate drives the client side of an SSH connection on top of an
//! external wire codec:
//!
//! - **Authentication** - none, password, publickey, agent,
//!   keyboard-interactive and hostbased, tried in a fixed order
//! - **Channels** - sessions (exec, shell, subsystems), direct TCP/IP and
//!   Unix socket channels, flow-controlled data
//! - **Forwarding** - remote TCP and Unix socket forwarding, X11 and agent
//!   forwarding
//! - **Liveness** - keep-alive pings and a handshake deadline
//!
//! Key exchange, encryption and packet framing belong to the codec; see
//! [`ssh::codec`].
//!
//! # Features
//!
//! - `ssh` (default) - the SSH client controller
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::{auth_methods, AuthMethod, SshClientConfig};
//!
//! let config = SshClientConfig::builder()
//!     .with_username("deploy")
//!     .with_password("hunter2")
//!     .with_try_keyboard(true)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(
//!     auth_methods(&config),
//!     vec![AuthMethod::None, AuthMethod::Password, AuthMethod::KeyboardInteractive]
//! );
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
