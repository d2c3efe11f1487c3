//! SSH client session controller.
//!
//! This module implements the client side of the SSH connection protocol on
//! top of an external wire codec (RFC 4251-4254).
//!
//! # Architecture
//!
//! The controller is layered around a single event-driven core:
//!
//! 1. **Codec boundary** ([`codec`]) - named protocol events in, encode calls out
//! 2. **Authentication** ([`auth`], [`agent`], [`keys`]) - method sequencing (RFC 4252)
//! 3. **Channels** ([`registry`], [`channel`], setup sequencing, [`incoming`]) - multiplexing (RFC 4254)
//! 4. **Connection requests** ([`forwarding`], global request queue, [`session::keepalive`])
//! 5. **Controller** ([`client`]) - wires the above to the codec and the user
//! 6. **Facade** ([`session`], [`dispatcher`]) - sockets, tasks and timers
//!
//! Requests on one channel, and global requests on the connection, are
//! answered by the peer in the order they were sent. The controller relies
//! on that: each keeps a FIFO of waiters and the next reply resolves the
//! oldest one.
//!
//! # Example
//!
//! ```rust,no_run
//! use wisp_proto::ssh::{ExecOptions, Session, SshClientConfig};
//! # use wisp_proto::ssh::codec::CodecFactory;
//!
//! # async fn run<F: CodecFactory>(factory: F) -> Result<(), Box<dyn std::error::Error>> {
//! let config = SshClientConfig::builder()
//!     .with_host("example.com")
//!     .with_username("deploy")
//!     .with_agent_socket("/run/user/1000/ssh-agent.sock")
//!     .build()?;
//!
//! let mut session = Session::connect(config, &factory).await?;
//! session.wait_ready().await?;
//!
//! let mut channel = session.exec("uname -a", ExecOptions::default()).await?;
//! while let Some(message) = channel.read().await {
//!     println!("{:?}", message);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [PROTOCOL.agent](https://datatracker.ietf.org/doc/html/draft-miller-ssh-agent) - SSH Agent Protocol

pub mod agent;
pub mod auth;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod forwarding;
pub mod incoming;
pub mod keys;
pub mod pending;
pub mod registry;
pub mod session;
pub mod version;

pub(crate) mod global;
pub(crate) mod setup;

// Re-export main types
pub use agent::{Agent, AgentKey, AgentSignature, UnixAgent};
pub use auth::{auth_methods, AuthMethod};
pub use channel::{ChannelMessage, ChannelState, ChannelSubtype, SshChannel};
pub use client::SshClient;
pub use codec::{Codec, CodecEvent, CodecFactory};
pub use config::{Algorithms, Compression, SshClientConfig, SshClientConfigBuilder};
pub use connection::{
    ChannelOpenFailureReason, ChannelType, DirectTcpip, ExecOptions, PtyOptions, ShellOptions,
    X11Options,
};
pub use events::{ClientEvent, IncomingChannel};
pub use forwarding::{ForwardAddr, ForwardingTable};
pub use incoming::IncomingKind;
pub use keys::{HashAlgorithm, HostHash, KeyType, Signer};
pub use pending::Pending;
pub use session::Session;
pub use version::Version;
