//! Boundary between the session controller and the SSH wire codec.
//!
//! The codec owns the byte stream: version exchange, key exchange, packet
//! framing, encryption and message (de)serialization. It reports parsed
//! traffic as [`CodecEvent`]s and accepts outbound messages through the
//! [`Codec`] trait. The controller never sees raw packets.

use crate::ssh::config::Algorithms;
use crate::ssh::connection::{
    ChannelOpenFailureReason, DirectTcpip, PtyOptions, X11Request,
};
use crate::ssh::version::Version;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use wisp_platform::WispResult;

/// Outbound half of the wire codec.
///
/// Every send returns an error only when the message could not be queued at
/// all; the controller treats that as a transport failure.
pub trait Codec: Send {
    /// True while the transport accepts writes.
    fn is_writable(&self) -> bool;

    /// SERVICE_REQUEST
    fn service_request(&mut self, service: &str) -> WispResult<()>;

    /// Answers the pending host key check.
    fn host_key_verdict(&mut self, accepted: bool) -> WispResult<()>;

    /// USERAUTH_REQUEST "none"
    fn auth_none(&mut self, username: &str) -> WispResult<()>;

    /// USERAUTH_REQUEST "password"
    fn auth_password(&mut self, username: &str, password: &str) -> WispResult<()>;

    /// USERAUTH_REQUEST "publickey" without signature.
    fn auth_publickey_probe(&mut self, username: &str, key_type: &str, public_key: &[u8])
        -> WispResult<()>;

    /// Bytes a publickey signature must cover (session id plus request).
    fn publickey_sign_payload(&self, username: &str, key_type: &str, public_key: &[u8]) -> Vec<u8>;

    /// USERAUTH_REQUEST "publickey" carrying `signature`.
    fn auth_publickey_signed(
        &mut self,
        username: &str,
        key_type: &str,
        public_key: &[u8],
        signature: &[u8],
    ) -> WispResult<()>;

    /// Bytes a hostbased signature must cover.
    fn hostbased_sign_payload(
        &self,
        username: &str,
        key_type: &str,
        public_key: &[u8],
        local_hostname: &str,
        local_username: &str,
    ) -> Vec<u8>;

    /// USERAUTH_REQUEST "hostbased"
    fn auth_hostbased(
        &mut self,
        username: &str,
        key_type: &str,
        public_key: &[u8],
        local_hostname: &str,
        local_username: &str,
        signature: &[u8],
    ) -> WispResult<()>;

    /// USERAUTH_REQUEST "keyboard-interactive"
    fn auth_keyboard_interactive(&mut self, username: &str) -> WispResult<()>;

    /// USERAUTH_INFO_RESPONSE
    fn auth_info_response(&mut self, answers: &[String]) -> WispResult<()>;

    /// CHANNEL_OPEN "session"
    fn open_session(&mut self, local_id: u32, window: u32, packet_size: u32) -> WispResult<()>;

    /// CHANNEL_OPEN "direct-tcpip"
    fn open_direct_tcpip(
        &mut self,
        local_id: u32,
        window: u32,
        packet_size: u32,
        target: &DirectTcpip,
    ) -> WispResult<()>;

    /// CHANNEL_OPEN "direct-streamlocal@openssh.com"
    fn open_direct_streamlocal(
        &mut self,
        local_id: u32,
        window: u32,
        packet_size: u32,
        socket_path: &str,
    ) -> WispResult<()>;

    /// CHANNEL_OPEN_CONFIRMATION for a peer-initiated open.
    fn open_confirmation(
        &mut self,
        remote_id: u32,
        local_id: u32,
        window: u32,
        packet_size: u32,
    ) -> WispResult<()>;

    /// CHANNEL_OPEN_FAILURE for a peer-initiated open.
    fn open_failure(
        &mut self,
        remote_id: u32,
        reason: ChannelOpenFailureReason,
        description: &str,
        lang: &str,
    ) -> WispResult<()>;

    /// "pty-req" (want reply)
    fn pty_request(&mut self, remote_id: u32, pty: &PtyOptions) -> WispResult<()>;

    /// "x11-req" (want reply)
    fn x11_request(&mut self, remote_id: u32, x11: &X11Request) -> WispResult<()>;

    /// "env" (no reply)
    fn env_request(&mut self, remote_id: u32, name: &str, value: &str) -> WispResult<()>;

    /// "auth-agent-req@openssh.com" (want reply)
    fn agent_forward_request(&mut self, remote_id: u32) -> WispResult<()>;

    /// "exec" (want reply)
    fn exec_request(&mut self, remote_id: u32, command: &str) -> WispResult<()>;

    /// "shell" (want reply)
    fn shell_request(&mut self, remote_id: u32) -> WispResult<()>;

    /// "subsystem" (want reply)
    fn subsystem_request(&mut self, remote_id: u32, name: &str) -> WispResult<()>;

    /// "window-change" (no reply)
    fn window_change(
        &mut self,
        remote_id: u32,
        rows: u32,
        cols: u32,
        height: u32,
        width: u32,
    ) -> WispResult<()>;

    /// "signal" (no reply)
    fn signal(&mut self, remote_id: u32, name: &str) -> WispResult<()>;

    /// CHANNEL_DATA
    fn channel_data(&mut self, remote_id: u32, data: &[u8]) -> WispResult<()>;

    /// CHANNEL_EOF
    fn channel_eof(&mut self, remote_id: u32) -> WispResult<()>;

    /// CHANNEL_CLOSE
    fn channel_close(&mut self, remote_id: u32) -> WispResult<()>;

    /// CHANNEL_WINDOW_ADJUST
    fn window_adjust(&mut self, remote_id: u32, bytes: u32) -> WispResult<()>;

    /// GLOBAL_REQUEST "tcpip-forward" (want reply)
    fn tcpip_forward(&mut self, bind_addr: &str, bind_port: u32) -> WispResult<()>;

    /// GLOBAL_REQUEST "cancel-tcpip-forward" (want reply)
    fn cancel_tcpip_forward(&mut self, bind_addr: &str, bind_port: u32) -> WispResult<()>;

    /// GLOBAL_REQUEST "streamlocal-forward@openssh.com" (want reply)
    fn streamlocal_forward(&mut self, socket_path: &str) -> WispResult<()>;

    /// GLOBAL_REQUEST "cancel-streamlocal-forward@openssh.com" (want reply)
    fn cancel_streamlocal_forward(&mut self, socket_path: &str) -> WispResult<()>;

    /// GLOBAL_REQUEST "no-more-sessions@openssh.com" (want reply)
    fn no_more_sessions(&mut self) -> WispResult<()>;

    /// REQUEST_FAILURE for a peer global request.
    fn request_failure(&mut self) -> WispResult<()>;

    /// GLOBAL_REQUEST "keepalive@openssh.com" (want reply)
    fn ping(&mut self) -> WispResult<()>;

    /// DISCONNECT, then close the transport once flushed.
    fn disconnect(&mut self) -> WispResult<()>;

    /// Drops the transport immediately.
    fn destroy(&mut self);
}

/// Addressing of a peer-initiated `forwarded-tcpip` open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpipInfo {
    /// Address the server accepted the connection on
    pub dest_addr: String,
    /// Port the server accepted the connection on
    pub dest_port: u32,
    /// Originator address
    pub src_addr: String,
    /// Originator port
    pub src_port: u32,
}

/// Originator of a peer-initiated `x11` open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Info {
    /// Originator address
    pub src_addr: String,
    /// Originator port
    pub src_port: u32,
}

/// Type-specific payload of a CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDetails {
    /// forwarded-tcpip
    Tcpip(TcpipInfo),
    /// x11
    X11(X11Info),
    /// Nothing type-specific (auth-agent, unknown types)
    None,
}

/// CHANNEL_OPEN sent by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOpen {
    /// Channel type name as sent
    pub channel_type: String,
    /// Peer's channel number
    pub sender_channel: u32,
    /// Peer's initial window
    pub initial_window_size: u32,
    /// Peer's maximum packet size
    pub maximum_packet_size: u32,
    /// Type-specific payload
    pub details: OpenDetails,
}

/// CHANNEL_OPEN_CONFIRMATION for one of our opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConfirmation {
    /// Our channel number
    pub recipient_channel: u32,
    /// Peer's channel number
    pub sender_channel: u32,
    /// Peer's initial window
    pub initial_window_size: u32,
    /// Peer's maximum packet size
    pub maximum_packet_size: u32,
}

/// CHANNEL_OPEN_FAILURE for one of our opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFailure {
    /// Our channel number
    pub recipient_channel: u32,
    /// Reason code
    pub reason: u32,
    /// Description
    pub description: String,
    /// Language tag
    pub lang: String,
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text
    pub prompt: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// USERAUTH_INFO_REQUEST
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoRequest {
    /// Name
    pub name: String,
    /// Instructions
    pub instructions: String,
    /// Language tag
    pub lang: String,
    /// Prompts, possibly empty
    pub prompts: Vec<Prompt>,
}

/// Parsed inbound traffic and transport notifications.
#[derive(Debug)]
pub enum CodecEvent {
    /// Peer identification line and any text sent before it.
    Header {
        /// Parsed identification
        version: Version,
        /// Pre-identification greeting, if any
        greeting: Option<String>,
    },
    /// Server host key, awaiting a verdict.
    HostKey(Vec<u8>),
    /// Key exchange finished; the connection can carry services.
    Ready,
    /// SERVICE_ACCEPT
    ServiceAccept(String),
    /// USERAUTH_BANNER
    UserauthBanner(String),
    /// USERAUTH_SUCCESS
    UserauthSuccess,
    /// USERAUTH_FAILURE
    UserauthFailure {
        /// Methods that can continue
        methods: Vec<String>,
        /// Partial success
        partial_success: bool,
    },
    /// USERAUTH_PK_OK
    UserauthPkOk,
    /// USERAUTH_INFO_REQUEST
    UserauthInfoRequest(InfoRequest),
    /// CHANNEL_OPEN
    ChannelOpen(IncomingOpen),
    /// CHANNEL_OPEN_CONFIRMATION
    ChannelOpenConfirmation(OpenConfirmation),
    /// CHANNEL_OPEN_FAILURE
    ChannelOpenFailure(OpenFailure),
    /// CHANNEL_SUCCESS
    ChannelSuccess(u32),
    /// CHANNEL_FAILURE
    ChannelFailure(u32),
    /// CHANNEL_DATA
    ChannelData {
        /// Our channel number
        recipient: u32,
        /// Payload
        data: Bytes,
    },
    /// CHANNEL_EXTENDED_DATA
    ChannelExtendedData {
        /// Our channel number
        recipient: u32,
        /// Data type code
        data_type: u32,
        /// Payload
        data: Bytes,
    },
    /// CHANNEL_WINDOW_ADJUST
    ChannelWindowAdjust {
        /// Our channel number
        recipient: u32,
        /// Bytes added
        bytes_to_add: u32,
    },
    /// CHANNEL_EOF
    ChannelEof(u32),
    /// CHANNEL_CLOSE
    ChannelClose(u32),
    /// "exit-status" channel request
    ExitStatus {
        /// Our channel number
        recipient: u32,
        /// Exit code
        code: u32,
    },
    /// "exit-signal" channel request
    ExitSignal {
        /// Our channel number
        recipient: u32,
        /// Signal name
        signal: String,
        /// Core dumped
        core_dumped: bool,
        /// Error message
        message: String,
    },
    /// REQUEST_SUCCESS with optional response data
    RequestSuccess(Option<Bytes>),
    /// REQUEST_FAILURE
    RequestFailure,
    /// GLOBAL_REQUEST from the peer
    GlobalRequest {
        /// Request name
        name: String,
        /// Whether the peer expects a reply
        want_reply: bool,
    },
    /// The codec can accept more writes.
    Continue,
    /// The transport flushed its buffer.
    Drain,
    /// Malformed or unexpected traffic.
    ProtocolError(String),
    /// Transport error.
    SocketError(std::io::Error),
    /// Peer closed its write side.
    End,
    /// Transport closed.
    Close,
}

/// Attaches a codec to a connected socket.
pub trait CodecFactory: Send + Sync {
    /// Codec produced by this factory.
    type Codec: Codec + 'static;

    /// Starts the codec on `stream`. Events arrive on the returned receiver;
    /// the sender side is dropped when the transport is gone.
    fn attach(
        &self,
        stream: TcpStream,
        algorithms: &Algorithms,
    ) -> WispResult<(Self::Codec, mpsc::UnboundedReceiver<CodecEvent>)>;
}
