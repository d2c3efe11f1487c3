//! Events the client reports to its owner.

use crate::ssh::codec::InfoRequest;
use crate::ssh::incoming::IncomingKind;
use tokio::sync::mpsc;
use tracing::trace;
use wisp_platform::WispError;

/// A peer-initiated channel waiting for the user's decision.
///
/// Pass it to `accept_incoming` or `reject_incoming`. Dropping it without
/// deciding leaves the peer waiting until the connection closes.
#[derive(Debug)]
pub struct IncomingChannel {
    pub(crate) local_id: u32,
    pub(crate) kind: IncomingKind,
}

impl IncomingChannel {
    /// Local channel id reserved for this open.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// What the peer is opening.
    pub fn kind(&self) -> &IncomingKind {
        &self.kind
    }
}

/// Client lifecycle and notification events.
#[derive(Debug)]
pub enum ClientEvent {
    /// Text the server sent before its identification line.
    Greeting(String),
    /// Authentication banner.
    Banner(String),
    /// Authentication succeeded; the connection is usable.
    Ready,
    /// The server wants keyboard-interactive answers.
    KeyboardInteractive(InfoRequest),
    /// Remote forwarded connection awaiting accept / reject.
    TcpConnection(IncomingChannel),
    /// X11 connection awaiting accept / reject.
    X11(IncomingChannel),
    /// The codec can take more writes.
    Continue,
    /// The transport drained its write buffer.
    Drain,
    /// Something failed. Fatal errors are followed by `Close`.
    Error(WispError),
    /// The peer ended the connection.
    End,
    /// The connection is closed. Emitted once per connection.
    Close,
}

/// Sending side of the event stream.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl EventSink {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emits an event. Nobody listening is not an error.
    pub(crate) fn emit(&self, event: ClientEvent) {
        trace!(?event, "client event");
        let _ = self.tx.send(event);
    }
}
