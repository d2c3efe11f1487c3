//! SSH channel state and user handles.
//!
//! A live channel has two halves. The incoming endpoint is ours: its id is
//! the local channel number and its window is what the peer may still send
//! us. The outgoing endpoint is the peer's: its id is the remote channel
//! number and its window is what we may still send.
//!
//! The user holds an [`SshChannel`] and reads [`ChannelMessage`]s from it;
//! writes go through the client so they can be flow-controlled.

use crate::ssh::connection::{ChannelType, LOCAL_PACKET_SIZE, LOCAL_WINDOW_SIZE};
use crate::ssh::setup::{RequestKind, SetupQueue};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use wisp_platform::WispError;

/// SSH Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel is opening
    Opening,
    /// Channel is open and ready
    Open,
    /// Channel is closing
    Closing,
    /// Channel is closed
    Closed,
}

/// What a session channel ended up running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSubtype {
    /// Interactive shell
    Shell,
    /// Single command
    Exec,
    /// Named subsystem (e.g. sftp)
    Subsystem,
}

/// Channel message type (for async communication).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Data received on this channel
    Data(Bytes),
    /// Extended data (type 1 is stderr)
    ExtendedData {
        /// Data type code
        data_type: u32,
        /// Payload
        data: Bytes,
    },
    /// Peer will send no more data
    Eof,
    /// Remote command exit status
    ExitStatus(u32),
    /// Remote command killed by a signal
    ExitSignal {
        /// Signal name without the SIG prefix
        signal: String,
        /// Core dumped
        core_dumped: bool,
        /// Error message
        message: String,
    },
    /// Channel close
    Close,
}

/// One side of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Channel number on this side
    pub id: u32,
    /// Remaining window
    pub window: u32,
    /// Maximum packet size
    pub packet_size: u32,
    /// Side state
    pub state: ChannelState,
}

/// User handle for an open channel.
#[derive(Debug)]
pub struct SshChannel {
    local_id: u32,
    remote_id: u32,
    channel_type: ChannelType,
    subtype: Option<ChannelSubtype>,
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl SshChannel {
    /// Returns the local channel ID.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the remote channel ID.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// Shell, exec or subsystem, once the main request succeeded.
    pub fn subtype(&self) -> Option<ChannelSubtype> {
        self.subtype
    }

    pub(crate) fn set_subtype(&mut self, subtype: ChannelSubtype) {
        self.subtype = Some(subtype);
    }

    /// Reads the next message. Returns `None` once the channel is gone.
    pub async fn read(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }

    /// Returns a message if one is already queued.
    pub fn try_read(&mut self) -> Option<ChannelMessage> {
        self.rx.try_recv().ok()
    }
}

/// Controller-side channel record.
#[derive(Debug)]
pub(crate) struct Channel {
    pub(crate) channel_type: ChannelType,
    pub(crate) incoming: Endpoint,
    pub(crate) outgoing: Endpoint,
    pub(crate) subtype: Option<ChannelSubtype>,
    pub(crate) pending: VecDeque<RequestKind>,
    pub(crate) setup: Option<SetupQueue>,
    pub(crate) has_x11: bool,
    pub(crate) allow_half_open: bool,
    pub(crate) eof_queued: bool,
    pub(crate) eof_sent: bool,
    aborted: bool,
    outbound: BytesMut,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

impl Channel {
    /// Creates a live channel and its user handle.
    pub(crate) fn new(
        local_id: u32,
        channel_type: ChannelType,
        remote_id: u32,
        remote_window: u32,
        remote_packet_size: u32,
    ) -> (Self, SshChannel) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            channel_type,
            incoming: Endpoint {
                id: local_id,
                window: LOCAL_WINDOW_SIZE,
                packet_size: LOCAL_PACKET_SIZE,
                state: ChannelState::Open,
            },
            outgoing: Endpoint {
                id: remote_id,
                window: remote_window,
                packet_size: remote_packet_size,
                state: ChannelState::Open,
            },
            subtype: None,
            pending: VecDeque::new(),
            setup: None,
            has_x11: false,
            allow_half_open: true,
            eof_queued: false,
            eof_sent: false,
            aborted: false,
            outbound: BytesMut::new(),
            tx,
        };
        let handle = SshChannel {
            local_id,
            remote_id,
            channel_type,
            subtype: None,
            rx,
        };
        (channel, handle)
    }

    pub(crate) fn local_id(&self) -> u32 {
        self.incoming.id
    }

    pub(crate) fn remote_id(&self) -> u32 {
        self.outgoing.id
    }

    /// True while we may still send requests and data.
    pub(crate) fn is_open(&self) -> bool {
        self.outgoing.state == ChannelState::Open
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Hands a message to the user. A dropped handle is not an error.
    pub(crate) fn deliver(&self, message: ChannelMessage) {
        if !self.aborted {
            let _ = self.tx.send(message);
        }
    }

    /// Accounts for `len` received bytes.
    ///
    /// Returns the window adjustment to send once the receive window drops
    /// below half of its initial size.
    pub(crate) fn consume_window(&mut self, len: u32) -> Option<u32> {
        self.incoming.window = self.incoming.window.saturating_sub(len);
        if self.incoming.window < LOCAL_WINDOW_SIZE / 2 && self.incoming.state == ChannelState::Open
        {
            let adjust = LOCAL_WINDOW_SIZE - self.incoming.window;
            self.incoming.window = LOCAL_WINDOW_SIZE;
            Some(adjust)
        } else {
            None
        }
    }

    /// Peer granted more send window.
    pub(crate) fn adjust_window(&mut self, bytes: u32) {
        self.outgoing.window = self.outgoing.window.saturating_add(bytes);
    }

    /// Buffers user data for sending.
    pub(crate) fn queue_write(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
    }

    pub(crate) fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Takes the next chunk the send window and packet size allow.
    pub(crate) fn next_chunk(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() || !self.is_open() {
            return None;
        }
        let limit = self.outgoing.window.min(self.outgoing.packet_size) as usize;
        if limit == 0 {
            return None;
        }
        let len = limit.min(self.outbound.len());
        self.outgoing.window -= len as u32;
        Some(self.outbound.split_to(len).freeze())
    }

    /// Drops buffered output and stops delivering to the user.
    pub(crate) fn abort(&mut self) {
        self.aborted = true;
        self.outbound.clear();
        if let Some(setup) = self.setup.take() {
            setup.fail(WispError::Channel("Channel aborted".to_string()));
        }
    }

    /// Final teardown: fails an unfinished setup and notifies the user.
    pub(crate) fn terminate(mut self, error: WispError) {
        self.incoming.state = ChannelState::Closed;
        self.outgoing.state = ChannelState::Closed;
        if let Some(setup) = self.setup.take() {
            setup.fail(error);
        }
        self.deliver(ChannelMessage::Close);
    }
}
