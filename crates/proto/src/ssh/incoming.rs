//! Policy for channels the peer opens.
//!
//! The peer may only open channels we asked for:
//! - `forwarded-tcpip` needs an active `tcpip-forward` binding.
//! - `x11` needs at least one session with x11 forwarding.
//! - `auth-agent@openssh.com` needs agent forwarding to have been granted.
//!
//! Anything else is refused before the user hears about it.

use crate::ssh::codec::{IncomingOpen, OpenDetails, TcpipInfo, X11Info};
use crate::ssh::connection::{ChannelOpenFailureReason, ChannelType};
use crate::ssh::forwarding::ForwardingTable;

/// Connection state the policy looks at.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PolicyState<'a> {
    pub(crate) forwarding: &'a ForwardingTable,
    pub(crate) x11_accepts: u32,
    pub(crate) agent_forwarding: bool,
}

/// An open that passed the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingKind {
    /// Remote forwarded connection; `dest_port` is already resolved.
    ForwardedTcpip(TcpipInfo),
    /// X11 connection
    X11(X11Info),
    /// Agent forwarding connection
    AuthAgent,
}

impl IncomingKind {
    /// Channel type of the open.
    pub fn channel_type(&self) -> ChannelType {
        match self {
            IncomingKind::ForwardedTcpip(_) => ChannelType::ForwardedTcpip,
            IncomingKind::X11(_) => ChannelType::X11,
            IncomingKind::AuthAgent => ChannelType::AuthAgent,
        }
    }
}

/// Decides whether an incoming open may proceed.
pub(crate) fn classify(
    open: &IncomingOpen,
    state: PolicyState<'_>,
) -> Result<IncomingKind, ChannelOpenFailureReason> {
    match (ChannelType::from_name(&open.channel_type), &open.details) {
        (Some(ChannelType::ForwardedTcpip), OpenDetails::Tcpip(info)) => {
            match state.forwarding.resolve(&info.dest_addr, info.dest_port) {
                Some(dest_port) => Ok(IncomingKind::ForwardedTcpip(TcpipInfo {
                    dest_port,
                    ..info.clone()
                })),
                None => Err(ChannelOpenFailureReason::AdministrativelyProhibited),
            }
        }
        (Some(ChannelType::X11), OpenDetails::X11(info)) => {
            if state.x11_accepts > 0 {
                Ok(IncomingKind::X11(info.clone()))
            } else {
                Err(ChannelOpenFailureReason::AdministrativelyProhibited)
            }
        }
        (Some(ChannelType::AuthAgent), _) => {
            if state.agent_forwarding {
                Ok(IncomingKind::AuthAgent)
            } else {
                Err(ChannelOpenFailureReason::AdministrativelyProhibited)
            }
        }
        _ => Err(ChannelOpenFailureReason::UnknownChannelType),
    }
}
