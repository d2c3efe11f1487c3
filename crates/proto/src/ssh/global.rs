//! Connection-scoped global request tracking.
//!
//! The peer answers global requests in the order they were sent, so waiters
//! live in a FIFO queue. A REQUEST_SUCCESS / REQUEST_FAILURE always resolves
//! the oldest waiter. Keep-alive pings share the queue with user requests.

use crate::ssh::forwarding::ForwardingTable;
use crate::ssh::pending::Completion;
use crate::ssh::session::keepalive::KeepaliveWatchdog;
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::debug;
use wisp_platform::WispError;

/// How a global request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GlobalReply {
    /// REQUEST_SUCCESS with its response payload.
    Success(Option<Bytes>),
    /// REQUEST_FAILURE
    Failure,
    /// The connection closed first.
    Disconnected,
}

/// State a reply may update.
pub(crate) struct ReplyContext<'a> {
    pub(crate) forwarding: &'a mut ForwardingTable,
    pub(crate) keepalive: &'a mut KeepaliveWatchdog,
    pub(crate) dyn_rport_bug: bool,
}

/// A sent global request waiting for its reply.
#[derive(Debug)]
pub(crate) enum GlobalWaiter {
    ForwardIn {
        host: String,
        port: u32,
        completion: Completion<u32>,
    },
    UnforwardIn {
        host: String,
        port: u32,
        completion: Completion<()>,
    },
    StreamLocalForward {
        socket_path: String,
        completion: Completion<()>,
    },
    CancelStreamLocalForward {
        socket_path: String,
        completion: Completion<()>,
    },
    NoMoreSessions {
        completion: Completion<()>,
    },
    Keepalive,
}

impl GlobalWaiter {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            GlobalWaiter::ForwardIn { .. } => "tcpip-forward",
            GlobalWaiter::UnforwardIn { .. } => "cancel-tcpip-forward",
            GlobalWaiter::StreamLocalForward { .. } => "streamlocal-forward@openssh.com",
            GlobalWaiter::CancelStreamLocalForward { .. } => {
                "cancel-streamlocal-forward@openssh.com"
            }
            GlobalWaiter::NoMoreSessions { .. } => "no-more-sessions@openssh.com",
            GlobalWaiter::Keepalive => "keepalive@openssh.com",
        }
    }

    /// Resolves the waiter.
    pub(crate) fn complete(self, reply: GlobalReply, cx: &mut ReplyContext<'_>) {
        debug!(request = self.name(), ?reply, "global request answered");
        match self {
            GlobalWaiter::ForwardIn {
                host,
                port,
                completion,
            } => match reply {
                GlobalReply::Success(payload) => {
                    let real_port = if port == 0 {
                        allocated_port(payload.as_deref()).unwrap_or(port)
                    } else {
                        port
                    };
                    let bind_port = if port == 0 && cx.dyn_rport_bug {
                        port
                    } else {
                        real_port
                    };
                    cx.forwarding.insert(&host, port, bind_port, real_port);
                    completion.complete(Ok(real_port));
                }
                GlobalReply::Failure => completion.complete(Err(WispError::Request(format!(
                    "Unable to bind to {}:{}",
                    host, port
                )))),
                GlobalReply::Disconnected => completion.complete(Err(WispError::Disconnected)),
            },
            GlobalWaiter::UnforwardIn {
                host,
                port,
                completion,
            } => match reply {
                GlobalReply::Success(_) => {
                    let released = cx.forwarding.release(&host, port);
                    if released.is_empty() {
                        debug!(%host, port, "cancelled forwarding was not recorded");
                    }
                    completion.complete(Ok(()));
                }
                GlobalReply::Failure => completion.complete(Err(WispError::Request(format!(
                    "Unable to unbind from {}:{}",
                    host, port
                )))),
                GlobalReply::Disconnected => completion.complete(Err(WispError::Disconnected)),
            },
            GlobalWaiter::StreamLocalForward {
                socket_path,
                completion,
            } => completion.complete(match reply {
                GlobalReply::Success(_) => Ok(()),
                GlobalReply::Failure => Err(WispError::Request(format!(
                    "Unable to bind to {}",
                    socket_path
                ))),
                GlobalReply::Disconnected => Err(WispError::Disconnected),
            }),
            GlobalWaiter::CancelStreamLocalForward {
                socket_path,
                completion,
            } => completion.complete(match reply {
                GlobalReply::Success(_) => Ok(()),
                GlobalReply::Failure => Err(WispError::Request(format!(
                    "Unable to unbind on {}",
                    socket_path
                ))),
                GlobalReply::Disconnected => Err(WispError::Disconnected),
            }),
            GlobalWaiter::NoMoreSessions { completion } => completion.complete(match reply {
                GlobalReply::Success(_) => Ok(()),
                GlobalReply::Failure => Err(WispError::Request(
                    "Unable to disable future sessions".to_string(),
                )),
                GlobalReply::Disconnected => Err(WispError::Disconnected),
            }),
            GlobalWaiter::Keepalive => {
                if reply != GlobalReply::Disconnected {
                    cx.keepalive.reset();
                }
            }
        }
    }
}

fn allocated_port(payload: Option<&[u8]>) -> Option<u32> {
    let bytes: [u8; 4] = payload?.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// FIFO of outstanding global requests.
#[derive(Debug, Default)]
pub(crate) struct GlobalRequestQueue {
    waiters: VecDeque<GlobalWaiter>,
}

impl GlobalRequestQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, waiter: GlobalWaiter) {
        self.waiters.push_back(waiter);
    }

    /// Oldest waiter, answered by the next reply.
    pub(crate) fn pop(&mut self) -> Option<GlobalWaiter> {
        self.waiters.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<GlobalWaiter> {
        self.waiters.drain(..).collect()
    }
}
