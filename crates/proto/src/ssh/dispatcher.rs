//! Codec event pump.
//!
//! Feeds the events a codec produces into a shared [`SshClient`], one at a
//! time and in arrival order, together with the outcomes of agent calls the
//! client started.

use crate::ssh::agent::AgentReply;
use crate::ssh::client::SshClient;
use crate::ssh::codec::{Codec, CodecEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Drives a client from a codec's event stream.
pub struct MessageDispatcher {
    /// Dispatcher task handle
    task_handle: Option<JoinHandle<()>>,
}

impl MessageDispatcher {
    /// Creates a dispatcher (but doesn't start it).
    pub fn new() -> Self {
        Self { task_handle: None }
    }

    /// Starts the dispatcher task.
    ///
    /// Codec events and agent outcomes are fed to the client as they
    /// arrive. The client lock is held per input only, never while an agent
    /// call is in flight. When the codec drops its sender the client is
    /// handed a final [`CodecEvent::Close`], so the connection is always
    /// torn down.
    pub fn start<C: Codec + 'static>(
        &mut self,
        client: Arc<Mutex<SshClient<C>>>,
        mut events: mpsc::UnboundedReceiver<CodecEvent>,
    ) {
        let handle = tokio::spawn(async move {
            debug!("message dispatcher started");
            let mut agent_replies = client.lock().await.take_agent_replies();

            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        trace!(?event, "codec event");
                        let mut client = client.lock().await;
                        client.handle_event(event).await;
                        if !client.is_connected() {
                            break;
                        }
                    }
                    Some(reply) = next_reply(&mut agent_replies) => {
                        client.lock().await.handle_agent_reply(reply);
                    }
                }
            }

            client.lock().await.handle_event(CodecEvent::Close).await;
            debug!("message dispatcher stopped");
        });

        self.task_handle = Some(handle);
    }

    /// Stops the dispatcher task.
    pub fn stop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// Returns whether the task is still pumping events.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

async fn next_reply(replies: &mut Option<mpsc::UnboundedReceiver<AgentReply>>) -> Option<AgentReply> {
    match replies {
        Some(replies) => replies.recv().await,
        None => std::future::pending().await,
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
