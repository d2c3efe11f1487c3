//! SSH agent access for authentication and agent forwarding.
//!
//! The controller talks to agents through the [`Agent`] trait. [`UnixAgent`]
//! reaches the agent behind `SSH_AUTH_SOCK` (or any configured path) with
//! `ssh-agent-client-rs`. That client is synchronous, so every call runs on
//! the blocking pool.
//!
//! Agent calls never run while the controller is borrowed. The controller
//! hands out an agent job, a task runs it under the configured timeout,
//! and the outcome comes back to the controller as its next input.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use ssh_key::public::PublicKey;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use wisp_platform::{WispError, WispResult};

/// Largest agent message accepted on a forwarded channel.
pub const MAX_AGENT_MESSAGE: usize = 256 * 1024;

/// A public key held by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentKey {
    key: PublicKey,
    blob: Bytes,
}

impl AgentKey {
    /// Wraps a parsed public key.
    pub fn new(key: PublicKey) -> WispResult<Self> {
        let blob = key
            .to_bytes()
            .map_err(|e| WispError::Agent(format!("unencodable agent key: {}", e)))?;
        Ok(Self {
            key,
            blob: Bytes::from(blob),
        })
    }

    /// Parses an OpenSSH `authorized_keys` style line.
    pub fn from_openssh(line: &str) -> WispResult<Self> {
        let key = PublicKey::from_openssh(line)
            .map_err(|e| WispError::Agent(format!("invalid public key: {}", e)))?;
        Self::new(key)
    }

    /// The parsed key.
    pub fn public_key(&self) -> &PublicKey {
        &self.key
    }

    /// Public key blob in SSH wire format.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Comment stored with the key.
    pub fn comment(&self) -> &str {
        self.key.comment()
    }

    /// Algorithm name, e.g. `ssh-rsa`.
    pub fn key_type(&self) -> String {
        self.key.algorithm().as_str().to_string()
    }
}

/// A signature produced by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSignature {
    /// Algorithm the agent signed with.
    pub algorithm: String,
    /// Raw signature, without the algorithm envelope.
    pub blob: Vec<u8>,
}

/// An SSH authentication agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Lists the keys the agent offers.
    async fn identities(&self) -> WispResult<Vec<AgentKey>>;

    /// Signs `data` with `key`.
    async fn sign(&self, key: &AgentKey, data: &[u8]) -> WispResult<AgentSignature>;

    /// Relays one framed request from a forwarded agent channel and returns
    /// the framed reply. Both carry their 4-byte length prefix.
    async fn forward(&self, _request: &[u8]) -> WispResult<Vec<u8>> {
        Err(WispError::Agent(
            "agent does not accept forwarded requests".to_string(),
        ))
    }
}

/// Agent reachable over a Unix domain socket.
#[derive(Debug, Clone)]
pub struct UnixAgent {
    socket_path: PathBuf,
}

impl UnixAgent {
    /// Uses the agent listening at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Uses `SSH_AUTH_SOCK`, if set.
    pub fn from_env() -> Option<Self> {
        std::env::var_os("SSH_AUTH_SOCK")
            .filter(|path| !path.is_empty())
            .map(Self::new)
    }

    /// Socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[async_trait]
impl Agent for UnixAgent {
    async fn identities(&self) -> WispResult<Vec<AgentKey>> {
        let socket_path = self.socket_path.clone();
        let keys = tokio::task::spawn_blocking(move || -> WispResult<Vec<PublicKey>> {
            use ssh_agent_client_rs::{Client, Identity};

            let mut client = Client::connect(&socket_path)
                .map_err(|e| WispError::Agent(format!("failed to connect to agent: {}", e)))?;
            let identities = client
                .list_all_identities()
                .map_err(|e| WispError::Agent(format!("failed to list agent identities: {}", e)))?;

            let mut keys = Vec::new();
            for identity in identities {
                match identity {
                    Identity::PublicKey(pk_cow) => keys.push(pk_cow.into_owned()),
                    Identity::Certificate(_) => debug!("skipping agent certificate"),
                }
            }
            Ok(keys)
        })
        .await
        .map_err(task_failed)??;

        debug!(path = %self.socket_path.display(), keys = keys.len(), "agent identities");
        keys.into_iter().map(AgentKey::new).collect()
    }

    async fn sign(&self, key: &AgentKey, data: &[u8]) -> WispResult<AgentSignature> {
        let socket_path = self.socket_path.clone();
        let key = key.public_key().clone();
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || -> WispResult<AgentSignature> {
            use ssh_agent_client_rs::{Client, Identity};

            let mut client = Client::connect(&socket_path)
                .map_err(|e| WispError::Agent(format!("failed to connect to agent: {}", e)))?;
            let signature = client
                .sign(Identity::from(&key), &data)
                .map_err(|e| WispError::Agent(format!("agent sign failed: {}", e)))?;

            Ok(AgentSignature {
                algorithm: signature.algorithm().as_str().to_string(),
                blob: signature.as_bytes().to_vec(),
            })
        })
        .await
        .map_err(task_failed)?
    }

    #[cfg(unix)]
    async fn forward(&self, request: &[u8]) -> WispResult<Vec<u8>> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let agent_io = |e: std::io::Error| WispError::Agent(format!("agent connection failed: {}", e));
        let mut stream = tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| WispError::Agent(format!("failed to connect to agent: {}", e)))?;
        stream.write_all(request).await.map_err(agent_io)?;

        let len = stream.read_u32().await.map_err(agent_io)? as usize;
        if len > MAX_AGENT_MESSAGE {
            return Err(WispError::Agent(format!("invalid agent reply length {}", len)));
        }
        let mut reply = vec![0u8; 4 + len];
        reply[..4].copy_from_slice(&(len as u32).to_be_bytes());
        stream.read_exact(&mut reply[4..]).await.map_err(agent_io)?;
        Ok(reply)
    }
}

fn task_failed(e: tokio::task::JoinError) -> WispError {
    WispError::Agent(format!("agent task failed: {}", e))
}

/// Agent work requested by the controller.
#[derive(Debug, Clone)]
pub(crate) enum AgentJob {
    Identities,
    Sign { key: AgentKey, data: Vec<u8> },
    Forward { local_id: u32, request: Bytes },
}

/// Result of an [`AgentJob`].
#[derive(Debug)]
pub(crate) enum AgentOutcome {
    Identities(WispResult<Vec<AgentKey>>),
    Signature(WispResult<AgentSignature>),
    Forwarded {
        local_id: u32,
        result: WispResult<Vec<u8>>,
    },
}

/// An outcome tagged with the connection attempt that asked for it.
#[derive(Debug)]
pub(crate) struct AgentReply {
    pub(crate) generation: u64,
    pub(crate) outcome: AgentOutcome,
}

impl AgentJob {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            AgentJob::Identities => "identities",
            AgentJob::Sign { .. } => "sign",
            AgentJob::Forward { .. } => "forward",
        }
    }

    /// Runs the job. A call that outlives `limit` fails with an agent error.
    pub(crate) async fn run(self, agent: Arc<dyn Agent>, limit: Duration) -> AgentOutcome {
        match self {
            AgentJob::Identities => AgentOutcome::Identities(bounded(limit, agent.identities()).await),
            AgentJob::Sign { key, data } => {
                AgentOutcome::Signature(bounded(limit, agent.sign(&key, &data)).await)
            }
            AgentJob::Forward { local_id, request } => AgentOutcome::Forwarded {
                local_id,
                result: bounded(limit, agent.forward(&request)).await,
            },
        }
    }
}

async fn bounded<T>(limit: Duration, call: impl Future<Output = WispResult<T>>) -> WispResult<T> {
    tokio::time::timeout(limit, call).await.map_err(|_| {
        WispError::Agent(format!("agent did not answer within {}ms", limit.as_millis()))
    })?
}

/// Reassembles agent requests arriving on a forwarded channel.
///
/// Requests are relayed one at a time; the next one is released only after
/// the previous reply was written back.
#[derive(Debug, Default)]
pub(crate) struct ForwardedRequests {
    buf: BytesMut,
    busy: bool,
}

impl ForwardedRequests {
    pub(crate) fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Takes the next complete request frame, length prefix included.
    pub(crate) fn next_request(&mut self) -> WispResult<Option<Bytes>> {
        if self.busy || self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_AGENT_MESSAGE {
            return Err(WispError::Agent(format!(
                "forwarded agent request too large: {} bytes",
                len
            )));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.busy = true;
        Ok(Some(self.buf.split_to(4 + len).freeze()))
    }

    /// The in-flight request was answered.
    pub(crate) fn finish(&mut self) {
        self.busy = false;
    }
}
