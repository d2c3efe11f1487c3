//! Shared fixtures for the controller tests.
//!
//! [`RecordingCodec`] stands in for the wire codec: every outbound message
//! is appended to a [`Wire`] log the test keeps a handle to, so the log
//! survives the client dropping the codec on close.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use wisp_platform::{WispError, WispResult};
use wisp_proto::ssh::codec::{Codec, CodecEvent, OpenConfirmation};
use wisp_proto::ssh::config::SshClientConfigBuilder;
use wisp_proto::ssh::connection::{ChannelOpenFailureReason, DirectTcpip, PtyOptions, X11Request};
use wisp_proto::ssh::{
    Agent, AgentKey, AgentSignature, ClientEvent, HashAlgorithm, Signer, SshClient,
    SshClientConfig, Version,
};

/// Initial window the scripted server grants on every channel.
pub const SERVER_WINDOW: u32 = 1024 * 1024;

/// Maximum packet size the scripted server accepts.
pub const SERVER_PACKET: u32 = 32 * 1024;

/// One outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    ServiceRequest(String),
    HostKeyVerdict(bool),
    AuthNone,
    AuthPassword(String),
    PublicKeyProbe {
        key_type: String,
        public_key: Vec<u8>,
    },
    PublicKeySigned {
        key_type: String,
        public_key: Vec<u8>,
        signature: Vec<u8>,
    },
    HostBased {
        key_type: String,
        local_hostname: String,
        local_username: String,
        signature: Vec<u8>,
    },
    KeyboardInteractive,
    InfoResponse(Vec<String>),
    OpenSession(u32),
    OpenDirectTcpip {
        local_id: u32,
        target: DirectTcpip,
    },
    OpenDirectStreamLocal {
        local_id: u32,
        socket_path: String,
    },
    OpenConfirmation {
        remote_id: u32,
        local_id: u32,
    },
    OpenFailure {
        remote_id: u32,
        reason: ChannelOpenFailureReason,
    },
    Pty(u32),
    X11 {
        remote_id: u32,
        single: bool,
        screen: u32,
    },
    Env {
        remote_id: u32,
        name: String,
        value: String,
    },
    AgentForward(u32),
    Exec {
        remote_id: u32,
        command: String,
    },
    Shell(u32),
    Subsystem {
        remote_id: u32,
        name: String,
    },
    WindowChange {
        remote_id: u32,
        rows: u32,
        cols: u32,
    },
    Signal {
        remote_id: u32,
        name: String,
    },
    Data {
        remote_id: u32,
        data: Vec<u8>,
    },
    Eof(u32),
    Close(u32),
    WindowAdjust {
        remote_id: u32,
        bytes: u32,
    },
    TcpipForward {
        addr: String,
        port: u32,
    },
    CancelTcpipForward {
        addr: String,
        port: u32,
    },
    StreamLocalForward(String),
    CancelStreamLocalForward(String),
    NoMoreSessions,
    RequestFailure,
    Ping,
    Disconnect,
}

/// Test-side view of a [`RecordingCodec`].
#[derive(Debug, Clone)]
pub struct Wire {
    sent: Arc<Mutex<Vec<Sent>>>,
    writable: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
}

impl Wire {
    /// Everything sent so far.
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Everything sent since the last call.
    pub fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn count(&self, predicate: impl Fn(&Sent) -> bool) -> usize {
        self.sent.lock().unwrap().iter().filter(|s| predicate(s)).count()
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Makes every following send fail as a broken transport would.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Codec double that records instead of encoding.
#[derive(Debug)]
pub struct RecordingCodec {
    wire: Wire,
}

impl RecordingCodec {
    pub fn new() -> (Self, Wire) {
        let wire = Wire {
            sent: Arc::new(Mutex::new(Vec::new())),
            writable: Arc::new(AtomicBool::new(true)),
            destroyed: Arc::new(AtomicBool::new(false)),
            fail_sends: Arc::new(AtomicBool::new(false)),
        };
        (Self { wire: wire.clone() }, wire)
    }

    fn record(&mut self, message: Sent) -> WispResult<()> {
        if self.wire.fail_sends.load(Ordering::SeqCst) {
            return Err(WispError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        self.wire.sent.lock().unwrap().push(message);
        Ok(())
    }
}

impl Codec for RecordingCodec {
    fn is_writable(&self) -> bool {
        self.wire.writable.load(Ordering::SeqCst)
    }

    fn service_request(&mut self, service: &str) -> WispResult<()> {
        self.record(Sent::ServiceRequest(service.to_string()))
    }

    fn host_key_verdict(&mut self, accepted: bool) -> WispResult<()> {
        self.record(Sent::HostKeyVerdict(accepted))
    }

    fn auth_none(&mut self, _username: &str) -> WispResult<()> {
        self.record(Sent::AuthNone)
    }

    fn auth_password(&mut self, _username: &str, password: &str) -> WispResult<()> {
        self.record(Sent::AuthPassword(password.to_string()))
    }

    fn auth_publickey_probe(
        &mut self,
        _username: &str,
        key_type: &str,
        public_key: &[u8],
    ) -> WispResult<()> {
        self.record(Sent::PublicKeyProbe {
            key_type: key_type.to_string(),
            public_key: public_key.to_vec(),
        })
    }

    fn publickey_sign_payload(&self, username: &str, key_type: &str, _public_key: &[u8]) -> Vec<u8> {
        format!("session|{}|{}", username, key_type).into_bytes()
    }

    fn auth_publickey_signed(
        &mut self,
        _username: &str,
        key_type: &str,
        public_key: &[u8],
        signature: &[u8],
    ) -> WispResult<()> {
        self.record(Sent::PublicKeySigned {
            key_type: key_type.to_string(),
            public_key: public_key.to_vec(),
            signature: signature.to_vec(),
        })
    }

    fn hostbased_sign_payload(
        &self,
        username: &str,
        key_type: &str,
        _public_key: &[u8],
        local_hostname: &str,
        local_username: &str,
    ) -> Vec<u8> {
        format!(
            "hostbased|{}|{}|{}|{}",
            username, key_type, local_hostname, local_username
        )
        .into_bytes()
    }

    fn auth_hostbased(
        &mut self,
        _username: &str,
        key_type: &str,
        _public_key: &[u8],
        local_hostname: &str,
        local_username: &str,
        signature: &[u8],
    ) -> WispResult<()> {
        self.record(Sent::HostBased {
            key_type: key_type.to_string(),
            local_hostname: local_hostname.to_string(),
            local_username: local_username.to_string(),
            signature: signature.to_vec(),
        })
    }

    fn auth_keyboard_interactive(&mut self, _username: &str) -> WispResult<()> {
        self.record(Sent::KeyboardInteractive)
    }

    fn auth_info_response(&mut self, answers: &[String]) -> WispResult<()> {
        self.record(Sent::InfoResponse(answers.to_vec()))
    }

    fn open_session(&mut self, local_id: u32, _window: u32, _packet_size: u32) -> WispResult<()> {
        self.record(Sent::OpenSession(local_id))
    }

    fn open_direct_tcpip(
        &mut self,
        local_id: u32,
        _window: u32,
        _packet_size: u32,
        target: &DirectTcpip,
    ) -> WispResult<()> {
        self.record(Sent::OpenDirectTcpip {
            local_id,
            target: target.clone(),
        })
    }

    fn open_direct_streamlocal(
        &mut self,
        local_id: u32,
        _window: u32,
        _packet_size: u32,
        socket_path: &str,
    ) -> WispResult<()> {
        self.record(Sent::OpenDirectStreamLocal {
            local_id,
            socket_path: socket_path.to_string(),
        })
    }

    fn open_confirmation(
        &mut self,
        remote_id: u32,
        local_id: u32,
        _window: u32,
        _packet_size: u32,
    ) -> WispResult<()> {
        self.record(Sent::OpenConfirmation {
            remote_id,
            local_id,
        })
    }

    fn open_failure(
        &mut self,
        remote_id: u32,
        reason: ChannelOpenFailureReason,
        _description: &str,
        _lang: &str,
    ) -> WispResult<()> {
        self.record(Sent::OpenFailure { remote_id, reason })
    }

    fn pty_request(&mut self, remote_id: u32, _pty: &PtyOptions) -> WispResult<()> {
        self.record(Sent::Pty(remote_id))
    }

    fn x11_request(&mut self, remote_id: u32, x11: &X11Request) -> WispResult<()> {
        self.record(Sent::X11 {
            remote_id,
            single: x11.single,
            screen: x11.screen,
        })
    }

    fn env_request(&mut self, remote_id: u32, name: &str, value: &str) -> WispResult<()> {
        self.record(Sent::Env {
            remote_id,
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    fn agent_forward_request(&mut self, remote_id: u32) -> WispResult<()> {
        self.record(Sent::AgentForward(remote_id))
    }

    fn exec_request(&mut self, remote_id: u32, command: &str) -> WispResult<()> {
        self.record(Sent::Exec {
            remote_id,
            command: command.to_string(),
        })
    }

    fn shell_request(&mut self, remote_id: u32) -> WispResult<()> {
        self.record(Sent::Shell(remote_id))
    }

    fn subsystem_request(&mut self, remote_id: u32, name: &str) -> WispResult<()> {
        self.record(Sent::Subsystem {
            remote_id,
            name: name.to_string(),
        })
    }

    fn window_change(
        &mut self,
        remote_id: u32,
        rows: u32,
        cols: u32,
        _height: u32,
        _width: u32,
    ) -> WispResult<()> {
        self.record(Sent::WindowChange {
            remote_id,
            rows,
            cols,
        })
    }

    fn signal(&mut self, remote_id: u32, name: &str) -> WispResult<()> {
        self.record(Sent::Signal {
            remote_id,
            name: name.to_string(),
        })
    }

    fn channel_data(&mut self, remote_id: u32, data: &[u8]) -> WispResult<()> {
        self.record(Sent::Data {
            remote_id,
            data: data.to_vec(),
        })
    }

    fn channel_eof(&mut self, remote_id: u32) -> WispResult<()> {
        self.record(Sent::Eof(remote_id))
    }

    fn channel_close(&mut self, remote_id: u32) -> WispResult<()> {
        self.record(Sent::Close(remote_id))
    }

    fn window_adjust(&mut self, remote_id: u32, bytes: u32) -> WispResult<()> {
        self.record(Sent::WindowAdjust { remote_id, bytes })
    }

    fn tcpip_forward(&mut self, bind_addr: &str, bind_port: u32) -> WispResult<()> {
        self.record(Sent::TcpipForward {
            addr: bind_addr.to_string(),
            port: bind_port,
        })
    }

    fn cancel_tcpip_forward(&mut self, bind_addr: &str, bind_port: u32) -> WispResult<()> {
        self.record(Sent::CancelTcpipForward {
            addr: bind_addr.to_string(),
            port: bind_port,
        })
    }

    fn streamlocal_forward(&mut self, socket_path: &str) -> WispResult<()> {
        self.record(Sent::StreamLocalForward(socket_path.to_string()))
    }

    fn cancel_streamlocal_forward(&mut self, socket_path: &str) -> WispResult<()> {
        self.record(Sent::CancelStreamLocalForward(socket_path.to_string()))
    }

    fn no_more_sessions(&mut self) -> WispResult<()> {
        self.record(Sent::NoMoreSessions)
    }

    fn request_failure(&mut self) -> WispResult<()> {
        self.record(Sent::RequestFailure)
    }

    fn ping(&mut self) -> WispResult<()> {
        self.record(Sent::Ping)
    }

    fn disconnect(&mut self) -> WispResult<()> {
        self.record(Sent::Disconnect)
    }

    fn destroy(&mut self) {
        self.wire.writable.store(false, Ordering::SeqCst);
        self.wire.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Private key double. Signatures are `sig(<hash>):<data>`.
pub struct TestSigner {
    key_type: String,
    public_key: Vec<u8>,
    broken: bool,
}

impl TestSigner {
    pub fn new(key_type: &str) -> Self {
        Self {
            key_type: key_type.to_string(),
            public_key: key_blob(key_type, b"client-key"),
            broken: false,
        }
    }

    /// A key whose signing always fails.
    pub fn broken(key_type: &str) -> Self {
        Self {
            broken: true,
            ..Self::new(key_type)
        }
    }
}

impl Signer for TestSigner {
    fn key_type(&self) -> &str {
        &self.key_type
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, data: &[u8], hash: HashAlgorithm) -> WispResult<Vec<u8>> {
        if self.broken {
            return Err(WispError::Protocol("key is encrypted".to_string()));
        }
        let mut signature = format!("sig({:?}):", hash).into_bytes();
        signature.extend_from_slice(data);
        Ok(signature)
    }
}

/// Agent double with a fixed key list.
#[derive(Clone, Default)]
pub struct ScriptedAgent {
    keys: Vec<AgentKey>,
    /// Algorithm reported for signatures instead of the key type.
    algorithm_override: Option<String>,
    unavailable: bool,
    /// Never answers.
    hung: bool,
    signed: Arc<Mutex<Vec<Vec<u8>>>>,
    forwarded: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedAgent {
    pub fn with_keys(keys: Vec<AgentKey>) -> Self {
        Self {
            keys,
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn hung() -> Self {
        Self {
            hung: true,
            ..Self::default()
        }
    }

    pub fn with_algorithm_override(mut self, algorithm: &str) -> Self {
        self.algorithm_override = Some(algorithm.to_string());
        self
    }

    /// Blobs of the keys asked to sign, in order.
    pub fn signed(&self) -> Vec<Vec<u8>> {
        self.signed.lock().unwrap().clone()
    }

    /// Framed requests relayed from forwarded agent channels, in order.
    pub fn forwarded(&self) -> Vec<Vec<u8>> {
        self.forwarded.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn identities(&self) -> WispResult<Vec<AgentKey>> {
        if self.hung {
            std::future::pending::<()>().await;
        }
        if self.unavailable {
            return Err(WispError::Agent("agent socket is gone".to_string()));
        }
        Ok(self.keys.clone())
    }

    async fn sign(&self, key: &AgentKey, data: &[u8]) -> WispResult<AgentSignature> {
        if self.hung {
            std::future::pending::<()>().await;
        }
        self.signed.lock().unwrap().push(key.blob().to_vec());
        let mut blob = b"agent-sig:".to_vec();
        blob.extend_from_slice(data);
        Ok(AgentSignature {
            algorithm: self
                .algorithm_override
                .clone()
                .unwrap_or_else(|| key.key_type()),
            blob,
        })
    }

    /// Answers every request with an identities answer listing no keys.
    async fn forward(&self, request: &[u8]) -> WispResult<Vec<u8>> {
        if self.hung {
            std::future::pending::<()>().await;
        }
        self.forwarded.lock().unwrap().push(request.to_vec());
        Ok(EMPTY_IDENTITIES_ANSWER.to_vec())
    }
}

/// SSH_AGENTC_REQUEST_IDENTITIES, framed.
pub const REQUEST_IDENTITIES: [u8; 5] = [0, 0, 0, 1, 11];

/// SSH_AGENT_IDENTITIES_ANSWER with zero keys, framed.
pub const EMPTY_IDENTITIES_ANSWER: [u8; 9] = [0, 0, 0, 5, 12, 0, 0, 0, 0];

fn put_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Public key blob for [`TestSigner`]: `string key_type, string material`.
pub fn key_blob(key_type: &str, material: &[u8]) -> Vec<u8> {
    let mut blob = BytesMut::new();
    put_string(&mut blob, key_type.as_bytes());
    put_string(&mut blob, material);
    blob.to_vec()
}

const RSA_LAPTOP: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQDvWIvltcCFhIHoOwyTaq76CQoECBNkBgBOca6vDZ7zhvuRN7ps/UDiW642QSCNQKvNYDsKj1j7KnzN5dCBh/Dvx75g/bmqq0H5SgSqhTUzFLBvbvrY/v1aC51UEs9PLkEq0kNacOBqhTELgO1ZupzEv3sco14GDht7GmJ2nlfg2rIG3BSlffyeRLE0lh+0scD6JwUHjpit3rK6I41/YpJHnIlBcFm7qebWRBluhJUx/fT5Crcapn2eh0Q8cJHmEA9mAjIAMrr0sPRkvSGea30TTrNUxCZaVlLANNNrYxlEvacRKa0caXdQYwm+a/sgAtwhg1R+WPoACAhTV068JvKD laptop";

const RSA_FIRST: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQCUm0JV79Vz9eSuEob9c8nDpqXVTN9wzbD5+i3EcMG2EuMteoCfLi9XCZGVEgsEGNmCqphDerVm6EKbZrF6OkuisKEr/TS6sR8yQMMCS0MKv1RlnKEjlN0/ZAQkuPLz2/zztQjzfsuQiYlp9DoOGdq7yauxHeqLz2e8uJxlqkRE6KPB1mccr49oUdPt/gHzMGBAg4qUpDnQSpAsrdxiJ48yL1ihQk675bO2cSEJV2gNlRNkQqUb/uHRtlHQp1kV8GLvE75DRgtsnQwkawAXgfKccNJwoCQgZwhypZVMpun9yZ/IFEkejv19QqZkk0q3g56OlG/uocT2ajD4DN08vgnD first";

const RSA_SECOND: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQDsJnmPXgngS0w8WsYu5Nc9mPwcivm7O68pou83UmwJqbFk/6ACe/k5KcmFrQ8mcrzXDeEDtyi4HKLE3oExkWDKSa+Jus13zhpiU95jC17z9LHE5C4tOQE14V9jyX8IN3BSZvjVcmFASkW8HHc/Wv/ohpFR+5Lw3a5oGsM4EmuwrLYTaRbXgorppV+wsVk0SPEoYwNqxXNGoURuFP1Mk6mMN8MqgUs68sHX4HFxr0vRjW+wWflyV3bgJVYel3pLNR9BY/c0AKVK6bBFCmq4ggjCGA0RCaDPR9O3DXeue7QUUfHpw8EQ0/PH1KdpMwAsaN3YReCMctghlbP/bxkpoCiL second";

const RSA_THIRD: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQCWWa1E99KzrjKIJdIhYkCdqhKqkgwEqjo8JNwJbBYQEXhPMPxxWK1qn4Jn3YDmczUV40tGkCQjuhHrgKdbNTJIMj2HnjUPr7kZMGZMhIL1TXd7YLCbBWJbDazngmaNO/7b1vwmFhxHNB+TRce1XBWXspuZrvxZKC5ceubYZz5difpdekn3ELz36pTGYc5Mbj35gQPaExu+67pBNlrIaLAHkLHF5FRjVEh57mFqfLoAECntS/0y/bZlrr88lfrU02rMIRXCcJoS7kN016mrX6H6qv6um6zaS9nqGVrhJiM2KfzKCk5xwzmYYjlxyrkVpP4y68VkUaf0pVtCmB3nkGpd third";

const ECDSA_SECOND: &str = "ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBDTNi+r5CfqB+MuQm9VLqbLUAvp4NSAxp60nPtbF7Y5IYYsJYdpnVTqApXUh1vGjMj6yVSpco0SQ10YC89vrz5o= second";

/// A real public key of `key_type`, commented `name`.
pub fn agent_key(key_type: &str, name: &str) -> AgentKey {
    let line = match (key_type, name) {
        ("ssh-rsa", "laptop") => RSA_LAPTOP,
        ("ssh-rsa", "first") => RSA_FIRST,
        ("ssh-rsa", "second") => RSA_SECOND,
        ("ssh-rsa", "third") => RSA_THIRD,
        ("ecdsa-sha2-nistp256", "second") => ECDSA_SECOND,
        other => panic!("no fixture key for {:?}", other),
    };
    AgentKey::from_openssh(line).unwrap()
}

/// Builder preset with a username and no authentication material.
pub fn base_config() -> SshClientConfigBuilder {
    SshClientConfig::builder()
        .with_host("server.test")
        .with_username("alice")
}

pub fn openssh() -> Version {
    Version::parse("SSH-2.0-OpenSSH_8.9").unwrap()
}

pub type TestClient = SshClient<RecordingCodec>;

/// Logs to the test writer; set `RUST_LOG=wisp_proto=trace` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Client connected over a fresh [`RecordingCodec`], nothing exchanged yet.
pub fn connected(
    config: SshClientConfig,
) -> (TestClient, mpsc::UnboundedReceiver<ClientEvent>, Wire) {
    init_tracing();
    let (codec, wire) = RecordingCodec::new();
    let (mut client, events) = SshClient::new();
    client.connect(Arc::new(config), codec).unwrap();
    (client, events, wire)
}

/// Runs the handshake and the `none` method to success against a server
/// identifying as `version`. Events and wire log start out empty.
pub async fn authenticated_with(
    config: SshClientConfig,
    version: Version,
) -> (TestClient, mpsc::UnboundedReceiver<ClientEvent>, Wire) {
    let (mut client, mut events, wire) = connected(config);
    client
        .handle_event(CodecEvent::Header {
            version,
            greeting: None,
        })
        .await;
    client.handle_event(CodecEvent::Ready).await;
    client
        .handle_event(CodecEvent::ServiceAccept("ssh-userauth".to_string()))
        .await;
    client.handle_event(CodecEvent::UserauthSuccess).await;
    assert!(client.is_ready());
    drain(&mut events);
    wire.take();
    (client, events, wire)
}

pub async fn authenticated() -> (TestClient, mpsc::UnboundedReceiver<ClientEvent>, Wire) {
    authenticated_with(base_config().build().unwrap(), openssh()).await
}

/// Events emitted so far.
pub fn drain(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Server confirmation of our channel `local_id`, numbered `remote_id` on
/// its side.
pub fn confirm(local_id: u32, remote_id: u32) -> CodecEvent {
    CodecEvent::ChannelOpenConfirmation(OpenConfirmation {
        recipient_channel: local_id,
        sender_channel: remote_id,
        initial_window_size: SERVER_WINDOW,
        maximum_packet_size: SERVER_PACKET,
    })
}

pub fn count_closes(events: &[ClientEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ClientEvent::Close))
        .count()
}
