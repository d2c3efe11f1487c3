//! SSH client connection controller.
//!
//! [`SshClient`] sits between a wire [`Codec`] and the user. It reacts to
//! [`CodecEvent`]s one at a time, drives authentication, multiplexes
//! channels and correlates replies. User operations return immediately:
//! anything that waits on the peer hands back a [`Pending`], and
//! connection-level notifications arrive on the [`ClientEvent`] stream.
//!
//! The controller never blocks. Agent calls run on their own tasks under
//! `agent_timeout` and their outcomes come back as inputs, so a slow agent
//! never holds up other work. [`Session`] wraps the controller in the tasks
//! that feed it events, agent outcomes and timer ticks; used directly,
//! [`SshClient::handle_event`] waits for agent work it started.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wisp_proto::ssh::client::SshClient;
//! use wisp_proto::ssh::codec::Codec;
//! use wisp_proto::ssh::config::SshClientConfig;
//! use wisp_proto::ssh::connection::ExecOptions;
//!
//! # async fn run<C: Codec>(codec: C) -> Result<(), Box<dyn std::error::Error>> {
//! let config = SshClientConfig::builder()
//!     .with_host("example.com")
//!     .with_username("deploy")
//!     .with_password("hunter2")
//!     .build()?;
//!
//! let (mut client, mut events) = SshClient::new();
//! client.connect(Arc::new(config), codec)?;
//!
//! // Feed codec events with `client.handle_event(..).await` until
//! // `ClientEvent::Ready` shows up on `events`, then:
//! let pending = client.exec("uptime", ExecOptions::default());
//! # let _ = (pending, events.recv().await);
//! # Ok(())
//! # }
//! ```
//!
//! [`Session`]: crate::ssh::session::Session

use crate::ssh::agent::{
    AgentJob, AgentKey, AgentOutcome, AgentReply, AgentSignature, ForwardedRequests,
};
use crate::ssh::auth::{AuthContext, AuthSession, AuthStatus};
use crate::ssh::channel::{Channel, ChannelMessage, ChannelState, SshChannel};
use crate::ssh::codec::{Codec, CodecEvent, IncomingOpen, InfoRequest, OpenConfirmation, OpenFailure};
use crate::ssh::config::SshClientConfig;
use crate::ssh::connection::{
    ChannelOpenFailureReason, ChannelType, DirectTcpip, ExecOptions, ShellOptions, X11Request,
    LOCAL_PACKET_SIZE, LOCAL_WINDOW_SIZE,
};
use crate::ssh::events::{ClientEvent, EventSink, IncomingChannel};
use crate::ssh::forwarding::ForwardingTable;
use crate::ssh::global::{GlobalReply, GlobalRequestQueue, GlobalWaiter, ReplyContext};
use crate::ssh::incoming::{classify, IncomingKind, PolicyState};
use crate::ssh::keys::format_fingerprint;
use crate::ssh::pending::{Completion, Pending};
use crate::ssh::registry::{ChannelRegistry, PendingOpen, Slot};
use crate::ssh::session::keepalive::{KeepaliveAction, KeepaliveWatchdog};
use crate::ssh::setup::{RequestKind, SessionPlan, SetupStep};
use crate::ssh::version::Version;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use wisp_platform::{WispError, WispResult};

const STRICT_VENDOR_MESSAGE: &str =
    "strictVendor enabled and server is not OpenSSH or compatible version";

enum AuthInput {
    Start,
    Failure {
        methods: Vec<String>,
        partial_success: bool,
    },
    PkOk,
    InfoRequest(InfoRequest),
    AgentIdentities(WispResult<Vec<AgentKey>>),
    AgentSignature(WispResult<AgentSignature>),
}

/// SSH client connection controller.
pub struct SshClient<C: Codec> {
    config: Option<Arc<SshClientConfig>>,
    codec: Option<C>,
    events: EventSink,
    channels: ChannelRegistry,
    global: GlobalRequestQueue,
    forwarding: ForwardingTable,
    /// Sessions with x11 forwarding granted.
    x11_accepts: u32,
    agent_forwarding: bool,
    remote_version: Option<Version>,
    auth: Option<AuthSession>,
    /// Forwarded agent channels, by local id.
    agent_relays: HashMap<u32, ForwardedRequests>,
    agent_tx: mpsc::UnboundedSender<AgentReply>,
    /// Taken by whoever pumps agent outcomes; kept for direct use.
    agent_rx: Option<mpsc::UnboundedReceiver<AgentReply>>,
    agent_jobs: usize,
    /// Bumped per connection attempt so late agent outcomes are dropped.
    generation: u64,
    keepalive: KeepaliveWatchdog,
    ready: bool,
    closed: bool,
}

impl<C: Codec> SshClient<C> {
    /// Creates an idle client and the stream its events are reported on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = EventSink::new();
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let client = Self {
            config: None,
            codec: None,
            events,
            channels: ChannelRegistry::new(),
            global: GlobalRequestQueue::new(),
            forwarding: ForwardingTable::new(),
            x11_accepts: 0,
            agent_forwarding: false,
            remote_version: None,
            auth: None,
            agent_relays: HashMap::new(),
            agent_tx,
            agent_rx: Some(agent_rx),
            agent_jobs: 0,
            generation: 0,
            keepalive: KeepaliveWatchdog::new(Duration::ZERO, 0),
            ready: false,
            closed: true,
        };
        (client, rx)
    }

    /// Starts a connection attempt over `codec`.
    ///
    /// A connection that is still live is torn down first; its waiters are
    /// failed and its `Close` is emitted before any state is reused.
    pub fn connect(&mut self, config: Arc<SshClientConfig>, codec: C) -> WispResult<()> {
        config.validate()?;
        if !self.closed {
            debug!("tearing down previous connection");
            self.teardown();
        }

        self.channels.reset();
        self.global = GlobalRequestQueue::new();
        self.forwarding.clear();
        self.x11_accepts = 0;
        self.agent_forwarding = false;
        self.remote_version = None;
        self.auth = None;
        self.agent_relays.clear();
        self.agent_jobs = 0;
        self.generation += 1;
        self.keepalive =
            KeepaliveWatchdog::new(config.keepalive_interval, config.keepalive_count_max);
        self.ready = false;
        self.closed = false;

        info!(host = %config.host, port = config.port, user = %config.username, "connecting");
        self.config = Some(config);
        self.codec = Some(codec);
        Ok(())
    }

    /// Processes one codec event.
    ///
    /// Transport failures while reacting are reported as an `Error` event
    /// and close the connection. Unless a dispatcher took over the agent
    /// outcomes, agent work started by the event is awaited here.
    pub async fn handle_event(&mut self, event: CodecEvent) {
        if self.closed {
            trace!(?event, "event after close ignored");
            return;
        }
        if let Err(e) = self.dispatch(event) {
            self.fatal(e);
        }
        self.settle_agent_jobs().await;
    }

    async fn settle_agent_jobs(&mut self) {
        while self.agent_jobs > 0 {
            let Some(replies) = self.agent_rx.as_mut() else {
                return;
            };
            let Some(reply) = replies.recv().await else {
                return;
            };
            self.handle_agent_reply(reply);
        }
    }

    /// Hands the agent outcome stream to a dispatcher.
    pub(crate) fn take_agent_replies(&mut self) -> Option<mpsc::UnboundedReceiver<AgentReply>> {
        self.agent_rx.take()
    }

    /// Processes the outcome of an agent job.
    pub(crate) fn handle_agent_reply(&mut self, reply: AgentReply) {
        if self.closed || reply.generation != self.generation {
            trace!("agent outcome for a finished connection ignored");
            return;
        }
        self.agent_jobs = self.agent_jobs.saturating_sub(1);
        let result = match reply.outcome {
            AgentOutcome::Identities(result) => self.drive_auth(AuthInput::AgentIdentities(result)),
            AgentOutcome::Signature(result) => self.drive_auth(AuthInput::AgentSignature(result)),
            AgentOutcome::Forwarded { local_id, result } => {
                self.on_agent_forwarded(local_id, result)
            }
        };
        if let Err(e) = result {
            self.fatal(e);
        }
    }

    fn spawn_agent_job(&mut self, job: AgentJob) -> WispResult<()> {
        let config = self.config()?;
        let agent = config
            .agent
            .clone()
            .ok_or_else(|| WispError::Agent("No agent configured".to_string()))?;
        let limit = config.agent_timeout;
        let generation = self.generation;
        let replies = self.agent_tx.clone();
        trace!(job = job.name(), "starting agent job");
        self.agent_jobs += 1;
        tokio::spawn(async move {
            let outcome = job.run(agent, limit).await;
            let _ = replies.send(AgentReply {
                generation,
                outcome,
            });
        });
        Ok(())
    }

    fn dispatch(&mut self, event: CodecEvent) -> WispResult<()> {
        match event {
            CodecEvent::Header { version, greeting } => {
                debug!(software = version.software(), "remote identification");
                self.remote_version = Some(version);
                if let Some(greeting) = greeting {
                    self.events.emit(ClientEvent::Greeting(greeting));
                }
            }
            CodecEvent::HostKey(key) => self.verify_host_key(&key)?,
            CodecEvent::Ready => {
                debug!("handshake complete, requesting ssh-userauth");
                self.codec_mut()?.service_request("ssh-userauth")?;
            }
            CodecEvent::ServiceAccept(service) => {
                if service == "ssh-userauth" && self.auth.is_none() && !self.ready {
                    let config = self.config()?;
                    self.auth = Some(AuthSession::new(&config));
                    self.drive_auth(AuthInput::Start)?;
                } else {
                    debug!(%service, "ignoring SERVICE_ACCEPT");
                }
            }
            CodecEvent::UserauthBanner(message) => self.events.emit(ClientEvent::Banner(message)),
            CodecEvent::UserauthSuccess => self.on_auth_success(),
            CodecEvent::UserauthFailure {
                methods,
                partial_success,
            } => {
                self.drive_auth(AuthInput::Failure {
                    methods,
                    partial_success,
                })?
            }
            CodecEvent::UserauthPkOk => self.drive_auth(AuthInput::PkOk)?,
            CodecEvent::UserauthInfoRequest(request) => {
                self.drive_auth(AuthInput::InfoRequest(request))?
            }
            CodecEvent::ChannelOpen(open) => self.on_incoming_open(open)?,
            CodecEvent::ChannelOpenConfirmation(confirmation) => {
                self.on_open_confirmation(confirmation)?
            }
            CodecEvent::ChannelOpenFailure(failure) => self.on_open_failure(failure),
            CodecEvent::ChannelSuccess(id) => self.on_channel_reply(id, true)?,
            CodecEvent::ChannelFailure(id) => self.on_channel_reply(id, false)?,
            CodecEvent::ChannelData { recipient, data } => {
                self.on_channel_data(recipient, ChannelMessage::Data(data))?
            }
            CodecEvent::ChannelExtendedData {
                recipient,
                data_type,
                data,
            } => self.on_channel_data(recipient, ChannelMessage::ExtendedData { data_type, data })?,
            CodecEvent::ChannelWindowAdjust {
                recipient,
                bytes_to_add,
            } => {
                if let Some(channel) = self.channels.live_mut(recipient) {
                    channel.adjust_window(bytes_to_add);
                    self.flush(recipient)?;
                }
            }
            CodecEvent::ChannelEof(id) => self.on_channel_eof(id)?,
            CodecEvent::ChannelClose(id) => self.on_channel_close(id)?,
            CodecEvent::ExitStatus { recipient, code } => {
                self.deliver(recipient, ChannelMessage::ExitStatus(code))
            }
            CodecEvent::ExitSignal {
                recipient,
                signal,
                core_dumped,
                message,
            } => self.deliver(
                recipient,
                ChannelMessage::ExitSignal {
                    signal,
                    core_dumped,
                    message,
                },
            ),
            CodecEvent::RequestSuccess(payload) => self.on_global_reply(GlobalReply::Success(payload)),
            CodecEvent::RequestFailure => self.on_global_reply(GlobalReply::Failure),
            CodecEvent::GlobalRequest { name, want_reply } => {
                debug!(%name, want_reply, "rejecting global request from server");
                if want_reply {
                    self.codec_mut()?.request_failure()?;
                }
            }
            CodecEvent::Continue => self.events.emit(ClientEvent::Continue),
            CodecEvent::Drain => self.events.emit(ClientEvent::Drain),
            CodecEvent::ProtocolError(message) => {
                warn!(%message, "protocol error");
                self.events
                    .emit(ClientEvent::Error(WispError::Protocol(message)));
            }
            CodecEvent::SocketError(e) => {
                warn!(error = %e, "socket error");
                self.events.emit(ClientEvent::Error(WispError::Io(e)));
            }
            CodecEvent::End => {
                debug!("server ended the connection");
                self.keepalive.disarm();
                self.events.emit(ClientEvent::End);
            }
            CodecEvent::Close => self.teardown(),
        }
        Ok(())
    }

    // ===== Handshake and authentication =====

    fn verify_host_key(&mut self, key: &[u8]) -> WispResult<()> {
        let config = self.config()?;
        let accepted = match &config.host_verifier {
            Some(verify) => verify(&config.host_hash.digest_hex(key)),
            None => true,
        };
        debug!(fingerprint = %format_fingerprint(key), accepted, "server host key");
        self.codec_mut()?.host_key_verdict(accepted)
    }

    fn drive_auth(&mut self, input: AuthInput) -> WispResult<()> {
        let Some(mut auth) = self.auth.take() else {
            debug!("authentication message outside of authentication");
            return Ok(());
        };
        let config = self.config()?;
        let codec = self.codec.as_mut().ok_or(WispError::NotConnected)?;
        let mut cx = AuthContext {
            codec,
            config: &config,
            events: &self.events,
        };

        let status = match input {
            AuthInput::Start => auth.start(&mut cx)?,
            AuthInput::Failure {
                methods,
                partial_success,
            } => auth.on_failure(&mut cx, &methods, partial_success)?,
            AuthInput::PkOk => auth.on_pk_ok(&mut cx)?,
            AuthInput::InfoRequest(request) => {
                auth.on_info_request(&mut cx, request)?;
                AuthStatus::Pending
            }
            AuthInput::AgentIdentities(result) => auth.on_agent_identities(&mut cx, result)?,
            AuthInput::AgentSignature(result) => auth.on_agent_signature(&mut cx, result)?,
        };

        match status {
            AuthStatus::Pending => self.auth = Some(auth),
            AuthStatus::Agent(job) => {
                self.auth = Some(auth);
                self.spawn_agent_job(job)?;
            }
            AuthStatus::Exhausted => {
                warn!("all authentication methods failed");
                self.events.emit(ClientEvent::Error(WispError::Authentication(
                    "All configured authentication methods failed".to_string(),
                )));
                let codec = self.codec_mut()?;
                if codec.is_writable() {
                    codec.disconnect()?;
                }
            }
        }
        Ok(())
    }

    fn on_auth_success(&mut self) {
        let Some(mut auth) = self.auth.take() else {
            debug!("unexpected USERAUTH_SUCCESS");
            return;
        };
        auth.on_success();
        if self.ready {
            return;
        }
        self.ready = true;
        self.keepalive.arm();
        self.events.emit(ClientEvent::Ready);
    }

    /// Answers the outstanding keyboard-interactive prompts.
    ///
    /// Each INFO_REQUEST takes exactly one answer.
    pub fn keyboard_interactive_response(&mut self, answers: &[String]) -> WispResult<()> {
        let waiting = self.auth.as_mut().map_or(false, AuthSession::take_prompts);
        if !waiting {
            return Err(WispError::Authentication(
                "No keyboard-interactive prompt is pending".to_string(),
            ));
        }
        self.send(|codec| codec.auth_info_response(answers))
    }

    // ===== Session channels =====

    /// Runs `command` on a new session channel.
    ///
    /// Resolves once the command started, or with the first failing setup
    /// step's error (in which case the channel is closed).
    pub fn exec(&mut self, command: &str, options: ExecOptions) -> Pending<SshChannel> {
        let (completion, pending) = Pending::new();
        let agent_forward = self.wants_agent_forward(options.agent_forward);
        self.open_session(SessionPlan::exec(command, options, agent_forward, completion));
        pending
    }

    /// Starts an interactive shell on a new session channel.
    pub fn shell(&mut self, options: ShellOptions) -> Pending<SshChannel> {
        let (completion, pending) = Pending::new();
        let agent_forward = self.wants_agent_forward(options.agent_forward);
        self.open_session(SessionPlan::shell(options, agent_forward, completion));
        pending
    }

    /// Starts subsystem `name` on a new session channel.
    pub fn subsys(&mut self, name: &str) -> Pending<SshChannel> {
        let (completion, pending) = Pending::new();
        self.open_session(SessionPlan::subsystem(name, completion));
        pending
    }

    /// Starts the `sftp` subsystem. The protocol on top is up to the caller.
    pub fn sftp(&mut self) -> Pending<SshChannel> {
        self.subsys("sftp")
    }

    fn wants_agent_forward(&self, requested: bool) -> bool {
        self.config
            .as_ref()
            .map_or(false, |config| config.agent_forward_for(requested))
    }

    fn open_session(&mut self, plan: SessionPlan) {
        let id = match self.check_writable().and_then(|_| self.channels.allocate()) {
            Ok(id) => id,
            Err(e) => return plan.fail(e),
        };
        self.channels
            .insert(id, Slot::Opening(PendingOpen::Session(plan)));
        debug!(channel = id, "opening session channel");
        if let Err(e) = self.send(|codec| codec.open_session(id, LOCAL_WINDOW_SIZE, LOCAL_PACKET_SIZE)) {
            debug!(channel = id, error = %e, "session open not sent");
        }
    }

    // ===== Direct channels =====

    /// Opens a `direct-tcpip` channel to `dst_addr:dst_port` on the server side.
    pub fn forward_out(
        &mut self,
        src_addr: &str,
        src_port: u32,
        dst_addr: &str,
        dst_port: u32,
    ) -> Pending<SshChannel> {
        let target = DirectTcpip {
            src_addr: src_addr.to_string(),
            src_port,
            dst_addr: dst_addr.to_string(),
            dst_port,
        };
        self.open_direct(ChannelType::DirectTcpip, |codec, id| {
            codec.open_direct_tcpip(id, LOCAL_WINDOW_SIZE, LOCAL_PACKET_SIZE, &target)
        })
    }

    /// Opens a `direct-streamlocal@openssh.com` channel to a server-side
    /// Unix socket.
    pub fn forward_out_streamlocal(&mut self, socket_path: &str) -> Pending<SshChannel> {
        if let Err(e) = self.check_vendor() {
            return Pending::resolved(Err(e));
        }
        self.open_direct(ChannelType::DirectStreamLocal, |codec, id| {
            codec.open_direct_streamlocal(id, LOCAL_WINDOW_SIZE, LOCAL_PACKET_SIZE, socket_path)
        })
    }

    fn open_direct<F>(&mut self, channel_type: ChannelType, open: F) -> Pending<SshChannel>
    where
        F: FnOnce(&mut C, u32) -> WispResult<()>,
    {
        let (completion, pending) = Pending::new();
        let id = match self.check_writable().and_then(|_| self.channels.allocate()) {
            Ok(id) => id,
            Err(e) => {
                completion.complete(Err(e));
                return pending;
            }
        };
        self.channels.insert(
            id,
            Slot::Opening(PendingOpen::Direct {
                channel_type,
                completion,
            }),
        );
        debug!(channel = id, channel_type = channel_type.name(), "opening channel");
        if let Err(e) = self.send(|codec| open(codec, id)) {
            debug!(channel = id, error = %e, "channel open not sent");
        }
        pending
    }

    fn on_open_confirmation(&mut self, confirmation: OpenConfirmation) -> WispResult<()> {
        let id = confirmation.recipient_channel;
        let Some(pending) = self.channels.take_opening(id) else {
            debug!(channel = id, "confirmation for unknown channel");
            return Ok(());
        };
        let (mut channel, handle) = Channel::new(
            id,
            pending.channel_type(),
            confirmation.sender_channel,
            confirmation.initial_window_size,
            confirmation.maximum_packet_size,
        );
        debug!(
            channel = id,
            remote = confirmation.sender_channel,
            window = confirmation.initial_window_size,
            "channel open"
        );

        match pending {
            PendingOpen::Direct { completion, .. } => {
                self.channels.insert_live(id, channel);
                completion.complete(Ok(handle));
                Ok(())
            }
            PendingOpen::Session(plan) => {
                channel.allow_half_open = plan.allow_half_open;
                let remote = channel.remote_id();
                for (name, value) in &plan.env {
                    self.codec_mut()?.env_request(remote, name, value)?;
                }
                channel.setup = Some(plan.into_queue(handle));
                self.channels.insert_live(id, channel);
                self.advance_setup(id)
            }
        }
    }

    fn on_open_failure(&mut self, failure: OpenFailure) {
        let id = failure.recipient_channel;
        let Some(pending) = self.channels.take_opening(id) else {
            debug!(channel = id, "open failure for unknown channel");
            return;
        };
        let description = match ChannelOpenFailureReason::from_u32(failure.reason) {
            Some(reason) if failure.description.is_empty() => reason.as_str().to_string(),
            _ => failure.description,
        };
        debug!(channel = id, reason = failure.reason, %description, "channel open failed");
        pending.fail(WispError::ChannelOpen {
            reason: Some(failure.reason),
            description,
            lang: failure.lang,
        });
    }

    // ===== Setup sequencing =====

    /// Sends the next setup request of channel `id`, if any.
    fn advance_setup(&mut self, id: u32) -> WispResult<()> {
        let Some(channel) = self.channels.live_mut(id) else {
            return Ok(());
        };
        if channel.is_aborted() || !channel.is_open() {
            return Ok(());
        }
        let Some(setup) = channel.setup.as_mut() else {
            return Ok(());
        };
        let codec = self.codec.as_mut().ok_or(WispError::NotConnected)?;
        let remote = channel.outgoing.id;

        while let Some(step) = setup.next_step() {
            if step == SetupStep::AgentForward && self.agent_forwarding {
                debug!(channel = id, "agent forwarding already enabled");
                continue;
            }
            debug!(channel = id, step = ?step.kind(), remaining = setup.remaining(), "channel request");
            match &step {
                SetupStep::AgentForward => {
                    self.agent_forwarding = true;
                    codec.agent_forward_request(remote)?;
                }
                SetupStep::Pty(pty) => codec.pty_request(remote, pty)?,
                SetupStep::X11(options) => {
                    codec.x11_request(remote, &X11Request::new(options.clone()))?
                }
                SetupStep::Exec(command) => codec.exec_request(remote, command)?,
                SetupStep::Shell => codec.shell_request(remote)?,
                SetupStep::Subsystem(name) => codec.subsystem_request(remote, name)?,
            }
            channel.pending.push_back(step.kind());
            return Ok(());
        }
        Ok(())
    }

    fn on_channel_reply(&mut self, id: u32, success: bool) -> WispResult<()> {
        let Some(channel) = self.channels.live_mut(id) else {
            debug!(channel = id, "reply for unknown channel");
            return Ok(());
        };
        let Some(kind) = channel.pending.pop_front() else {
            debug!(channel = id, "reply without a pending request");
            return Ok(());
        };

        if !success {
            debug!(channel = id, request = ?kind, "channel request failed");
            if kind == RequestKind::AgentForward {
                self.agent_forwarding = false;
            }
            if let Some(setup) = channel.setup.take() {
                setup.fail(kind.failure());
            }
            return self.send_close(id);
        }

        if kind == RequestKind::X11 {
            channel.has_x11 = true;
            self.x11_accepts += 1;
        }
        if let Some(subtype) = kind.subtype() {
            channel.subtype = Some(subtype);
            if let Some(setup) = channel.setup.take() {
                setup.succeed(subtype);
            }
            return Ok(());
        }
        self.advance_setup(id)
    }

    // ===== Data plane =====

    fn deliver(&mut self, id: u32, message: ChannelMessage) {
        match self.channels.live(id) {
            Some(channel) => channel.deliver(message),
            None => debug!(channel = id, "message for unknown channel"),
        }
    }

    fn on_channel_data(&mut self, id: u32, message: ChannelMessage) -> WispResult<()> {
        let Some(channel) = self.channels.live_mut(id) else {
            debug!(channel = id, "data for unknown channel");
            return Ok(());
        };
        let len = match &message {
            ChannelMessage::Data(data) | ChannelMessage::ExtendedData { data, .. } => data.len(),
            _ => 0,
        };
        let adjust = channel.consume_window(len as u32);
        let remote = channel.remote_id();
        let open = channel.is_open();
        match (self.agent_relays.get_mut(&id), message) {
            (Some(relay), ChannelMessage::Data(data)) => relay.push(&data),
            (Some(_), _) => trace!(channel = id, "extended data on agent channel dropped"),
            (None, message) => channel.deliver(message),
        }
        if let Some(bytes) = adjust {
            if open {
                trace!(channel = id, bytes, "window adjust");
                self.codec_mut()?.window_adjust(remote, bytes)?;
            }
        }
        self.pump_agent_relay(id)
    }

    /// Relays the next complete request on agent channel `id`, if any.
    fn pump_agent_relay(&mut self, id: u32) -> WispResult<()> {
        let Some(relay) = self.agent_relays.get_mut(&id) else {
            return Ok(());
        };
        match relay.next_request() {
            Ok(Some(request)) => {
                trace!(channel = id, len = request.len(), "relaying agent request");
                self.spawn_agent_job(AgentJob::Forward {
                    local_id: id,
                    request,
                })
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(channel = id, error = %e, "closing agent channel");
                self.agent_relays.remove(&id);
                self.send_close(id)
            }
        }
    }

    fn on_agent_forwarded(&mut self, id: u32, result: WispResult<Vec<u8>>) -> WispResult<()> {
        let Some(relay) = self.agent_relays.get_mut(&id) else {
            debug!(channel = id, "agent reply for a closed channel");
            return Ok(());
        };
        relay.finish();
        match result {
            Ok(reply) => {
                let Some(channel) = self.channels.live_mut(id).filter(|c| c.is_open()) else {
                    return Ok(());
                };
                channel.queue_write(&reply);
                self.flush(id)?;
                self.pump_agent_relay(id)
            }
            Err(e) => {
                warn!(channel = id, error = %e, "agent forwarding failed");
                self.agent_relays.remove(&id);
                self.send_close(id)
            }
        }
    }

    fn on_channel_eof(&mut self, id: u32) -> WispResult<()> {
        let Some(channel) = self.channels.live_mut(id) else {
            debug!(channel = id, "EOF for unknown channel");
            return Ok(());
        };
        channel.incoming.state = ChannelState::Closing;
        channel.deliver(ChannelMessage::Eof);
        if !channel.allow_half_open {
            channel.eof_queued = true;
            return self.flush(id);
        }
        Ok(())
    }

    fn on_channel_close(&mut self, id: u32) -> WispResult<()> {
        match self.channels.remove(id) {
            Some(Slot::Opening(pending)) => {
                debug!(channel = id, "channel closed before confirmation");
                pending.fail(WispError::channel_closed_unexpectedly());
            }
            Some(Slot::Live(channel)) => {
                debug!(channel = id, "channel closed by server");
                self.agent_relays.remove(&id);
                let reply_to = channel.is_open().then(|| channel.remote_id());
                if channel.has_x11 {
                    self.x11_accepts = self.x11_accepts.saturating_sub(1);
                }
                channel.terminate(WispError::Channel("Channel closed".to_string()));
                if let (Some(remote), Some(codec)) =
                    (reply_to, self.codec.as_mut().filter(|c| c.is_writable()))
                {
                    codec.channel_close(remote)?;
                }
            }
            Some(Slot::Incoming(open)) => {
                debug!(channel = id, channel_type = %open.channel_type, "undecided channel closed");
            }
            None => debug!(channel = id, "close for unknown channel"),
        }
        Ok(())
    }

    /// Sends as much buffered data as the window allows, then a queued EOF.
    fn flush(&mut self, id: u32) -> WispResult<()> {
        let Some(channel) = self.channels.live_mut(id) else {
            return Ok(());
        };
        let codec = self.codec.as_mut().ok_or(WispError::NotConnected)?;
        let remote = channel.remote_id();
        while let Some(chunk) = channel.next_chunk() {
            codec.channel_data(remote, &chunk)?;
        }
        if channel.eof_queued && !channel.eof_sent && !channel.has_outbound() && channel.is_open() {
            channel.eof_sent = true;
            codec.channel_eof(remote)?;
        }
        Ok(())
    }

    /// Writes to channel `id`. Data beyond the peer's window is buffered.
    pub fn write(&mut self, id: u32, data: &[u8]) -> WispResult<()> {
        let channel = self.open_channel_mut(id)?;
        if channel.eof_queued {
            return Err(WispError::Channel("Write after end".to_string()));
        }
        channel.queue_write(data);
        self.flush_or_fail(id)
    }

    /// Ends our side of channel `id` once buffered data is sent.
    pub fn eof(&mut self, id: u32) -> WispResult<()> {
        self.open_channel_mut(id)?.eof_queued = true;
        self.flush_or_fail(id)
    }

    /// Closes channel `id`. The handle sees `Close` once the peer confirms.
    pub fn close_channel(&mut self, id: u32) -> WispResult<()> {
        if self.channels.live(id).is_none() {
            return Err(WispError::Channel("Channel is not open".to_string()));
        }
        let result = self.send_close(id);
        result.map_err(|e| self.transport_failed(e))
    }

    /// Abandons channel `id`: buffered output is discarded, nothing more is
    /// delivered, an unfinished setup fails, and the channel is closed.
    pub fn abort_channel(&mut self, id: u32) -> WispResult<()> {
        let channel = self
            .channels
            .live_mut(id)
            .ok_or_else(|| WispError::Channel("Channel is not open".to_string()))?;
        debug!(channel = id, "aborting channel");
        channel.abort();
        let result = self.send_close(id);
        result.map_err(|e| self.transport_failed(e))
    }

    /// Reports a terminal size change.
    pub fn window_change(
        &mut self,
        id: u32,
        rows: u32,
        cols: u32,
        height: u32,
        width: u32,
    ) -> WispResult<()> {
        let remote = self.open_channel_mut(id)?.remote_id();
        self.send(|codec| codec.window_change(remote, rows, cols, height, width))
    }

    /// Sends a signal (`INT`, `SIGTERM`, ...) to the remote process.
    pub fn signal(&mut self, id: u32, name: &str) -> WispResult<()> {
        let remote = self.open_channel_mut(id)?.remote_id();
        let upper = name.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper).to_string();
        self.send(|codec| codec.signal(remote, &name))
    }

    fn open_channel_mut(&mut self, id: u32) -> WispResult<&mut Channel> {
        match self.channels.live_mut(id) {
            Some(channel) if channel.is_open() && !channel.is_aborted() => Ok(channel),
            _ => Err(WispError::Channel("Channel is not open".to_string())),
        }
    }

    fn flush_or_fail(&mut self, id: u32) -> WispResult<()> {
        let result = self.flush(id);
        result.map_err(|e| self.transport_failed(e))
    }

    fn send_close(&mut self, id: u32) -> WispResult<()> {
        let Some(channel) = self.channels.live_mut(id) else {
            return Ok(());
        };
        if !channel.is_open() {
            return Ok(());
        }
        channel.outgoing.state = ChannelState::Closing;
        let remote = channel.remote_id();
        match self.codec.as_mut().filter(|c| c.is_writable()) {
            Some(codec) => codec.channel_close(remote),
            None => Ok(()),
        }
    }

    // ===== Incoming opens =====

    fn on_incoming_open(&mut self, open: IncomingOpen) -> WispResult<()> {
        let state = PolicyState {
            forwarding: &self.forwarding,
            x11_accepts: self.x11_accepts,
            agent_forwarding: self.agent_forwarding,
        };
        let kind = match classify(&open, state) {
            Ok(kind) => kind,
            Err(reason) => {
                debug!(channel_type = %open.channel_type, reason = reason.as_str(), "rejecting incoming channel");
                return self
                    .codec_mut()?
                    .open_failure(open.sender_channel, reason, "", "");
            }
        };
        let id = match self.channels.allocate() {
            Ok(id) => id,
            Err(_) => {
                warn!(channel_type = %open.channel_type, "no free channel for incoming open");
                return self.codec_mut()?.open_failure(
                    open.sender_channel,
                    ChannelOpenFailureReason::ResourceShortage,
                    "",
                    "",
                );
            }
        };

        match kind {
            IncomingKind::AuthAgent => {
                self.codec_mut()?.open_confirmation(
                    open.sender_channel,
                    id,
                    LOCAL_WINDOW_SIZE,
                    LOCAL_PACKET_SIZE,
                )?;
                let (channel, _) = Channel::new(
                    id,
                    ChannelType::AuthAgent,
                    open.sender_channel,
                    open.initial_window_size,
                    open.maximum_packet_size,
                );
                self.channels.insert_live(id, channel);
                self.agent_relays.insert(id, ForwardedRequests::default());
                debug!(channel = id, "agent forwarding channel relayed to the agent");
            }
            IncomingKind::ForwardedTcpip(_) | IncomingKind::X11(_) => {
                let is_x11 = matches!(kind, IncomingKind::X11(_));
                debug!(channel = id, channel_type = %open.channel_type, "incoming channel awaiting decision");
                self.channels.insert(id, Slot::Incoming(open));
                let token = IncomingChannel { local_id: id, kind };
                self.events.emit(if is_x11 {
                    ClientEvent::X11(token)
                } else {
                    ClientEvent::TcpConnection(token)
                });
            }
        }
        Ok(())
    }

    /// Accepts a forwarded connection announced by `TcpConnection` or `X11`.
    pub fn accept_incoming(&mut self, incoming: IncomingChannel) -> WispResult<SshChannel> {
        let id = incoming.local_id;
        let open = self
            .channels
            .take_incoming(id)
            .ok_or(WispError::NotConnected)?;
        let remote = open.sender_channel;
        self.send(|codec| codec.open_confirmation(remote, id, LOCAL_WINDOW_SIZE, LOCAL_PACKET_SIZE))?;
        let (channel, handle) = Channel::new(
            id,
            incoming.kind.channel_type(),
            remote,
            open.initial_window_size,
            open.maximum_packet_size,
        );
        self.channels.insert_live(id, channel);
        debug!(channel = id, "incoming channel accepted");
        Ok(handle)
    }

    /// Refuses a forwarded connection; the reserved id is released.
    pub fn reject_incoming(&mut self, incoming: IncomingChannel) -> WispResult<()> {
        let open = self
            .channels
            .take_incoming(incoming.local_id)
            .ok_or(WispError::NotConnected)?;
        debug!(channel = incoming.local_id, "incoming channel rejected");
        self.send(|codec| {
            codec.open_failure(
                open.sender_channel,
                ChannelOpenFailureReason::ConnectFailed,
                "",
                "",
            )
        })
    }

    // ===== Global requests =====

    /// Asks the server to listen on `bind_addr:bind_port` and forward
    /// connections back. Port 0 lets the server pick; the result is the
    /// port actually bound.
    pub fn forward_in(&mut self, bind_addr: &str, bind_port: u32) -> Pending<u32> {
        let (completion, pending) = Pending::new();
        let waiter = GlobalWaiter::ForwardIn {
            host: bind_addr.to_string(),
            port: bind_port,
            completion,
        };
        self.global_request(waiter, |codec| codec.tcpip_forward(bind_addr, bind_port));
        pending
    }

    /// Cancels a forwarding set up by [`Self::forward_in`].
    pub fn unforward_in(&mut self, bind_addr: &str, bind_port: u32) -> Pending<()> {
        let (completion, pending) = Pending::new();
        let waiter = GlobalWaiter::UnforwardIn {
            host: bind_addr.to_string(),
            port: bind_port,
            completion,
        };
        self.global_request(waiter, |codec| {
            codec.cancel_tcpip_forward(bind_addr, bind_port)
        });
        pending
    }

    /// Asks the server to listen on a Unix socket and forward connections back.
    pub fn forward_in_streamlocal(&mut self, socket_path: &str) -> Pending<()> {
        self.vendor_request(
            |completion| GlobalWaiter::StreamLocalForward {
                socket_path: socket_path.to_string(),
                completion,
            },
            |codec| codec.streamlocal_forward(socket_path),
        )
    }

    /// Cancels a Unix socket forwarding.
    pub fn unforward_in_streamlocal(&mut self, socket_path: &str) -> Pending<()> {
        self.vendor_request(
            |completion| GlobalWaiter::CancelStreamLocalForward {
                socket_path: socket_path.to_string(),
                completion,
            },
            |codec| codec.cancel_streamlocal_forward(socket_path),
        )
    }

    /// Tells the server to refuse further session channels.
    pub fn no_more_sessions(&mut self) -> Pending<()> {
        self.vendor_request(
            |completion| GlobalWaiter::NoMoreSessions { completion },
            |codec| codec.no_more_sessions(),
        )
    }

    fn vendor_request<W, F>(&mut self, waiter: W, send: F) -> Pending<()>
    where
        W: FnOnce(Completion<()>) -> GlobalWaiter,
        F: FnOnce(&mut C) -> WispResult<()>,
    {
        if let Err(e) = self.check_vendor() {
            return Pending::resolved(Err(e));
        }
        let (completion, pending) = Pending::new();
        self.global_request(waiter(completion), send);
        pending
    }

    fn global_request<F>(&mut self, waiter: GlobalWaiter, send: F)
    where
        F: FnOnce(&mut C) -> WispResult<()>,
    {
        if let Err(e) = self.check_writable() {
            let mut cx = ReplyContext {
                forwarding: &mut self.forwarding,
                keepalive: &mut self.keepalive,
                dyn_rport_bug: false,
            };
            debug!(request = waiter.name(), error = %e, "global request not sent");
            waiter.complete(GlobalReply::Disconnected, &mut cx);
            return;
        }
        debug!(request = waiter.name(), "global request");
        self.global.push(waiter);
        if let Err(e) = self.send(send) {
            debug!(error = %e, "global request not sent");
        }
    }

    fn on_global_reply(&mut self, reply: GlobalReply) {
        let Some(waiter) = self.global.pop() else {
            debug!(?reply, "global reply without a pending request");
            return;
        };
        let mut cx = ReplyContext {
            forwarding: &mut self.forwarding,
            keepalive: &mut self.keepalive,
            dyn_rport_bug: self
                .remote_version
                .as_ref()
                .map_or(false, Version::has_dyn_rport_bug),
        };
        waiter.complete(reply, &mut cx);
    }

    fn check_vendor(&self) -> WispResult<()> {
        let strict = self.config.as_ref().map_or(true, |c| c.strict_vendor);
        let compatible = self
            .remote_version
            .as_ref()
            .map_or(false, Version::is_openssh_compatible);
        if strict && !compatible {
            return Err(WispError::Unsupported(STRICT_VENDOR_MESSAGE.to_string()));
        }
        Ok(())
    }

    // ===== Keep-alive and timers =====

    /// One keep-alive interval elapsed.
    ///
    /// Returns an error once the connection is gone or declared dead, so a
    /// timer driving this can stop.
    pub fn keepalive_tick(&mut self) -> WispResult<()> {
        if self.closed {
            return Err(WispError::NotConnected);
        }
        let writable = self.codec.as_ref().map_or(false, |c| c.is_writable());
        match self.keepalive.tick(writable) {
            KeepaliveAction::Idle => Ok(()),
            KeepaliveAction::SendPing => {
                trace!(missed = self.keepalive.count(), "keep-alive ping");
                self.global.push(GlobalWaiter::Keepalive);
                self.send(|codec| codec.ping())
            }
            KeepaliveAction::TimedOut => {
                warn!(missed = self.keepalive.count(), "keep-alive timeout");
                self.fatal(WispError::Timeout("Keepalive timeout".to_string()));
                Err(WispError::Timeout("Keepalive timeout".to_string()))
            }
        }
    }

    /// The ready timeout elapsed. Closes the connection unless it is ready.
    pub fn handshake_timeout(&mut self) {
        if self.ready || self.closed {
            return;
        }
        warn!("handshake timed out");
        self.fatal(WispError::Timeout(
            "Timed out while waiting for handshake".to_string(),
        ));
    }

    // ===== Lifecycle =====

    /// Disconnects gracefully; `Close` follows once the transport is gone.
    pub fn end(&mut self) -> WispResult<()> {
        match self.codec.as_mut().filter(|c| c.is_writable()) {
            Some(codec) => {
                debug!("disconnecting");
                let result = codec.disconnect();
                result.map_err(|e| self.transport_failed(e))
            }
            None => Ok(()),
        }
    }

    /// Drops the transport immediately and fails everything in flight.
    pub fn destroy(&mut self) {
        self.teardown();
    }

    fn fatal(&mut self, error: WispError) {
        warn!(error = %error, level = ?error.level(), "connection failed");
        self.events.emit(ClientEvent::Error(error));
        self.teardown();
    }

    /// Closes the connection and resolves every waiter exactly once.
    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.ready = false;
        self.auth = None;
        self.agent_relays.clear();
        self.agent_jobs = 0;
        self.keepalive.disarm();
        if let Some(mut codec) = self.codec.take() {
            codec.destroy();
        }

        let waiters = self.global.drain();
        let slots = self.channels.drain();
        debug!(
            global_requests = waiters.len(),
            channels = slots.len(),
            "failing outstanding requests"
        );

        let mut cx = ReplyContext {
            forwarding: &mut self.forwarding,
            keepalive: &mut self.keepalive,
            dyn_rport_bug: false,
        };
        for waiter in waiters {
            waiter.complete(GlobalReply::Disconnected, &mut cx);
        }
        for (_, slot) in slots {
            match slot {
                Slot::Opening(pending) => pending.fail(WispError::channel_closed_unexpectedly()),
                Slot::Live(channel) => channel.terminate(WispError::Disconnected),
                Slot::Incoming(_) => {}
            }
        }

        self.forwarding.clear();
        self.x11_accepts = 0;
        self.agent_forwarding = false;
        info!("connection closed");
        self.events.emit(ClientEvent::Close);
    }

    // ===== Helpers =====

    fn config(&self) -> WispResult<Arc<SshClientConfig>> {
        self.config.clone().ok_or(WispError::NotConnected)
    }

    fn codec_mut(&mut self) -> WispResult<&mut C> {
        self.codec.as_mut().ok_or(WispError::NotConnected)
    }

    fn check_writable(&self) -> WispResult<()> {
        match &self.codec {
            Some(codec) if !self.closed && codec.is_writable() => Ok(()),
            _ => Err(WispError::NotConnected),
        }
    }

    /// Runs a codec send from a user operation. A failed send closes the
    /// connection; the caller sees `NotConnected`.
    fn send<F>(&mut self, send: F) -> WispResult<()>
    where
        F: FnOnce(&mut C) -> WispResult<()>,
    {
        let result = match self.codec.as_mut() {
            Some(codec) if !self.closed => send(codec),
            _ => return Err(WispError::NotConnected),
        };
        result.map_err(|e| self.transport_failed(e))
    }

    fn transport_failed(&mut self, error: WispError) -> WispError {
        self.fatal(error);
        WispError::NotConnected
    }

    // ===== Accessors =====

    /// True once authentication succeeded.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// True while a transport is attached.
    pub fn is_connected(&self) -> bool {
        !self.closed
    }

    /// Configuration of the current connection attempt.
    pub fn config_ref(&self) -> Option<&SshClientConfig> {
        self.config.as_deref()
    }

    /// Peer identification, once received.
    pub fn remote_version(&self) -> Option<&Version> {
        self.remote_version.as_ref()
    }

    /// Active remote forwardings.
    pub fn forwarding(&self) -> &ForwardingTable {
        &self.forwarding
    }

    /// Local channel ids in use (opening, undecided or live).
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Global requests still waiting for a reply.
    pub fn pending_global_requests(&self) -> usize {
        self.global.len()
    }

    /// Consecutive unanswered keep-alive pings.
    pub fn keepalive_misses(&self) -> u32 {
        self.keepalive.count()
    }

    /// Whether agent forwarding is active on this connection.
    pub fn agent_forwarding(&self) -> bool {
        self.agent_forwarding
    }

    /// The attached codec.
    pub fn codec(&self) -> Option<&C> {
        self.codec.as_ref()
    }
}
