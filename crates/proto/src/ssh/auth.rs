//! Client authentication sequencing (RFC 4252).
//!
//! Methods are tried in a fixed order, each only if configured:
//!
//! 1. `none`
//! 2. `password`
//! 3. `publickey` with the configured private key
//! 4. `publickey` with each agent key in turn
//! 5. `keyboard-interactive`
//! 6. `hostbased`
//!
//! A USERAUTH_FAILURE moves to the next agent key while agent keys remain,
//! otherwise to the next method. Local failures (signing errors, agent
//! errors) are reported and skipped the same way. Running out of methods is
//! reported once as [`AuthStatus::Exhausted`].
//!
//! The sequencer itself never waits. Agent work is returned to the caller
//! as [`AuthStatus::Agent`] and its outcome fed back in later.

use crate::ssh::agent::{AgentJob, AgentKey, AgentSignature};
use crate::ssh::codec::{Codec, InfoRequest};
use crate::ssh::config::SshClientConfig;
use crate::ssh::events::{ClientEvent, EventSink};
use crate::ssh::keys::{KeyType, Signer};
use std::collections::VecDeque;
use tracing::{debug, info};
use wisp_platform::{WispError, WispResult};

/// Authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// "none"
    None,
    /// "password"
    Password,
    /// "publickey" with the configured key
    PublicKey,
    /// "publickey" with agent keys
    Agent,
    /// "keyboard-interactive"
    KeyboardInteractive,
    /// "hostbased"
    HostBased,
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password => "password",
            AuthMethod::PublicKey => "publickey",
            AuthMethod::Agent => "agent",
            AuthMethod::KeyboardInteractive => "keyboard-interactive",
            AuthMethod::HostBased => "hostbased",
        }
    }
}

/// Methods to try for `config`, in order.
pub fn auth_methods(config: &SshClientConfig) -> Vec<AuthMethod> {
    let mut methods = vec![AuthMethod::None];
    if config.password.is_some() {
        methods.push(AuthMethod::Password);
    }
    if config.private_key.is_some() {
        methods.push(AuthMethod::PublicKey);
    }
    if config.agent.is_some() {
        methods.push(AuthMethod::Agent);
    }
    if config.try_keyboard {
        methods.push(AuthMethod::KeyboardInteractive);
    }
    if config.private_key.is_some()
        && config.local_hostname.is_some()
        && config.local_username.is_some()
    {
        methods.push(AuthMethod::HostBased);
    }
    methods
}

/// Where authentication stands after an input.
#[derive(Debug)]
pub(crate) enum AuthStatus {
    /// Waiting on the server (or nothing changed).
    Pending,
    /// Waiting on the agent; the caller runs the job and feeds the outcome
    /// back through [`AuthSession::on_agent_identities`] or
    /// [`AuthSession::on_agent_signature`].
    Agent(AgentJob),
    /// Every method failed.
    Exhausted,
}

/// What an authentication step may touch.
pub(crate) struct AuthContext<'a, C: Codec> {
    pub(crate) codec: &'a mut C,
    pub(crate) config: &'a SshClientConfig,
    pub(crate) events: &'a EventSink,
}

/// Authentication progress for one connection.
#[derive(Debug)]
pub(crate) struct AuthSession {
    remaining: VecDeque<AuthMethod>,
    current: Option<AuthMethod>,
    agent_keys: Vec<AgentKey>,
    agent_key_index: usize,
    awaiting_pk_ok: bool,
    awaiting_agent: bool,
    prompts_pending: bool,
    finished: bool,
}

impl AuthSession {
    pub(crate) fn new(config: &SshClientConfig) -> Self {
        Self {
            remaining: auth_methods(config).into(),
            current: None,
            agent_keys: Vec::new(),
            agent_key_index: 0,
            awaiting_pk_ok: false,
            awaiting_agent: false,
            prompts_pending: false,
            finished: false,
        }
    }

    pub(crate) fn current(&self) -> Option<AuthMethod> {
        self.current
    }

    /// Sends the first method.
    pub(crate) fn start<C: Codec>(&mut self, cx: &mut AuthContext<'_, C>) -> WispResult<AuthStatus> {
        self.try_next(cx)
    }

    pub(crate) fn on_success(&mut self) {
        info!(method = self.current.map(|m| m.name()), "authentication succeeded");
        self.finished = true;
        self.current = None;
        self.awaiting_agent = false;
        self.prompts_pending = false;
        self.agent_keys.clear();
    }

    pub(crate) fn on_failure<C: Codec>(
        &mut self,
        cx: &mut AuthContext<'_, C>,
        methods: &[String],
        partial_success: bool,
    ) -> WispResult<AuthStatus> {
        let Some(current) = self.current.filter(|_| !self.finished) else {
            return Ok(AuthStatus::Pending);
        };
        self.awaiting_pk_ok = false;
        self.awaiting_agent = false;
        self.prompts_pending = false;
        if current == AuthMethod::Agent {
            debug!(key = self.agent_key_index + 1, "agent key rejected");
            return self.next_agent_key(cx);
        }
        debug!(
            method = current.name(),
            ?methods,
            partial_success,
            "authentication method failed"
        );
        self.try_next(cx)
    }

    pub(crate) fn on_pk_ok<C: Codec>(
        &mut self,
        cx: &mut AuthContext<'_, C>,
    ) -> WispResult<AuthStatus> {
        if !self.awaiting_pk_ok || self.finished {
            debug!("ignoring unexpected USERAUTH_PK_OK");
            return Ok(AuthStatus::Pending);
        }
        self.awaiting_pk_ok = false;
        let config = cx.config;
        let user = config.username.as_str();

        match self.current {
            Some(AuthMethod::PublicKey) => {
                let Some(key) = config.private_key.as_ref() else {
                    return self.try_next(cx);
                };
                let payload =
                    cx.codec
                        .publickey_sign_payload(user, key.key_type(), key.public_key());
                match sign_with(key.as_ref(), &payload) {
                    Ok(signature) => {
                        cx.codec.auth_publickey_signed(
                            user,
                            key.key_type(),
                            key.public_key(),
                            &signature,
                        )?;
                        Ok(AuthStatus::Pending)
                    }
                    Err(e) => {
                        cx.events.emit(ClientEvent::Error(signing_error(e)));
                        self.try_next(cx)
                    }
                }
            }
            Some(AuthMethod::Agent) => {
                let Some(key) = self.agent_keys.get(self.agent_key_index).cloned() else {
                    return self.next_agent_key(cx);
                };
                let key_type = key.key_type();
                if KeyType::from_name(&key_type).is_none() {
                    debug!(%key_type, "skipping unsupported agent key type");
                    return self.next_agent_key(cx);
                }
                let data = cx.codec.publickey_sign_payload(user, &key_type, key.blob());
                self.awaiting_agent = true;
                Ok(AuthStatus::Agent(AgentJob::Sign { key, data }))
            }
            _ => Ok(AuthStatus::Pending),
        }
    }

    /// Continues the agent method with the agent's key list.
    pub(crate) fn on_agent_identities<C: Codec>(
        &mut self,
        cx: &mut AuthContext<'_, C>,
        result: WispResult<Vec<AgentKey>>,
    ) -> WispResult<AuthStatus> {
        if !self.take_agent_turn() {
            return Ok(AuthStatus::Pending);
        }
        match result {
            Err(e) => cx.events.emit(ClientEvent::Error(as_agent_error(e))),
            Ok(keys) if keys.is_empty() => debug!("agent holds no keys"),
            Ok(keys) => {
                self.agent_keys = keys;
                if self.probe_agent_key_from(cx, 0)? {
                    return Ok(AuthStatus::Pending);
                }
                self.agent_keys.clear();
            }
        }
        self.try_next(cx)
    }

    /// Sends the agent's signature for the accepted key.
    pub(crate) fn on_agent_signature<C: Codec>(
        &mut self,
        cx: &mut AuthContext<'_, C>,
        result: WispResult<AgentSignature>,
    ) -> WispResult<AuthStatus> {
        if !self.take_agent_turn() {
            return Ok(AuthStatus::Pending);
        }
        let Some(key) = self.agent_keys.get(self.agent_key_index) else {
            return self.next_agent_key(cx);
        };
        let key_type = key.key_type();
        match result {
            Ok(signature) if signature.algorithm == key_type => {
                cx.codec.auth_publickey_signed(
                    &cx.config.username,
                    &key_type,
                    key.blob(),
                    &signature.blob,
                )?;
                return Ok(AuthStatus::Pending);
            }
            Ok(signature) => {
                debug!(%key_type, algorithm = %signature.algorithm, "agent signed with another algorithm");
                cx.events.emit(ClientEvent::Error(WispError::Agent(
                    "Agent key/signature type mismatch".to_string(),
                )));
            }
            Err(e) => cx.events.emit(ClientEvent::Error(as_agent_error(e))),
        }
        self.next_agent_key(cx)
    }

    /// True (once) if an agent outcome is expected now.
    fn take_agent_turn(&mut self) -> bool {
        let expected =
            self.awaiting_agent && !self.finished && self.current == Some(AuthMethod::Agent);
        if !expected {
            debug!("ignoring stale agent outcome");
        }
        self.awaiting_agent = false;
        expected
    }

    /// Answers an empty prompt list automatically; otherwise asks the user.
    pub(crate) fn on_info_request<C: Codec>(
        &mut self,
        cx: &mut AuthContext<'_, C>,
        request: InfoRequest,
    ) -> WispResult<()> {
        if self.current != Some(AuthMethod::KeyboardInteractive) || self.finished {
            debug!("ignoring USERAUTH_INFO_REQUEST outside keyboard-interactive");
            return Ok(());
        }
        if request.prompts.is_empty() {
            debug!("sending automatic USERAUTH_INFO_RESPONSE");
            return cx.codec.auth_info_response(&[]);
        }
        self.prompts_pending = true;
        cx.events.emit(ClientEvent::KeyboardInteractive(request));
        Ok(())
    }

    /// Claims the outstanding prompts for a user answer.
    ///
    /// Returns false if no INFO_REQUEST is waiting for one.
    pub(crate) fn take_prompts(&mut self) -> bool {
        let pending = self.prompts_pending
            && !self.finished
            && self.current == Some(AuthMethod::KeyboardInteractive);
        self.prompts_pending = false;
        pending
    }

    fn try_next<C: Codec>(&mut self, cx: &mut AuthContext<'_, C>) -> WispResult<AuthStatus> {
        let config = cx.config;
        let user = config.username.as_str();

        loop {
            self.awaiting_pk_ok = false;
            self.awaiting_agent = false;
            self.prompts_pending = false;
            let Some(method) = self.remaining.pop_front() else {
                self.current = None;
                self.finished = true;
                return Ok(AuthStatus::Exhausted);
            };
            self.current = Some(method);
            debug!(method = method.name(), "trying authentication method");

            match method {
                AuthMethod::None => cx.codec.auth_none(user)?,
                AuthMethod::Password => {
                    let password = config.password.as_ref().map(|p| p.as_str()).unwrap_or("");
                    cx.codec.auth_password(user, password)?;
                }
                AuthMethod::PublicKey => {
                    let Some(key) = config.private_key.as_ref() else {
                        continue;
                    };
                    cx.codec
                        .auth_publickey_probe(user, key.key_type(), key.public_key())?;
                    self.awaiting_pk_ok = true;
                }
                AuthMethod::Agent => {
                    if config.agent.is_none() {
                        continue;
                    }
                    self.awaiting_agent = true;
                    return Ok(AuthStatus::Agent(AgentJob::Identities));
                }
                AuthMethod::KeyboardInteractive => cx.codec.auth_keyboard_interactive(user)?,
                AuthMethod::HostBased => {
                    let (Some(key), Some(host), Some(local_user)) = (
                        config.private_key.as_ref(),
                        config.local_hostname.as_deref(),
                        config.local_username.as_deref(),
                    ) else {
                        continue;
                    };
                    let payload = cx.codec.hostbased_sign_payload(
                        user,
                        key.key_type(),
                        key.public_key(),
                        host,
                        local_user,
                    );
                    match sign_with(key.as_ref(), &payload) {
                        Ok(signature) => cx.codec.auth_hostbased(
                            user,
                            key.key_type(),
                            key.public_key(),
                            host,
                            local_user,
                            &signature,
                        )?,
                        Err(e) => {
                            cx.events.emit(ClientEvent::Error(signing_error(e)));
                            continue;
                        }
                    }
                }
            }
            return Ok(AuthStatus::Pending);
        }
    }

    fn next_agent_key<C: Codec>(&mut self, cx: &mut AuthContext<'_, C>) -> WispResult<AuthStatus> {
        if self.current != Some(AuthMethod::Agent) {
            return Ok(AuthStatus::Pending);
        }
        if self.probe_agent_key_from(cx, self.agent_key_index + 1)? {
            return Ok(AuthStatus::Pending);
        }
        debug!("no more agent keys to try");
        self.agent_keys.clear();
        self.try_next(cx)
    }

    /// Probes the agent key at `start`, if any.
    fn probe_agent_key_from<C: Codec>(
        &mut self,
        cx: &mut AuthContext<'_, C>,
        start: usize,
    ) -> WispResult<bool> {
        let Some(key) = self.agent_keys.get(start) else {
            self.agent_key_index = self.agent_keys.len();
            return Ok(false);
        };
        let key_type = key.key_type();
        debug!(key = start + 1, %key_type, "trying agent key");
        cx.codec
            .auth_publickey_probe(&cx.config.username, &key_type, key.blob())?;
        self.agent_key_index = start;
        self.awaiting_pk_ok = true;
        Ok(true)
    }
}

fn sign_with(key: &dyn Signer, data: &[u8]) -> WispResult<Vec<u8>> {
    let key_type = KeyType::from_name(key.key_type()).ok_or_else(|| {
        WispError::Unsupported(format!("unsupported key type {}", key.key_type()))
    })?;
    key.sign(data, key_type.signature_hash())
}

fn signing_error(e: WispError) -> WispError {
    WispError::Authentication(format!("Error while signing data with privateKey: {}", e))
}

fn as_agent_error(e: WispError) -> WispError {
    match e {
        WispError::Agent(_) => e,
        other => WispError::Agent(other.to_string()),
    }
}
