//! Session channel setup sequencing.
//!
//! A session channel is configured by a short ordered list of requests:
//! optional agent forwarding, pty and x11, then exactly one main request
//! (exec, shell or subsystem). Each request waits for the previous one's
//! reply. The first failure closes the channel and ends the sequence; the
//! caller is answered once, either with the ready channel or with the
//! failing step's error.

use crate::ssh::channel::{ChannelSubtype, SshChannel};
use crate::ssh::connection::{ExecOptions, PtyOptions, ShellOptions, X11Options};
use crate::ssh::pending::Completion;
use std::collections::VecDeque;
use wisp_platform::{WispError, WispResult};

/// One request in a setup sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SetupStep {
    AgentForward,
    Pty(PtyOptions),
    X11(X11Options),
    Exec(String),
    Shell,
    Subsystem(String),
}

impl SetupStep {
    pub(crate) fn kind(&self) -> RequestKind {
        match self {
            SetupStep::AgentForward => RequestKind::AgentForward,
            SetupStep::Pty(_) => RequestKind::Pty,
            SetupStep::X11(_) => RequestKind::X11,
            SetupStep::Exec(_) => RequestKind::Exec,
            SetupStep::Shell => RequestKind::Shell,
            SetupStep::Subsystem(name) => RequestKind::Subsystem(name.clone()),
        }
    }
}

/// A channel request waiting for CHANNEL_SUCCESS / CHANNEL_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestKind {
    AgentForward,
    Pty,
    X11,
    Exec,
    Shell,
    Subsystem(String),
}

impl RequestKind {
    /// The subtype a successful main request gives the channel.
    pub(crate) fn subtype(&self) -> Option<ChannelSubtype> {
        match self {
            RequestKind::Exec => Some(ChannelSubtype::Exec),
            RequestKind::Shell => Some(ChannelSubtype::Shell),
            RequestKind::Subsystem(_) => Some(ChannelSubtype::Subsystem),
            _ => None,
        }
    }

    pub(crate) fn failure(&self) -> WispError {
        WispError::Request(match self {
            RequestKind::AgentForward => "Unable to request agent forwarding".to_string(),
            RequestKind::Pty => "Unable to request a pseudo-terminal".to_string(),
            RequestKind::X11 => "Unable to request X11".to_string(),
            RequestKind::Exec => "Unable to exec".to_string(),
            RequestKind::Shell => "Unable to open shell".to_string(),
            RequestKind::Subsystem(name) => format!("Unable to start subsystem: {}", name),
        })
    }
}

/// Everything needed to configure a session channel once it opens.
#[derive(Debug)]
pub(crate) struct SessionPlan {
    pub(crate) env: Vec<(String, String)>,
    pub(crate) steps: Vec<SetupStep>,
    pub(crate) allow_half_open: bool,
    pub(crate) completion: Completion<SshChannel>,
}

impl SessionPlan {
    pub(crate) fn exec(
        command: &str,
        options: ExecOptions,
        agent_forward: bool,
        completion: Completion<SshChannel>,
    ) -> Self {
        let mut steps = Vec::new();
        if agent_forward {
            steps.push(SetupStep::AgentForward);
        }
        if let Some(pty) = options.pty {
            steps.push(SetupStep::Pty(pty));
        }
        if let Some(x11) = options.x11 {
            steps.push(SetupStep::X11(x11));
        }
        steps.push(SetupStep::Exec(command.to_string()));
        Self {
            env: options.env,
            steps,
            allow_half_open: options.allow_half_open,
            completion,
        }
    }

    pub(crate) fn shell(
        options: ShellOptions,
        agent_forward: bool,
        completion: Completion<SshChannel>,
    ) -> Self {
        let mut steps = Vec::new();
        if agent_forward {
            steps.push(SetupStep::AgentForward);
        }
        if let Some(pty) = options.pty {
            steps.push(SetupStep::Pty(pty));
        }
        if let Some(x11) = options.x11 {
            steps.push(SetupStep::X11(x11));
        }
        steps.push(SetupStep::Shell);
        Self {
            env: options.env,
            steps,
            allow_half_open: true,
            completion,
        }
    }

    pub(crate) fn subsystem(name: &str, completion: Completion<SshChannel>) -> Self {
        Self {
            env: Vec::new(),
            steps: vec![SetupStep::Subsystem(name.to_string())],
            allow_half_open: true,
            completion,
        }
    }

    pub(crate) fn into_queue(self, handle: SshChannel) -> SetupQueue {
        SetupQueue {
            steps: self.steps.into(),
            handle: Some(handle),
            completion: self.completion,
        }
    }

    pub(crate) fn fail(self, error: WispError) {
        self.completion.complete(Err(error));
    }
}

/// Remaining steps of an in-progress setup.
#[derive(Debug)]
pub(crate) struct SetupQueue {
    steps: VecDeque<SetupStep>,
    handle: Option<SshChannel>,
    completion: Completion<SshChannel>,
}

impl SetupQueue {
    /// The next request to send, if any.
    pub(crate) fn next_step(&mut self) -> Option<SetupStep> {
        self.steps.pop_front()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.steps.len()
    }

    /// The main request succeeded: hand the channel to the caller.
    pub(crate) fn succeed(mut self, subtype: ChannelSubtype) {
        let result: WispResult<SshChannel> = match self.handle.take() {
            Some(mut handle) => {
                handle.set_subtype(subtype);
                Ok(handle)
            }
            None => Err(WispError::Channel("Channel handle already taken".to_string())),
        };
        self.completion.complete(result);
    }

    pub(crate) fn fail(self, error: WispError) {
        self.completion.complete(Err(error));
    }
}
