//! Async session facade.
//!
//! [`Session`] owns everything an [`SshClient`] needs to run on its own:
//! - the TCP socket, resolved with optional address-family forcing,
//! - the codec produced by a [`CodecFactory`],
//! - the dispatcher task feeding codec events and agent outcomes to the
//!   client,
//! - the keep-alive timer and the handshake (ready) timer.
//!
//! Operations lock the client only long enough to issue the request, then
//! await the reply without holding the lock.

pub mod keepalive;

pub use keepalive::{KeepaliveAction, KeepaliveTask, KeepaliveWatchdog};

use crate::ssh::channel::SshChannel;
use crate::ssh::client::SshClient;
use crate::ssh::codec::{Codec, CodecEvent, CodecFactory};
use crate::ssh::config::SshClientConfig;
use crate::ssh::connection::{ExecOptions, ShellOptions};
use crate::ssh::dispatcher::MessageDispatcher;
use crate::ssh::events::{ClientEvent, IncomingChannel};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use wisp_platform::{WispError, WispResult};

/// A connected SSH client with its background tasks.
pub struct Session<C: Codec + 'static> {
    client: Arc<Mutex<SshClient<C>>>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    dispatcher: MessageDispatcher,
    keepalive: Option<KeepaliveTask>,
    ready_timer: Option<JoinHandle<()>>,
}

impl<C: Codec + 'static> Session<C> {
    /// Resolves and connects to the configured server, attaches a codec and
    /// starts the background tasks.
    ///
    /// Returns once the socket is connected; wait for
    /// [`ClientEvent::Ready`] (or use [`Session::wait_ready`]) before
    /// opening channels.
    ///
    /// # Errors
    ///
    /// [`WispError::Dns`] if the host has no address of a forced family,
    /// [`WispError::Io`] if the TCP connection fails, and whatever the
    /// factory reports when attaching the codec.
    pub async fn connect<F>(config: SshClientConfig, factory: &F) -> WispResult<Self>
    where
        F: CodecFactory<Codec = C>,
    {
        config.validate()?;
        let config = Arc::new(config);

        let addr = resolve(&config).await?;
        info!(%addr, "connecting to SSH server");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(%addr, "connected");

        let (codec, codec_events) = factory.attach(stream, &config.algorithms)?;
        let (client, events) = SshClient::new();
        let client = Arc::new(Mutex::new(client));
        client.lock().await.connect(Arc::clone(&config), codec)?;

        Ok(Self::start(client, events, codec_events, &config))
    }

    /// Runs an already attached codec. Used when the transport is not a
    /// plain TCP socket.
    pub async fn with_codec(
        config: SshClientConfig,
        codec: C,
        codec_events: mpsc::UnboundedReceiver<CodecEvent>,
    ) -> WispResult<Self> {
        let config = Arc::new(config);
        let (client, events) = SshClient::new();
        let client = Arc::new(Mutex::new(client));
        client.lock().await.connect(Arc::clone(&config), codec)?;
        Ok(Self::start(client, events, codec_events, &config))
    }

    fn start(
        client: Arc<Mutex<SshClient<C>>>,
        events: mpsc::UnboundedReceiver<ClientEvent>,
        codec_events: mpsc::UnboundedReceiver<CodecEvent>,
        config: &SshClientConfig,
    ) -> Self {
        let mut dispatcher = MessageDispatcher::new();
        dispatcher.start(Arc::clone(&client), codec_events);

        let ready_timer = (!config.ready_timeout.is_zero()).then(|| {
            let client = Arc::clone(&client);
            let timeout = config.ready_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                client.lock().await.handshake_timeout();
            })
        });

        let keepalive = (!config.keepalive_interval.is_zero()).then(|| {
            let mut task = KeepaliveTask::new(config.keepalive_interval);
            let client = Arc::clone(&client);
            task.start(move || {
                let client = Arc::clone(&client);
                async move { client.lock().await.keepalive_tick() }
            });
            task
        });

        Self {
            client,
            events,
            dispatcher,
            keepalive,
            ready_timer,
        }
    }

    /// Next client event; `None` once the client is gone.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Consumes events until authentication succeeds.
    ///
    /// Banners and greetings are dropped. Errors that do not end the
    /// connection (a failed agent or signing attempt) are skipped; if the
    /// connection closes, the last error seen is returned.
    pub async fn wait_ready(&mut self) -> WispResult<()> {
        let mut last_error = None;
        while let Some(event) = self.events.recv().await {
            match event {
                ClientEvent::Ready => {
                    if let Some(timer) = self.ready_timer.take() {
                        timer.abort();
                    }
                    return Ok(());
                }
                ClientEvent::Error(e) => {
                    debug!(error = %e, "error while waiting for ready");
                    last_error = Some(e);
                }
                ClientEvent::Close => break,
                _ => {}
            }
        }
        Err(last_error.unwrap_or(WispError::Disconnected))
    }

    /// Runs a command.
    pub async fn exec(&self, command: &str, options: ExecOptions) -> WispResult<SshChannel> {
        let pending = self.client.lock().await.exec(command, options);
        pending.await
    }

    /// Starts a shell.
    pub async fn shell(&self, options: ShellOptions) -> WispResult<SshChannel> {
        let pending = self.client.lock().await.shell(options);
        pending.await
    }

    /// Starts a subsystem.
    pub async fn subsys(&self, name: &str) -> WispResult<SshChannel> {
        let pending = self.client.lock().await.subsys(name);
        pending.await
    }

    /// Starts the sftp subsystem.
    pub async fn sftp(&self) -> WispResult<SshChannel> {
        let pending = self.client.lock().await.sftp();
        pending.await
    }

    /// Remote port forwarding; returns the bound port.
    pub async fn forward_in(&self, bind_addr: &str, bind_port: u32) -> WispResult<u32> {
        let pending = self.client.lock().await.forward_in(bind_addr, bind_port);
        pending.await
    }

    /// Cancels a remote port forwarding.
    pub async fn unforward_in(&self, bind_addr: &str, bind_port: u32) -> WispResult<()> {
        let pending = self.client.lock().await.unforward_in(bind_addr, bind_port);
        pending.await
    }

    /// Remote Unix socket forwarding.
    pub async fn forward_in_streamlocal(&self, socket_path: &str) -> WispResult<()> {
        let pending = self.client.lock().await.forward_in_streamlocal(socket_path);
        pending.await
    }

    /// Cancels a remote Unix socket forwarding.
    pub async fn unforward_in_streamlocal(&self, socket_path: &str) -> WispResult<()> {
        let pending = self.client.lock().await.unforward_in_streamlocal(socket_path);
        pending.await
    }

    /// Opens a `direct-tcpip` channel.
    pub async fn forward_out(
        &self,
        src_addr: &str,
        src_port: u32,
        dst_addr: &str,
        dst_port: u32,
    ) -> WispResult<SshChannel> {
        let pending = self
            .client
            .lock()
            .await
            .forward_out(src_addr, src_port, dst_addr, dst_port);
        pending.await
    }

    /// Opens a `direct-streamlocal@openssh.com` channel.
    pub async fn forward_out_streamlocal(&self, socket_path: &str) -> WispResult<SshChannel> {
        let pending = self.client.lock().await.forward_out_streamlocal(socket_path);
        pending.await
    }

    /// Disables further session channels on the server.
    pub async fn no_more_sessions(&self) -> WispResult<()> {
        let pending = self.client.lock().await.no_more_sessions();
        pending.await
    }

    /// Accepts an incoming forwarded connection.
    pub async fn accept_incoming(&self, incoming: IncomingChannel) -> WispResult<SshChannel> {
        self.client.lock().await.accept_incoming(incoming)
    }

    /// Rejects an incoming forwarded connection.
    pub async fn reject_incoming(&self, incoming: IncomingChannel) -> WispResult<()> {
        self.client.lock().await.reject_incoming(incoming)
    }

    /// Answers keyboard-interactive prompts.
    pub async fn keyboard_interactive_response(&self, answers: &[String]) -> WispResult<()> {
        self.client.lock().await.keyboard_interactive_response(answers)
    }

    /// Writes to a channel.
    pub async fn write(&self, channel: &SshChannel, data: &[u8]) -> WispResult<()> {
        self.client.lock().await.write(channel.local_id(), data)
    }

    /// Sends EOF on a channel once its buffered data is out.
    pub async fn eof(&self, channel: &SshChannel) -> WispResult<()> {
        self.client.lock().await.eof(channel.local_id())
    }

    /// Closes a channel.
    pub async fn close_channel(&self, channel: &SshChannel) -> WispResult<()> {
        self.client.lock().await.close_channel(channel.local_id())
    }

    /// Reports a terminal size change.
    pub async fn window_change(
        &self,
        channel: &SshChannel,
        rows: u32,
        cols: u32,
        height: u32,
        width: u32,
    ) -> WispResult<()> {
        self.client
            .lock()
            .await
            .window_change(channel.local_id(), rows, cols, height, width)
    }

    /// Signals the remote process.
    pub async fn signal(&self, channel: &SshChannel, name: &str) -> WispResult<()> {
        self.client.lock().await.signal(channel.local_id(), name)
    }

    /// Disconnects gracefully.
    pub async fn end(&self) -> WispResult<()> {
        self.client.lock().await.end()
    }

    /// Closes the connection immediately and stops the background tasks.
    pub async fn destroy(&mut self) {
        self.client.lock().await.destroy();
        self.stop_tasks();
    }

    /// True while the transport is attached.
    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_connected()
    }

    fn stop_tasks(&mut self) {
        if let Some(mut task) = self.keepalive.take() {
            task.stop();
        }
        if let Some(timer) = self.ready_timer.take() {
            timer.abort();
        }
        self.dispatcher.stop();
    }
}

impl<C: Codec + 'static> Drop for Session<C> {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// Picks the address to connect to.
///
/// With exactly one of `force_ipv4` / `force_ipv6` set, only addresses of
/// that family qualify.
async fn resolve(config: &SshClientConfig) -> WispResult<SocketAddr> {
    let family = match (config.force_ipv4, config.force_ipv6) {
        (true, false) => Some("IPv4"),
        (false, true) => Some("IPv6"),
        _ => None,
    };
    let lookup_error = |reason: String| match family {
        Some(family) => WispError::Dns(format!(
            "Error while looking up {} address for host {}: {}",
            family, config.host, reason
        )),
        None => WispError::Dns(format!(
            "Error while looking up address for host {}: {}",
            config.host, reason
        )),
    };

    let addrs = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(|e| lookup_error(e.to_string()))?;
    let mut addrs = addrs.filter(|addr| match family {
        Some("IPv4") => addr.is_ipv4(),
        Some(_) => addr.is_ipv6(),
        None => true,
    });
    addrs
        .next()
        .ok_or_else(|| lookup_error("no matching address".to_string()))
}
