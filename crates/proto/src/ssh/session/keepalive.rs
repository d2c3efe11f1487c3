//! SSH keep-alive watchdog.
//!
//! Every interval the client sends a `keepalive@openssh.com` global request.
//! Any reply, success or failure, proves the peer is alive and resets the
//! miss counter. After `count_max` unanswered pings the next tick declares
//! the connection dead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wisp_platform::WispResult;

/// What the client should do on a keep-alive tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Nothing to do (not armed, or disabled).
    Idle,
    /// Queue a keep-alive waiter and send a ping.
    SendPing,
    /// Too many pings went unanswered.
    TimedOut,
}

/// Keep-alive miss counter.
///
/// Pure state: the clock lives in [`KeepaliveTask`], the ping goes through
/// the client's global request queue.
#[derive(Debug, Clone)]
pub struct KeepaliveWatchdog {
    interval: Duration,
    count_max: u32,
    count: u32,
    armed: bool,
}

impl KeepaliveWatchdog {
    /// Creates a disarmed watchdog. A zero interval disables it entirely.
    pub fn new(interval: Duration, count_max: u32) -> Self {
        Self {
            interval,
            count_max,
            count: 0,
            armed: false,
        }
    }

    /// Arms the watchdog after authentication. Resets the counter.
    pub fn arm(&mut self) {
        self.count = 0;
        self.armed = !self.interval.is_zero();
    }

    /// Disarms the watchdog (connection closing).
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Any reply from the peer.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Advances one interval.
    ///
    /// A non-writable transport disarms the watchdog without declaring a
    /// timeout; the transport close will tear the connection down instead.
    pub fn tick(&mut self, writable: bool) -> KeepaliveAction {
        if !self.armed {
            return KeepaliveAction::Idle;
        }
        self.count += 1;
        if self.count > self.count_max {
            self.armed = false;
            return KeepaliveAction::TimedOut;
        }
        if !writable {
            self.armed = false;
            return KeepaliveAction::Idle;
        }
        KeepaliveAction::SendPing
    }

    /// Unanswered pings so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether ticks currently do anything.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Keep-alive task handle.
///
/// Drives a tick callback on a fixed interval until the callback fails or
/// the task is stopped.
pub struct KeepaliveTask {
    interval: Duration,
    stop_signal: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
}

impl KeepaliveTask {
    /// Creates a new keep-alive task (but doesn't start it).
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop_signal: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }

    /// Starts ticking.
    ///
    /// `tick_fn` returning an error stops the task; the client returns one
    /// after declaring a keep-alive timeout.
    pub fn start<F, Fut>(&mut self, tick_fn: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = WispResult<()>> + Send + 'static,
    {
        let interval = self.interval;
        let stop_signal = Arc::clone(&self.stop_signal);

        let handle = tokio::spawn(async move {
            debug!(?interval, "keep-alive task started");

            loop {
                tokio::time::sleep(interval).await;

                if stop_signal.load(Ordering::Relaxed) {
                    break;
                }

                if let Err(e) = tick_fn().await {
                    warn!(error = %e, "keep-alive stopped");
                    break;
                }
            }

            debug!("keep-alive task stopped");
        });

        self.task_handle = Some(handle);
    }

    /// Stops the task.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);

        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// Returns whether the task is running.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}
