use super::backoff::Backoff;
use super::channel::{ConnectionState, SocketChannel};
use super::state::LinkState;
use super::telemetry::Telemetry;
use super::wait_for_flag;
use crate::config::LinkConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Cancels a running [`Supervisor`] from anywhere.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<watch::Sender<bool>>,
    state: Arc<LinkState>,
}

impl ShutdownHandle {
    /// Stop the supervisor loop, close the live channel, and cut short any
    /// backoff wait.
    pub fn shutdown(&self) {
        if !self.flag.send_replace(true) {
            info!(component = "supervisor", "Shutdown requested");
        }
        if let Some(channel) = self.state.current_channel() {
            channel.close();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.flag.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        wait_for_flag(&mut rx).await;
    }
}

/// Closes and forgets the channel whichever way the session ends.
struct ChannelGuard<'a> {
    state: &'a LinkState,
    channel: SocketChannel,
}

impl<'a> ChannelGuard<'a> {
    fn install(state: &'a LinkState, channel: SocketChannel) -> Self {
        state.install_channel(channel.clone());
        Self { state, channel }
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        self.channel.close();
        self.state.clear_channel(&self.channel);
    }
}

/// Outer reconnect loop: open a channel, push telemetry while it lives,
/// back off, repeat.
///
/// Owns the `channel`, `backoff_attempt`, and `connect_attempts` fields of
/// [`LinkState`].
pub struct Supervisor {
    config: LinkConfig,
    state: Arc<LinkState>,
    telemetry: Arc<Telemetry>,
    shutdown: Arc<watch::Sender<bool>>,
    reconnect_requested: AtomicBool,
    backoff_max: Duration,
}

impl Supervisor {
    pub fn new(config: LinkConfig, telemetry: Arc<Telemetry>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            backoff_max: config.backoff_max(),
            state: telemetry.state().clone(),
            config,
            telemetry,
            shutdown: Arc::new(shutdown),
            reconnect_requested: AtomicBool::new(false),
        }
    }

    /// Override the backoff ceiling from the configuration.
    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    pub fn state(&self) -> &Arc<LinkState> {
        &self.state
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            state: self.state.clone(),
        }
    }

    /// Drop the live channel and reopen straight away, skipping the backoff.
    /// Returns false when there was no channel to drop.
    pub fn reconnect(&self) -> bool {
        match self.state.current_channel() {
            Some(channel) => {
                info!(component = "supervisor", channel_id = %channel.id(), "Reconnect requested");
                self.reconnect_requested.store(true, Ordering::Release);
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Run until shut down. Transport and configuration failures are logged
    /// and retried after the backoff delay; nothing here terminates the loop.
    pub async fn run(&self) {
        let mut backoff = Backoff::new(self.backoff_max);
        let mut shutdown_rx = self.shutdown.subscribe();
        info!(
            component = "supervisor",
            max_backoff_secs = self.backoff_max.as_secs_f64(),
            "Supervisor started"
        );

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            match self.config.channel_target() {
                Ok((url, token)) => {
                    self.run_session(&url, &token, &mut backoff, &mut shutdown_rx)
                        .await
                }
                Err(e) => warn!(component = "supervisor", "Printer not ready: {}", e),
            }

            if *shutdown_rx.borrow_and_update() {
                break;
            }
            if self.reconnect_requested.swap(false, Ordering::AcqRel) {
                continue;
            }

            let delay = backoff.next_delay();
            self.state.set_backoff_attempt(backoff.attempt());
            debug!(
                component = "supervisor",
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Waiting before reconnect"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_flag(&mut shutdown_rx) => break,
            }
        }

        if let Some(channel) = self.state.current_channel() {
            channel.close();
            self.state.clear_channel(&channel);
        }
        info!(
            component = "supervisor",
            connect_attempts = self.state.connect_attempts(),
            "Supervisor stopped"
        );
    }

    async fn run_session(
        &self,
        url: &str,
        token: &str,
        backoff: &mut Backoff,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let attempt = self.state.record_connect_attempt();
        debug!(component = "supervisor", attempt, url = %url, "Opening channel");

        let channel = match SocketChannel::open(
            url,
            token,
            self.config.connect_timeout(),
            self.telemetry.clone(),
        ) {
            Ok(channel) => channel,
            Err(e) => {
                error!(component = "supervisor", "Cannot open channel: {}", e);
                return;
            }
        };
        let _guard = ChannelGuard::install(&self.state, channel.clone());

        let settled = tokio::select! {
            state = channel.wait_settled() => state,
            _ = wait_for_flag(shutdown_rx) => return,
        };
        if settled != ConnectionState::Connected {
            return;
        }

        backoff.zero();
        self.state.set_backoff_attempt(0);

        let mut interval_rx = self.state.subscribe_interval();
        let mut last_push = Instant::now();
        loop {
            backoff.zero();
            let interval = *interval_rx.borrow_and_update();
            let deadline = last_push + interval;

            tokio::select! {
                biased;
                _ = wait_for_flag(shutdown_rx) => break,
                _ = channel.closed() => break,
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep_until(deadline) => {
                    self.telemetry.push_snapshot(&channel, None).await;
                    last_push = Instant::now();
                }
            }
        }
        debug!(component = "supervisor", channel_id = %channel.id(), "Session ended");
    }
}
