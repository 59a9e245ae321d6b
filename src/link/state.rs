use super::channel::SocketChannel;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Shared link state.
///
/// Each field has exactly one writer; the setters are crate-private and
/// named after their owner:
/// - `channel`, `backoff_attempt`, `connect_attempts`: the supervisor loop
/// - `active_online`, `remote_connected`, `push_interval`, `snapshots_sent`:
///   the telemetry handler (channel callbacks and host event hooks)
/// - `images_sent`: the sampler
#[derive(Debug)]
pub struct LinkState {
    channel: Mutex<Option<SocketChannel>>,
    active_online: AtomicBool,
    remote_connected: AtomicBool,
    push_interval: watch::Sender<Duration>,
    backoff_attempt: AtomicU32,
    connect_attempts: AtomicU64,
    snapshots_sent: AtomicU64,
    images_sent: AtomicU64,
    start_time: Instant,
}

/// Point-in-time view of the link, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkStatus {
    pub connected: bool,
    pub active_online: bool,
    pub push_interval_ms: u64,
    pub backoff_attempt: u32,
    pub connect_attempts: u64,
    pub snapshots_sent: u64,
    pub images_sent: u64,
    pub uptime_seconds: u64,
}

impl LinkState {
    pub fn new(initial_interval: Duration) -> Self {
        let (push_interval, _) = watch::channel(initial_interval);
        Self {
            channel: Mutex::new(None),
            active_online: AtomicBool::new(false),
            remote_connected: AtomicBool::new(false),
            push_interval,
            backoff_attempt: AtomicU32::new(0),
            connect_attempts: AtomicU64::new(0),
            snapshots_sent: AtomicU64::new(0),
            images_sent: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn current_channel(&self) -> Option<SocketChannel> {
        self.channel.lock().clone()
    }

    /// True when a channel exists and its transport is fully open.
    pub fn is_connected(&self) -> bool {
        self.channel
            .lock()
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    pub fn is_active_online(&self) -> bool {
        self.active_online.load(Ordering::Acquire)
    }

    /// Whether the last channel reported open and has not closed since.
    pub fn is_remote_connected(&self) -> bool {
        self.remote_connected.load(Ordering::Acquire)
    }

    pub fn push_interval(&self) -> Duration {
        *self.push_interval.borrow()
    }

    pub fn subscribe_interval(&self) -> watch::Receiver<Duration> {
        self.push_interval.subscribe()
    }

    pub fn backoff_attempt(&self) -> u32 {
        self.backoff_attempt.load(Ordering::Acquire)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Acquire)
    }

    pub fn snapshots_sent(&self) -> u64 {
        self.snapshots_sent.load(Ordering::Relaxed)
    }

    pub fn images_sent(&self) -> u64 {
        self.images_sent.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            connected: self.is_connected(),
            active_online: self.is_active_online(),
            push_interval_ms: self.push_interval().as_millis() as u64,
            backoff_attempt: self.backoff_attempt(),
            connect_attempts: self.connect_attempts(),
            snapshots_sent: self.snapshots_sent(),
            images_sent: self.images_sent(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    // supervisor-owned

    pub(crate) fn install_channel(&self, channel: SocketChannel) {
        *self.channel.lock() = Some(channel);
    }

    /// Drop the channel reference if it is still `channel`.
    pub(crate) fn clear_channel(&self, channel: &SocketChannel) {
        let mut current = self.channel.lock();
        if current.as_ref().map(|c| c.id()) == Some(channel.id()) {
            *current = None;
        }
    }

    pub(crate) fn set_backoff_attempt(&self, attempt: u32) {
        self.backoff_attempt.store(attempt, Ordering::Release);
    }

    pub(crate) fn record_connect_attempt(&self) -> u64 {
        self.connect_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    // telemetry-owned

    pub(crate) fn set_active_online(&self, active: bool) -> bool {
        self.active_online.swap(active, Ordering::AcqRel) != active
    }

    pub(crate) fn set_remote_connected(&self, connected: bool) {
        self.remote_connected.store(connected, Ordering::Release);
    }

    /// Returns true when the interval actually changed.
    pub(crate) fn set_push_interval(&self, interval: Duration) -> bool {
        self.push_interval.send_if_modified(|current| {
            if *current != interval {
                *current = interval;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn record_snapshot_sent(&self) {
        self.snapshots_sent.fetch_add(1, Ordering::Relaxed);
    }

    // sampler-owned

    pub(crate) fn record_image_sent(&self) {
        self.images_sent.fetch_add(1, Ordering::Relaxed);
    }
}
