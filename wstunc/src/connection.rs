//! Reconnect state machine and connection statistics.

use std::time::Duration;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Counters surfaced through the status file.
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub total_connections: u64,
    pub failed_connections: u64,
    pub last_error: Option<String>,
}

struct Inner {
    state: ConnectionState,
    retry_count: usize,
    stats: ClientStats,
}

/// Tracks connection state and arbitrates retries.
///
/// Retry attempt k is permitted iff `max_retries` is zero (unlimited) or
/// `k <= max_retries`, with k = 1 being the first retry; the check and the
/// counter increment happen under one lock, so the permission can not be
/// granted twice for the same slot.
pub struct ConnectionManager {
    reconnect_delay: Duration,
    max_retries: usize,
    inner: Mutex<Inner>,
}

impl ConnectionManager {
    pub fn new(reconnect_delay: Duration, max_retries: usize) -> Self {
        Self {
            reconnect_delay,
            max_retries,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                retry_count: 0,
                stats: ClientStats::default(),
            }),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.retry_count = 0;
        inner.state = ConnectionState::Connected;
        inner.stats.total_connections += 1;
        inner.stats.last_error = None;
    }

    /// Records a failed attempt. Returns the back-off to sleep before the
    /// next attempt, or `None` when the retry budget is spent.
    ///
    /// Back-off is linear with a deterministic 10% jitter: the n-th retry
    /// waits `reconnect_delay × n × 1.1`.
    pub fn record_failure(&self, error: &str) -> Option<Duration> {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Failed;
        inner.stats.failed_connections += 1;
        inner.stats.last_error = Some(error.to_owned());

        if self.max_retries > 0 && inner.retry_count >= self.max_retries {
            return None;
        }
        inner.retry_count += 1;
        Some(self.reconnect_delay.mul_f64(inner.retry_count as f64 * 1.1))
    }

    pub fn stats(&self) -> ClientStats {
        self.inner.lock().stats.clone()
    }
}
