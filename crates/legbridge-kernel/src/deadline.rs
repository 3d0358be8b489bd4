//! [`KeepaliveDeadlines`] – per-channel keepalive health tracking.
//!
//! Each keepalive channel (lease renewal, e-stop heartbeat) is registered with
//! a safety margin.  A successful cycle records a check-in and resets the
//! margin; a failed cycle increments the channel's consecutive-failure count.
//! A channel is *expired* once the margin has elapsed since its last
//! successful check-in.
//!
//! Time is always supplied by the caller, so the tracker itself never reads a
//! clock.

use std::collections::HashMap;
use std::time::Duration;

use legbridge_types::KeepaliveChannel;
use tokio::time::Instant;

/// Health state reported for a single keepalive channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    /// Checked in within its safety margin.
    Healthy,
    /// The safety margin has elapsed since the last successful check-in.
    Expired,
}

struct ChannelEntry {
    last_success: Instant,
    margin: Duration,
    consecutive_failures: u32,
}

/// Tracks check-ins from the keepalive channels of one session.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use legbridge_kernel::deadline::{ChannelHealth, KeepaliveDeadlines};
/// use legbridge_types::KeepaliveChannel;
/// use tokio::time::Instant;
///
/// let start = Instant::now();
/// let mut deadlines = KeepaliveDeadlines::new();
/// deadlines.register(KeepaliveChannel::Estop, Duration::from_secs(3), start);
///
/// assert_eq!(deadlines.health(KeepaliveChannel::Estop, start), ChannelHealth::Healthy);
/// let late = start + Duration::from_secs(4);
/// assert_eq!(deadlines.health(KeepaliveChannel::Estop, late), ChannelHealth::Expired);
/// ```
#[derive(Default)]
pub struct KeepaliveDeadlines {
    channels: HashMap<KeepaliveChannel, ChannelEntry>,
}

impl KeepaliveDeadlines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` with a safety `margin`, counting `now` as its first
    /// successful check-in.  Re-registering resets the channel.
    pub fn register(&mut self, channel: KeepaliveChannel, margin: Duration, now: Instant) {
        self.channels.insert(
            channel,
            ChannelEntry {
                last_success: now,
                margin,
                consecutive_failures: 0,
            },
        );
    }

    /// Record a successful cycle.  No-ops for unregistered channels.
    pub fn check_in(&mut self, channel: KeepaliveChannel, now: Instant) {
        if let Some(entry) = self.channels.get_mut(&channel) {
            entry.last_success = now;
            entry.consecutive_failures = 0;
        }
    }

    /// Record a failed cycle and return the consecutive-failure count.
    /// Returns `0` for unregistered channels.
    pub fn record_failure(&mut self, channel: KeepaliveChannel) -> u32 {
        match self.channels.get_mut(&channel) {
            Some(entry) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.consecutive_failures
            }
            None => 0,
        }
    }

    pub fn consecutive_failures(&self, channel: KeepaliveChannel) -> u32 {
        self.channels
            .get(&channel)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    /// Time since the last successful check-in, if registered.
    pub fn since_last_success(&self, channel: KeepaliveChannel, now: Instant) -> Option<Duration> {
        self.channels
            .get(&channel)
            .map(|e| now.saturating_duration_since(e.last_success))
    }

    /// Unregistered channels report [`ChannelHealth::Expired`].
    pub fn health(&self, channel: KeepaliveChannel, now: Instant) -> ChannelHealth {
        match self.channels.get(&channel) {
            Some(entry) if now.saturating_duration_since(entry.last_success) <= entry.margin => {
                ChannelHealth::Healthy
            }
            _ => ChannelHealth::Expired,
        }
    }

    /// Forget every channel.
    pub fn clear(&mut self) {
        self.channels.clear();
    }
}
