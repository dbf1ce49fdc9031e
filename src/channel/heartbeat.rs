//! Heartbeat strategy and scheduling for pooled channels.
//!
//! Two modes are supported:
//!
//! - [`HeartbeatMode::Idle`]: the transport fires a trigger when nothing was
//!   read for one interval; each trigger sends one heartbeat.
//! - [`HeartbeatMode::Timing`]: a timer task sends a heartbeat every interval
//!   after a random initial delay in `0..=interval`, so channels opened
//!   together do not beat together.
//!
//! Consecutive failures are counted; reaching the threshold reconnects the
//! pooled channel in place.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;

use super::pool::{ChannelEvent, SharedChannel};
use crate::config::keys;
use crate::protocol::{Header, Message, MsgType};
use crate::status::Status;
use crate::url::Url;

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default time to wait for a heartbeat response.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default consecutive failures before reconnecting.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMode {
    /// Beat when the transport reports read-idle.
    Idle,
    /// Beat on a fixed, jittered schedule.
    Timing,
}

impl HeartbeatMode {
    /// Parse `idle`/`timing`, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("idle") {
            Some(HeartbeatMode::Idle)
        } else if value.eq_ignore_ascii_case("timing") {
            Some(HeartbeatMode::Timing)
        } else {
            None
        }
    }
}

/// How a pooled channel keeps its connection alive.
#[derive(Debug, Clone)]
pub struct HeartbeatStrategy {
    pub mode: HeartbeatMode,
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
}

impl Default for HeartbeatStrategy {
    fn default() -> Self {
        Self {
            mode: HeartbeatMode::Timing,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl HeartbeatStrategy {
    pub fn with_mode(mut self, mode: HeartbeatMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Strategy from `heartbeatMode`/`heartbeatInterval` (ms) url parameters.
    pub fn from_url(url: &Url) -> Self {
        let mut strategy = Self::default();
        if let Some(mode) = url.param(keys::HEARTBEAT_MODE).and_then(HeartbeatMode::parse) {
            strategy.mode = mode;
        }
        let interval = url.get_u64(keys::HEARTBEAT_INTERVAL, 0);
        if interval > 0 {
            strategy.interval = Duration::from_millis(interval);
        }
        strategy
    }

    /// Random delay before the first timed beat.
    pub fn initial_delay(&self) -> Duration {
        let max = self.interval.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=max))
    }
}

fn heartbeat_message() -> Message {
    Message::empty(Header::new(MsgType::HbReq, 0))
}

/// Start heartbeating `shared` according to its strategy.
pub(super) fn start(shared: &Arc<SharedChannel>) {
    let Some(strategy) = shared.heartbeat.clone() else {
        return;
    };
    let epoch = shared.epoch.load(Ordering::Acquire);

    match strategy.mode {
        HeartbeatMode::Idle => {
            let Some(channel) = shared.current() else {
                return;
            };
            let weak = Arc::downgrade(shared);
            channel.set_idle_trigger(
                strategy.interval,
                Arc::new(move || {
                    let weak = weak.clone();
                    tokio::spawn(async move {
                        if let Some(shared) = weak.upgrade() {
                            beat(&shared).await;
                        }
                    });
                }),
            );
        }
        HeartbeatMode::Timing => {
            tokio::spawn(timing_loop(Arc::downgrade(shared), strategy, epoch));
        }
    }
}

async fn timing_loop(weak: Weak<SharedChannel>, strategy: HeartbeatStrategy, epoch: u64) {
    tokio::time::sleep(strategy.initial_delay()).await;
    loop {
        {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            // A reconnect or close starts a new epoch; this loop belongs to the old one.
            if shared.status.get() != Status::Opened
                || shared.epoch.load(Ordering::Acquire) != epoch
            {
                return;
            }
            beat(&shared).await;
        }
        tokio::time::sleep(strategy.interval).await;
    }
}

/// Send one heartbeat and account for the outcome.
pub(super) async fn beat(shared: &Arc<SharedChannel>) {
    let (Some(strategy), Some(channel)) = (shared.heartbeat.as_ref(), shared.current()) else {
        return;
    };
    if shared.status.get() != Status::Opened {
        return;
    }

    match channel.request(heartbeat_message(), strategy.timeout).await {
        Ok(_) => {
            shared.heartbeat_fails.store(0, Ordering::Release);
        }
        Err(e) => {
            let failures = shared.heartbeat_fails.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::warn!(
                "Heartbeat to {} failed ({} in a row): {}",
                shared.key,
                failures,
                e
            );
            shared.events.publish(ChannelEvent::HeartbeatFailed {
                address: shared.key.clone(),
                failures,
            });
            if failures >= strategy.failure_threshold {
                shared.heartbeat_fails.store(0, Ordering::Release);
                shared.reconnect().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = HeartbeatStrategy::default();
        assert_eq!(s.mode, HeartbeatMode::Timing);
        assert_eq!(s.interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(s.failure_threshold, 3);
    }

    #[test]
    fn test_from_url() {
        let url = Url::new("joy", Some("h"), 1, "svc")
            .with_param(keys::HEARTBEAT_MODE, "IDLE")
            .with_param(keys::HEARTBEAT_INTERVAL, 1500);
        let s = HeartbeatStrategy::from_url(&url);
        assert_eq!(s.mode, HeartbeatMode::Idle);
        assert_eq!(s.interval, Duration::from_millis(1500));
        assert_eq!(HeartbeatMode::parse("bogus"), None);
    }

    #[test]
    fn test_initial_delay_within_interval() {
        let s = HeartbeatStrategy::default().with_interval(Duration::from_millis(50));
        for _ in 0..100 {
            assert!(s.initial_delay() <= Duration::from_millis(50));
        }
        let zero = HeartbeatStrategy::default().with_interval(Duration::ZERO);
        assert_eq!(zero.initial_delay(), Duration::ZERO);
    }
}
