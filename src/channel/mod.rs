//! Pooled, reference-counted client channels with heartbeats.

mod heartbeat;
mod pool;

pub use heartbeat::{
    HeartbeatMode, HeartbeatStrategy, DEFAULT_FAILURE_THRESHOLD, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_HEARTBEAT_TIMEOUT,
};
pub use pool::{ChannelEvent, ChannelPool, PoolConfig, PooledChannel, DEFAULT_DRAIN_INTERVAL};
