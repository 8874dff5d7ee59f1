use std::time::Duration;

use crate::heartbeat::HeartbeatConfig;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_KEEP_ALIVE_THRESHOLD: Duration = Duration::from_secs(20);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_ATTACHMENT_BUDGET_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_MODEL_ID: &str = "default";
pub const DEFAULT_SIDE_CHANNEL_TOOL: &str = "browser";
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Knobs for every relayed turn.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub heartbeat_interval: Duration,
    /// Idle time after which the heartbeat writes a keep-alive.
    pub keep_alive_threshold: Duration,
    pub poll_interval: Duration,
    pub attachment_budget_bytes: usize,
    /// Model used when neither the request nor the user's config names one.
    pub default_model_id: String,
    pub caching_enabled: bool,
    /// Tool whose presence in `enabled_tools` arms the side channel.
    pub side_channel_tool: String,
    /// Frames buffered between the relay tasks and the response body.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            keep_alive_threshold: DEFAULT_KEEP_ALIVE_THRESHOLD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            attachment_budget_bytes: DEFAULT_ATTACHMENT_BUDGET_BYTES,
            default_model_id: DEFAULT_MODEL_ID.to_string(),
            caching_enabled: true,
            side_channel_tool: DEFAULT_SIDE_CHANNEL_TOOL.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl RelayConfig {
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: self.heartbeat_interval,
            threshold: self.keep_alive_threshold,
        }
    }
}
