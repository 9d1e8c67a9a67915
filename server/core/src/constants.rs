use std::time::Duration;

/// Tunable broker constants. Defaults match spec.md's stated defaults;
/// `server/gateway` exposes them as CLI/env overrides.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Hard cap on a single audio chunk's payload size.
    pub max_chunk_size_bytes: usize,
    /// How far behind `expected` a sequence may fall before being rejected
    /// as `TooOld` rather than accepted as a stray duplicate.
    pub max_lag: u32,
    /// How far TxChunk looks ahead in the buffer to advance `expected`
    /// past a contiguous run.
    pub lookahead_window: u32,
    /// How long an accepted chunk stays available for late-joiner replay.
    pub replay_window: Duration,
    /// Hard memory cap per transmission's chunk buffer.
    pub replay_memory_cap_bytes: usize,
    /// Force-end a Transmission after this much time regardless of activity.
    pub max_duration: Duration,
    /// Force-end a Transmission if no chunk arrives within this window.
    pub idle_timeout: Duration,
    /// Remove a participant whose last-seen exceeds this.
    pub presence_timeout: Duration,
    /// Tear down an idle broker (no participants, no transmission) after this.
    pub dehydrate_idle: Duration,
    /// Depth of each subscriber's bounded outbound queue.
    pub subscriber_queue_depth: usize,
    /// Granularity of the chunk-buffer expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size_bytes: 64 * 1024,
            max_lag: 10,
            lookahead_window: 50,
            replay_window: Duration::from_secs(5),
            replay_memory_cap_bytes: 4 * 1024 * 1024,
            max_duration: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(3),
            presence_timeout: Duration::from_secs(5 * 60),
            dehydrate_idle: Duration::from_secs(10 * 60),
            subscriber_queue_depth: 256,
            sweep_interval: Duration::from_millis(500),
        }
    }
}
