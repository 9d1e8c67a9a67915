use std::time::Duration;

use clap::Parser;

/// CLI/env configuration for the gateway binary (spec §6 transports, §9
/// tunables). Every constant spec.md states a default for is overridable
/// here; `broker_config` turns the flat CLI surface into the `BrokerConfig`
/// the dispatcher actually wants.
#[derive(Parser, Debug, Clone)]
#[command(name = "vp-gateway", about = "PTT voice broker gateway")]
pub struct Config {
    /// Listen address for the one-shot verb endpoint (Join/Leave/TxStart/
    /// TxChunk/TxEnd/Status).
    #[arg(long, env = "VP_VERB_LISTEN", default_value = "0.0.0.0:7420")]
    pub verb_listen: String,

    /// Listen address for the framed streaming Subscribe endpoint.
    #[arg(long, env = "VP_STREAM_LISTEN", default_value = "0.0.0.0:7421")]
    pub stream_listen: String,

    /// Prometheus scrape endpoint.
    #[arg(long, env = "VP_METRICS_LISTEN", default_value = "0.0.0.0:9420")]
    pub metrics_listen: String,

    /// Postgres connection string for the audit sink (and, outside dev
    /// mode, the channel directory).
    #[arg(long, env = "VP_DATABASE_URL")]
    pub database_url: String,

    /// Dev mode seeds an in-memory `StaticChannelDirectory` with one fixed
    /// channel instead of resolving channels from Postgres. The
    /// administrative collaborator that owns real channel CRUD is out of
    /// scope for this crate (spec §1).
    #[arg(long, env = "VP_DEV_MODE", default_value_t = false)]
    pub dev_mode: bool,

    #[arg(long, env = "VP_DEV_CHANNEL_ID")]
    pub dev_channel_id: Option<uuid::Uuid>,

    #[arg(long, env = "VP_DEV_CHANNEL_NAME", default_value = "Ridge Launch")]
    pub dev_channel_name: String,

    #[arg(long, env = "VP_DEV_CHANNEL_CAPACITY", default_value_t = 32)]
    pub dev_channel_capacity: usize,

    #[arg(long, default_value_t = 30)]
    pub max_duration_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub idle_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub max_lag: u32,

    #[arg(long, default_value_t = 50)]
    pub lookahead_window: u32,

    #[arg(long, default_value_t = 5)]
    pub replay_window_secs: u64,

    #[arg(long, default_value_t = 65_536)]
    pub max_chunk_size_bytes: usize,

    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    pub replay_memory_cap_bytes: usize,

    #[arg(long, default_value_t = 300)]
    pub presence_timeout_secs: u64,

    #[arg(long, default_value_t = 600)]
    pub dehydrate_idle_secs: u64,

    #[arg(long, default_value_t = 256)]
    pub subscriber_queue_depth: usize,

    #[arg(long, default_value_t = 500)]
    pub sweep_interval_ms: u64,

    /// Bounded in-process queue depth for the audit sink (spec §4.6).
    #[arg(long, default_value_t = 1024)]
    pub audit_queue_capacity: usize,
}

impl Config {
    pub fn broker_config(&self) -> vp_core::BrokerConfig {
        vp_core::BrokerConfig {
            max_chunk_size_bytes: self.max_chunk_size_bytes,
            max_lag: self.max_lag,
            lookahead_window: self.lookahead_window,
            replay_window: Duration::from_secs(self.replay_window_secs),
            replay_memory_cap_bytes: self.replay_memory_cap_bytes,
            max_duration: Duration::from_secs(self.max_duration_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            presence_timeout: Duration::from_secs(self.presence_timeout_secs),
            dehydrate_idle: Duration::from_secs(self.dehydrate_idle_secs),
            subscriber_queue_depth: self.subscriber_queue_depth,
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }
}
