use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use vp_control::{AudioFormat, Coordinates, NetworkQuality, ParticipantId, SessionId, UserId};

use crate::chunk_buffer::ChunkBuffer;
use crate::constants::BrokerConfig;

/// Why a Transmission ended. Carried into the `transmission_ended` event's
/// `reason` and the audit record (spec §4.1, §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    Normal,
    DurationExceeded,
    IdleTimeout,
    TransmitterLeft,
    ServerShutdown,
}

impl EndReason {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            EndReason::Normal => None,
            EndReason::DurationExceeded => Some("duration_exceeded"),
            EndReason::IdleTimeout => Some("idle_timeout"),
            EndReason::TransmitterLeft => Some("transmitter_left"),
            EndReason::ServerShutdown => Some("server_shutdown"),
        }
    }
}

/// The live Transmission object (spec §3). At most one exists per broker;
/// owned by `ChannelBroker`'s `Option<Transmission>`.
pub struct Transmission {
    pub session_id: SessionId,
    pub transmitter_participant: ParticipantId,
    pub transmitter_user_id: UserId,
    pub transmitter_display_name: String,
    pub started_at_wall: DateTime<Utc>,
    started_at_mono: Instant,
    pub format: AudioFormat,
    pub is_emergency: bool,
    pub coordinates: Option<Coordinates>,
    pub network_quality: NetworkQuality,
    pub total_bytes: u64,
    pub chunks: ChunkBuffer,
    last_chunk_at: Instant,
}

impl Transmission {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        transmitter_participant: ParticipantId,
        transmitter_user_id: UserId,
        transmitter_display_name: String,
        format: AudioFormat,
        is_emergency: bool,
        coordinates: Option<Coordinates>,
        network_quality: NetworkQuality,
        now_wall: DateTime<Utc>,
        now_mono: Instant,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            session_id,
            transmitter_participant,
            transmitter_user_id,
            transmitter_display_name,
            started_at_wall: now_wall,
            started_at_mono: now_mono,
            format,
            is_emergency,
            coordinates,
            network_quality,
            total_bytes: 0,
            chunks: ChunkBuffer::new(config, 1),
            last_chunk_at: now_mono,
        }
    }

    pub fn record_chunk(&mut self, len: usize, now: Instant) {
        self.total_bytes += len as u64;
        self.last_chunk_at = now;
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at_mono)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_chunk_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(config: &BrokerConfig, now: Instant) -> Transmission {
        Transmission::new(
            SessionId("s".into()),
            ParticipantId::new(),
            UserId::new(),
            "pilot".into(),
            AudioFormat {
                codec: "opus".into(),
                sample_rate: 48_000,
                bitrate: 32_000,
            },
            false,
            None,
            NetworkQuality::Good,
            Utc::now(),
            now,
            config,
        )
    }

    #[test]
    fn tracks_elapsed_and_idle_time() {
        let config = BrokerConfig::default();
        let t0 = Instant::now();
        let mut tx = sample(&config, t0);
        let t1 = t0 + Duration::from_secs(2);
        tx.record_chunk(100, t1);
        assert_eq!(tx.total_bytes, 100);
        let t2 = t1 + Duration::from_secs(1);
        assert_eq!(tx.elapsed(t2), Duration::from_secs(3));
        assert_eq!(tx.idle_for(t2), Duration::from_secs(1));
    }
}
