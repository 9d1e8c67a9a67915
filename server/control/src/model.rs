use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, SessionId, UserId};

/// The Channel entity of the spec: owned by the administrative collaborator,
/// loaded or handed to a broker on first contact. The core never mutates it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    pub display_name: String,
    pub capacity: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Opaque to the core: carried for clients, never interpreted or validated
/// beyond non-emptiness/range checks at TxStart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudioFormat {
    pub codec: String,
    pub sample_rate: u32,
    pub bitrate: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkQuality {
    Good,
    Fair,
    Poor,
    Unknown,
}

impl NetworkQuality {
    pub fn parse(s: &str) -> Self {
        match s {
            "good" => Self::Good,
            "fair" => Self::Fair,
            "poor" => Self::Poor,
            _ => Self::Unknown,
        }
    }
}

/// Participant record (spec §3). Keyed externally by `ParticipantId`; this
/// struct holds everything but the delivery handle, which the subscriber
/// registry owns separately.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub coordinates: Option<Coordinates>,
    pub device_info: Option<String>,
}

/// Snapshot of a live Transmission, as returned by Status/TxStart and
/// embedded in the `channel_state` synthetic message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransmissionMeta {
    pub session_id: SessionId,
    pub transmitter: UserId,
    pub transmitter_display_name: String,
    pub started_at: DateTime<Utc>,
    pub format: AudioFormat,
    pub is_emergency: bool,
    pub coordinates: Option<Coordinates>,
    pub network_quality: NetworkQuality,
}

/// The durable row spec §6 describes. Immutable once written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub session_id: SessionId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub username: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: i64,
    pub audio_format: String,
    pub chunks_count: i64,
    pub total_bytes: i64,
    pub participant_count: i64,
    pub is_emergency: bool,
    pub network_quality: String,
    pub location_lat: Option<f64>,
    pub location_lon: Option<f64>,
    pub missing_chunks: i64,
    pub packet_loss_rate: f64,
}
