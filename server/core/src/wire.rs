//! Illustrative JSON request/response and streaming-event DTOs (spec §6).
//! Pure data: no I/O, no framing. `server/gateway` owns turning these into
//! bytes on a socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vp_control::{ChannelId, Coordinates, NetworkQuality, ParticipantId, SessionId, UserId};

fn default_true() -> bool {
    true
}

/// Shared failure shape for every one-shot verb response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub success: bool,
    /// Stable, machine-parseable kind (`CoreError::kind()`).
    pub error: String,
    /// Human-readable detail, not parsed by clients.
    pub message: String,
}

impl ErrorBody {
    pub fn from_core_error(err: &vp_control::CoreError) -> Self {
        Self {
            success: false,
            error: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

// ---- Join ----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub channel_id: ChannelId,
    pub participant_id: ParticipantId,
    pub user_id: UserId,
    pub username: String,
    pub location: Option<Coordinates>,
    pub device_info: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinOk {
    #[serde(default = "default_true")]
    pub success: bool,
    pub participant_count: usize,
    pub current_transmitter: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinResponse {
    Ok(JoinOk),
    Err(ErrorBody),
}

// ---- Leave ----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub participant_id: ParticipantId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveOk {
    #[serde(default = "default_true")]
    pub success: bool,
    pub participant_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LeaveResponse {
    Ok(LeaveOk),
    Err(ErrorBody),
}

// ---- TxStart ----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxStartRequest {
    pub participant_id: ParticipantId,
    pub user_id: UserId,
    pub username: String,
    pub audio_format: String,
    pub sample_rate: u32,
    pub bitrate: u32,
    pub network_quality: String,
    pub location: Option<Coordinates>,
    #[serde(default)]
    pub is_emergency: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxStartOk {
    #[serde(default = "default_true")]
    pub success: bool,
    pub session_id: SessionId,
    pub max_duration_ms: u64,
    pub chunk_size_limit_bytes: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TxStartResponse {
    Ok(TxStartOk),
    Err(ErrorBody),
}

// ---- TxChunk ----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxChunkRequest {
    pub session_id: SessionId,
    pub chunk_sequence: u64,
    /// Opaque payload; the gateway decides whether to carry it as a JSON
    /// byte array or base-N text, per spec's "illustrative" wire note.
    pub audio_data: Vec<u8>,
    pub timestamp_ms: i64,
    pub chunk_size_bytes: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxChunkOk {
    #[serde(default = "default_true")]
    pub success: bool,
    pub chunk_received: bool,
    pub next_expected_sequence: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TxChunkResponse {
    Ok(TxChunkOk),
    Err(ErrorBody),
}

// ---- TxEnd ----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxEndRequest {
    pub session_id: SessionId,
    pub total_duration_ms: u64,
    pub final_location: Option<Coordinates>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total_duration_ms: u64,
    pub chunks_received: u64,
    pub total_bytes: u64,
    pub participants_notified: usize,
    pub missing_chunks: u64,
    pub packet_loss_rate: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxEndOk {
    #[serde(default = "default_true")]
    pub success: bool,
    pub session_summary: SessionSummary,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TxEndResponse {
    Ok(TxEndOk),
    Err(ErrorBody),
}

// ---- Status ----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActiveTransmissionView {
    pub session_id: SessionId,
    pub transmitter_user_id: UserId,
    pub transmitter_display_name: String,
    pub started_at: DateTime<Utc>,
    pub is_emergency: bool,
    pub network_quality: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusOk {
    #[serde(default = "default_true")]
    pub success: bool,
    pub active_transmission: Option<ActiveTransmissionView>,
    pub connected_participants: usize,
    pub dropped_audio_frames: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusResponse {
    Ok(StatusOk),
    Err(ErrorBody),
}

// ---- Subscribe ----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub participant_id: ParticipantId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantView {
    pub user_id: UserId,
    pub display_name: String,
    pub coordinates: Option<Coordinates>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelStateData {
    pub participants: Vec<ParticipantView>,
    pub active_transmission: Option<ActiveTransmissionView>,
    pub replay_chunks: Vec<ReplayChunk>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayChunk {
    pub sequence: u64,
    pub audio_data: Vec<u8>,
    pub size_bytes: usize,
}

/// The streaming-channel event envelope (spec §6): `type` is the serde tag,
/// `channel_id`/`timestamp_ms` are common to every variant, `session_id` is
/// present only on transmission-scoped events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ChannelState {
        channel_id: ChannelId,
        timestamp_ms: i64,
        data: ChannelStateData,
    },
    ParticipantJoin {
        channel_id: ChannelId,
        timestamp_ms: i64,
        participant: ParticipantView,
    },
    ParticipantLeave {
        channel_id: ChannelId,
        timestamp_ms: i64,
        user_id: UserId,
    },
    TransmissionStarted {
        channel_id: ChannelId,
        session_id: SessionId,
        timestamp_ms: i64,
        transmitter: ActiveTransmissionView,
    },
    AudioChunk {
        channel_id: ChannelId,
        session_id: SessionId,
        timestamp_ms: i64,
        sequence: u64,
        audio_data: Vec<u8>,
        size_bytes: usize,
    },
    TransmissionEnded {
        channel_id: ChannelId,
        session_id: SessionId,
        timestamp_ms: i64,
        duration_ms: u64,
        total_chunks: u64,
        total_bytes: u64,
        reason: Option<String>,
    },
    Error {
        channel_id: ChannelId,
        timestamp_ms: i64,
        error: String,
        message: String,
    },
    Pong {
        channel_id: ChannelId,
        timestamp_ms: i64,
    },
    ServerReset {
        channel_id: ChannelId,
        timestamp_ms: i64,
    },
}

/// Inbound subscriber frames (spec §6): everything else is rejected by the
/// transport before it ever reaches the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Heartbeat,
}

/// `Status()` with no transport framing opinion; used by the in-process
/// channel broker API and reused verbatim by the gateway's JSON handler.
pub type NetworkQualityTag = NetworkQuality;
