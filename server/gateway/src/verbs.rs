//! The one-shot request/response transport (spec §6): Join, Leave, TxStart,
//! TxChunk, TxEnd, Status. Each connection is a sequence of independent
//! request/response frames; the core's verbs are plain async methods on
//! `ChannelHandle`, so this module is pure marshalling.

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use vp_control::{ChannelId, CoreError};
use vp_core::wire::{
    ErrorBody, JoinRequest, JoinResponse, LeaveRequest, LeaveResponse, StatusOk, StatusResponse,
    TxChunkRequest, TxChunkResponse, TxEndRequest, TxEndResponse, TxStartRequest, TxStartResponse,
};
use vp_core::Dispatcher;

use crate::frame::{read_json_frame, write_json_frame};

/// Every request frame on the verb connection names its channel and verb
/// explicitly; `body` is one of the typed `*Request` structs in
/// `vp_core::wire`, left as a `Value` here so the outer envelope can be
/// parsed before the verb-specific shape is known.
#[derive(Deserialize)]
struct VerbEnvelope {
    channel_id: ChannelId,
    verb: String,
    #[serde(default)]
    body: serde_json::Value,
}

pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "verb endpoint listening");
    loop {
        let (socket, peer) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, dispatcher).await {
                debug!(%peer, error = %err, "verb connection ended");
            }
        });
    }
}

async fn handle_conn(mut socket: TcpStream, dispatcher: Arc<Dispatcher>) -> Result<()> {
    loop {
        let envelope: VerbEnvelope = match read_json_frame(&mut socket).await {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        let response = dispatch(&dispatcher, envelope).await;
        write_json_frame(&mut socket, &response).await?;
    }
}

async fn dispatch(dispatcher: &Arc<Dispatcher>, envelope: VerbEnvelope) -> serde_json::Value {
    let channel = match dispatcher.handle(envelope.channel_id).await {
        Ok(handle) => handle,
        Err(err) => return error_value(&err),
    };

    let body = envelope.body;
    match envelope.verb.as_str() {
        "join" => {
            let req: JoinRequest = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(_) => return invalid_body("join"),
            };
            let result = channel
                .join(
                    req.participant_id,
                    req.user_id,
                    req.username,
                    req.location,
                    req.device_info,
                )
                .await;
            match result {
                Ok(r) => serde_json::to_value(JoinResponse::Ok(vp_core::wire::JoinOk {
                    success: true,
                    participant_count: r.participant_count,
                    current_transmitter: r.current_transmitter,
                }))
                .unwrap(),
                Err(err) => {
                    warn!(channel_id = %envelope.channel_id, verb = "join", error = %err, "verb rejected");
                    error_value(&err)
                }
            }
        }
        "leave" => {
            let req: LeaveRequest = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(_) => return invalid_body("leave"),
            };
            match channel.leave(req.participant_id).await {
                Ok(r) => serde_json::to_value(LeaveResponse::Ok(vp_core::wire::LeaveOk {
                    success: true,
                    participant_count: r.participant_count,
                }))
                .unwrap(),
                Err(err) => error_value(&err),
            }
        }
        "tx_start" => {
            let req: TxStartRequest = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(_) => return invalid_body("tx_start"),
            };
            let result = channel
                .tx_start(
                    req.participant_id,
                    req.user_id,
                    req.username,
                    req.audio_format,
                    req.sample_rate,
                    req.bitrate,
                    req.network_quality,
                    req.location,
                    req.is_emergency,
                )
                .await;
            match result {
                Ok(r) => serde_json::to_value(TxStartResponse::Ok(vp_core::wire::TxStartOk {
                    success: true,
                    session_id: r.session_id,
                    max_duration_ms: r.max_duration_ms,
                    chunk_size_limit_bytes: r.chunk_size_limit_bytes,
                }))
                .unwrap(),
                Err(err) => {
                    warn!(channel_id = %envelope.channel_id, verb = "tx_start", error = %err, "verb rejected");
                    error_value(&err)
                }
            }
        }
        "tx_chunk" => {
            let req: TxChunkRequest = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(_) => return invalid_body("tx_chunk"),
            };
            let payload = bytes::Bytes::from(req.audio_data);
            let result = channel
                .tx_chunk(
                    req.session_id,
                    req.chunk_sequence,
                    payload,
                    req.timestamp_ms,
                    req.chunk_size_bytes,
                )
                .await;
            match result {
                Ok(r) => serde_json::to_value(TxChunkResponse::Ok(vp_core::wire::TxChunkOk {
                    success: true,
                    chunk_received: r.chunk_received,
                    next_expected_sequence: r.next_expected_sequence,
                }))
                .unwrap(),
                Err(err) => error_value(&err),
            }
        }
        "tx_end" => {
            let req: TxEndRequest = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(_) => return invalid_body("tx_end"),
            };
            let result = channel
                .tx_end(req.session_id, req.total_duration_ms, req.final_location)
                .await;
            match result {
                Ok(r) => serde_json::to_value(TxEndResponse::Ok(vp_core::wire::TxEndOk {
                    success: true,
                    session_summary: vp_core::wire::SessionSummary {
                        total_duration_ms: r.total_duration_ms,
                        chunks_received: r.chunks_received,
                        total_bytes: r.total_bytes,
                        participants_notified: r.participants_notified,
                        missing_chunks: r.missing_chunks,
                        packet_loss_rate: r.packet_loss_rate,
                    },
                }))
                .unwrap(),
                Err(err) => error_value(&err),
            }
        }
        "status" => match channel.status().await {
            Ok(s) => serde_json::to_value(StatusResponse::Ok(StatusOk {
                success: true,
                active_transmission: s.active_transmission.map(|t| vp_core::wire::ActiveTransmissionView {
                    session_id: t.session_id,
                    transmitter_user_id: t.transmitter,
                    transmitter_display_name: t.transmitter_display_name,
                    started_at: t.started_at,
                    is_emergency: t.is_emergency,
                    network_quality: format!("{:?}", t.network_quality).to_lowercase(),
                }),
                connected_participants: s.connected_participants,
                dropped_audio_frames: s.dropped_audio_frames,
                timestamp: s.timestamp,
            }))
            .unwrap(),
            Err(err) => error_value(&err),
        },
        other => invalid_body(other),
    }
}

fn error_value(err: &CoreError) -> serde_json::Value {
    serde_json::to_value(ErrorBody::from_core_error(err)).expect("ErrorBody always serializes")
}

fn invalid_body(verb: &str) -> serde_json::Value {
    serde_json::to_value(ErrorBody {
        success: false,
        error: "invalid".to_string(),
        message: format!("malformed or unknown body for verb {verb}"),
    })
    .expect("ErrorBody always serializes")
}
