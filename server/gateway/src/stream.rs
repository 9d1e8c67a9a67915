//! The framed streaming transport (spec §6): a long-lived connection that
//! receives `ChannelState`/`ParticipantJoin`/.../`ServerReset` events after a
//! one-time `Subscribe` handshake, and may send back `ping`/`heartbeat`
//! client frames. Everything past the handshake is just draining a
//! `SubscriberHandle`; backpressure and overflow policy live entirely in
//! `vp_core::subscribers`.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use vp_control::{ChannelId, ParticipantId};
use vp_core::wire::{ClientFrame, ServerEvent};
use vp_core::Dispatcher;

use crate::frame::{read_json_frame, write_json_frame};

#[derive(Deserialize)]
struct SubscribeHandshake {
    channel_id: ChannelId,
    participant_id: ParticipantId,
}

pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "stream endpoint listening");
    loop {
        let (socket, peer) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, dispatcher).await {
                debug!(%peer, error = %err, "stream connection ended");
            }
        });
    }
}

async fn handle_conn(mut socket: TcpStream, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let handshake: SubscribeHandshake = read_json_frame(&mut socket)
        .await
        .context("subscribe handshake")?;

    let channel = dispatcher
        .handle(handshake.channel_id)
        .await
        .context("resolving channel for subscribe")?;
    let sub = channel
        .subscribe(handshake.participant_id)
        .await
        .context("subscribe rejected")?;

    let channel_id = handshake.channel_id;
    let participant_id = handshake.participant_id;

    let (read_half, mut write_half) = socket.into_split();

    let inbound_channel = channel.clone();
    let inbound_sub = sub.clone();
    let mut read_half = read_half;
    let inbound = tokio::spawn(async move {
        loop {
            let frame: ClientFrame = match read_json_frame(&mut read_half).await {
                Ok(f) => f,
                Err(_) => {
                    inbound_channel.disconnect(participant_id);
                    return;
                }
            };
            match frame {
                ClientFrame::Heartbeat => inbound_channel.heartbeat(participant_id),
                ClientFrame::Ping => inbound_sub.enqueue(ServerEvent::Pong {
                    channel_id,
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                }),
            }
        }
    });

    let outbound = async {
        while let Some(event) = sub.recv().await {
            if write_json_frame(&mut write_half, &event).await.is_err() {
                break;
            }
        }
    };
    outbound.await;

    inbound.abort();
    channel.disconnect(participant_id);
    Ok(())
}
