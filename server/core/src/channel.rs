//! The per-channel broker actor (spec §4.1). A single task owns all state
//! for one channel; every verb arrives as a message on its mailbox and is
//! processed to completion before the next is read, giving the total-order
//! guarantee spec §5 requires without a general-purpose lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use vp_control::{
    AuditRecord, ChannelDescriptor, ChannelId, CoreError, CoreResult, Coordinates, NetworkQuality,
    ParticipantId, SessionId, TransmissionMeta, UserId,
};

use crate::audit::AuditSink;
use crate::chunk_buffer::AcceptOutcome;
use crate::clock::{generate_session_id, Clock};
use crate::constants::BrokerConfig;
use crate::metrics::BrokerMetrics;
use crate::participants::{JoinOutcome, ParticipantRegistry};
use crate::subscribers::{OverflowPolicy, SubscriberHandle, SubscriberRegistry};
use crate::transmission::{EndReason, Transmission};
use crate::wire::{
    ActiveTransmissionView, ChannelStateData, ParticipantView, ReplayChunk, ServerEvent,
};

/// Result of a successful Join.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinResult {
    pub participant_count: usize,
    pub current_transmitter: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeaveResult {
    pub participant_count: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxStartResult {
    pub session_id: SessionId,
    pub max_duration_ms: u64,
    pub chunk_size_limit_bytes: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxChunkResult {
    pub chunk_received: bool,
    pub next_expected_sequence: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxEndResult {
    pub total_duration_ms: u64,
    pub chunks_received: u64,
    pub total_bytes: u64,
    pub participants_notified: usize,
    pub missing_chunks: u64,
    pub packet_loss_rate: f64,
}

#[derive(Clone, Debug)]
pub struct StatusResult {
    pub active_transmission: Option<TransmissionMeta>,
    pub connected_participants: usize,
    pub dropped_audio_frames: u64,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
pub struct ProbeSnapshot {
    pub participant_count: usize,
    pub has_transmission: bool,
    pub idle_for: Duration,
}

type Reply<T> = oneshot::Sender<CoreResult<T>>;

enum Command {
    Join {
        participant_id: ParticipantId,
        user_id: UserId,
        display_name: String,
        coordinates: Option<Coordinates>,
        device_info: Option<String>,
        reply: Reply<JoinResult>,
    },
    Leave {
        participant_id: ParticipantId,
        reply: Reply<LeaveResult>,
    },
    Disconnect {
        participant_id: ParticipantId,
    },
    Heartbeat {
        participant_id: ParticipantId,
    },
    TxStart {
        participant_id: ParticipantId,
        user_id: UserId,
        display_name: String,
        audio_format: String,
        sample_rate: u32,
        bitrate: u32,
        network_quality: String,
        coordinates: Option<Coordinates>,
        is_emergency: bool,
        reply: Reply<TxStartResult>,
    },
    TxChunk {
        session_id: SessionId,
        sequence: u64,
        payload: bytes::Bytes,
        client_timestamp_ms: i64,
        size_bytes: usize,
        reply: Reply<TxChunkResult>,
    },
    TxEnd {
        session_id: SessionId,
        total_duration_ms: u64,
        final_coordinates: Option<Coordinates>,
        reply: Reply<TxEndResult>,
    },
    Status {
        reply: Reply<StatusResult>,
    },
    Subscribe {
        participant_id: ParticipantId,
        reply: Reply<SubscriberHandle>,
    },
    Probe {
        reply: Reply<ProbeSnapshot>,
    },
    Shutdown,
}

/// A cheap, cloneable reference to a running `ChannelBroker` task.
#[derive(Clone)]
pub struct ChannelHandle {
    pub channel_id: ChannelId,
    tx: mpsc::Sender<Command>,
    subscriber_mirror: Arc<DashMap<ParticipantId, SubscriberHandle>>,
}

impl ChannelHandle {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> CoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = build(reply_tx);
        self.tx
            .send(cmd)
            .await
            .map_err(|_| CoreError::ServerShutdown)?;
        reply_rx.await.map_err(|_| CoreError::ServerShutdown)?
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn join(
        &self,
        participant_id: ParticipantId,
        user_id: UserId,
        display_name: String,
        coordinates: Option<Coordinates>,
        device_info: Option<String>,
    ) -> CoreResult<JoinResult> {
        self.call(|reply| Command::Join {
            participant_id,
            user_id,
            display_name,
            coordinates,
            device_info,
            reply,
        })
        .await
    }

    pub async fn leave(&self, participant_id: ParticipantId) -> CoreResult<LeaveResult> {
        self.call(|reply| Command::Leave {
            participant_id,
            reply,
        })
        .await
    }

    /// Transport-level disconnect: best-effort, fire-and-forget. A full
    /// mailbox drops the notification; the presence sweeper (§4.4) still
    /// catches it within PRESENCE_TIMEOUT.
    pub fn disconnect(&self, participant_id: ParticipantId) {
        let _ = self.tx.try_send(Command::Disconnect { participant_id });
    }

    /// Inbound `heartbeat` frame from a subscriber connection (spec §6, §4.4):
    /// refreshes last-seen without otherwise touching broker state. Best-effort,
    /// like `disconnect`; the presence sweeper is the backstop.
    pub fn heartbeat(&self, participant_id: ParticipantId) {
        let _ = self.tx.try_send(Command::Heartbeat { participant_id });
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn tx_start(
        &self,
        participant_id: ParticipantId,
        user_id: UserId,
        display_name: String,
        audio_format: String,
        sample_rate: u32,
        bitrate: u32,
        network_quality: String,
        coordinates: Option<Coordinates>,
        is_emergency: bool,
    ) -> CoreResult<TxStartResult> {
        self.call(|reply| Command::TxStart {
            participant_id,
            user_id,
            display_name,
            audio_format,
            sample_rate,
            bitrate,
            network_quality,
            coordinates,
            is_emergency,
            reply,
        })
        .await
    }

    pub async fn tx_chunk(
        &self,
        session_id: SessionId,
        sequence: u64,
        payload: bytes::Bytes,
        client_timestamp_ms: i64,
        size_bytes: usize,
    ) -> CoreResult<TxChunkResult> {
        self.call(|reply| Command::TxChunk {
            session_id,
            sequence,
            payload,
            client_timestamp_ms,
            size_bytes,
            reply,
        })
        .await
    }

    pub async fn tx_end(
        &self,
        session_id: SessionId,
        total_duration_ms: u64,
        final_coordinates: Option<Coordinates>,
    ) -> CoreResult<TxEndResult> {
        self.call(|reply| Command::TxEnd {
            session_id,
            total_duration_ms,
            final_coordinates,
            reply,
        })
        .await
    }

    pub async fn status(&self) -> CoreResult<StatusResult> {
        self.call(|reply| Command::Status { reply }).await
    }

    pub async fn subscribe(&self, participant_id: ParticipantId) -> CoreResult<SubscriberHandle> {
        self.call(|reply| Command::Subscribe {
            participant_id,
            reply,
        })
        .await
    }

    pub async fn probe(&self) -> CoreResult<ProbeSnapshot> {
        self.call(|reply| Command::Probe { reply }).await
    }

    pub fn shutdown(&self) {
        let _ = self.tx.try_send(Command::Shutdown);
    }

    /// Subscriber handles mirrored outside the actor's own state, so a
    /// supervisor can broadcast `server_reset` even after the actor task
    /// itself has died (§4.1 Broker panic, §4.5 Supervision).
    pub fn subscriber_mirror(&self) -> Arc<DashMap<ParticipantId, SubscriberHandle>> {
        self.subscriber_mirror.clone()
    }
}

/// The actor. Not `Clone`; only reachable through its `ChannelHandle`.
pub struct ChannelBroker {
    channel_id: ChannelId,
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<dyn BrokerMetrics>,
    participants: ParticipantRegistry,
    subscribers: SubscriberRegistry,
    subscriber_mirror: Arc<DashMap<ParticipantId, SubscriberHandle>>,
    transmission: Option<Transmission>,
    last_activity: Instant,
    mailbox: mpsc::Receiver<Command>,
}

impl ChannelBroker {
    /// Spawn the actor task plus a lightweight supervisor that removes the
    /// dead entry from `registry` and notifies any leftover subscribers
    /// with `server_reset`, whether the task ended by panic or by a clean
    /// `Shutdown` (spec §4.1, §4.5).
    pub fn spawn(
        descriptor: ChannelDescriptor,
        config: BrokerConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<dyn BrokerMetrics>,
        registry: Arc<DashMap<ChannelId, ChannelHandle>>,
    ) -> ChannelHandle {
        let (tx, rx) = mpsc::channel(256);
        let subscriber_mirror = Arc::new(DashMap::new());
        let channel_id = descriptor.id;
        let capacity = descriptor.capacity;
        let subscriber_queue_depth = config.subscriber_queue_depth;

        let handle = ChannelHandle {
            channel_id,
            tx,
            subscriber_mirror: subscriber_mirror.clone(),
        };

        let broker = ChannelBroker {
            channel_id,
            config,
            clock: clock.clone(),
            audit,
            metrics: metrics.clone(),
            participants: ParticipantRegistry::new(capacity),
            subscribers: SubscriberRegistry::new(subscriber_queue_depth, OverflowPolicy::DropOldest),
            subscriber_mirror: subscriber_mirror.clone(),
            transmission: None,
            last_activity: clock.now(),
            mailbox: rx,
        };

        let run_handle = tokio::spawn(broker.run());
        tokio::spawn(async move {
            let outcome = run_handle.await;
            if let Err(err) = &outcome {
                warn!(%channel_id, panic = %err, "channel broker task ended abnormally");
            } else {
                debug!(%channel_id, "channel broker task ended");
            }
            registry.remove(&channel_id);
            metrics.set_broker_count(registry.len());
            let reset_ts = Utc::now().timestamp_millis();
            for entry in subscriber_mirror.iter() {
                entry.value().enqueue(ServerEvent::ServerReset {
                    channel_id,
                    timestamp_ms: reset_ts,
                });
                entry.value().close();
            }
            subscriber_mirror.clear();
        });

        handle
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe_cmd = self.mailbox.recv() => {
                    match maybe_cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                _ = ticker.tick() => {
                    self.on_tick();
                }
            }
        }
        if self.transmission.is_some() {
            self.force_end(EndReason::ServerShutdown);
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Join {
                participant_id,
                user_id,
                display_name,
                coordinates,
                device_info,
                reply,
            } => {
                self.metrics.record_verb_call("join");
                let result = self.join(participant_id, user_id, display_name, coordinates, device_info);
                if let Err(err) = &result {
                    self.metrics.record_verb_rejected("join", err.kind());
                }
                let _ = reply.send(result);
            }
            Command::Leave {
                participant_id,
                reply,
            } => {
                self.metrics.record_verb_call("leave");
                let result = self.leave(participant_id);
                if let Err(err) = &result {
                    self.metrics.record_verb_rejected("leave", err.kind());
                }
                let _ = reply.send(result);
            }
            Command::Disconnect { participant_id } => {
                let _ = self.leave(participant_id);
            }
            Command::Heartbeat { participant_id } => {
                let now = self.clock.utc_now();
                self.participants.touch(participant_id, now);
            }
            Command::TxStart {
                participant_id,
                user_id,
                display_name,
                audio_format,
                sample_rate,
                bitrate,
                network_quality,
                coordinates,
                is_emergency,
                reply,
            } => {
                self.metrics.record_verb_call("tx_start");
                let result = self.tx_start(
                    participant_id,
                    user_id,
                    display_name,
                    audio_format,
                    sample_rate,
                    bitrate,
                    network_quality,
                    coordinates,
                    is_emergency,
                );
                if let Err(err) = &result {
                    self.metrics.record_verb_rejected("tx_start", err.kind());
                }
                let _ = reply.send(result);
            }
            Command::TxChunk {
                session_id,
                sequence,
                payload,
                client_timestamp_ms,
                size_bytes,
                reply,
            } => {
                self.metrics.record_verb_call("tx_chunk");
                let result = self.tx_chunk(session_id, sequence, payload, client_timestamp_ms, size_bytes);
                if let Err(err) = &result {
                    self.metrics.record_verb_rejected("tx_chunk", err.kind());
                }
                let _ = reply.send(result);
            }
            Command::TxEnd {
                session_id,
                total_duration_ms,
                final_coordinates,
                reply,
            } => {
                self.metrics.record_verb_call("tx_end");
                let result = self.tx_end(session_id, total_duration_ms, final_coordinates);
                if let Err(err) = &result {
                    self.metrics.record_verb_rejected("tx_end", err.kind());
                }
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
            Command::Subscribe {
                participant_id,
                reply,
            } => {
                self.metrics.record_verb_call("subscribe");
                let result = self.subscribe(participant_id);
                if let Err(err) = &result {
                    self.metrics.record_verb_rejected("subscribe", err.kind());
                }
                let _ = reply.send(result);
            }
            Command::Probe { reply } => {
                let _ = reply.send(Ok(ProbeSnapshot {
                    participant_count: self.participants.len(),
                    has_transmission: self.transmission.is_some(),
                    idle_for: self.clock.now().saturating_duration_since(self.last_activity),
                }));
            }
            Command::Shutdown => unreachable!("handled in run()'s select loop"),
        }
    }

    fn touch_activity(&mut self) {
        self.last_activity = self.clock.now();
    }

    fn broadcast(&mut self, event: ServerEvent, exclude: Option<ParticipantId>) {
        let (audio_drops, control_drops) = self.subscribers.broadcast(event, exclude);
        for _ in 0..audio_drops {
            self.metrics.record_subscriber_drop(true);
        }
        for _ in 0..control_drops {
            self.metrics.record_subscriber_drop(false);
        }
        self.metrics.record_fanout(self.channel_id, self.subscribers.len());
    }

    fn join(
        &mut self,
        participant_id: ParticipantId,
        user_id: UserId,
        display_name: String,
        coordinates: Option<Coordinates>,
        device_info: Option<String>,
    ) -> CoreResult<JoinResult> {
        let now = self.clock.utc_now();
        let outcome = self.participants.join(
            participant_id,
            user_id,
            display_name.clone(),
            coordinates,
            device_info,
            now,
        )?;
        self.touch_activity();
        if matches!(outcome, JoinOutcome::Joined) {
            self.broadcast(
                ServerEvent::ParticipantJoin {
                    channel_id: self.channel_id,
                    timestamp_ms: now.timestamp_millis(),
                    participant: ParticipantView {
                        user_id,
                        display_name,
                        coordinates,
                    },
                },
                Some(participant_id),
            );
        }
        let current_transmitter = self
            .transmission
            .as_ref()
            .map(|t| t.transmitter_display_name.clone());
        Ok(JoinResult {
            participant_count: self.participants.len(),
            current_transmitter,
        })
    }

    fn leave(&mut self, participant_id: ParticipantId) -> CoreResult<LeaveResult> {
        if !self.participants.contains(participant_id) {
            return Err(CoreError::NotPresent);
        }
        let is_transmitter = self
            .transmission
            .as_ref()
            .map(|t| t.transmitter_participant == participant_id)
            .unwrap_or(false);
        if is_transmitter {
            self.force_end(EndReason::TransmitterLeft);
        }
        let now = self.clock.utc_now();
        let participant = self.participants.leave(participant_id)?;
        self.subscribers.unregister(participant_id);
        self.subscriber_mirror.remove(&participant_id);
        self.touch_activity();
        self.broadcast(
            ServerEvent::ParticipantLeave {
                channel_id: self.channel_id,
                timestamp_ms: now.timestamp_millis(),
                user_id: participant.user_id,
            },
            None,
        );
        Ok(LeaveResult {
            participant_count: self.participants.len(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn tx_start(
        &mut self,
        participant_id: ParticipantId,
        user_id: UserId,
        display_name: String,
        audio_format: String,
        sample_rate: u32,
        bitrate: u32,
        network_quality: String,
        coordinates: Option<Coordinates>,
        is_emergency: bool,
    ) -> CoreResult<TxStartResult> {
        if !self.participants.contains(participant_id) {
            return Err(CoreError::NotPresent);
        }
        self.participants.touch(participant_id, self.clock.utc_now());
        if let Some(active) = &self.transmission {
            return Err(CoreError::Busy {
                current_transmitter: active.transmitter_display_name.clone(),
            });
        }
        if audio_format.trim().is_empty() {
            return Err(CoreError::Invalid("audio_format must not be empty"));
        }
        if sample_rate == 0 || bitrate == 0 {
            return Err(CoreError::Invalid("sample_rate and bitrate must be positive"));
        }

        let now_wall = self.clock.utc_now();
        let now_mono = self.clock.now();
        let session_id = generate_session_id(self.clock.as_ref());
        let quality = NetworkQuality::parse(&network_quality);
        let format = vp_control::AudioFormat {
            codec: audio_format,
            sample_rate,
            bitrate,
        };

        let tx = Transmission::new(
            session_id.clone(),
            participant_id,
            user_id,
            display_name.clone(),
            format,
            is_emergency,
            coordinates,
            quality,
            now_wall,
            now_mono,
            &self.config,
        );
        self.transmission = Some(tx);
        self.touch_activity();
        self.metrics.set_transmission_active(self.channel_id, true);

        self.broadcast(
            ServerEvent::TransmissionStarted {
                channel_id: self.channel_id,
                session_id: session_id.clone(),
                timestamp_ms: now_wall.timestamp_millis(),
                transmitter: ActiveTransmissionView {
                    session_id: session_id.clone(),
                    transmitter_user_id: user_id,
                    transmitter_display_name: display_name,
                    started_at: now_wall,
                    is_emergency,
                    network_quality,
                },
            },
            None,
        );

        Ok(TxStartResult {
            session_id,
            max_duration_ms: self.config.max_duration.as_millis() as u64,
            chunk_size_limit_bytes: self.config.max_chunk_size_bytes,
        })
    }

    fn tx_chunk(
        &mut self,
        session_id: SessionId,
        sequence: u64,
        payload: bytes::Bytes,
        client_timestamp_ms: i64,
        size_bytes: usize,
    ) -> CoreResult<TxChunkResult> {
        if size_bytes > self.config.max_chunk_size_bytes {
            return Err(CoreError::TooLarge);
        }
        let now_mono = self.clock.now();
        let outcome = {
            let tx = self.transmission.as_mut().ok_or(CoreError::NoSession)?;
            if tx.session_id != session_id {
                return Err(CoreError::NoSession);
            }
            tx.chunks.accept(sequence, payload.clone(), client_timestamp_ms, now_mono)
        };

        if let Some(tx) = &self.transmission {
            self.participants.touch(tx.transmitter_participant, self.clock.utc_now());
        }

        match outcome {
            AcceptOutcome::TooOld => {
                self.metrics.record_chunk_rejected("too_old");
                Err(CoreError::TooOld)
            }
            AcceptOutcome::Duplicate { next_expected } => {
                self.metrics.record_chunk_duplicate();
                Ok(TxChunkResult {
                    chunk_received: true,
                    next_expected_sequence: next_expected,
                })
            }
            AcceptOutcome::Accepted { next_expected } => {
                if let Some(tx) = self.transmission.as_mut() {
                    tx.record_chunk(payload.len(), now_mono);
                }
                self.metrics.record_chunk_accepted();
                self.touch_activity();
                let now_wall = self.clock.utc_now();
                self.broadcast(
                    ServerEvent::AudioChunk {
                        channel_id: self.channel_id,
                        session_id,
                        timestamp_ms: now_wall.timestamp_millis(),
                        sequence,
                        audio_data: payload.to_vec(),
                        size_bytes,
                    },
                    None,
                );
                Ok(TxChunkResult {
                    chunk_received: true,
                    next_expected_sequence: next_expected,
                })
            }
        }
    }

    fn tx_end(
        &mut self,
        session_id: SessionId,
        total_duration_ms: u64,
        final_coordinates: Option<Coordinates>,
    ) -> CoreResult<TxEndResult> {
        {
            let tx = self.transmission.as_ref().ok_or(CoreError::NoSession)?;
            if tx.session_id != session_id {
                return Err(CoreError::NoSession);
            }
        }
        if let Some(coords) = final_coordinates {
            if let Some(tx) = self.transmission.as_mut() {
                tx.coordinates = Some(coords);
            }
        }
        if let Some(tx) = &self.transmission {
            self.participants.touch(tx.transmitter_participant, self.clock.utc_now());
        }
        Ok(self.end_transmission(EndReason::Normal, Some(total_duration_ms)))
    }

    fn status(&self) -> StatusResult {
        let now_wall = self.clock.utc_now();
        let active_transmission = self.transmission.as_ref().map(|t| TransmissionMeta {
            session_id: t.session_id.clone(),
            transmitter: t.transmitter_user_id,
            transmitter_display_name: t.transmitter_display_name.clone(),
            started_at: t.started_at_wall,
            format: t.format.clone(),
            is_emergency: t.is_emergency,
            coordinates: t.coordinates,
            network_quality: t.network_quality.clone(),
        });
        StatusResult {
            active_transmission,
            connected_participants: self.participants.len(),
            dropped_audio_frames: self.subscribers.total_dropped_audio(),
            timestamp: now_wall,
        }
    }

    fn subscribe(&mut self, participant_id: ParticipantId) -> CoreResult<SubscriberHandle> {
        if !self.participants.contains(participant_id) {
            return Err(CoreError::NotPresent);
        }
        self.participants.touch(participant_id, self.clock.utc_now());
        let handle = self.subscribers.register(participant_id);
        self.subscriber_mirror.insert(participant_id, handle.clone());
        self.touch_activity();

        let now_mono = self.clock.now();
        let now_wall = self.clock.utc_now();
        let replay_chunks = self
            .transmission
            .as_ref()
            .map(|t| t.chunks.replay_snapshot(now_mono))
            .unwrap_or_default()
            .into_iter()
            .map(|(sequence, entry)| ReplayChunk {
                sequence,
                size_bytes: entry.payload.len(),
                audio_data: entry.payload.to_vec(),
            })
            .collect();
        let active_transmission = self.transmission.as_ref().map(|t| ActiveTransmissionView {
            session_id: t.session_id.clone(),
            transmitter_user_id: t.transmitter_user_id,
            transmitter_display_name: t.transmitter_display_name.clone(),
            started_at: t.started_at_wall,
            is_emergency: t.is_emergency,
            network_quality: format!("{:?}", t.network_quality).to_lowercase(),
        });
        let participants = self
            .participants
            .iter()
            .map(|(_, p)| ParticipantView {
                user_id: p.user_id,
                display_name: p.display_name.clone(),
                coordinates: p.coordinates,
            })
            .collect();

        handle.enqueue(ServerEvent::ChannelState {
            channel_id: self.channel_id,
            timestamp_ms: now_wall.timestamp_millis(),
            data: ChannelStateData {
                participants,
                active_transmission,
                replay_chunks,
            },
        });

        Ok(handle)
    }

    /// Tear down the active Transmission (if any), write its audit record,
    /// and notify subscribers. Shared by `tx_end` and every force-end path.
    fn end_transmission(&mut self, reason: EndReason, claimed_duration_ms: Option<u64>) -> TxEndResult {
        let now_mono = self.clock.now();
        let now_wall = self.clock.utc_now();
        let tx = self
            .transmission
            .take()
            .expect("end_transmission called without an active transmission");

        let elapsed_ms = tx.elapsed(now_mono).as_millis() as u64;
        let duration_ms = claimed_duration_ms.unwrap_or(elapsed_ms);
        let chunks_received = tx.chunks.chunks_accepted();
        let missing_chunks = tx.chunks.missing_chunks();
        let packet_loss_rate = tx.chunks.packet_loss_rate();
        let participants_notified = self.subscribers.len();

        self.broadcast(
            ServerEvent::TransmissionEnded {
                channel_id: self.channel_id,
                session_id: tx.session_id.clone(),
                timestamp_ms: now_wall.timestamp_millis(),
                duration_ms,
                total_chunks: chunks_received,
                total_bytes: tx.total_bytes,
                reason: reason.as_str().map(str::to_string),
            },
            None,
        );

        let record = AuditRecord {
            session_id: tx.session_id.clone(),
            channel_id: self.channel_id,
            user_id: tx.transmitter_user_id,
            username: tx.transmitter_display_name.clone(),
            start_time: tx.started_at_wall,
            end_time: now_wall,
            duration_seconds: (duration_ms / 1000) as i64,
            audio_format: tx.format.codec.clone(),
            chunks_count: chunks_received as i64,
            total_bytes: tx.total_bytes as i64,
            participant_count: self.participants.len() as i64,
            is_emergency: tx.is_emergency,
            network_quality: format!("{:?}", tx.network_quality).to_lowercase(),
            location_lat: tx.coordinates.map(|c| c.lat),
            location_lon: tx.coordinates.map(|c| c.lon),
            missing_chunks: missing_chunks as i64,
            packet_loss_rate,
        };
        self.audit.write(record);
        self.metrics.set_transmission_active(self.channel_id, false);
        self.touch_activity();

        if let Some(reason) = reason.as_str() {
            info!(channel_id = %self.channel_id, session_id = %tx.session_id, reason, "transmission force-ended");
        }

        TxEndResult {
            total_duration_ms: duration_ms,
            chunks_received,
            total_bytes: tx.total_bytes,
            participants_notified,
            missing_chunks,
            packet_loss_rate,
        }
    }

    fn force_end(&mut self, reason: EndReason) {
        if self.transmission.is_some() {
            let _ = self.end_transmission(reason, None);
        }
    }

    fn on_tick(&mut self) {
        let now_mono = self.clock.now();
        let now_wall = self.clock.utc_now();

        if let Some(tx) = &self.transmission {
            if tx.elapsed(now_mono) >= self.config.max_duration {
                self.force_end(EndReason::DurationExceeded);
            } else if tx.idle_for(now_mono) >= self.config.idle_timeout {
                self.force_end(EndReason::IdleTimeout);
            }
        }
        if let Some(tx) = self.transmission.as_mut() {
            tx.chunks.sweep_expired(now_mono);
        }

        let presence_timeout = chrono::Duration::from_std(self.config.presence_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let threshold = now_wall - presence_timeout;
        let stale = self.participants.stale_before(threshold);
        for participant_id in stale {
            let is_transmitter = self
                .transmission
                .as_ref()
                .map(|t| t.transmitter_participant == participant_id)
                .unwrap_or(false);
            if is_transmitter {
                self.force_end(EndReason::TransmitterLeft);
            }
            if let Ok(participant) = self.participants.leave(participant_id) {
                self.subscribers.unregister(participant_id);
                self.subscriber_mirror.remove(&participant_id);
                self.broadcast(
                    ServerEvent::ParticipantLeave {
                        channel_id: self.channel_id,
                        timestamp_ms: now_wall.timestamp_millis(),
                        user_id: participant.user_id,
                    },
                    None,
                );
            }
        }
    }
}

#[cfg(test)]
mod broker_tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::clock::SystemClock;
    use crate::metrics::NoopMetrics;
    use vp_control::ChannelDescriptor;

    fn descriptor(capacity: usize) -> ChannelDescriptor {
        ChannelDescriptor {
            id: ChannelId::new(),
            display_name: "Ridge Launch".into(),
            capacity,
            created_at: Utc::now(),
        }
    }

    fn spawn_broker(config: BrokerConfig, capacity: usize) -> (ChannelHandle, Arc<RecordingAuditSink>) {
        let audit = Arc::new(RecordingAuditSink::new());
        let registry = Arc::new(DashMap::new());
        let handle = ChannelBroker::spawn(
            descriptor(capacity),
            config,
            Arc::new(SystemClock),
            audit.clone(),
            Arc::new(NoopMetrics),
            registry,
        );
        (handle, audit)
    }

    // S1: capacity is enforced and never evicts existing participants.
    #[tokio::test]
    async fn s1_capacity_rejects_once_full() {
        let (handle, _audit) = spawn_broker(BrokerConfig::default(), 2);
        let p1 = ParticipantId::new();
        let p2 = ParticipantId::new();
        let p3 = ParticipantId::new();

        let r1 = handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        assert_eq!(r1.participant_count, 1);
        let r2 = handle.join(p2, UserId::new(), "B".into(), None, None).await.unwrap();
        assert_eq!(r2.participant_count, 2);
        let err = handle
            .join(p3, UserId::new(), "C".into(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::ChannelFull);
    }

    // S2: single-speaker invariant; the losing caller learns who's talking.
    #[tokio::test]
    async fn s2_busy_carries_current_transmitter_name() {
        let (handle, _audit) = spawn_broker(BrokerConfig::default(), 2);
        let p1 = ParticipantId::new();
        let p2 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        handle.join(p2, UserId::new(), "B".into(), None, None).await.unwrap();

        handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();

        let err = handle
            .tx_start(p2, UserId::new(), "B".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap_err();
        match err {
            CoreError::Busy { current_transmitter } => assert_eq!(current_transmitter, "A"),
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    // S3: gap held, filled, expected advances past the contiguous run.
    #[tokio::test]
    async fn s3_sequence_with_loss_then_fill() {
        let (handle, _audit) = spawn_broker(BrokerConfig::default(), 2);
        let p1 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        let start = handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();

        let r1 = handle
            .tx_chunk(start.session_id.clone(), 1, bytes::Bytes::from_static(b"a"), 0, 1)
            .await
            .unwrap();
        assert_eq!(r1.next_expected_sequence, 2);

        let r3 = handle
            .tx_chunk(start.session_id.clone(), 3, bytes::Bytes::from_static(b"c"), 0, 1)
            .await
            .unwrap();
        assert_eq!(r3.next_expected_sequence, 2);

        let r2 = handle
            .tx_chunk(start.session_id.clone(), 2, bytes::Bytes::from_static(b"b"), 0, 1)
            .await
            .unwrap();
        assert_eq!(r2.next_expected_sequence, 4);

        let summary = handle.tx_end(start.session_id, 500, None).await.unwrap();
        assert_eq!(summary.chunks_received, 3);
        assert_eq!(summary.missing_chunks, 0);
    }

    // S4: oversized chunk is rejected without mutating totals or broadcasting.
    #[tokio::test]
    async fn s4_oversized_chunk_rejected() {
        let (handle, _audit) = spawn_broker(BrokerConfig::default(), 2);
        let p1 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        let start = handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();

        let oversized = vec![0u8; 65_537];
        let err = handle
            .tx_chunk(start.session_id.clone(), 1, bytes::Bytes::from(oversized), 0, 65_537)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::TooLarge);

        let summary = handle.tx_end(start.session_id, 0, None).await.unwrap();
        assert_eq!(summary.total_bytes, 0);
        assert_eq!(summary.chunks_received, 0);
    }

    // R1: TxStart -> TxEnd with no chunks still yields a zeroed summary and
    // (implicitly) an audit record.
    #[tokio::test]
    async fn r1_start_end_without_chunks() {
        let (handle, audit) = spawn_broker(BrokerConfig::default(), 2);
        let p1 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        let start = handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();
        let summary = handle.tx_end(start.session_id, 0, None).await.unwrap();
        assert_eq!(summary.chunks_received, 0);
        assert_eq!(summary.total_bytes, 0);
        assert_eq!(audit.records().len(), 1);
    }

    // R2: the chunk-size boundary is inclusive at MAX_CHUNK_SIZE.
    #[tokio::test]
    async fn r2_max_chunk_size_boundary() {
        let (handle, _audit) = spawn_broker(BrokerConfig::default(), 2);
        let p1 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        let start = handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();

        let exact = bytes::Bytes::from(vec![0u8; 64 * 1024]);
        let ok = handle
            .tx_chunk(start.session_id.clone(), 1, exact, 0, 64 * 1024)
            .await
            .unwrap();
        assert!(ok.chunk_received);

        let over = bytes::Bytes::from(vec![0u8; 64 * 1024 + 1]);
        let err = handle
            .tx_chunk(start.session_id, 2, over, 0, 64 * 1024 + 1)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::TooLarge);
    }

    // P4: replaying the same (session, sequence) never double-counts bytes
    // or moves `next_expected_sequence` downward.
    #[tokio::test]
    async fn p4_duplicate_tx_chunk_is_idempotent() {
        let (handle, _audit) = spawn_broker(BrokerConfig::default(), 2);
        let p1 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        let start = handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();

        let payload = bytes::Bytes::from_static(b"hello");
        handle
            .tx_chunk(start.session_id.clone(), 1, payload.clone(), 0, payload.len())
            .await
            .unwrap();
        let dup = handle
            .tx_chunk(start.session_id.clone(), 1, payload.clone(), 0, payload.len())
            .await
            .unwrap();
        assert!(dup.chunk_received);
        assert_eq!(dup.next_expected_sequence, 2);

        let summary = handle.tx_end(start.session_id, 0, None).await.unwrap();
        assert_eq!(summary.total_bytes, payload.len() as u64);
        assert_eq!(summary.chunks_received, 1);
    }

    // S6 / P5: a late joiner gets channel_state with the replay buffer in
    // sequence order, then subsequent chunks normally.
    #[tokio::test]
    async fn s6_late_joiner_gets_replay_then_live_chunks() {
        let (handle, _audit) = spawn_broker(BrokerConfig::default(), 3);
        let p1 = ParticipantId::new();
        let p2 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        let start = handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();
        for seq in 1..=3 {
            handle
                .tx_chunk(start.session_id.clone(), seq, bytes::Bytes::from_static(b"x"), 0, 1)
                .await
                .unwrap();
        }

        handle.join(p2, UserId::new(), "B".into(), None, None).await.unwrap();
        let sub = handle.subscribe(p2).await.unwrap();
        let first = sub.recv().await.expect("channel_state frame");
        match first {
            ServerEvent::ChannelState { data, .. } => {
                let sequences: Vec<u64> = data.replay_chunks.iter().map(|c| c.sequence).collect();
                assert_eq!(sequences, vec![1, 2, 3]);
                assert!(data.active_transmission.is_some());
            }
            other => panic!("expected ChannelState, got {other:?}"),
        }

        handle
            .tx_chunk(start.session_id.clone(), 4, bytes::Bytes::from_static(b"y"), 0, 1)
            .await
            .unwrap();
        let live = sub.recv().await.expect("live audio_chunk frame");
        match live {
            ServerEvent::AudioChunk { sequence, .. } => assert_eq!(sequence, 4),
            other => panic!("expected AudioChunk, got {other:?}"),
        }
    }

    // Leave while transmitting forces the transmission to end first, then
    // removes the participant (spec §4.1 Leave).
    #[tokio::test]
    async fn leave_force_ends_active_transmission() {
        let (handle, audit) = spawn_broker(BrokerConfig::default(), 2);
        let p1 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();

        let status_before = handle.status().await.unwrap();
        assert!(status_before.active_transmission.is_some());

        handle.leave(p1).await.unwrap();

        let status_after = handle.status().await.unwrap();
        assert!(status_after.active_transmission.is_none());
        assert_eq!(audit.records().len(), 1);
    }

    // P1: single-speaker invariant holds across a sequence of verbs.
    #[tokio::test]
    async fn p1_single_speaker_invariant() {
        let (handle, _audit) = spawn_broker(BrokerConfig::default(), 3);
        let p1 = ParticipantId::new();
        let p2 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        handle.join(p2, UserId::new(), "B".into(), None, None).await.unwrap();

        let start = handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();
        assert!(handle
            .tx_start(p2, UserId::new(), "B".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .is_err());
        handle.tx_end(start.session_id, 0, None).await.unwrap();

        // Now p2 can start; still at most one active transmission at a time.
        let started = handle
            .tx_start(p2, UserId::new(), "B".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await;
        assert!(started.is_ok());
    }

    // Force-end by duration (S5): the idle/duration watchdog tears down a
    // forgotten transmission and writes an audit record with a reason tag.
    #[tokio::test(start_paused = true)]
    async fn s5_force_end_by_duration() {
        let mut config = BrokerConfig::default();
        config.max_duration = Duration::from_millis(50);
        config.idle_timeout = Duration::from_secs(60);
        config.sweep_interval = Duration::from_millis(10);
        let (handle, audit) = spawn_broker(config, 2);

        let p1 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        // Give the actor's select loop a chance to observe the tick.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let status = handle.status().await.unwrap();
        assert!(status.active_transmission.is_none());
        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].duration_seconds >= 0);
    }

    // Idle watchdog: a transmitter that stops sending chunks is force-ended
    // after IDLE_TIMEOUT even if MAX_DURATION hasn't elapsed.
    #[tokio::test(start_paused = true)]
    async fn idle_transmitter_is_force_ended() {
        let mut config = BrokerConfig::default();
        config.max_duration = Duration::from_secs(60);
        config.idle_timeout = Duration::from_millis(50);
        config.sweep_interval = Duration::from_millis(10);
        let (handle, _audit) = spawn_broker(config, 2);

        let p1 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let status = handle.status().await.unwrap();
        assert!(status.active_transmission.is_none());
    }

    // Heartbeat refreshes last-seen without otherwise disturbing state.
    #[tokio::test]
    async fn heartbeat_does_not_error_or_mutate_count() {
        let (handle, _audit) = spawn_broker(BrokerConfig::default(), 2);
        let p1 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        handle.heartbeat(p1);
        tokio::task::yield_now().await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.connected_participants, 1);
    }

    // §4.2: a subscriber slow enough to overflow its outbound queue shows up
    // in Status's dropped_audio_frames total.
    #[tokio::test]
    async fn slow_subscriber_drops_are_exposed_in_status() {
        let mut config = BrokerConfig::default();
        config.subscriber_queue_depth = 2;
        let (handle, _audit) = spawn_broker(config, 2);
        let p1 = ParticipantId::new();
        let p2 = ParticipantId::new();
        handle.join(p1, UserId::new(), "A".into(), None, None).await.unwrap();
        handle.join(p2, UserId::new(), "B".into(), None, None).await.unwrap();
        let _sub = handle.subscribe(p2).await.unwrap();

        let start = handle
            .tx_start(p1, UserId::new(), "A".into(), "opus".into(), 48_000, 32_000, "good".into(), None, false)
            .await
            .unwrap();
        for seq in 1..=10 {
            handle
                .tx_chunk(start.session_id.clone(), seq, bytes::Bytes::from_static(b"x"), 0, 1)
                .await
                .unwrap();
        }

        let status = handle.status().await.unwrap();
        assert!(status.dropped_audio_frames > 0);
    }
}
