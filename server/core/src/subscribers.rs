use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use vp_control::ParticipantId;

use crate::wire::ServerEvent;

/// What happens when a handle's outbound queue is full (§4.2).
#[derive(Clone, Copy, Debug)]
pub enum OverflowPolicy {
    /// Drop the oldest queued frame to make room (voice continuity
    /// preference; the default).
    DropOldest,
    /// Drop the incoming frame instead, closing the handle after this many
    /// consecutive drops.
    DropNewest { max_consecutive_drops: u32 },
}

struct Inner {
    queue: Mutex<VecDeque<ServerEvent>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped_audio: AtomicU64,
    dropped_control: AtomicU64,
    consecutive_drops: AtomicU32,
    closed: AtomicBool,
}

/// A connected listener's delivery handle (§3 SubscriberHandle). Cheap to
/// clone; the broker holds one copy, the transport layer another.
#[derive(Clone)]
pub struct SubscriberHandle {
    pub participant_id: ParticipantId,
    pub epoch: u64,
    inner: Arc<Inner>,
}

impl SubscriberHandle {
    fn new(
        participant_id: ParticipantId,
        epoch: u64,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Self {
        Self {
            participant_id,
            epoch,
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
                notify: Notify::new(),
                capacity,
                policy,
                dropped_audio: AtomicU64::new(0),
                dropped_control: AtomicU64::new(0),
                consecutive_drops: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a frame. Never blocks or awaits; applies the overflow policy
    /// synchronously and returns immediately so the broker's hot path is
    /// never stalled by a slow subscriber (§5). Returns whether this call
    /// dropped a frame and, if so, whether it was an `audio_chunk`.
    pub fn enqueue(&self, event: ServerEvent) -> Option<bool> {
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }
        let is_audio = matches!(event, ServerEvent::AudioChunk { .. });
        let mut dropped = None;
        {
            let mut q = self.inner.queue.lock();
            if q.len() >= self.inner.capacity {
                match self.inner.policy {
                    OverflowPolicy::DropOldest => {
                        q.pop_front();
                        self.count_drop(is_audio);
                        q.push_back(event);
                        self.inner.consecutive_drops.store(0, Ordering::Relaxed);
                        dropped = Some(is_audio);
                    }
                    OverflowPolicy::DropNewest {
                        max_consecutive_drops,
                    } => {
                        self.count_drop(is_audio);
                        let n = self.inner.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                        if n >= max_consecutive_drops {
                            self.inner.closed.store(true, Ordering::Release);
                        }
                        dropped = Some(is_audio);
                    }
                }
            } else {
                q.push_back(event);
                self.inner.consecutive_drops.store(0, Ordering::Relaxed);
            }
        }
        self.inner.notify.notify_waiters();
        dropped
    }

    fn count_drop(&self, is_audio: bool) {
        if is_audio {
            self.inner.dropped_audio.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.dropped_control.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pull the next queued frame, waiting if the queue is empty. The core
    /// never calls this; it is the contract with the transport-layer write
    /// loop that actually pushes bytes to the socket.
    pub async fn recv(&self) -> Option<ServerEvent> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut q = self.inner.queue.lock();
                if let Some(event) = q.pop_front() {
                    return Some(event);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn dropped_audio(&self) -> u64 {
        self.inner.dropped_audio.load(Ordering::Relaxed)
    }

    pub fn dropped_control(&self) -> u64 {
        self.inner.dropped_control.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

/// The set of live delivery handles for one channel (§4.2).
pub struct SubscriberRegistry {
    handles: HashMap<ParticipantId, SubscriberHandle>,
    capacity: usize,
    policy: OverflowPolicy,
    next_epoch: u64,
}

impl SubscriberRegistry {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            handles: HashMap::new(),
            capacity,
            policy,
            next_epoch: 0,
        }
    }

    pub fn register(&mut self, participant_id: ParticipantId) -> SubscriberHandle {
        self.next_epoch += 1;
        let handle = SubscriberHandle::new(participant_id, self.next_epoch, self.capacity, self.policy);
        self.handles.insert(participant_id, handle.clone());
        handle
    }

    pub fn unregister(&mut self, participant_id: ParticipantId) -> Option<SubscriberHandle> {
        self.handles.remove(&participant_id)
    }

    /// Enqueue `event` to every registered handle except `exclude`, then
    /// drop any handle the overflow policy closed during this pass. Returns
    /// the number of (audio, control) frame drops this broadcast caused,
    /// for the caller to report to metrics (§4.2).
    pub fn broadcast(&mut self, event: ServerEvent, exclude: Option<ParticipantId>) -> (usize, usize) {
        let mut stale = Vec::new();
        let mut audio_drops = 0;
        let mut control_drops = 0;
        for (participant_id, handle) in self.handles.iter() {
            if Some(*participant_id) == exclude {
                continue;
            }
            match handle.enqueue(event.clone()) {
                Some(true) => audio_drops += 1,
                Some(false) => control_drops += 1,
                None => {}
            }
            if handle.is_closed() {
                stale.push(*participant_id);
            }
        }
        for participant_id in stale {
            self.handles.remove(&participant_id);
        }
        (audio_drops, control_drops)
    }

    /// Total `dropped_audio` across every currently-registered handle, for
    /// Status (spec §4.2 "per-handle 'dropped_audio' counter exposed in
    /// Status").
    pub fn total_dropped_audio(&self) -> u64 {
        self.handles.values().map(|h| h.dropped_audio()).sum()
    }

    pub fn total_dropped_control(&self) -> u64 {
        self.handles.values().map(|h| h.dropped_control()).sum()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, participant_id: ParticipantId) -> Option<&SubscriberHandle> {
        self.handles.get(&participant_id)
    }

    pub fn close_all(&mut self) {
        for handle in self.handles.values() {
            handle.close();
        }
        self.handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_frame(sequence: u64) -> ServerEvent {
        ServerEvent::AudioChunk {
            channel_id: vp_control::ChannelId::new(),
            session_id: vp_control::SessionId("s".into()),
            timestamp_ms: 0,
            sequence,
            audio_data: Vec::new(),
            size_bytes: 0,
        }
    }

    #[test]
    fn drop_oldest_keeps_capacity_and_counts_drops() {
        let handle = SubscriberHandle::new(ParticipantId::new(), 1, 2, OverflowPolicy::DropOldest);
        handle.enqueue(audio_frame(1));
        handle.enqueue(audio_frame(2));
        handle.enqueue(audio_frame(3));
        assert_eq!(handle.queue_len(), 2);
        assert_eq!(handle.dropped_audio(), 1);
    }

    #[test]
    fn drop_newest_closes_after_k_consecutive_drops() {
        let handle = SubscriberHandle::new(
            ParticipantId::new(),
            1,
            1,
            OverflowPolicy::DropNewest {
                max_consecutive_drops: 2,
            },
        );
        handle.enqueue(audio_frame(1));
        assert!(!handle.is_closed());
        handle.enqueue(audio_frame(2));
        assert!(!handle.is_closed());
        handle.enqueue(audio_frame(3));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn broadcast_excludes_joining_handle() {
        let mut registry = SubscriberRegistry::new(8, OverflowPolicy::DropOldest);
        let a = registry.register(ParticipantId::new());
        let b_id = ParticipantId::new();
        let b = registry.register(b_id);
        registry.broadcast(audio_frame(1), Some(b_id));
        assert_eq!(a.recv().await.map(|_| ()), Some(()));
        assert_eq!(b.queue_len(), 0);
    }
}
