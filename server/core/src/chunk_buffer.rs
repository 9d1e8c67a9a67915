use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::constants::BrokerConfig;

/// One accepted audio chunk, held for late-joiner replay.
#[derive(Clone, Debug)]
pub struct ChunkEntry {
    pub payload: Bytes,
    pub client_timestamp_ms: i64,
    pub received_at: Instant,
    pub expires_at: Instant,
}

/// Result of offering a sequence to the buffer. `Accepted` and `Duplicate`
/// both mean `chunk_received = true` on the wire; only `TooOld` is a
/// rejection (see spec §4.1 TxChunk, R3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted { next_expected: u64 },
    Duplicate { next_expected: u64 },
    TooOld,
}

/// Sequence-indexed, time-bounded store of in-flight chunks for one
/// Transmission. Implements spec §4.1's TxChunk ordering policy and §4.3's
/// replay/expiry/memory-cap rules.
pub struct ChunkBuffer {
    entries: BTreeMap<u64, ChunkEntry>,
    start_sequence: u64,
    expected: u64,
    memory_bytes: usize,
    memory_cap_bytes: usize,
    max_lag: u64,
    lookahead_window: u64,
    replay_window: Duration,
    chunks_accepted: u64,
    duplicates: u64,
    max_sequence_seen: Option<u64>,
}

impl ChunkBuffer {
    /// `start_sequence` is the first sequence number the transmitter will
    /// use; spec's scenarios (S3) number chunks from 1.
    pub fn new(config: &BrokerConfig, start_sequence: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            start_sequence,
            expected: start_sequence,
            memory_bytes: 0,
            memory_cap_bytes: config.replay_memory_cap_bytes,
            max_lag: config.max_lag as u64,
            lookahead_window: config.lookahead_window as u64,
            replay_window: config.replay_window,
            chunks_accepted: 0,
            duplicates: 0,
            max_sequence_seen: None,
        }
    }

    pub fn accept(
        &mut self,
        sequence: u64,
        payload: Bytes,
        client_timestamp_ms: i64,
        now: Instant,
    ) -> AcceptOutcome {
        self.max_sequence_seen = Some(match self.max_sequence_seen {
            Some(max) => max.max(sequence),
            None => sequence,
        });

        if sequence < self.expected {
            if sequence + self.max_lag < self.expected {
                return AcceptOutcome::TooOld;
            }
            self.duplicates += 1;
            return AcceptOutcome::Duplicate {
                next_expected: self.expected,
            };
        }

        if self.entries.contains_key(&sequence) {
            self.duplicates += 1;
            return AcceptOutcome::Duplicate {
                next_expected: self.expected,
            };
        }

        let len = payload.len();
        let expires_at = now + self.replay_window;
        self.entries.insert(
            sequence,
            ChunkEntry {
                payload,
                client_timestamp_ms,
                received_at: now,
                expires_at,
            },
        );
        self.memory_bytes += len;
        self.chunks_accepted += 1;
        self.enforce_memory_cap();
        self.advance_expected();

        AcceptOutcome::Accepted {
            next_expected: self.expected,
        }
    }

    fn advance_expected(&mut self) {
        let mut advanced = 0u64;
        while advanced < self.lookahead_window && self.entries.contains_key(&self.expected) {
            self.expected += 1;
            advanced += 1;
        }
    }

    /// Evict oldest-received entries until under the hard memory cap, even
    /// if their expiration hasn't elapsed (§4.3 sizing).
    fn enforce_memory_cap(&mut self) {
        while self.memory_bytes > self.memory_cap_bytes {
            let oldest = match self.entries.iter().next() {
                Some((&seq, _)) => seq,
                None => break,
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.memory_bytes -= entry.payload.len();
            }
        }
    }

    /// Remove entries whose expiration has elapsed. Called on a periodic
    /// tick and on every TxChunk (§4.3).
    pub fn sweep_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in expired {
            if let Some(entry) = self.entries.remove(&seq) {
                self.memory_bytes -= entry.payload.len();
            }
        }
    }

    /// Live, non-expired entries in ascending sequence order, for a new
    /// subscriber's replay (§4.1 Subscribe, P5).
    pub fn replay_snapshot(&self, now: Instant) -> Vec<(u64, ChunkEntry)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(&seq, e)| (seq, e.clone()))
            .collect()
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn chunks_accepted(&self) -> u64 {
        self.chunks_accepted
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Gap between the highest sequence ever observed and the count of
    /// distinct sequences actually accepted; zero when nothing was lost.
    pub fn missing_chunks(&self) -> u64 {
        match self.max_sequence_seen {
            Some(max) => {
                let span = max + 1 - self.start_sequence;
                span.saturating_sub(self.chunks_accepted)
            }
            None => 0,
        }
    }

    pub fn packet_loss_rate(&self) -> f64 {
        let missing = self.missing_chunks();
        let total = missing + self.chunks_accepted;
        if total == 0 {
            0.0
        } else {
            missing as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf() -> ChunkBuffer {
        ChunkBuffer::new(&BrokerConfig::default(), 1)
    }

    #[test]
    fn sequence_with_loss_held_then_filled() {
        let mut b = buf();
        let now = Instant::now();
        assert_eq!(
            b.accept(1, Bytes::from_static(b"a"), 0, now),
            AcceptOutcome::Accepted { next_expected: 2 }
        );
        assert_eq!(
            b.accept(3, Bytes::from_static(b"c"), 0, now),
            AcceptOutcome::Accepted { next_expected: 2 }
        );
        assert_eq!(
            b.accept(2, Bytes::from_static(b"b"), 0, now),
            AcceptOutcome::Accepted { next_expected: 4 }
        );
        assert_eq!(b.chunks_accepted(), 3);
        assert_eq!(b.missing_chunks(), 0);
    }

    #[test]
    fn duplicate_does_not_move_expected_or_recount() {
        let mut b = buf();
        let now = Instant::now();
        b.accept(1, Bytes::from_static(b"a"), 0, now);
        let outcome = b.accept(1, Bytes::from_static(b"a"), 0, now);
        assert_eq!(outcome, AcceptOutcome::Duplicate { next_expected: 2 });
        assert_eq!(b.chunks_accepted(), 1);
    }

    #[test]
    fn rejects_sequence_older_than_max_lag() {
        let mut b = buf();
        let now = Instant::now();
        for seq in 1..=12 {
            b.accept(seq, Bytes::from_static(b"x"), 0, now);
        }
        // expected is now 13; max_lag default is 10.
        assert_eq!(b.accept(2, Bytes::from_static(b"x"), 0, now), AcceptOutcome::TooOld);
        assert_eq!(
            b.accept(3, Bytes::from_static(b"x"), 0, now),
            AcceptOutcome::Duplicate { next_expected: 13 }
        );
    }

    #[test]
    fn missing_chunks_reflects_real_gap() {
        let mut b = buf();
        let now = Instant::now();
        b.accept(1, Bytes::from_static(b"a"), 0, now);
        b.accept(2, Bytes::from_static(b"b"), 0, now);
        b.accept(5, Bytes::from_static(b"e"), 0, now);
        assert_eq!(b.chunks_accepted(), 3);
        assert_eq!(b.missing_chunks(), 2);
    }

    #[test]
    fn expired_entries_are_swept_and_excluded_from_replay() {
        let mut b = buf();
        let now = Instant::now();
        b.accept(1, Bytes::from_static(b"a"), 0, now);
        let later = now + Duration::from_secs(6);
        b.sweep_expired(later);
        assert!(b.replay_snapshot(later).is_empty());
    }
}
