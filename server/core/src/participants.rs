use std::collections::HashMap;

use chrono::{DateTime, Utc};
use vp_control::{CoreError, CoreResult, Coordinates, Participant, ParticipantId, UserId};

/// Map of participant-id → Participant record for one channel (§4.4).
/// Capacity-gated; reconnect semantics collapse a repeat Join into an
/// update rather than a rejection.
pub struct ParticipantRegistry {
    capacity: usize,
    entries: HashMap<ParticipantId, Participant>,
}

pub enum JoinOutcome {
    Joined,
    Reconnected,
}

impl ParticipantRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.entries.contains_key(&id)
    }

    /// §4.1 Join. A participant id already present is treated as a
    /// reconnect: last-seen and device info are refreshed, capacity is not
    /// re-checked, and the participant is not counted twice.
    #[allow(clippy::too_many_arguments)]
    pub fn join(
        &mut self,
        id: ParticipantId,
        user_id: UserId,
        display_name: String,
        coordinates: Option<Coordinates>,
        device_info: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<JoinOutcome> {
        if let Some(existing) = self.entries.get_mut(&id) {
            existing.last_seen = now;
            existing.display_name = display_name;
            if coordinates.is_some() {
                existing.coordinates = coordinates;
            }
            if device_info.is_some() {
                existing.device_info = device_info;
            }
            return Ok(JoinOutcome::Reconnected);
        }
        if self.entries.len() >= self.capacity {
            return Err(CoreError::ChannelFull);
        }
        self.entries.insert(
            id,
            Participant {
                user_id,
                display_name,
                joined_at: now,
                last_seen: now,
                coordinates,
                device_info,
            },
        );
        Ok(JoinOutcome::Joined)
    }

    pub fn leave(&mut self, id: ParticipantId) -> CoreResult<Participant> {
        self.entries.remove(&id).ok_or(CoreError::NotPresent)
    }

    pub fn touch(&mut self, id: ParticipantId, now: DateTime<Utc>) {
        if let Some(p) = self.entries.get_mut(&id) {
            p.last_seen = now;
        }
    }

    pub fn get(&self, id: ParticipantId) -> Option<&Participant> {
        self.entries.get(&id)
    }

    /// Participants whose last-seen predates `threshold`, for the presence
    /// sweeper (default PRESENCE_TIMEOUT = 5 min).
    pub fn stale_before(&self, threshold: DateTime<Utc>) -> Vec<ParticipantId> {
        self.entries
            .iter()
            .filter(|(_, p)| p.last_seen < threshold)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &Participant)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_rejects_at_capacity() {
        let mut reg = ParticipantRegistry::new(2);
        let now = Utc::now();
        reg.join(ParticipantId::new(), UserId::new(), "a".into(), None, None, now)
            .unwrap();
        reg.join(ParticipantId::new(), UserId::new(), "b".into(), None, None, now)
            .unwrap();
        let err = reg
            .join(ParticipantId::new(), UserId::new(), "c".into(), None, None, now)
            .unwrap_err();
        assert_eq!(err, CoreError::ChannelFull);
    }

    #[test]
    fn rejoin_with_same_id_updates_instead_of_erroring() {
        let mut reg = ParticipantRegistry::new(2);
        let now = Utc::now();
        let id = ParticipantId::new();
        let user = UserId::new();
        reg.join(id, user, "a".into(), None, None, now).unwrap();
        let later = now + chrono::Duration::seconds(5);
        let outcome = reg
            .join(id, user, "a-renamed".into(), None, None, later)
            .unwrap();
        assert!(matches!(outcome, JoinOutcome::Reconnected));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(id).unwrap().last_seen, later);
    }

    #[test]
    fn leave_unknown_participant_errors() {
        let mut reg = ParticipantRegistry::new(2);
        assert_eq!(reg.leave(ParticipantId::new()).unwrap_err(), CoreError::NotPresent);
    }
}
