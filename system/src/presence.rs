use crate::types::{Participant, ParticipantId};

/// Participants currently joined to one session, in join order.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    participants: Vec<Participant>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the participant was not present before. A repeated
    /// join only refreshes the display name.
    pub fn join(&mut self, participant: Participant) -> bool {
        if let Some(existing) = self
            .participants
            .iter_mut()
            .find(|p| p.participant_id == participant.participant_id)
        {
            existing.display_name = participant.display_name;
            false
        } else {
            self.participants.push(participant);
            true
        }
    }

    pub fn leave(&mut self, participant_id: &ParticipantId) -> Option<Participant> {
        self.participants
            .iter()
            .position(|p| &p.participant_id == participant_id)
            .map(|pos| self.participants.remove(pos))
    }

    pub fn get(&self, participant_id: &ParticipantId) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| &p.participant_id == participant_id)
    }

    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.get(participant_id).is_some()
    }

    pub fn list(&self) -> &[Participant] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
