use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Stable participant identifier assigned at join.
///
/// Ordering matters: when both ends of a link offer at once, the lower id yields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("user-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Roster entry as carried over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub participant_id: ParticipantId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub is_local: bool,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub screen_sharing: bool,
}

impl Participant {
    pub fn new(id: ParticipantId, display_name: impl Into<String>, is_local: bool) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            is_local,
            video_enabled: true,
            audio_enabled: true,
            screen_sharing: false,
        }
    }
}

pub struct Room {
    pub id: String,
    host_id: Option<ParticipantId>,
    max_participants: usize,
    local_id: ParticipantId,
    participants: HashMap<ParticipantId, Participant>,
}

impl Room {
    pub fn new(id: String, local: Participant, is_host: bool, max_participants: usize) -> Self {
        let local_id = local.id.clone();
        let mut participants = HashMap::new();
        participants.insert(local_id.clone(), local);
        Self {
            id,
            host_id: is_host.then(|| local_id.clone()),
            max_participants: max_participants.max(1),
            local_id,
            participants,
        }
    }

    /// Returns `Ok(true)` for a new entry, `Ok(false)` when the participant was already known.
    pub fn add_participant(&mut self, participant: Participant) -> Result<bool> {
        if let Some(existing) = self.participants.get_mut(&participant.id) {
            existing.display_name = participant.display_name;
            return Ok(false);
        }
        if self.participants.len() >= self.max_participants {
            return Err(Error::RoomFull {
                room_id: self.id.clone(),
                max_participants: self.max_participants,
            });
        }
        self.participants.insert(participant.id.clone(), participant);
        Ok(true)
    }

    pub fn remove_participant(&mut self, id: &ParticipantId) -> Option<Participant> {
        if *id == self.local_id {
            return None;
        }
        self.participants.remove(id)
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn remote_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self
            .participants
            .keys()
            .filter(|id| **id != self.local_id)
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn local(&self) -> &Participant {
        &self.participants[&self.local_id]
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants
    }

    pub fn max_participants(&self) -> usize {
        self.max_participants
    }

    pub fn host_id(&self) -> Option<&ParticipantId> {
        self.host_id.as_ref()
    }

    pub fn set_host(&mut self, id: ParticipantId) {
        self.host_id = Some(id);
    }

    pub fn is_local_host(&self) -> bool {
        self.host_id.as_ref() == Some(&self.local_id)
    }

    pub fn set_screen_sharing(&mut self, id: &ParticipantId, sharing: bool) -> bool {
        match self.participants.get_mut(id) {
            Some(p) => {
                p.screen_sharing = sharing;
                true
            }
            None => false,
        }
    }

    pub fn set_media_state(&mut self, id: &ParticipantId, video: bool, audio: bool) -> bool {
        match self.participants.get_mut(id) {
            Some(p) => {
                p.video_enabled = video;
                p.audio_enabled = audio;
                true
            }
            None => false,
        }
    }
}
