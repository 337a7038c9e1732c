use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::room::ParticipantId;
use crate::signaling::SignalingSender;

pub const DEFAULT_HISTORY: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: ParticipantId,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Text chat over the signaling channel.
///
/// History is kept in arrival order. The server may echo our own messages
/// back, so every message is de-duplicated by id.
pub struct ChatRelay {
    local_id: ParticipantId,
    local_name: String,
    signaling: SignalingSender,
    history: VecDeque<ChatMessage>,
    seen: HashSet<String>,
    capacity: usize,
}

impl ChatRelay {
    pub fn new(local_id: ParticipantId, local_name: impl Into<String>, signaling: SignalingSender) -> Self {
        Self::with_capacity(local_id, local_name, signaling, DEFAULT_HISTORY)
    }

    pub fn with_capacity(
        local_id: ParticipantId,
        local_name: impl Into<String>,
        signaling: SignalingSender,
        capacity: usize,
    ) -> Self {
        Self {
            local_id,
            local_name: local_name.into(),
            signaling,
            history: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn send(&mut self, text: &str) -> Result<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidMessage("chat message is empty".into()));
        }
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: self.local_id.clone(),
            sender_name: self.local_name.clone(),
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        self.signaling.chat(message.clone())?;
        self.push(message.clone());
        Ok(message)
    }

    /// Returns `false` when the message was already in the history.
    pub fn receive(&mut self, message: ChatMessage) -> bool {
        if self.seen.contains(&message.id) {
            debug!(id = %message.id, "duplicate chat message dropped");
            return false;
        }
        self.push(message);
        true
    }

    pub fn history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    fn push(&mut self, message: ChatMessage) {
        self.seen.insert(message.id.clone());
        self.history.push_back(message);
        while self.history.len() > self.capacity {
            if let Some(evicted) = self.history.pop_front() {
                self.seen.remove(&evicted.id);
            }
        }
    }
}
