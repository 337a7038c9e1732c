use serde::{Deserialize, Serialize};

use super::state::ParticipantId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    #[default]
    Grid,
    Speaker,
}

/// What the local viewer is focused on.
///
/// Only one remote screen is presented at a time; a newer share replaces the
/// one on display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    mode: ViewMode,
    active_speaker: Option<ParticipantId>,
    presented_screen: Option<ParticipantId>,
}

impl ViewState {
    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ViewMode) -> bool {
        let changed = self.mode != mode;
        self.mode = mode;
        changed
    }

    pub fn active_speaker(&self) -> Option<&ParticipantId> {
        self.active_speaker.as_ref()
    }

    pub fn set_active_speaker(&mut self, speaker: Option<ParticipantId>) -> bool {
        let changed = self.active_speaker != speaker;
        self.active_speaker = speaker;
        changed
    }

    /// Participant given the main tile, if the current mode picks one.
    pub fn focused(&self) -> Option<&ParticipantId> {
        match self.mode {
            ViewMode::Speaker => self.active_speaker.as_ref(),
            ViewMode::Grid => None,
        }
    }

    pub fn presented_screen(&self) -> Option<&ParticipantId> {
        self.presented_screen.as_ref()
    }

    /// Returns the participant whose screen was displaced, if any.
    pub fn present_screen(&mut self, id: ParticipantId) -> Option<ParticipantId> {
        match self.presented_screen.replace(id.clone()) {
            Some(previous) if previous != id => Some(previous),
            _ => None,
        }
    }

    pub fn screen_stopped(&mut self, id: &ParticipantId) -> bool {
        if self.presented_screen.as_ref() == Some(id) {
            self.presented_screen = None;
            true
        } else {
            false
        }
    }

    pub fn participant_left(&mut self, id: &ParticipantId) {
        self.screen_stopped(id);
        if self.active_speaker.as_ref() == Some(id) {
            self.active_speaker = None;
        }
    }
}
