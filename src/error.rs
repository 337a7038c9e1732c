use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::media::CaptureError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("signaling error: {0}")]
    Signaling(String),

    /// Reconnection attempts are exhausted; the session must be restarted.
    #[error("signaling connection lost after {attempts} reconnection attempts")]
    ConnectionLost { attempts: u32 },

    #[error("room {room_id} is full ({max_participants} participants)")]
    RoomFull {
        room_id: String,
        max_participants: usize,
    },

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("no peer link for participant {0}")]
    UnknownPeer(String),

    #[error("recording error: {0}")]
    Recording(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("a screen share is already active")]
    AlreadySharing,

    #[error("a device switch is already in progress")]
    SwitchInProgress,

    #[error("not permitted: {0}")]
    NotPermitted(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("conference has shut down")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::Signaling(msg.to_string())
    }

    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    pub fn recording(msg: impl std::fmt::Display) -> Self {
        Self::Recording(msg.to_string())
    }

    pub fn upload(msg: impl std::fmt::Display) -> Self {
        Self::Upload(msg.to_string())
    }

    pub fn media(msg: impl std::fmt::Display) -> Self {
        Self::Media(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Text shown to the user when the error is surfaced rather than retried.
    pub fn user_message(&self) -> String {
        match self {
            Error::Capture(e) => e.user_message().to_string(),
            Error::ConnectionLost { .. } => {
                "Lost connection to the meeting server. Please rejoin the meeting.".to_string()
            }
            Error::RoomFull {
                max_participants, ..
            } => format!(
                "This meeting is full ({} participants). Try again later.",
                max_participants
            ),
            Error::Recording(reason) => format!("Recording unavailable: {}", reason),
            Error::Upload(reason) => format!(
                "The recording could not be uploaded ({}). It has been discarded.",
                reason
            ),
            Error::NotPermitted(reason) => format!("That action is not allowed: {}", reason),
            Error::AlreadySharing => "You are already sharing your screen.".to_string(),
            Error::SwitchInProgress => {
                "A device change is already in progress. Please wait.".to_string()
            }
            other => format!("Something went wrong: {}", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
