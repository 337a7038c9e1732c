//! Peer-to-peer mesh video conferencing.
//!
//! Every participant holds one WebRTC link to every other participant; a
//! WebSocket signaling server only relays negotiation, roster and chat
//! messages. [`Conference`] owns the whole session and is driven through a
//! [`ConferenceHandle`].

pub mod activity;
pub mod audio;
pub mod background;
pub mod chat;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod metrics;
pub mod peer;
pub mod recording;
pub mod room;
pub mod screen;
pub mod session;
pub mod signaling;
pub mod webrtc;

pub use config::Config;
pub use error::{Error, Result};
pub use media::{DeviceSelection, LocalStream, MediaTrack, TrackKind, TrackPurpose};
pub use room::{ParticipantId, ViewMode};
pub use session::{
    Conference, ConferenceDeps, ConferenceHandle, ConferenceSnapshot, ConferenceUpdate,
    JoinOptions,
};
