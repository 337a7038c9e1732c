use std::fmt;

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Connectivity of one peer transport as reported by its ICE/DTLS stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Whether connectivity was lost and may need an ICE restart.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::New => write!(f, "New"),
            TransportState::Connecting => write!(f, "Connecting"),
            TransportState::Connected => write!(f, "Connected"),
            TransportState::Disconnected => write!(f, "Disconnected"),
            TransportState::Failed => write!(f, "Failed"),
            TransportState::Closed => write!(f, "Closed"),
        }
    }
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                TransportState::New
            }
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_connection_states_map() {
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Connected),
            TransportState::Connected
        );
        assert!(TransportState::from(RTCPeerConnectionState::Failed).is_interrupted());
        assert!(!TransportState::from(RTCPeerConnectionState::Closed).is_interrupted());
    }
}
