use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::TransportState;
use crate::error::Result;
use crate::media::MediaTrack;
use crate::metrics::LinkStats;
use crate::room::ParticipantId;
use crate::signaling::IceCandidate;

/// Handle to one outgoing track on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender-{}", self.0)
    }
}

/// Something a transport noticed on its own; delivered to the conference loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    IceCandidate(IceCandidate),
    StateChanged(TransportState),
    /// A new incoming track, not yet classified.
    RemoteTrack(MediaTrack),
}

pub type TransportEvents = mpsc::UnboundedSender<(ParticipantId, TransportEvent)>;

/// One media connection to one remote participant.
///
/// Session descriptions are opaque strings; the manager only relays them.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId>;

    /// Swap the track feeding `sender` without renegotiating.
    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<()>;

    async fn remove_track(&self, sender: SenderId) -> Result<()>;

    /// Create an offer and apply it locally.
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    /// Apply a remote offer and return the local answer.
    async fn handle_offer(&self, sdp: &str) -> Result<String>;

    async fn handle_answer(&self, sdp: &str) -> Result<()>;

    /// Drop a pending local offer.
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn stats(&self) -> Option<LinkStats>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        remote: &ParticipantId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>>;
}
