use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::transport::{PeerTransport, SenderId};
use crate::error::Result;
use crate::media::{MediaTrack, TrackPurpose};
use crate::room::ParticipantId;
use crate::signaling::{IceCandidate, TrackTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    New,
    Negotiating,
    Connected,
    IceRestarting,
    Disconnected,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::New => write!(f, "new"),
            LinkState::Negotiating => write!(f, "negotiating"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::IceRestarting => write!(f, "ice-restarting"),
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone)]
pub(crate) struct LocalSender {
    pub id: SenderId,
    pub track: MediaTrack,
    /// Fixed when the sender was created; replacing the track keeps it.
    pub tag: TrackTag,
}

pub struct PeerLink {
    remote: ParticipantId,
    state: LinkState,
    role: NegotiationRole,
    polite: bool,
    transport: Arc<dyn PeerTransport>,
    pub(crate) senders: HashMap<TrackPurpose, LocalSender>,
    pub(crate) receivers: HashMap<String, MediaTrack>,
    remote_tags: HashMap<String, TrackTag>,
    pending_candidates: Vec<IceCandidate>,
    has_remote_description: bool,
    pub(crate) making_offer: bool,
    pub(crate) renegotiate_after_answer: bool,
    closed: bool,
}

impl PeerLink {
    pub(crate) fn new(
        remote: ParticipantId,
        transport: Arc<dyn PeerTransport>,
        role: NegotiationRole,
        polite: bool,
    ) -> Self {
        Self {
            remote,
            state: LinkState::New,
            role,
            polite,
            transport,
            senders: HashMap::new(),
            receivers: HashMap::new(),
            remote_tags: HashMap::new(),
            pending_candidates: Vec::new(),
            has_remote_description: false,
            making_offer: false,
            renegotiate_after_answer: false,
            closed: false,
        }
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Returns `true` if the state actually changed.
    pub(crate) fn set_state(&mut self, next: LinkState) -> bool {
        if self.state == next || self.state == LinkState::Closed {
            return false;
        }
        debug!(participant = %self.remote, from = %self.state, to = %next, "link state");
        self.state = next;
        true
    }

    pub(crate) fn local_tags(&self) -> Vec<TrackTag> {
        let mut tags: Vec<_> = self.senders.values().map(|s| s.tag.clone()).collect();
        tags.sort_by(|a, b| a.track_id.cmp(&b.track_id));
        tags
    }

    pub(crate) async fn attach(&mut self, track: &MediaTrack) -> Result<()> {
        if let Some(existing) = self.senders.get(&track.purpose()) {
            if existing.track == *track {
                return Ok(());
            }
            let id = existing.id;
            self.transport.replace_track(id, track).await?;
            if let Some(sender) = self.senders.get_mut(&track.purpose()) {
                sender.track = track.clone();
            }
            return Ok(());
        }
        let id = self.transport.add_track(track).await?;
        self.senders.insert(
            track.purpose(),
            LocalSender {
                id,
                track: track.clone(),
                tag: TrackTag {
                    stream_id: track.stream_id().to_string(),
                    track_id: track.id().to_string(),
                    purpose: track.purpose(),
                },
            },
        );
        Ok(())
    }

    /// Returns `true` if a sender carried `track`.
    pub(crate) async fn detach(&mut self, track: &MediaTrack) -> Result<bool> {
        let purpose = match self
            .senders
            .iter()
            .find(|(_, sender)| sender.track == *track)
        {
            Some((purpose, _)) => *purpose,
            None => return Ok(false),
        };
        if let Some(sender) = self.senders.remove(&purpose) {
            self.transport.remove_track(sender.id).await?;
        }
        Ok(true)
    }

    /// Returns `true` if a sender carried `old`.
    pub(crate) async fn replace(&mut self, old: &MediaTrack, new: &MediaTrack) -> Result<bool> {
        let Some(sender) = self.senders.values_mut().find(|s| s.track == *old) else {
            return Ok(false);
        };
        self.transport.replace_track(sender.id, new).await?;
        sender.track = new.clone();
        Ok(true)
    }

    pub(crate) fn set_remote_tags(&mut self, tags: Vec<TrackTag>) {
        self.remote_tags = tags
            .into_iter()
            .map(|tag| (tag.track_id.clone(), tag))
            .collect();
    }

    pub(crate) fn has_remote_tags(&self) -> bool {
        !self.remote_tags.is_empty()
    }

    /// Purpose announced for an incoming track, if any.
    pub(crate) fn announced_purpose(&self, track_id: &str) -> Option<TrackPurpose> {
        self.remote_tags.get(track_id).map(|tag| tag.purpose)
    }

    pub(crate) fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    /// Mark the remote description applied and hand back candidates that were waiting for it.
    pub(crate) fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.has_remote_description = true;
        std::mem::take(&mut self.pending_candidates)
    }

    pub(crate) fn queue_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    /// Close the transport. Only the first call does anything.
    pub(crate) async fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.state = LinkState::Closed;
        self.making_offer = false;
        self.renegotiate_after_answer = false;
        if let Err(e) = self.transport.close().await {
            warn!(participant = %self.remote, error = %e, "error closing peer transport");
        }
        for track in self.receivers.values() {
            track.stop();
        }
        self.receivers.clear();
        self.senders.clear();
        true
    }
}

/// Point-in-time view of one link, for status displays and tests.
#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    pub participant: ParticipantId,
    pub state: LinkState,
    pub role: NegotiationRole,
    pub polite: bool,
    pub sending: Vec<TrackPurpose>,
    pub received: Vec<MediaTrack>,
}

impl From<&PeerLink> for LinkSnapshot {
    fn from(link: &PeerLink) -> Self {
        let mut sending: Vec<_> = link.senders.keys().copied().collect();
        sending.sort_by_key(|p| format!("{:?}", p));
        let mut received: Vec<_> = link.receivers.values().cloned().collect();
        received.sort_by(|a, b| a.id().cmp(b.id()));
        Self {
            participant: link.remote.clone(),
            state: link.state,
            role: link.role,
            polite: link.polite,
            sending,
            received,
        }
    }
}
