//! The mesh: one [`PeerLink`] per remote participant, owned here and only
//! reachable through this manager's methods.

mod link;
mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use link::{LinkSnapshot, LinkState, NegotiationRole, PeerLink};
pub use transport::{
    PeerTransport, SenderId, TransportEvent, TransportEvents, TransportFactory,
};

use crate::connection::TransportState;
use crate::error::{Error, Result};
use crate::media::{LocalStream, MediaTrack, TrackPurpose, TrackReplacer};
use crate::metrics::LinkStats;
use crate::room::ParticipantId;
use crate::signaling::{IceCandidate, SignalingSender, TrackTag};

/// Media received from one participant, at most one track per purpose.
#[derive(Debug, Clone, Default)]
pub struct RemoteMedia {
    pub camera: Option<MediaTrack>,
    pub microphone: Option<MediaTrack>,
    pub screen: Option<MediaTrack>,
    pub screen_audio: Option<MediaTrack>,
}

impl RemoteMedia {
    pub fn get(&self, purpose: TrackPurpose) -> Option<&MediaTrack> {
        match purpose {
            TrackPurpose::Camera => self.camera.as_ref(),
            TrackPurpose::Microphone => self.microphone.as_ref(),
            TrackPurpose::Screen => self.screen.as_ref(),
            TrackPurpose::ScreenAudio => self.screen_audio.as_ref(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.camera
            .iter()
            .chain(self.microphone.iter())
            .chain(self.screen.iter())
            .chain(self.screen_audio.iter())
    }

    fn slot_mut(&mut self, purpose: TrackPurpose) -> &mut Option<MediaTrack> {
        match purpose {
            TrackPurpose::Camera => &mut self.camera,
            TrackPurpose::Microphone => &mut self.microphone,
            TrackPurpose::Screen => &mut self.screen,
            TrackPurpose::ScreenAudio => &mut self.screen_audio,
        }
    }

    /// Clear the slot for `track` if it still holds that track.
    fn release(&mut self, track: &MediaTrack) {
        let slot = self.slot_mut(track.purpose());
        if slot.as_ref() == Some(track) {
            *slot = None;
        }
    }
}

/// Changes other components need to hear about, drained by the conference loop.
#[derive(Debug, Clone)]
pub enum PeerUpdate {
    TrackAdded {
        participant: ParticipantId,
        track: MediaTrack,
    },
    TrackRemoved {
        participant: ParticipantId,
        track: MediaTrack,
    },
    LinkStateChanged {
        participant: ParticipantId,
        state: LinkState,
    },
}

pub struct PeerConnectionManager {
    local_id: ParticipantId,
    factory: Arc<dyn TransportFactory>,
    signaling: SignalingSender,
    events: TransportEvents,
    links: HashMap<ParticipantId, PeerLink>,
    local_tracks: Vec<MediaTrack>,
    remote_media: HashMap<ParticipantId, RemoteMedia>,
    updates: Vec<PeerUpdate>,
}

impl PeerConnectionManager {
    /// The returned receiver carries every transport's events, tagged with the remote id.
    pub fn new(
        local_id: ParticipantId,
        factory: Arc<dyn TransportFactory>,
        signaling: SignalingSender,
    ) -> (Self, mpsc::UnboundedReceiver<(ParticipantId, TransportEvent)>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                local_id,
                factory,
                signaling,
                events,
                links: HashMap::new(),
                local_tracks: Vec::new(),
                remote_media: HashMap::new(),
                updates: Vec::new(),
            },
            rx,
        )
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Seed the tracks attached to every link created from now on.
    pub fn set_local_stream(&mut self, stream: &LocalStream) {
        self.local_tracks = stream.tracks().cloned().collect();
    }

    pub fn local_tracks(&self) -> &[MediaTrack] {
        &self.local_tracks
    }

    /// An existing member sees a newcomer: open the link and offer.
    pub async fn handle_participant_joined(&mut self, remote: &ParticipantId) -> Result<()> {
        if *remote == self.local_id {
            return Ok(());
        }
        if self.links.contains_key(remote) {
            debug!(participant = %remote, "link already exists, not offering again");
            return Ok(());
        }
        self.open_link(remote, NegotiationRole::Offerer).await?;
        let Some(link) = self.links.get_mut(remote) else {
            return Ok(());
        };
        negotiate(link, &self.signaling, &mut self.updates, false).await
    }

    pub async fn handle_offer(
        &mut self,
        from: &ParticipantId,
        sdp: &str,
        tags: Vec<TrackTag>,
    ) -> Result<()> {
        if !self.links.contains_key(from) {
            self.open_link(from, NegotiationRole::Answerer).await?;
        }
        let link = self
            .links
            .get_mut(from)
            .ok_or_else(|| Error::UnknownPeer(from.to_string()))?;
        let transport = link.transport().clone();

        if link.making_offer {
            if !link.is_polite() {
                info!(participant = %from, "offer collision, keeping our own offer");
                return Ok(());
            }
            info!(participant = %from, "offer collision, rolling back our offer");
            transport.rollback().await?;
            link.making_offer = false;
            link.renegotiate_after_answer = true;
        }

        link.set_remote_tags(tags);
        let answer = transport.handle_offer(sdp).await?;
        for candidate in link.remote_description_applied() {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!(participant = %from, error = %e, "queued ice candidate rejected");
            }
        }
        if link.state() == LinkState::New {
            transition(link, LinkState::Negotiating, &mut self.updates);
        }
        self.signaling.answer(from, answer, link.local_tags())?;

        let media = self.remote_media.entry(from.clone()).or_default();
        reclassify(link, media, &mut self.updates);

        if link.renegotiate_after_answer {
            link.renegotiate_after_answer = false;
            negotiate(link, &self.signaling, &mut self.updates, false).await?;
        }
        Ok(())
    }

    pub async fn handle_answer(
        &mut self,
        from: &ParticipantId,
        sdp: &str,
        tags: Vec<TrackTag>,
    ) -> Result<()> {
        let Some(link) = self.links.get_mut(from) else {
            warn!(participant = %from, "answer for unknown peer link dropped");
            return Ok(());
        };
        if !link.making_offer {
            debug!(participant = %from, "answer without a pending offer ignored");
            return Ok(());
        }
        let transport = link.transport().clone();
        link.set_remote_tags(tags);
        transport.handle_answer(sdp).await?;
        link.making_offer = false;
        for candidate in link.remote_description_applied() {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!(participant = %from, error = %e, "queued ice candidate rejected");
            }
        }

        let media = self.remote_media.entry(from.clone()).or_default();
        reclassify(link, media, &mut self.updates);

        if link.renegotiate_after_answer {
            link.renegotiate_after_answer = false;
            negotiate(link, &self.signaling, &mut self.updates, false).await?;
        }
        Ok(())
    }

    pub async fn handle_ice_candidate(
        &mut self,
        from: &ParticipantId,
        candidate: IceCandidate,
    ) -> Result<()> {
        let Some(link) = self.links.get_mut(from) else {
            debug!(participant = %from, "ice candidate for unknown peer link dropped");
            return Ok(());
        };
        if !link.has_remote_description() {
            link.queue_candidate(candidate);
            return Ok(());
        }
        let transport = link.transport().clone();
        transport.add_ice_candidate(candidate).await
    }

    /// Close and forget the link to `remote`. Returns `false` if there was none.
    pub async fn handle_participant_left(&mut self, remote: &ParticipantId) -> bool {
        let closed = match self.links.remove(remote) {
            Some(mut link) => {
                link.close().await;
                info!(participant = %remote, "peer link closed");
                true
            }
            None => false,
        };
        if let Some(media) = self.remote_media.remove(remote) {
            for track in media.tracks() {
                track.stop();
                self.updates.push(PeerUpdate::TrackRemoved {
                    participant: remote.clone(),
                    track: track.clone(),
                });
            }
        }
        closed
    }

    pub async fn handle_transport_event(&mut self, from: &ParticipantId, event: TransportEvent) {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                if self.links.get(from).is_some_and(|l| !l.is_closed()) {
                    if let Err(e) = self.signaling.ice_candidate(from, candidate) {
                        warn!(participant = %from, error = %e, "failed to relay ice candidate");
                    }
                }
            }
            TransportEvent::StateChanged(state) => self.on_transport_state(from, state).await,
            TransportEvent::RemoteTrack(track) => self.on_remote_track(from, track),
        }
    }

    async fn on_transport_state(&mut self, from: &ParticipantId, state: TransportState) {
        let Some(link) = self.links.get_mut(from) else {
            return;
        };
        let next = match (link.state(), state) {
            (LinkState::Closed, _) => None,
            (_, TransportState::Connected) => Some(LinkState::Connected),
            (LinkState::Connected, s) if s.is_interrupted() => Some(LinkState::IceRestarting),
            (LinkState::IceRestarting, TransportState::Failed) => Some(LinkState::Disconnected),
            (LinkState::New | LinkState::Negotiating, TransportState::Failed) => {
                Some(LinkState::Disconnected)
            }
            _ => None,
        };
        let Some(next) = next else {
            return;
        };
        if !transition(link, next, &mut self.updates) {
            return;
        }
        if next == LinkState::IceRestarting && !link.is_polite() {
            info!(participant = %from, "connectivity lost, restarting ice");
            if let Err(e) = negotiate(link, &self.signaling, &mut self.updates, true).await {
                warn!(participant = %from, error = %e, "ice restart offer failed");
            }
        }
    }

    fn on_remote_track(&mut self, from: &ParticipantId, track: MediaTrack) {
        let Some(link) = self.links.get_mut(from) else {
            debug!(participant = %from, track = %track.id(), "track for unknown peer link dropped");
            track.stop();
            return;
        };
        let purpose = match link.announced_purpose(track.id()) {
            Some(purpose) if purpose.kind() == track.kind() => purpose,
            Some(purpose) => {
                warn!(participant = %from, track = %track.id(), ?purpose, kind = %track.kind(), "announced purpose does not match track kind");
                TrackPurpose::default_for(track.kind())
            }
            None => {
                warn!(participant = %from, track = %track.id(), "untagged remote track, classifying by kind");
                TrackPurpose::default_for(track.kind())
            }
        };
        let track = track.with_purpose(purpose);
        let media = self.remote_media.entry(from.clone()).or_default();
        place(link, media, track, &mut self.updates);
    }

    pub async fn add_local_track(&mut self, track: &MediaTrack) -> Result<()> {
        self.add_local_tracks(std::slice::from_ref(track)).await
    }

    /// Attach tracks to every link, renegotiating each link once.
    pub async fn add_local_tracks(&mut self, tracks: &[MediaTrack]) -> Result<()> {
        for track in tracks {
            if !self.local_tracks.contains(track) {
                self.local_tracks.push(track.clone());
            }
        }
        for link in self.links.values_mut().filter(|l| !l.is_closed()) {
            let mut attached = false;
            for track in tracks {
                match link.attach(track).await {
                    Ok(()) => attached = true,
                    Err(e) => {
                        warn!(participant = %link.remote(), track = %track.id(), error = %e, "failed to attach local track")
                    }
                }
            }
            if attached {
                if let Err(e) = negotiate(link, &self.signaling, &mut self.updates, false).await {
                    warn!(participant = %link.remote(), error = %e, "renegotiation failed");
                }
            }
        }
        Ok(())
    }

    /// Detach tracks from every link, renegotiating each link that carried one.
    pub async fn remove_local_tracks(&mut self, tracks: &[MediaTrack]) -> Result<()> {
        self.local_tracks.retain(|t| !tracks.contains(t));
        for link in self.links.values_mut().filter(|l| !l.is_closed()) {
            let mut detached = false;
            for track in tracks {
                match link.detach(track).await {
                    Ok(removed) => detached |= removed,
                    Err(e) => {
                        warn!(participant = %link.remote(), track = %track.id(), error = %e, "failed to detach local track")
                    }
                }
            }
            if detached {
                if let Err(e) = negotiate(link, &self.signaling, &mut self.updates, false).await {
                    warn!(participant = %link.remote(), error = %e, "renegotiation failed");
                }
            }
        }
        Ok(())
    }

    /// Put `new` on every sender carrying `old`. No renegotiation is needed.
    pub async fn replace_local_track(&mut self, old: &MediaTrack, new: &MediaTrack) -> Result<()> {
        for track in self.local_tracks.iter_mut() {
            if track == old {
                *track = new.clone();
            }
        }
        let mut first_error = None;
        for link in self.links.values_mut().filter(|l| !l.is_closed()) {
            if let Err(e) = link.replace(old, new).await {
                warn!(participant = %link.remote(), error = %e, "track replacement failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Statistics from every link with live connectivity.
    pub async fn collect_stats(&self) -> Vec<(ParticipantId, LinkStats)> {
        let mut samples = Vec::with_capacity(self.links.len());
        for (id, link) in &self.links {
            if !matches!(link.state(), LinkState::Connected | LinkState::IceRestarting) {
                continue;
            }
            if let Some(stats) = link.transport().stats().await {
                samples.push((id.clone(), stats));
            }
        }
        samples
    }

    /// Close every link. Returns how many were closed.
    pub async fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for (id, mut link) in self.links.drain() {
            if link.close().await {
                debug!(participant = %id, "peer link closed");
                closed += 1;
            }
        }
        for media in self.remote_media.values() {
            for track in media.tracks() {
                track.stop();
            }
        }
        self.remote_media.clear();
        closed
    }

    pub fn take_updates(&mut self) -> Vec<PeerUpdate> {
        std::mem::take(&mut self.updates)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn link_state(&self, remote: &ParticipantId) -> Option<LinkState> {
        self.links.get(remote).map(PeerLink::state)
    }

    pub fn link_role(&self, remote: &ParticipantId) -> Option<NegotiationRole> {
        self.links.get(remote).map(PeerLink::role)
    }

    pub fn remote_media(&self, remote: &ParticipantId) -> Option<&RemoteMedia> {
        self.remote_media.get(remote)
    }

    pub fn remote_tracks(&self) -> Vec<(ParticipantId, MediaTrack)> {
        self.remote_media
            .iter()
            .flat_map(|(id, media)| media.tracks().map(move |t| (id.clone(), t.clone())))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        let mut links: Vec<LinkSnapshot> = self.links.values().map(LinkSnapshot::from).collect();
        links.sort_by(|a, b| a.participant.cmp(&b.participant));
        links
    }

    async fn open_link(&mut self, remote: &ParticipantId, role: NegotiationRole) -> Result<()> {
        let transport = self.factory.create(remote, self.events.clone()).await?;
        // The lower id yields when both sides offer at once.
        let polite = self.local_id < *remote;
        let mut link = PeerLink::new(remote.clone(), transport, role, polite);
        for track in &self.local_tracks {
            if let Err(e) = link.attach(track).await {
                warn!(participant = %remote, track = %track.id(), error = %e, "failed to attach local track");
            }
        }
        info!(participant = %remote, ?role, polite, "peer link created");
        self.links.insert(remote.clone(), link);
        Ok(())
    }
}

#[async_trait]
impl TrackReplacer for PeerConnectionManager {
    async fn replace_track(&mut self, old: &MediaTrack, new: &MediaTrack) -> Result<()> {
        self.replace_local_track(old, new).await
    }

    async fn add_track(&mut self, track: &MediaTrack) -> Result<()> {
        self.add_local_track(track).await
    }

    async fn remove_track(&mut self, track: &MediaTrack) -> Result<()> {
        self.remove_local_tracks(std::slice::from_ref(track)).await
    }
}

fn transition(link: &mut PeerLink, next: LinkState, updates: &mut Vec<PeerUpdate>) -> bool {
    if !link.set_state(next) {
        return false;
    }
    updates.push(PeerUpdate::LinkStateChanged {
        participant: link.remote().clone(),
        state: next,
    });
    true
}

/// Send an offer now, or after the outstanding one is answered.
async fn negotiate(
    link: &mut PeerLink,
    signaling: &SignalingSender,
    updates: &mut Vec<PeerUpdate>,
    ice_restart: bool,
) -> Result<()> {
    if link.is_closed() {
        return Ok(());
    }
    if link.making_offer && !ice_restart {
        debug!(participant = %link.remote(), "offer outstanding, renegotiating after the answer");
        link.renegotiate_after_answer = true;
        return Ok(());
    }
    let transport = link.transport().clone();
    let sdp = transport.create_offer(ice_restart).await?;
    link.making_offer = true;
    if link.state() == LinkState::New {
        transition(link, LinkState::Negotiating, updates);
    }
    signaling.offer(link.remote(), sdp, link.local_tags())
}

/// Store a classified incoming track. A newer track of the same purpose wins.
fn place(link: &mut PeerLink, media: &mut RemoteMedia, track: MediaTrack, updates: &mut Vec<PeerUpdate>) {
    let participant = link.remote().clone();
    link.receivers.insert(track.id().to_string(), track.clone());
    if let Some(previous) = media.slot_mut(track.purpose()).replace(track.clone()) {
        if previous == track {
            return;
        }
        debug!(participant = %participant, purpose = ?track.purpose(), "newer remote track replaces previous one");
        link.receivers.remove(previous.id());
        previous.stop();
        updates.push(PeerUpdate::TrackRemoved {
            participant: participant.clone(),
            track: previous,
        });
    }
    updates.push(PeerUpdate::TrackAdded { participant, track });
}

/// Re-apply the latest announced tags to tracks already received.
fn reclassify(link: &mut PeerLink, media: &mut RemoteMedia, updates: &mut Vec<PeerUpdate>) {
    if !link.has_remote_tags() {
        return;
    }
    let received: Vec<MediaTrack> = link.receivers.values().cloned().collect();
    for track in received {
        match link.announced_purpose(track.id()) {
            None => {
                debug!(participant = %link.remote(), track = %track.id(), "remote track withdrawn");
                link.receivers.remove(track.id());
                media.release(&track);
                track.stop();
                updates.push(PeerUpdate::TrackRemoved {
                    participant: link.remote().clone(),
                    track,
                });
            }
            Some(purpose) if purpose != track.purpose() && purpose.kind() == track.kind() => {
                media.release(&track);
                updates.push(PeerUpdate::TrackRemoved {
                    participant: link.remote().clone(),
                    track: track.clone(),
                });
                place(link, media, track.with_purpose(purpose), updates);
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalingMessage;
    use crate::media::TrackKind;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTransport {
        calls: Mutex<Vec<String>>,
        next_sender: AtomicU64,
        closes: AtomicU64,
    }

    impl ScriptedTransport {
        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerTransport for ScriptedTransport {
        async fn add_track(&self, track: &MediaTrack) -> Result<SenderId> {
            self.log(format!("add:{}", track.label()));
            Ok(SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst)))
        }

        async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<()> {
            self.log(format!("replace:{}:{}", sender.0, track.label()));
            Ok(())
        }

        async fn remove_track(&self, sender: SenderId) -> Result<()> {
            self.log(format!("remove:{}", sender.0));
            Ok(())
        }

        async fn create_offer(&self, ice_restart: bool) -> Result<String> {
            self.log(if ice_restart { "offer:restart" } else { "offer" });
            Ok("local-offer".into())
        }

        async fn handle_offer(&self, sdp: &str) -> Result<String> {
            self.log(format!("remote-offer:{}", sdp));
            Ok("local-answer".into())
        }

        async fn handle_answer(&self, sdp: &str) -> Result<()> {
            self.log(format!("remote-answer:{}", sdp));
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            self.log("rollback");
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.log(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn stats(&self) -> Option<LinkStats> {
            Some(LinkStats {
                rtt_ms: Some(42.0),
                ..Default::default()
            })
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedFactory {
        created: Mutex<HashMap<ParticipantId, Arc<ScriptedTransport>>>,
    }

    impl ScriptedFactory {
        fn transport(&self, id: &str) -> Arc<ScriptedTransport> {
            self.created.lock().unwrap()[&ParticipantId::from(id)].clone()
        }
    }

    #[async_trait]
    impl TransportFactory for ScriptedFactory {
        async fn create(
            &self,
            remote: &ParticipantId,
            _events: TransportEvents,
        ) -> Result<Arc<dyn PeerTransport>> {
            let transport = Arc::new(ScriptedTransport::default());
            self.created
                .lock()
                .unwrap()
                .insert(remote.clone(), transport.clone());
            Ok(transport)
        }
    }

    struct Harness {
        manager: PeerConnectionManager,
        factory: Arc<ScriptedFactory>,
        outbound: mpsc::UnboundedReceiver<SignalingMessage>,
        camera: MediaTrack,
    }

    impl Harness {
        fn new(local: &str) -> Self {
            let factory = Arc::new(ScriptedFactory::default());
            let (tx, outbound) = mpsc::unbounded_channel();
            let signaling = SignalingSender::new("room", local.into(), tx);
            let (mut manager, _events) =
                PeerConnectionManager::new(local.into(), factory.clone(), signaling);
            let camera = MediaTrack::local(TrackPurpose::Camera, "cam", "stream", None);
            let mut stream = LocalStream::new("stream");
            stream.video = Some(camera.clone());
            manager.set_local_stream(&stream);
            Self {
                manager,
                factory,
                outbound,
                camera,
            }
        }

        fn sent(&mut self) -> Vec<SignalingMessage> {
            let mut sent = Vec::new();
            while let Ok(message) = self.outbound.try_recv() {
                sent.push(message);
            }
            sent
        }
    }

    fn tag(track_id: &str, purpose: TrackPurpose) -> TrackTag {
        TrackTag {
            stream_id: "remote-stream".into(),
            track_id: track_id.into(),
            purpose,
        }
    }

    #[tokio::test]
    async fn test_existing_member_offers_to_newcomer() {
        let mut h = Harness::new("a");
        h.manager.handle_participant_joined(&"c".into()).await.unwrap();

        assert_eq!(h.manager.link_count(), 1);
        assert_eq!(
            h.manager.link_role(&"c".into()),
            Some(NegotiationRole::Offerer)
        );
        assert_eq!(
            h.manager.link_state(&"c".into()),
            Some(LinkState::Negotiating)
        );
        match h.sent().as_slice() {
            [SignalingMessage::Offer { to_peer, tracks, .. }] => {
                assert_eq!(to_peer, &ParticipantId::from("c"));
                assert_eq!(tracks.len(), 1);
                assert_eq!(tracks[0].purpose, TrackPurpose::Camera);
                assert_eq!(tracks[0].track_id, h.camera.id());
            }
            other => panic!("unexpected messages {:?}", other),
        }
        assert_eq!(h.factory.transport("c").calls(), vec!["add:cam", "offer"]);

        // A repeated join does not open a second link.
        h.manager.handle_participant_joined(&"c".into()).await.unwrap();
        assert_eq!(h.manager.link_count(), 1);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_newcomer_answers_offer() {
        let mut h = Harness::new("c");
        h.manager
            .handle_offer(&"a".into(), "remote-offer", vec![])
            .await
            .unwrap();
        assert_eq!(
            h.manager.link_role(&"a".into()),
            Some(NegotiationRole::Answerer)
        );
        assert!(matches!(
            h.sent().as_slice(),
            [SignalingMessage::Answer { sdp, .. }] if sdp == "local-answer"
        ));
    }

    #[tokio::test]
    async fn test_unknown_link_references_are_dropped() {
        let mut h = Harness::new("a");
        h.manager
            .handle_answer(&"x".into(), "sdp", vec![])
            .await
            .unwrap();
        h.manager
            .handle_ice_candidate(
                &"x".into(),
                IceCandidate {
                    candidate: "c1".into(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(h.manager.link_count(), 0);
        assert!(!h.manager.handle_participant_left(&"x".into()).await);
    }

    #[tokio::test]
    async fn test_candidates_wait_for_remote_description() {
        let mut h = Harness::new("a");
        h.manager.handle_participant_joined(&"b".into()).await.unwrap();
        let candidate = |c: &str| IceCandidate {
            candidate: c.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        h.manager
            .handle_ice_candidate(&"b".into(), candidate("early"))
            .await
            .unwrap();
        assert!(!h
            .factory
            .transport("b")
            .calls()
            .iter()
            .any(|c| c.starts_with("candidate")));

        h.manager
            .handle_answer(&"b".into(), "answer", vec![])
            .await
            .unwrap();
        h.manager
            .handle_ice_candidate(&"b".into(), candidate("late"))
            .await
            .unwrap();
        let calls = h.factory.transport("b").calls();
        assert_eq!(
            &calls[calls.len() - 3..],
            &["remote-answer:answer", "candidate:early", "candidate:late"]
        );
    }

    #[tokio::test]
    async fn test_polite_side_rolls_back_on_glare() {
        // "a" < "b", so "a" is polite toward "b".
        let mut h = Harness::new("a");
        h.manager.handle_participant_joined(&"b".into()).await.unwrap();
        h.sent();

        h.manager
            .handle_offer(&"b".into(), "their-offer", vec![])
            .await
            .unwrap();
        let calls = h.factory.transport("b").calls();
        assert_eq!(
            &calls[2..],
            &["rollback", "remote-offer:their-offer", "offer"]
        );
        let sent = h.sent();
        assert!(matches!(sent[0], SignalingMessage::Answer { .. }));
        assert!(matches!(sent[1], SignalingMessage::Offer { .. }));
    }

    #[tokio::test]
    async fn test_impolite_side_ignores_colliding_offer() {
        let mut h = Harness::new("b");
        h.manager.handle_participant_joined(&"a".into()).await.unwrap();
        h.sent();

        h.manager
            .handle_offer(&"a".into(), "their-offer", vec![])
            .await
            .unwrap();
        assert_eq!(h.factory.transport("a").calls(), vec!["add:cam", "offer"]);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_departure_closes_link_once() {
        let mut h = Harness::new("a");
        h.manager.handle_participant_joined(&"b".into()).await.unwrap();
        let transport = h.factory.transport("b");

        assert!(h.manager.handle_participant_left(&"b".into()).await);
        assert!(!h.manager.handle_participant_left(&"b".into()).await);
        assert_eq!(h.manager.close_all().await, 0);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.manager.link_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_tracks_classified_by_tag() {
        let mut h = Harness::new("b");
        h.manager
            .handle_offer(
                &"a".into(),
                "offer",
                vec![
                    tag("cam-1", TrackPurpose::Camera),
                    tag("screen-1", TrackPurpose::Screen),
                ],
            )
            .await
            .unwrap();

        let from = ParticipantId::from("a");
        for id in ["cam-1", "screen-1", "mystery"] {
            let track = MediaTrack::remote(TrackKind::Video, id, "remote-stream");
            h.manager
                .handle_transport_event(&from, TransportEvent::RemoteTrack(track))
                .await;
        }

        let media = h.manager.remote_media(&from).unwrap();
        assert_eq!(media.screen.as_ref().unwrap().id(), "screen-1");
        assert_eq!(media.screen.as_ref().unwrap().purpose(), TrackPurpose::Screen);
        // The untagged track falls back to camera and replaces the earlier one.
        assert_eq!(media.camera.as_ref().unwrap().id(), "mystery");

        let removed: Vec<_> = h
            .manager
            .take_updates()
            .into_iter()
            .filter_map(|u| match u {
                PeerUpdate::TrackRemoved { track, .. } => Some(track.id().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec!["cam-1"]);
    }

    #[tokio::test]
    async fn test_withdrawn_screen_track_is_removed() {
        let mut h = Harness::new("b");
        let from = ParticipantId::from("a");
        h.manager
            .handle_offer(
                &from,
                "offer",
                vec![
                    tag("cam-1", TrackPurpose::Camera),
                    tag("screen-1", TrackPurpose::Screen),
                ],
            )
            .await
            .unwrap();
        let screen = MediaTrack::remote(TrackKind::Video, "screen-1", "remote-stream");
        h.manager
            .handle_transport_event(&from, TransportEvent::RemoteTrack(screen.clone()))
            .await;
        h.manager
            .handle_offer(&from, "offer-2", vec![tag("cam-1", TrackPurpose::Camera)])
            .await
            .unwrap();

        assert!(h.manager.remote_media(&from).unwrap().screen.is_none());
        assert!(screen.is_ended());
    }

    #[tokio::test]
    async fn test_ice_restart_then_disconnect() {
        let mut h = Harness::new("b");
        let remote = ParticipantId::from("a");
        h.manager.handle_participant_joined(&remote).await.unwrap();
        h.manager
            .handle_answer(&remote, "answer", vec![])
            .await
            .unwrap();
        h.manager
            .handle_transport_event(&remote, TransportEvent::StateChanged(TransportState::Connected))
            .await;
        assert_eq!(h.manager.link_state(&remote), Some(LinkState::Connected));

        h.manager
            .handle_transport_event(&remote, TransportEvent::StateChanged(TransportState::Disconnected))
            .await;
        assert_eq!(h.manager.link_state(&remote), Some(LinkState::IceRestarting));
        assert_eq!(
            h.factory.transport("a").calls().last().map(String::as_str),
            Some("offer:restart")
        );

        h.manager
            .handle_transport_event(&remote, TransportEvent::StateChanged(TransportState::Failed))
            .await;
        assert_eq!(h.manager.link_state(&remote), Some(LinkState::Disconnected));
    }

    #[tokio::test]
    async fn test_replace_reaches_every_link_without_renegotiation() {
        let mut h = Harness::new("a");
        h.manager.handle_participant_joined(&"b".into()).await.unwrap();
        h.manager.handle_participant_joined(&"c".into()).await.unwrap();
        h.sent();

        let next = MediaTrack::local(TrackPurpose::Camera, "cam-2", "stream", None);
        let camera = h.camera.clone();
        h.manager.replace_local_track(&camera, &next).await.unwrap();

        for id in ["b", "c"] {
            let calls = h.factory.transport(id).calls();
            assert_eq!(calls.last().map(String::as_str), Some("replace:0:cam-2"));
        }
        assert!(h.sent().is_empty());
        assert_eq!(h.manager.local_tracks(), &[next]);
    }

    #[tokio::test]
    async fn test_adding_tracks_renegotiates_once_per_link() {
        let mut h = Harness::new("a");
        h.manager.handle_participant_joined(&"b".into()).await.unwrap();
        h.manager
            .handle_answer(&"b".into(), "answer", vec![])
            .await
            .unwrap();
        h.sent();

        let screen = MediaTrack::local(TrackPurpose::Screen, "display", "screen", None);
        let screen_audio = MediaTrack::local(TrackPurpose::ScreenAudio, "display-audio", "screen", None);
        h.manager
            .add_local_tracks(&[screen.clone(), screen_audio.clone()])
            .await
            .unwrap();
        let offers = h
            .sent()
            .into_iter()
            .filter(|m| matches!(m, SignalingMessage::Offer { .. }))
            .count();
        assert_eq!(offers, 1);

        h.manager
            .remove_local_tracks(&[screen, screen_audio])
            .await
            .unwrap();
        // The second offer waits for the answer to the first.
        assert!(h.sent().is_empty());
        h.manager
            .handle_answer(&"b".into(), "answer-2", vec![])
            .await
            .unwrap();
        assert!(matches!(
            h.sent().as_slice(),
            [SignalingMessage::Offer { tracks, .. }] if tracks.len() == 1
        ));
    }
}
