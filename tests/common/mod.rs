//! In-process signaling server, loopback transports and synthetic capture
//! for driving whole conferences inside one test.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use meshmeet::config::CaptureProfile;
use meshmeet::error::{Error, Result};
use meshmeet::media::{
    spawn_test_pattern, CaptureBackend, CaptureError, DeviceInfo, DeviceKind, LocalStream,
    MediaTrack, TrackKind, TrackPurpose, VideoConstraints,
};
use meshmeet::metrics::LinkStats;
use meshmeet::peer::{PeerTransport, SenderId, TransportEvent, TransportEvents, TransportFactory};
use meshmeet::recording::{RecordingArtifact, UploadCollaborator, UploadReceipt};
use meshmeet::room::ParticipantInfo;
use meshmeet::signaling::{IceCandidate, RoomEvent, SignalingClient, SignalingMessage};
use meshmeet::{
    Conference, ConferenceDeps, ConferenceHandle, ConferenceSnapshot, ConferenceUpdate, Config,
    DeviceSelection, JoinOptions, ParticipantId,
};

pub const ROOM: &str = "standup";
pub const WAIT: Duration = Duration::from_secs(5);

pub const CAM_X_SEED: u8 = 10;
pub const CAM_Y_SEED: u8 = 200;

pub fn small_config() -> Config {
    Config {
        capture: CaptureProfile {
            ideal: VideoConstraints::new(32, 18, 30),
            medium: VideoConstraints::new(24, 14, 20),
            low: VideoConstraints::new(16, 9, 10),
        },
        ..Config::default()
    }
}

// ---------------------------------------------------------------------------
// Signaling

struct Member {
    name: String,
    events: mpsc::UnboundedSender<RoomEvent>,
}

#[derive(Default)]
struct RoomTable {
    host: Option<ParticipantId>,
    max_participants: usize,
    members: BTreeMap<ParticipantId, Member>,
}

impl RoomTable {
    fn deliver(&self, to: &ParticipantId, message: SignalingMessage) {
        let Some(member) = self.members.get(to) else {
            return;
        };
        if let Some(event) = RoomEvent::from_message(message, to) {
            let _ = member.events.send(event);
        }
    }

    fn broadcast(&self, from: &ParticipantId, message: &SignalingMessage) {
        for id in self.members.keys().filter(|id| *id != from) {
            self.deliver(id, message.clone());
        }
    }

    fn depart(&mut self, id: &ParticipantId) {
        if self.members.remove(id).is_none() {
            return;
        }
        for member in self.members.values() {
            let _ = member.events.send(RoomEvent::ParticipantLeft(id.clone()));
        }
    }
}

/// Relays messages between conferences the way the signaling server does.
#[derive(Clone)]
pub struct Router {
    table: Arc<Mutex<RoomTable>>,
}

impl Router {
    pub fn new(max_participants: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(RoomTable {
                max_participants,
                ..RoomTable::default()
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().members.len()
    }

    pub fn connect(&self, id: &ParticipantId, name: &str, is_host: bool) -> SignalingClient {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        {
            let mut table = self.table.lock().unwrap();
            if table.members.len() >= table.max_participants {
                let _ = event_tx.send(RoomEvent::RoomFull {
                    max_participants: table.max_participants,
                });
            } else {
                if is_host {
                    table.host = Some(id.clone());
                }
                let info = ParticipantInfo {
                    participant_id: id.clone(),
                    display_name: name.to_string(),
                };
                let existing = table
                    .members
                    .iter()
                    .map(|(id, member)| ParticipantInfo {
                        participant_id: id.clone(),
                        display_name: member.name.clone(),
                    })
                    .collect();
                let _ = event_tx.send(RoomEvent::RoomState {
                    host_id: table.host.clone(),
                    participants: existing,
                });
                for member in table.members.values() {
                    let _ = member
                        .events
                        .send(RoomEvent::ParticipantJoined(info.clone()));
                }
                table.members.insert(
                    id.clone(),
                    Member {
                        name: name.to_string(),
                        events: event_tx.clone(),
                    },
                );
            }
        }

        let table = self.table.clone();
        let from = id.clone();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let mut table = table.lock().unwrap();
                match &message {
                    SignalingMessage::Offer { to_peer, .. }
                    | SignalingMessage::Answer { to_peer, .. }
                    | SignalingMessage::IceCandidate { to_peer, .. } => {
                        let to = to_peer.clone();
                        table.deliver(&to, message);
                    }
                    SignalingMessage::Leave { .. } => table.depart(&from),
                    SignalingMessage::RemoveParticipant { participant_id, .. } => {
                        if table.host.as_ref() != Some(&from) {
                            continue;
                        }
                        let target = participant_id.clone();
                        table.deliver(&target, message.clone());
                        table.depart(&target);
                    }
                    SignalingMessage::ChatMessage { .. }
                    | SignalingMessage::ScreenShareStarted { .. }
                    | SignalingMessage::ScreenShareStopped { .. }
                    | SignalingMessage::MediaState { .. } => table.broadcast(&from, &message),
                    _ => {}
                }
            }
        });

        SignalingClient::from_channels(ROOM, id.clone(), out_tx, event_rx)
    }
}

// ---------------------------------------------------------------------------
// Transports

struct LoopbackSender {
    wire_id: String,
    kind: TrackKind,
    stream_id: String,
    current: watch::Sender<Option<MediaTrack>>,
}

/// One side of a link. Descriptions are JSON lists of the wire ids being sent;
/// applying the far side's description starts forwarding its frames here.
pub struct LoopbackTransport {
    local: ParticipantId,
    remote: ParticipantId,
    network: Arc<LoopbackNetwork>,
    events: TransportEvents,
    senders: Mutex<BTreeMap<u64, LoopbackSender>>,
    next_sender: AtomicU64,
    received: Mutex<HashMap<String, MediaTrack>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackTransport {
    fn description(&self) -> String {
        let wire_ids: Vec<String> = self
            .senders
            .lock()
            .unwrap()
            .values()
            .map(|s| s.wire_id.clone())
            .collect();
        serde_json::to_string(&wire_ids).unwrap()
    }

    fn apply(&self, sdp: &str) -> Result<()> {
        let wire_ids: Vec<String> = serde_json::from_str(sdp)?;
        let far = self
            .network
            .get(&self.remote, &self.local)
            .ok_or_else(|| Error::negotiation("far side of the link is gone"))?;

        let mut fresh = Vec::new();
        {
            let far_senders = far.senders.lock().unwrap();
            let mut received = self.received.lock().unwrap();
            for wire_id in wire_ids {
                if received.contains_key(&wire_id) {
                    continue;
                }
                let Some(sender) = far_senders.values().find(|s| s.wire_id == wire_id) else {
                    continue;
                };
                let track = MediaTrack::remote(sender.kind, wire_id.clone(), sender.stream_id.clone());
                tokio::spawn(forward(sender.current.subscribe(), track.clone()));
                received.insert(wire_id, track.clone());
                fresh.push(track);
            }
        }

        for track in fresh {
            let _ = self
                .events
                .send((self.remote.clone(), TransportEvent::RemoteTrack(track)));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            let candidate = IceCandidate {
                candidate: format!("candidate:loopback {}", self.local),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            };
            let _ = self
                .events
                .send((self.remote.clone(), TransportEvent::IceCandidate(candidate)));
            let _ = self.events.send((
                self.remote.clone(),
                TransportEvent::StateChanged(meshmeet::connection::TransportState::Connected),
            ));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn forward(mut source: watch::Receiver<Option<MediaTrack>>, sink: MediaTrack) {
    loop {
        let Some(track) = source.borrow_and_update().clone() else {
            return;
        };
        let mut frames = track.subscribe();
        loop {
            tokio::select! {
                _ = sink.ended() => return,
                changed = source.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                frame = frames.recv() => match frame {
                    Ok(frame) => sink.push(frame),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        if source.changed().await.is_err() {
                            return;
                        }
                        break;
                    }
                },
            }
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId> {
        let id = self.next_sender.fetch_add(1, Ordering::SeqCst);
        let (current, _) = watch::channel(Some(track.clone()));
        self.senders.lock().unwrap().insert(
            id,
            LoopbackSender {
                wire_id: track.id().to_string(),
                kind: track.kind(),
                stream_id: track.stream_id().to_string(),
                current,
            },
        );
        Ok(SenderId(id))
    }

    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<()> {
        let senders = self.senders.lock().unwrap();
        let slot = senders
            .get(&sender.0)
            .ok_or_else(|| Error::negotiation(format!("no {}", sender)))?;
        if slot.kind != track.kind() {
            return Err(Error::negotiation("replacement track has the wrong kind"));
        }
        slot.current.send_replace(Some(track.clone()));
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        if let Some(slot) = self.senders.lock().unwrap().remove(&sender.0) {
            slot.current.send_replace(None);
        }
        Ok(())
    }

    async fn create_offer(&self, _ice_restart: bool) -> Result<String> {
        Ok(self.description())
    }

    async fn handle_offer(&self, sdp: &str) -> Result<String> {
        self.apply(sdp)?;
        Ok(self.description())
    }

    async fn handle_answer(&self, sdp: &str) -> Result<()> {
        self.apply(sdp)
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Option<LinkStats> {
        Some(LinkStats {
            bandwidth_bps: Some(2_500_000.0),
            rtt_ms: Some(20.0),
            packet_loss_percent: Some(0.0),
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        for track in self.received.lock().unwrap().values() {
            track.stop();
        }
        for sender in self.senders.lock().unwrap().values() {
            sender.current.send_replace(None);
        }
        Ok(())
    }
}

/// Every loopback transport, keyed by (owner, far side).
#[derive(Default)]
pub struct LoopbackNetwork {
    transports: Mutex<HashMap<(ParticipantId, ParticipantId), Arc<LoopbackTransport>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, owner: &ParticipantId, remote: &ParticipantId) -> Option<Arc<LoopbackTransport>> {
        self.transports
            .lock()
            .unwrap()
            .get(&(owner.clone(), remote.clone()))
            .cloned()
    }

    pub fn factory(self: &Arc<Self>, owner: &ParticipantId) -> Arc<dyn TransportFactory> {
        Arc::new(LoopbackFactory {
            network: self.clone(),
            owner: owner.clone(),
        })
    }
}

struct LoopbackFactory {
    network: Arc<LoopbackNetwork>,
    owner: ParticipantId,
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        remote: &ParticipantId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(LoopbackTransport {
            local: self.owner.clone(),
            remote: remote.clone(),
            network: self.network.clone(),
            events,
            senders: Mutex::new(BTreeMap::new()),
            next_sender: AtomicU64::new(0),
            received: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.network
            .transports
            .lock()
            .unwrap()
            .insert((self.owner.clone(), remote.clone()), transport.clone());
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// Capture

/// Two cameras that render distinguishable patterns, one microphone, and a display.
pub struct FakeCapture;

#[async_trait]
impl CaptureBackend for FakeCapture {
    async fn enumerate(&self) -> std::result::Result<Vec<DeviceInfo>, CaptureError> {
        Ok(vec![
            DeviceInfo {
                id: "mic-1".into(),
                label: "Fake mic".into(),
                kind: DeviceKind::AudioInput,
            },
            DeviceInfo {
                id: "cam-x".into(),
                label: "Camera X".into(),
                kind: DeviceKind::VideoInput,
            },
            DeviceInfo {
                id: "cam-y".into(),
                label: "Camera Y".into(),
                kind: DeviceKind::VideoInput,
            },
        ])
    }

    async fn open_audio(
        &self,
        device_id: Option<&str>,
        stream_id: &str,
    ) -> std::result::Result<MediaTrack, CaptureError> {
        let device = device_id.unwrap_or("mic-1");
        if device != "mic-1" {
            return Err(CaptureError::DeviceMissing);
        }
        Ok(MediaTrack::local(
            TrackPurpose::Microphone,
            "Fake mic",
            stream_id,
            Some(device.to_string()),
        ))
    }

    async fn open_video(
        &self,
        device_id: Option<&str>,
        constraints: Option<VideoConstraints>,
        stream_id: &str,
    ) -> std::result::Result<MediaTrack, CaptureError> {
        let (label, seed) = match device_id.unwrap_or("cam-x") {
            "cam-x" => ("Camera X", CAM_X_SEED),
            "cam-y" => ("Camera Y", CAM_Y_SEED),
            _ => return Err(CaptureError::DeviceMissing),
        };
        let track = MediaTrack::local(
            TrackPurpose::Camera,
            label,
            stream_id,
            device_id.map(str::to_string),
        );
        track.apply_constraints(constraints.unwrap_or(VideoConstraints::new(32, 18, 30)));
        spawn_test_pattern(track.clone(), seed);
        Ok(track)
    }

    async fn open_display(&self, stream_id: &str) -> std::result::Result<LocalStream, CaptureError> {
        let track = MediaTrack::local(TrackPurpose::Screen, "Fake display", stream_id, None);
        track.apply_constraints(VideoConstraints::new(32, 18, 15));
        spawn_test_pattern(track.clone(), 128);
        let mut stream = LocalStream::new(stream_id);
        stream.video = Some(track);
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Uploads

/// Keeps every artifact it is handed.
#[derive(Default)]
pub struct DriveStub {
    pub uploads: Mutex<Vec<RecordingArtifact>>,
}

#[async_trait]
impl UploadCollaborator for DriveStub {
    async fn upload(&self, artifact: &RecordingArtifact, _access_token: &str) -> Result<UploadReceipt> {
        self.uploads.lock().unwrap().push(artifact.clone());
        Ok(UploadReceipt {
            link: format!("https://drive.example.com/{}", artifact.file_name),
        })
    }
}

// ---------------------------------------------------------------------------
// Conferences

pub struct Attendee {
    pub id: ParticipantId,
    pub handle: ConferenceHandle,
    pub updates: broadcast::Receiver<ConferenceUpdate>,
    pub task: JoinHandle<Result<()>>,
}

impl Attendee {
    pub async fn join(
        router: &Router,
        network: &Arc<LoopbackNetwork>,
        id: &str,
        is_host: bool,
    ) -> Self {
        Self::join_with_uploader(router, network, id, is_host, None).await
    }

    pub async fn join_with_uploader(
        router: &Router,
        network: &Arc<LoopbackNetwork>,
        id: &str,
        is_host: bool,
        uploader: Option<Arc<dyn UploadCollaborator>>,
    ) -> Self {
        let id = ParticipantId::from(id);
        let signaling = router.connect(&id, id.as_str(), is_host);
        let options = JoinOptions {
            room_id: ROOM.to_string(),
            participant_id: id.clone(),
            display_name: id.to_string(),
            is_host,
            max_participants: 8,
            devices: DeviceSelection::new("mic-1", "cam-x"),
        };
        let deps = ConferenceDeps {
            signaling,
            capture: Arc::new(FakeCapture),
            transports: network.factory(&id),
            uploader,
            config: small_config(),
        };
        let (conference, handle) = Conference::join(options, deps).await.unwrap();
        let updates = handle.subscribe();
        let task = tokio::spawn(conference.run());
        Self {
            id,
            handle,
            updates,
            task,
        }
    }

    /// Wait for an update matching `pred`, skipping the rest.
    pub async fn expect(&mut self, what: &str, pred: impl Fn(&ConferenceUpdate) -> bool) -> ConferenceUpdate {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let next = tokio::time::timeout_at(deadline, self.updates.recv()).await;
            match next {
                Ok(Ok(update)) if pred(&update) => return update,
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
                Ok(Err(RecvError::Closed)) => panic!("{}: updates closed while waiting for {}", self.id, what),
                Err(_) => panic!("{}: timed out waiting for {}", self.id, what),
            }
        }
    }

    /// Poll snapshots until `pred` holds.
    pub async fn eventually(&self, what: &str, pred: impl Fn(&ConferenceSnapshot) -> bool) -> ConferenceSnapshot {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let snapshot = self.handle.snapshot().await.unwrap();
            if pred(&snapshot) {
                return snapshot;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("{}: timed out waiting for {}: {:#?}", self.id, what, snapshot.links);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
