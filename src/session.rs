//! The conference: one task owns every component and reacts to signaling,
//! transport events, timers and user commands in arrival order.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::activity::AudioActivityDetector;
use crate::background::{VirtualBackgroundConfig, VirtualBackgroundProcessor};
use crate::chat::{ChatMessage, ChatRelay};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::media::{
    CaptureBackend, DeviceSelection, LocalStream, MediaDeviceController, MediaTrack, TrackKind,
    TrackPurpose, TrackReplacer, VideoConstraints,
};
use crate::metrics::{NetworkQualityMonitor, NetworkQualityReading};
use crate::peer::{
    LinkSnapshot, LinkState, PeerConnectionManager, PeerUpdate, TransportEvent, TransportFactory,
};
use crate::recording::{RecordingManager, UploadCollaborator, UploadReceipt};
use crate::room::{Participant, ParticipantId, ParticipantInfo, Room, ViewMode, ViewState};
use crate::screen::ScreenShareController;
use crate::signaling::{RoomEvent, SignalingClient};

const COMMAND_QUEUE: usize = 64;
const UPDATE_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub room_id: String,
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub is_host: bool,
    pub max_participants: usize,
    pub devices: DeviceSelection,
}

/// Collaborators a conference is built from.
pub struct ConferenceDeps {
    pub signaling: SignalingClient,
    pub capture: Arc<dyn CaptureBackend>,
    pub transports: Arc<dyn TransportFactory>,
    pub uploader: Option<Arc<dyn UploadCollaborator>>,
    pub config: Config,
}

/// Everything observers of a conference are told about.
#[derive(Debug, Clone)]
pub enum ConferenceUpdate {
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft(ParticipantId),
    TrackAdded {
        participant: ParticipantId,
        track: MediaTrack,
    },
    TrackRemoved {
        participant: ParticipantId,
        track: MediaTrack,
    },
    LinkState {
        participant: ParticipantId,
        state: LinkState,
    },
    Chat(ChatMessage),
    ScreenShare {
        participant: ParticipantId,
        active: bool,
    },
    /// The remote screen on display changed.
    PresentedScreen(Option<ParticipantId>),
    MediaState {
        participant: ParticipantId,
        video_enabled: bool,
        audio_enabled: bool,
    },
    ActiveSpeaker(Option<ParticipantId>),
    ViewMode(ViewMode),
    Quality(NetworkQualityReading),
    CaptureAdapted(VideoConstraints),
    /// The video track peers now receive from us.
    LocalVideo(MediaTrack),
    RecordingStarted,
    RecordingUploaded {
        link: String,
    },
    RecordingFailed {
        message: String,
    },
    ApprovalGranted,
    Reconnecting {
        attempt: u32,
    },
    ConnectionRestored,
    Notice(String),
    Removed,
    Fatal {
        message: String,
    },
    Left,
}

#[derive(Debug, Clone)]
pub struct ConferenceSnapshot {
    pub room_id: String,
    pub local_id: ParticipantId,
    pub host_id: Option<ParticipantId>,
    pub participants: Vec<Participant>,
    pub links: Vec<LinkSnapshot>,
    pub view: ViewState,
    pub quality: Option<NetworkQualityReading>,
    pub sharing_screen: bool,
    pub recording: bool,
    pub background: VirtualBackgroundConfig,
    pub local_tracks: Vec<MediaTrack>,
    pub chat: Vec<ChatMessage>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    SwitchDevices(DeviceSelection, Reply<LocalStream>),
    StartScreenShare(Reply<LocalStream>),
    StopScreenShare(Reply<bool>),
    SetBackground(VirtualBackgroundConfig, Reply<()>),
    StartRecording(String, Reply<()>),
    StopRecording(String, Reply<UploadReceipt>),
    SendChat(String, Reply<ChatMessage>),
    SetAudioEnabled(bool, Reply<()>),
    SetVideoEnabled(bool, Reply<()>),
    SetViewMode(ViewMode, Reply<()>),
    RemoveParticipant(ParticipantId, Reply<()>),
    Snapshot(Reply<ConferenceSnapshot>),
    Leave(Reply<()>),
}

/// Cloneable control surface for a running conference.
#[derive(Clone)]
pub struct ConferenceHandle {
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<ConferenceUpdate>,
}

impl ConferenceHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ConferenceUpdate> {
        self.updates.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn switch_devices(&self, selection: DeviceSelection) -> Result<LocalStream> {
        self.request(|r| Command::SwitchDevices(selection, r)).await
    }

    pub async fn start_screen_share(&self) -> Result<LocalStream> {
        self.request(Command::StartScreenShare).await
    }

    pub async fn stop_screen_share(&self) -> Result<bool> {
        self.request(Command::StopScreenShare).await
    }

    pub async fn set_background(&self, config: VirtualBackgroundConfig) -> Result<()> {
        self.request(|r| Command::SetBackground(config, r)).await
    }

    pub async fn start_recording(&self, drive_token: impl Into<String>) -> Result<()> {
        let token = drive_token.into();
        self.request(|r| Command::StartRecording(token, r)).await
    }

    pub async fn stop_recording(&self, title: impl Into<String>) -> Result<UploadReceipt> {
        let title = title.into();
        self.request(|r| Command::StopRecording(title, r)).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<ChatMessage> {
        let text = text.into();
        self.request(|r| Command::SendChat(text, r)).await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|r| Command::SetAudioEnabled(enabled, r)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|r| Command::SetVideoEnabled(enabled, r)).await
    }

    pub async fn set_view_mode(&self, mode: ViewMode) -> Result<()> {
        self.request(|r| Command::SetViewMode(mode, r)).await
    }

    pub async fn remove_participant(&self, participant: ParticipantId) -> Result<()> {
        self.request(|r| Command::RemoveParticipant(participant, r)).await
    }

    pub async fn snapshot(&self) -> Result<ConferenceSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Leave and wait for teardown to finish.
    pub async fn leave(&self) -> Result<()> {
        self.request(Command::Leave).await
    }
}

pub struct Conference {
    room: Room,
    view: ViewState,
    signaling: SignalingClient,
    peers: PeerConnectionManager,
    transport_events: mpsc::UnboundedReceiver<(ParticipantId, TransportEvent)>,
    devices: MediaDeviceController,
    screen: ScreenShareController,
    screen_ended: mpsc::UnboundedReceiver<u64>,
    background: VirtualBackgroundProcessor,
    quality: NetworkQualityMonitor,
    activity: AudioActivityDetector,
    recording: RecordingManager,
    chat: ChatRelay,
    quality_timer: Option<Interval>,
    speaking_timer: Option<Interval>,
    commands: mpsc::Receiver<Command>,
    updates: broadcast::Sender<ConferenceUpdate>,
    closed: bool,
}

impl Conference {
    /// Acquire local media and wire every component together. Nothing runs
    /// until [`Conference::run`] is polled.
    pub async fn join(options: JoinOptions, deps: ConferenceDeps) -> Result<(Self, ConferenceHandle)> {
        let ConferenceDeps {
            mut signaling,
            capture,
            transports,
            uploader,
            config,
        } = deps;
        config.validate()?;
        let local_id = options.participant_id.clone();

        let devices = MediaDeviceController::new(
            capture.clone(),
            format!("{}-camera", local_id),
            config.capture.ideal,
        );
        let stream = match devices.acquire(options.devices.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "could not open local media, leaving the room");
                signaling.disconnect().await;
                return Err(e);
            }
        };

        let sender = signaling.sender();
        let (mut peers, transport_events) =
            PeerConnectionManager::new(local_id.clone(), transports, sender.clone());
        peers.set_local_stream(&stream);

        let mut activity = AudioActivityDetector::new(config.speaking.clone());
        if let Some(mic) = &stream.audio {
            activity.track(&local_id, mic);
        }

        let (ended_tx, screen_ended) = mpsc::unbounded_channel();
        let screen = ScreenShareController::new(
            capture,
            sender.clone(),
            format!("{}-screen", local_id),
            ended_tx,
        );

        let mut local = Participant::new(local_id.clone(), options.display_name.clone(), true);
        local.audio_enabled = stream.audio.is_some();
        local.video_enabled = stream.video.is_some();
        let room = Room::new(
            options.room_id.clone(),
            local,
            options.is_host,
            options.max_participants,
        );

        let start = tokio::time::Instant::now();
        let mut quality_timer = interval_at(start + config.quality_interval(), config.quality_interval());
        quality_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut speaking_timer =
            interval_at(start + config.speaking_interval(), config.speaking_interval());
        speaking_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (updates, _) = broadcast::channel(UPDATE_QUEUE);
        info!(room = %options.room_id, participant = %local_id, host = options.is_host, "joined conference");

        let conference = Self {
            room,
            view: ViewState::default(),
            signaling,
            peers,
            transport_events,
            devices,
            screen,
            screen_ended,
            background: VirtualBackgroundProcessor::new(&config.background),
            quality: NetworkQualityMonitor::new(config.capture.clone(), &config.quality),
            activity,
            recording: RecordingManager::new(options.is_host, uploader)
                .with_limit(config.upload.max_recording_bytes()),
            chat: ChatRelay::new(local_id, options.display_name, sender),
            quality_timer: Some(quality_timer),
            speaking_timer: Some(speaking_timer),
            commands,
            updates: updates.clone(),
            closed: false,
        };
        let handle = ConferenceHandle {
            commands: command_tx,
            updates,
        };
        Ok((conference, handle))
    }

    /// Drive the conference until we leave or a fatal condition ends it.
    pub async fn run(mut self) -> Result<()> {
        let outcome = loop {
            let step = tokio::select! {
                event = self.signaling.receive() => match event {
                    Some(event) => self.on_room_event(event).await,
                    None => Step::Exit(Err(Error::signaling("signaling channel closed"))),
                },
                Some((from, event)) = self.transport_events.recv() => {
                    self.peers.handle_transport_event(&from, event).await;
                    Step::Continue
                }
                Some(share) = self.screen_ended.recv() => {
                    if self.screen.is_current(share) {
                        debug!(share, "screen share ended outside the app");
                        self.stop_screen_share().await;
                    } else {
                        debug!(share, "ignoring end of an earlier screen share");
                    }
                    Step::Continue
                }
                _ = self.recording.overflowed() => {
                    let error = self.recording.discard_overflowed();
                    warn!(error = %error, "recording stopped");
                    self.publish(ConferenceUpdate::RecordingFailed {
                        message: error.user_message(),
                    });
                    Step::Continue
                }
                _ = tick(&mut self.quality_timer) => {
                    self.sample_quality().await;
                    Step::Continue
                }
                _ = tick(&mut self.speaking_timer) => {
                    self.check_speaking();
                    Step::Continue
                }
                command = self.commands.recv() => match command {
                    Some(Command::Leave(reply)) => Step::Leave(Some(reply)),
                    Some(command) => {
                        self.on_command(command).await;
                        Step::Continue
                    }
                    None => Step::Leave(None),
                },
            };
            self.flush_peer_updates();
            match step {
                Step::Continue => {}
                Step::Leave(reply) => {
                    info!("leaving conference");
                    self.teardown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                    break Ok(());
                }
                Step::Exit(outcome) => break outcome,
            }
        };
        self.teardown().await;
        outcome
    }

    async fn on_room_event(&mut self, event: RoomEvent) -> Step {
        match event {
            RoomEvent::ParticipantJoined(info) => {
                self.admit(&info);
                if let Err(e) = self.peers.handle_participant_joined(&info.participant_id).await {
                    warn!(participant = %info.participant_id, error = %e, "could not open peer link");
                }
                let local = self.room.local();
                if !local.video_enabled || !local.audio_enabled {
                    let (video, audio) = (local.video_enabled, local.audio_enabled);
                    if let Err(e) = self.signaling.sender().media_state(video, audio) {
                        debug!(error = %e, "media state not sent");
                    }
                }
            }
            RoomEvent::RoomState {
                host_id,
                participants,
            } => {
                if let Some(host) = host_id {
                    self.room.set_host(host);
                }
                for info in participants {
                    if info.participant_id != *self.room.local_id() {
                        self.admit(&info);
                    }
                }
            }
            RoomEvent::ParticipantLeft(id) => self.on_participant_left(&id).await,
            RoomEvent::Offer { from, sdp, tracks } => {
                if self.room.participant(&from).is_none() {
                    self.admit(&ParticipantInfo {
                        participant_id: from.clone(),
                        display_name: from.to_string(),
                    });
                }
                if let Err(e) = self.peers.handle_offer(&from, &sdp, tracks).await {
                    warn!(participant = %from, error = %e, "failed to answer offer");
                }
            }
            RoomEvent::Answer { from, sdp, tracks } => {
                if let Err(e) = self.peers.handle_answer(&from, &sdp, tracks).await {
                    warn!(participant = %from, error = %e, "failed to apply answer");
                }
            }
            RoomEvent::IceCandidate { from, candidate } => {
                if let Err(e) = self.peers.handle_ice_candidate(&from, candidate).await {
                    debug!(participant = %from, error = %e, "ice candidate rejected");
                }
            }
            RoomEvent::ChatMessage(message) => {
                if self.chat.receive(message.clone()) {
                    self.publish(ConferenceUpdate::Chat(message));
                }
            }
            RoomEvent::ScreenShareStarted(id) => {
                self.room.set_screen_sharing(&id, true);
                self.publish(ConferenceUpdate::ScreenShare {
                    participant: id.clone(),
                    active: true,
                });
                self.present_screen(id);
            }
            RoomEvent::ScreenShareStopped(id) => {
                self.room.set_screen_sharing(&id, false);
                self.publish(ConferenceUpdate::ScreenShare {
                    participant: id.clone(),
                    active: false,
                });
                if self.view.screen_stopped(&id) {
                    self.publish(ConferenceUpdate::PresentedScreen(None));
                }
            }
            RoomEvent::MediaState {
                participant_id,
                video_enabled,
                audio_enabled,
            } => {
                if self
                    .room
                    .set_media_state(&participant_id, video_enabled, audio_enabled)
                {
                    self.publish(ConferenceUpdate::MediaState {
                        participant: participant_id,
                        video_enabled,
                        audio_enabled,
                    });
                }
            }
            RoomEvent::ApprovalGranted => self.publish(ConferenceUpdate::ApprovalGranted),
            RoomEvent::Removed => {
                info!("removed from the room by the host");
                self.publish(ConferenceUpdate::Removed);
                return Step::Exit(Ok(()));
            }
            RoomEvent::RoomFull { max_participants } => {
                let error = Error::RoomFull {
                    room_id: self.room.id.clone(),
                    max_participants,
                };
                return self.fatal(error);
            }
            RoomEvent::Error(message) => {
                warn!(%message, "signaling server reported an error");
                self.publish(ConferenceUpdate::Notice(message));
            }
            RoomEvent::Reconnecting { attempt } => {
                self.publish(ConferenceUpdate::Reconnecting { attempt })
            }
            RoomEvent::ConnectionRestored => self.publish(ConferenceUpdate::ConnectionRestored),
            RoomEvent::ConnectionLost { attempts } => {
                return self.fatal(Error::ConnectionLost { attempts });
            }
        }
        Step::Continue
    }

    fn fatal(&mut self, error: Error) -> Step {
        warn!(error = %error, "conference cannot continue");
        self.publish(ConferenceUpdate::Fatal {
            message: error.user_message(),
        });
        Step::Exit(Err(error))
    }

    fn admit(&mut self, info: &ParticipantInfo) {
        let participant = Participant::new(
            info.participant_id.clone(),
            info.display_name.clone(),
            false,
        );
        match self.room.add_participant(participant) {
            Ok(true) => {
                info!(participant = %info.participant_id, name = %info.display_name, "participant joined");
                self.publish(ConferenceUpdate::ParticipantJoined(info.clone()));
            }
            Ok(false) => {}
            Err(e) => warn!(participant = %info.participant_id, error = %e, "roster over capacity"),
        }
    }

    async fn on_participant_left(&mut self, id: &ParticipantId) {
        let known = self.room.remove_participant(id).is_some();
        let had_link = self.peers.handle_participant_left(id).await;
        if self.activity.untrack(id) {
            self.publish(ConferenceUpdate::ActiveSpeaker(None));
        }
        let was_presented = self.view.presented_screen() == Some(id);
        self.view.participant_left(id);
        if was_presented {
            self.publish(ConferenceUpdate::PresentedScreen(None));
        }
        if known || had_link {
            info!(participant = %id, "participant left");
            self.publish(ConferenceUpdate::ParticipantLeft(id.clone()));
        }
    }

    fn present_screen(&mut self, id: ParticipantId) {
        if self.view.presented_screen() == Some(&id) {
            return;
        }
        if let Some(previous) = self.view.present_screen(id.clone()) {
            info!(previous = %previous, current = %id, "newer screen share replaces the one on display");
        }
        self.publish(ConferenceUpdate::PresentedScreen(Some(id)));
    }

    fn flush_peer_updates(&mut self) {
        for update in self.peers.take_updates() {
            match update {
                PeerUpdate::TrackAdded { participant, track } => {
                    match track.purpose() {
                        TrackPurpose::Microphone => self.activity.track(&participant, &track),
                        TrackPurpose::Screen => {
                            self.room.set_screen_sharing(&participant, true);
                            self.present_screen(participant.clone());
                        }
                        _ => {}
                    }
                    self.recording.attach_track(&participant, &track);
                    self.publish(ConferenceUpdate::TrackAdded { participant, track });
                }
                PeerUpdate::TrackRemoved { participant, track } => {
                    if track.purpose() == TrackPurpose::Screen {
                        self.room.set_screen_sharing(&participant, false);
                        if self.view.screen_stopped(&participant) {
                            self.publish(ConferenceUpdate::PresentedScreen(None));
                        }
                    }
                    self.publish(ConferenceUpdate::TrackRemoved { participant, track });
                }
                PeerUpdate::LinkStateChanged { participant, state } => {
                    self.publish(ConferenceUpdate::LinkState { participant, state });
                }
            }
        }
    }

    async fn sample_quality(&mut self) {
        let samples = self.peers.collect_stats().await;
        let Some((reading, adapted)) = self.quality.record(&samples) else {
            return;
        };
        self.publish(ConferenceUpdate::Quality(reading));
        if let Some(constraints) = adapted {
            self.devices.apply_video_constraints(constraints);
            if let Some(output) = self.background.output() {
                output.apply_constraints(constraints);
            }
            self.publish(ConferenceUpdate::CaptureAdapted(constraints));
        }
    }

    fn check_speaking(&mut self) {
        if !self.activity.check(Instant::now()) {
            return;
        }
        let speaker = self.activity.active_speaker().cloned();
        self.view.set_active_speaker(speaker.clone());
        self.publish(ConferenceUpdate::ActiveSpeaker(speaker));
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SwitchDevices(selection, reply) => {
                let _ = reply.send(self.switch_devices(selection).await);
            }
            Command::StartScreenShare(reply) => {
                let _ = reply.send(self.start_screen_share().await);
            }
            Command::StopScreenShare(reply) => {
                let _ = reply.send(Ok(self.stop_screen_share().await));
            }
            Command::SetBackground(config, reply) => {
                let _ = reply.send(self.set_background(config).await);
            }
            Command::StartRecording(token, reply) => {
                let _ = reply.send(self.start_recording(&token));
            }
            Command::StopRecording(title, reply) => {
                let _ = reply.send(self.stop_recording(&title).await);
            }
            Command::SendChat(text, reply) => {
                let sent = self.chat.send(&text);
                if let Ok(message) = &sent {
                    self.publish(ConferenceUpdate::Chat(message.clone()));
                }
                let _ = reply.send(sent);
            }
            Command::SetAudioEnabled(enabled, reply) => {
                let _ = reply.send(self.set_local_media(TrackKind::Audio, enabled));
            }
            Command::SetVideoEnabled(enabled, reply) => {
                let _ = reply.send(self.set_local_media(TrackKind::Video, enabled));
            }
            Command::SetViewMode(mode, reply) => {
                if self.view.set_mode(mode) {
                    self.publish(ConferenceUpdate::ViewMode(mode));
                }
                let _ = reply.send(Ok(()));
            }
            Command::RemoveParticipant(id, reply) => {
                let _ = reply.send(self.remove_participant(&id).await);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::Leave(reply) => {
                // Handled by the run loop.
                let _ = reply.send(Err(Error::Closed));
            }
        }
    }

    async fn switch_devices(&mut self, selection: DeviceSelection) -> Result<LocalStream> {
        let mut senders = LocalSenders {
            local_id: self.room.local_id(),
            peers: &mut self.peers,
            background: &mut self.background,
            activity: &mut self.activity,
        };
        let stream = self.devices.switch(selection, &mut senders).await?;
        let (video, audio) = (stream.video.is_some(), stream.audio.is_some());
        let local = self.room.local_id().clone();
        self.room.set_media_state(&local, video, audio);
        self.record_local_tracks();
        Ok(stream)
    }

    /// Attach whatever we currently send to an in-progress recording.
    fn record_local_tracks(&mut self) {
        if !self.recording.is_recording() {
            return;
        }
        let local = self.room.local_id().clone();
        for track in self.peers.local_tracks() {
            self.recording.attach_track(&local, track);
        }
    }

    async fn start_screen_share(&mut self) -> Result<LocalStream> {
        let stream = self.screen.start(&mut self.peers).await?;
        let local = self.room.local_id().clone();
        self.room.set_screen_sharing(&local, true);
        self.record_local_tracks();
        self.publish(ConferenceUpdate::ScreenShare {
            participant: local,
            active: true,
        });
        Ok(stream)
    }

    async fn stop_screen_share(&mut self) -> bool {
        if !self.screen.stop(&mut self.peers).await {
            return false;
        }
        let local = self.room.local_id().clone();
        self.room.set_screen_sharing(&local, false);
        self.publish(ConferenceUpdate::ScreenShare {
            participant: local,
            active: false,
        });
        true
    }

    /// Peers always hold a live camera track: the processed output goes on
    /// before the raw camera comes off, and the other way round.
    async fn set_background(&mut self, config: VirtualBackgroundConfig) -> Result<()> {
        self.background.set_config(config.clone())?;
        let camera = self.devices.current().and_then(|stream| stream.video);

        match (config.is_active(), self.background.is_running()) {
            (true, false) => {
                let camera = camera.ok_or_else(|| Error::media("no camera to apply a background to"))?;
                let output = self.background.start(&camera);
                output.set_enabled(camera.is_enabled());
                if let Err(e) = self.peers.replace_local_track(&camera, &output).await {
                    if let Err(e) = self.peers.replace_local_track(&output, &camera).await {
                        warn!(error = %e, "could not restore the camera after a failed background switch");
                    }
                    self.background.stop();
                    return Err(e);
                }
                self.record_local_tracks();
                self.publish(ConferenceUpdate::LocalVideo(output));
            }
            (false, true) => {
                if let (Some(camera), Some(output)) = (camera, self.background.output().cloned()) {
                    if let Err(e) = self.peers.replace_local_track(&output, &camera).await {
                        warn!(error = %e, "could not restore the camera on every link");
                    }
                    self.record_local_tracks();
                    self.publish(ConferenceUpdate::LocalVideo(camera));
                }
                self.background.stop();
            }
            _ => {}
        }
        Ok(())
    }

    fn start_recording(&mut self, token: &str) -> Result<()> {
        self.recording.set_host(self.room.is_local_host());
        let local = self.room.local_id().clone();
        let mut tracks: Vec<(ParticipantId, MediaTrack)> = self
            .peers
            .local_tracks()
            .iter()
            .map(|track| (local.clone(), track.clone()))
            .collect();
        tracks.extend(self.peers.remote_tracks());
        self.recording.start(token, tracks)?;
        self.publish(ConferenceUpdate::RecordingStarted);
        Ok(())
    }

    async fn stop_recording(&mut self, title: &str) -> Result<UploadReceipt> {
        let room_id = self.room.id.clone();
        match self.recording.stop(&room_id, title).await {
            Ok(receipt) => {
                self.publish(ConferenceUpdate::RecordingUploaded {
                    link: receipt.link.clone(),
                });
                Ok(receipt)
            }
            Err(e) => {
                warn!(error = %e, "recording upload failed");
                self.publish(ConferenceUpdate::RecordingFailed {
                    message: e.user_message(),
                });
                Err(e)
            }
        }
    }

    fn set_local_media(&mut self, kind: TrackKind, enabled: bool) -> Result<()> {
        let applied = match kind {
            TrackKind::Audio => self.devices.set_audio_enabled(enabled),
            TrackKind::Video => self.devices.set_video_enabled(enabled),
        };
        if !applied {
            return Err(Error::media(format!("no local {} track", kind)));
        }
        if kind == TrackKind::Video {
            if let Some(output) = self.background.output() {
                output.set_enabled(enabled);
            }
        }

        let local = self.room.local_id().clone();
        let (mut video, mut audio) = {
            let participant = self.room.local();
            (participant.video_enabled, participant.audio_enabled)
        };
        match kind {
            TrackKind::Audio => audio = enabled,
            TrackKind::Video => video = enabled,
        }
        self.room.set_media_state(&local, video, audio);
        if let Err(e) = self.signaling.sender().media_state(video, audio) {
            warn!(error = %e, "could not announce media state");
        }
        self.publish(ConferenceUpdate::MediaState {
            participant: local,
            video_enabled: video,
            audio_enabled: audio,
        });
        Ok(())
    }

    async fn remove_participant(&mut self, id: &ParticipantId) -> Result<()> {
        if !self.room.is_local_host() {
            return Err(Error::NotPermitted(
                "only the host can remove participants".into(),
            ));
        }
        if id == self.room.local_id() {
            return Err(Error::NotPermitted("the host cannot remove themselves".into()));
        }
        if self.room.participant(id).is_none() {
            return Err(Error::UnknownPeer(id.to_string()));
        }
        self.signaling.sender().remove_participant(id)?;
        self.on_participant_left(id).await;
        Ok(())
    }

    fn snapshot(&self) -> ConferenceSnapshot {
        let mut participants: Vec<Participant> = self.room.participants().cloned().collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        ConferenceSnapshot {
            room_id: self.room.id.clone(),
            local_id: self.room.local_id().clone(),
            host_id: self.room.host_id().cloned(),
            participants,
            links: self.peers.snapshot(),
            view: self.view.clone(),
            quality: self.quality.latest(),
            sharing_screen: self.screen.is_sharing(),
            recording: self.recording.is_recording(),
            background: self.background.config(),
            local_tracks: self.peers.local_tracks().to_vec(),
            chat: self.chat.history().cloned().collect(),
        }
    }

    /// Best-effort, ordered shutdown. Safe to call more than once.
    async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.recording.discard() {
            info!("in-progress recording discarded on leave");
        }
        self.signaling.disconnect().await;
        let closed = self.peers.close_all().await;
        debug!(links = closed, "peer links closed");
        self.screen.shutdown();
        self.devices.stop();
        self.quality_timer = None;
        self.speaking_timer = None;
        self.activity.stop();
        self.background.stop();

        self.publish(ConferenceUpdate::Left);
        info!(room = %self.room.id, "conference closed");
    }

    fn publish(&self, update: ConferenceUpdate) {
        // Nobody listening is fine.
        let _ = self.updates.send(update);
    }
}

enum Step {
    Continue,
    Leave(Option<Reply<()>>),
    Exit(Result<()>),
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Hands a device switch to whoever currently sends each kind: the background
/// loop for video while it runs, otherwise the peer links directly.
struct LocalSenders<'a> {
    local_id: &'a ParticipantId,
    peers: &'a mut PeerConnectionManager,
    background: &'a mut VirtualBackgroundProcessor,
    activity: &'a mut AudioActivityDetector,
}

#[async_trait]
impl TrackReplacer for LocalSenders<'_> {
    async fn replace_track(&mut self, old: &MediaTrack, new: &MediaTrack) -> Result<()> {
        if new.kind() == TrackKind::Video && self.background.is_running() {
            self.background.set_source(new);
            return Ok(());
        }
        self.peers.replace_local_track(old, new).await?;
        if new.kind() == TrackKind::Audio {
            self.activity.track(self.local_id, new);
        }
        Ok(())
    }

    async fn add_track(&mut self, track: &MediaTrack) -> Result<()> {
        self.peers.add_local_track(track).await?;
        if track.kind() == TrackKind::Audio {
            self.activity.track(self.local_id, track);
        }
        Ok(())
    }

    async fn remove_track(&mut self, track: &MediaTrack) -> Result<()> {
        if track.kind() == TrackKind::Audio {
            self.activity.untrack(self.local_id);
        }
        self.peers.remove_local_tracks(std::slice::from_ref(track)).await
    }
}
