use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::chat::ChatMessage;
use crate::config::ReconnectPolicy;
use crate::error::{Error, Result};
use crate::media::TrackPurpose;
use crate::room::{ParticipantId, ParticipantInfo};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Announces what a sent track carries so the receiver never has to guess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTag {
    pub stream_id: String,
    pub track_id: String,
    pub purpose: TrackPurpose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Leave {
        room_id: String,
        participant_id: ParticipantId,
    },
    ParticipantJoined {
        #[serde(default)]
        room_id: String,
        participant_id: ParticipantId,
        display_name: String,
    },
    ParticipantLeft {
        #[serde(default)]
        room_id: String,
        participant_id: ParticipantId,
    },
    RoomState {
        room_id: String,
        #[serde(default)]
        host_id: Option<ParticipantId>,
        participants: Vec<ParticipantInfo>,
    },
    Offer {
        room_id: String,
        from_peer: ParticipantId,
        to_peer: ParticipantId,
        sdp: String,
        #[serde(default)]
        tracks: Vec<TrackTag>,
    },
    Answer {
        room_id: String,
        from_peer: ParticipantId,
        to_peer: ParticipantId,
        sdp: String,
        #[serde(default)]
        tracks: Vec<TrackTag>,
    },
    IceCandidate {
        room_id: String,
        from_peer: ParticipantId,
        to_peer: ParticipantId,
        candidate: IceCandidate,
    },
    ChatMessage {
        room_id: String,
        message: ChatMessage,
    },
    ScreenShareStarted {
        room_id: String,
        participant_id: ParticipantId,
    },
    ScreenShareStopped {
        room_id: String,
        participant_id: ParticipantId,
    },
    MediaState {
        room_id: String,
        participant_id: ParticipantId,
        video_enabled: bool,
        audio_enabled: bool,
    },
    ApprovalGranted {
        room_id: String,
    },
    RemoveParticipant {
        room_id: String,
        participant_id: ParticipantId,
    },
    RoomFull {
        room_id: String,
        max_participants: usize,
    },
    Error {
        message: String,
    },
}

/// Typed room event delivered to the conference.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft(ParticipantId),
    RoomState {
        host_id: Option<ParticipantId>,
        participants: Vec<ParticipantInfo>,
    },
    Offer {
        from: ParticipantId,
        sdp: String,
        tracks: Vec<TrackTag>,
    },
    Answer {
        from: ParticipantId,
        sdp: String,
        tracks: Vec<TrackTag>,
    },
    IceCandidate {
        from: ParticipantId,
        candidate: IceCandidate,
    },
    ChatMessage(ChatMessage),
    ScreenShareStarted(ParticipantId),
    ScreenShareStopped(ParticipantId),
    MediaState {
        participant_id: ParticipantId,
        video_enabled: bool,
        audio_enabled: bool,
    },
    ApprovalGranted,
    /// The host removed the local participant.
    Removed,
    RoomFull {
        max_participants: usize,
    },
    Error(String),
    Reconnecting {
        attempt: u32,
    },
    ConnectionRestored,
    /// Terminal: reconnection attempts are exhausted.
    ConnectionLost {
        attempts: u32,
    },
}

impl RoomEvent {
    /// Interpret an inbound message for `local`. Messages addressed to someone
    /// else, echoes of our own presence, and outbound-only variants yield `None`.
    pub fn from_message(message: SignalingMessage, local: &ParticipantId) -> Option<Self> {
        let event = match message {
            SignalingMessage::Leave { .. } => {
                debug!("ignoring echoed leave message");
                return None;
            }
            SignalingMessage::ParticipantJoined {
                participant_id,
                display_name,
                ..
            } => {
                if participant_id == *local {
                    return None;
                }
                RoomEvent::ParticipantJoined(ParticipantInfo {
                    participant_id,
                    display_name,
                })
            }
            SignalingMessage::ParticipantLeft { participant_id, .. } => {
                if participant_id == *local {
                    return None;
                }
                RoomEvent::ParticipantLeft(participant_id)
            }
            SignalingMessage::RoomState {
                host_id,
                participants,
                ..
            } => RoomEvent::RoomState {
                host_id,
                participants,
            },
            SignalingMessage::Offer {
                from_peer,
                to_peer,
                sdp,
                tracks,
                ..
            } => {
                if !addressed_to(&to_peer, local, "offer") {
                    return None;
                }
                RoomEvent::Offer {
                    from: from_peer,
                    sdp,
                    tracks,
                }
            }
            SignalingMessage::Answer {
                from_peer,
                to_peer,
                sdp,
                tracks,
                ..
            } => {
                if !addressed_to(&to_peer, local, "answer") {
                    return None;
                }
                RoomEvent::Answer {
                    from: from_peer,
                    sdp,
                    tracks,
                }
            }
            SignalingMessage::IceCandidate {
                from_peer,
                to_peer,
                candidate,
                ..
            } => {
                if !addressed_to(&to_peer, local, "ice candidate") {
                    return None;
                }
                RoomEvent::IceCandidate {
                    from: from_peer,
                    candidate,
                }
            }
            SignalingMessage::ChatMessage { message, .. } => RoomEvent::ChatMessage(message),
            SignalingMessage::ScreenShareStarted { participant_id, .. } => {
                if participant_id == *local {
                    return None;
                }
                RoomEvent::ScreenShareStarted(participant_id)
            }
            SignalingMessage::ScreenShareStopped { participant_id, .. } => {
                if participant_id == *local {
                    return None;
                }
                RoomEvent::ScreenShareStopped(participant_id)
            }
            SignalingMessage::MediaState {
                participant_id,
                video_enabled,
                audio_enabled,
                ..
            } => {
                if participant_id == *local {
                    return None;
                }
                RoomEvent::MediaState {
                    participant_id,
                    video_enabled,
                    audio_enabled,
                }
            }
            SignalingMessage::ApprovalGranted { .. } => RoomEvent::ApprovalGranted,
            SignalingMessage::RemoveParticipant { participant_id, .. } => {
                if participant_id == *local {
                    RoomEvent::Removed
                } else {
                    RoomEvent::ParticipantLeft(participant_id)
                }
            }
            SignalingMessage::RoomFull {
                max_participants, ..
            } => RoomEvent::RoomFull { max_participants },
            SignalingMessage::Error { message } => RoomEvent::Error(message),
        };
        Some(event)
    }
}

fn addressed_to(to: &ParticipantId, local: &ParticipantId, what: &str) -> bool {
    if to != local {
        debug!(to = %to, "dropping {} addressed to another participant", what);
        return false;
    }
    true
}

/// Parameters sent with the join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room_id: String,
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub is_host: bool,
    pub max_participants: usize,
}

impl JoinRequest {
    pub fn url(&self, base: &str) -> Result<Url> {
        let mut url = Url::parse(base)
            .map_err(|e| Error::config(format!("invalid signaling url {}: {}", base, e)))?;
        url.query_pairs_mut()
            .append_pair("roomId", &self.room_id)
            .append_pair("participantId", self.participant_id.as_str())
            .append_pair("displayName", &self.display_name)
            .append_pair("isHost", if self.is_host { "true" } else { "false" })
            .append_pair("maxParticipants", &self.max_participants.to_string());
        Ok(url)
    }
}

/// Cloneable outbound half of the signaling channel.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    room_id: String,
    local_id: ParticipantId,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl SignalingSender {
    pub fn new(
        room_id: impl Into<String>,
        local_id: ParticipantId,
        tx: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            local_id,
            tx,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn send(&self, message: SignalingMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::signaling("signaling channel is closed"))
    }

    pub fn offer(&self, to: &ParticipantId, sdp: String, tracks: Vec<TrackTag>) -> Result<()> {
        self.send(SignalingMessage::Offer {
            room_id: self.room_id.clone(),
            from_peer: self.local_id.clone(),
            to_peer: to.clone(),
            sdp,
            tracks,
        })
    }

    pub fn answer(&self, to: &ParticipantId, sdp: String, tracks: Vec<TrackTag>) -> Result<()> {
        self.send(SignalingMessage::Answer {
            room_id: self.room_id.clone(),
            from_peer: self.local_id.clone(),
            to_peer: to.clone(),
            sdp,
            tracks,
        })
    }

    pub fn ice_candidate(&self, to: &ParticipantId, candidate: IceCandidate) -> Result<()> {
        self.send(SignalingMessage::IceCandidate {
            room_id: self.room_id.clone(),
            from_peer: self.local_id.clone(),
            to_peer: to.clone(),
            candidate,
        })
    }

    pub fn chat(&self, message: ChatMessage) -> Result<()> {
        self.send(SignalingMessage::ChatMessage {
            room_id: self.room_id.clone(),
            message,
        })
    }

    pub fn screen_share(&self, started: bool) -> Result<()> {
        let room_id = self.room_id.clone();
        let participant_id = self.local_id.clone();
        self.send(if started {
            SignalingMessage::ScreenShareStarted {
                room_id,
                participant_id,
            }
        } else {
            SignalingMessage::ScreenShareStopped {
                room_id,
                participant_id,
            }
        })
    }

    pub fn media_state(&self, video_enabled: bool, audio_enabled: bool) -> Result<()> {
        self.send(SignalingMessage::MediaState {
            room_id: self.room_id.clone(),
            participant_id: self.local_id.clone(),
            video_enabled,
            audio_enabled,
        })
    }

    pub fn remove_participant(&self, participant_id: &ParticipantId) -> Result<()> {
        self.send(SignalingMessage::RemoveParticipant {
            room_id: self.room_id.clone(),
            participant_id: participant_id.clone(),
        })
    }

    pub fn leave(&self) -> Result<()> {
        self.send(SignalingMessage::Leave {
            room_id: self.room_id.clone(),
            participant_id: self.local_id.clone(),
        })
    }
}

pub struct SignalingClient {
    sender: SignalingSender,
    events: mpsc::UnboundedReceiver<RoomEvent>,
    driver: Option<JoinHandle<()>>,
}

impl SignalingClient {
    /// Join a room over WebSocket. The first connection attempt must succeed;
    /// later transport losses are retried according to `policy`.
    pub async fn connect(base_url: &str, join: JoinRequest, policy: ReconnectPolicy) -> Result<Self> {
        let url = join.url(base_url)?;
        let (ws, _) = connect_async(url.as_str()).await?;
        info!(room = %join.room_id, participant = %join.participant_id, "connected to signaling server");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let local_id = join.participant_id.clone();
        let driver = tokio::spawn(drive(ws, url, policy, out_rx, event_tx, local_id.clone()));

        Ok(Self {
            sender: SignalingSender::new(join.room_id, local_id, out_tx),
            events,
            driver: Some(driver),
        })
    }

    /// A client over in-process channels, for embedding behind another transport.
    pub fn from_channels(
        room_id: impl Into<String>,
        local_id: ParticipantId,
        outgoing: mpsc::UnboundedSender<SignalingMessage>,
        events: mpsc::UnboundedReceiver<RoomEvent>,
    ) -> Self {
        Self {
            sender: SignalingSender::new(room_id, local_id, outgoing),
            events,
            driver: None,
        }
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub fn send(&self, message: SignalingMessage) -> Result<()> {
        self.sender.send(message)
    }

    pub async fn receive(&mut self) -> Option<RoomEvent> {
        self.events.recv().await
    }

    /// Announce departure and shut the transport down.
    pub async fn disconnect(&mut self) {
        if let Err(e) = self.sender.leave() {
            debug!(error = %e, "leave not sent");
        }
        if let Some(driver) = self.driver.take() {
            let abort = driver.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), driver)
                .await
                .is_err()
            {
                warn!("signaling driver did not stop in time, aborting");
                abort.abort();
            }
        }
        self.events.close();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

enum SessionEnd {
    /// We left or the client went away.
    Closed,
    RoomFull,
    TransportLost(String),
}

async fn drive(
    mut ws: WsStream,
    url: Url,
    policy: ReconnectPolicy,
    mut outgoing: mpsc::UnboundedReceiver<SignalingMessage>,
    events: mpsc::UnboundedSender<RoomEvent>,
    local_id: ParticipantId,
) {
    loop {
        match pump(&mut ws, &mut outgoing, &events, &local_id).await {
            SessionEnd::Closed => {
                debug!("signaling session closed");
                return;
            }
            SessionEnd::RoomFull => {
                info!("room is full, not reconnecting");
                return;
            }
            SessionEnd::TransportLost(reason) => {
                warn!(%reason, "signaling transport lost");
            }
        }

        let mut attempt = 0;
        ws = loop {
            attempt += 1;
            if attempt > policy.max_attempts {
                let _ = events.send(RoomEvent::ConnectionLost {
                    attempts: policy.max_attempts,
                });
                return;
            }
            if events.send(RoomEvent::Reconnecting { attempt }).is_err() {
                return;
            }
            tokio::time::sleep(jittered(policy.delay_for(attempt))).await;
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => break ws,
                Err(e) => warn!(attempt, error = %e, "reconnection attempt failed"),
            }
        };
        info!(attempt, "signaling connection restored");
        if events.send(RoomEvent::ConnectionRestored).is_err() {
            return;
        }
    }
}

async fn pump(
    ws: &mut WsStream,
    outgoing: &mut mpsc::UnboundedReceiver<SignalingMessage>,
    events: &mpsc::UnboundedSender<RoomEvent>,
    local_id: &ParticipantId,
) -> SessionEnd {
    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(message) = message else {
                    let _ = ws.close(None).await;
                    return SessionEnd::Closed;
                };
                let leaving = matches!(message, SignalingMessage::Leave { .. });
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode signaling message");
                        continue;
                    }
                };
                if let Err(e) = ws.send(Message::Text(json)).await {
                    return SessionEnd::TransportLost(e.to_string());
                }
                if leaving {
                    let _ = ws.close(None).await;
                    return SessionEnd::Closed;
                }
            }
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<SignalingMessage>(&text) {
                        Ok(message) => {
                            let Some(event) = RoomEvent::from_message(message, local_id) else {
                                continue;
                            };
                            let full = matches!(event, RoomEvent::RoomFull { .. });
                            if events.send(event).is_err() {
                                return SessionEnd::Closed;
                            }
                            if full {
                                return SessionEnd::RoomFull;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed signaling message"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return SessionEnd::TransportLost(format!("closed by server: {:?}", frame));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::TransportLost(e.to_string()),
                None => return SessionEnd::TransportLost("stream ended".into()),
            }
        }
    }
}

/// Up to 20% extra delay so clients dropped together do not retry in lockstep.
fn jittered(delay: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.2);
    delay.mul_f64(factor)
}
