use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceServerConfig;
use crate::error::{Error, Result};
use crate::media::{
    split_for_wire, FrameCodec, MediaFrame, MediaTrack, TrackKind, WireCodec, MAX_VIDEO_PAYLOAD,
};
use crate::metrics::LinkStats;
use crate::peer::{PeerTransport, SenderId, TransportEvent, TransportEvents, TransportFactory};
use crate::room::ParticipantId;
use crate::signaling::IceCandidate;

const VIDEO_CLOCK_RATE: u32 = 90_000;
const AUDIO_CLOCK_RATE: u32 = 48_000;
/// Outbound MTU used by `TrackLocalStaticSample`.
const RTP_MTU: usize = 1200;
const RTP_HEADER: usize = 12;
const VP8_DESCRIPTOR: usize = 1;
/// Packets in the largest video payload.
const MAX_VIDEO_PACKETS: usize = MAX_VIDEO_PAYLOAD.div_ceil(RTP_MTU - RTP_HEADER - VP8_DESCRIPTOR);
/// The VP8 depacketizer rejects packets shorter than this.
const MIN_VP8_PACKET: usize = 4;
/// Reassembly window: a whole frame plus the next one's head must fit.
const MAX_LATE_PACKETS: u16 = (MAX_VIDEO_PACKETS * 2) as u16;

/// Builds webrtc-rs peer connections sharing one configured API.
pub struct RtcTransportFactory {
    api: API,
    config: RTCConfiguration,
    codec: Arc<dyn FrameCodec>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self> {
        Self::with_codec(ice_servers, Arc::new(WireCodec))
    }

    pub fn with_codec(ice_servers: &[IceServerConfig], codec: Arc<dyn FrameCodec>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        Ok(Self { api, config, codec })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        remote: &ParticipantId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        let ice_events = events.clone();
        let ice_remote = remote.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            let remote = ice_remote.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send((
                            remote,
                            TransportEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }),
                        ));
                    }
                    Err(e) => warn!(participant = %remote, error = %e, "failed to serialize ice candidate"),
                }
            })
        }));

        let state_events = events.clone();
        let state_remote = remote.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events = state_events.clone();
            let remote = state_remote.clone();
            Box::pin(async move {
                debug!(participant = %remote, state = %s, "peer connection state changed");
                let _ = events.send((remote, TransportEvent::StateChanged(s.into())));
            })
        }));

        let track_events = events;
        let track_remote = remote.clone();
        let codec = self.codec.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                let remote = track_remote.clone();
                let codec = codec.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => TrackKind::Video,
                    };
                    let media = MediaTrack::remote(kind, track.id(), track.stream_id());
                    info!(participant = %remote, track = %media.id(), %kind, "remote track received");
                    let _ = events.send((remote, TransportEvent::RemoteTrack(media.clone())));
                    tokio::spawn(async move {
                        match kind {
                            TrackKind::Audio => read_remote(track, media, codec, audio_builder()).await,
                            TrackKind::Video => read_remote(track, media, codec, video_builder()).await,
                        }
                    });
                })
            },
        ));

        Ok(Arc::new(RtcPeerTransport {
            remote: remote.clone(),
            pc,
            codec: self.codec.clone(),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(0),
        }))
    }
}

struct RtcSender {
    rtp_sender: Arc<RTCRtpSender>,
    kind: TrackKind,
    /// Id announced to the peer; replacement tracks reuse it.
    wire_id: String,
    stream_id: String,
    pump: JoinHandle<()>,
}

pub struct RtcPeerTransport {
    remote: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    codec: Arc<dyn FrameCodec>,
    senders: Mutex<HashMap<SenderId, RtcSender>>,
    next_sender: AtomicU64,
}

impl RtcPeerTransport {
    fn senders(&self) -> std::sync::MutexGuard<'_, HashMap<SenderId, RtcSender>> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn capability(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: AUDIO_CLOCK_RATE,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: VIDEO_CLOCK_RATE,
            ..Default::default()
        },
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId> {
        let local = Arc::new(TrackLocalStaticSample::new(
            capability(track.kind()),
            track.id().to_owned(),
            track.stream_id().to_owned(),
        ));
        let rtp_sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be read for the interceptors to work.
        let rtcp_sender = rtp_sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        let pump = spawn_pump(track.clone(), local, self.codec.clone());
        self.senders().insert(
            id,
            RtcSender {
                rtp_sender,
                kind: track.kind(),
                wire_id: track.id().to_owned(),
                stream_id: track.stream_id().to_owned(),
                pump,
            },
        );
        debug!(participant = %self.remote, %id, track = %track.id(), "sender added");
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<()> {
        let (rtp_sender, wire_id, stream_id) = {
            let senders = self.senders();
            let entry = senders
                .get(&sender)
                .ok_or_else(|| Error::negotiation(format!("unknown {}", sender)))?;
            if entry.kind != track.kind() {
                return Err(Error::negotiation(format!(
                    "cannot put a {} track on a {} sender",
                    track.kind(),
                    entry.kind
                )));
            }
            (
                entry.rtp_sender.clone(),
                entry.wire_id.clone(),
                entry.stream_id.clone(),
            )
        };

        let local = Arc::new(TrackLocalStaticSample::new(
            capability(track.kind()),
            wire_id,
            stream_id,
        ));
        rtp_sender
            .replace_track(Some(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>))
            .await?;

        let pump = spawn_pump(track.clone(), local, self.codec.clone());
        if let Some(entry) = self.senders().get_mut(&sender) {
            entry.pump.abort();
            entry.pump = pump;
        }
        debug!(participant = %self.remote, %sender, track = %track.id(), "sender track replaced");
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let Some(entry) = self.senders().remove(&sender) else {
            return Ok(());
        };
        entry.pump.abort();
        self.pc.remove_track(&entry.rtp_sender).await?;
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_string(&offer)?)
    }

    async fn handle_offer(&self, sdp: &str) -> Result<String> {
        let offer: RTCSessionDescription = serde_json::from_str(sdp)?;
        self.pc.set_remote_description(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(serde_json::to_string(&answer)?)
    }

    async fn handle_answer(&self, sdp: &str) -> Result<()> {
        let answer: RTCSessionDescription = serde_json::from_str(sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let rollback: RTCSessionDescription =
            serde_json::from_str(r#"{"type":"rollback","sdp":""}"#)?;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Option<LinkStats> {
        let report = self.pc.get_stats().await;
        let mut summary = StatsSummary::default();
        for stat in report.reports.values() {
            match stat {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    summary.available_outgoing_bps.push(pair.available_outgoing_bitrate);
                    summary.pair_rtt_ms.push(pair.current_round_trip_time * 1000.0);
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    if let Some(seconds) = remote.round_trip_time {
                        summary.rtt_ms.push(seconds * 1000.0);
                    }
                    summary.loss_percent.push(remote.fraction_lost * 100.0);
                }
                _ => {}
            }
        }
        summary.into_link_stats()
    }

    async fn close(&self) -> Result<()> {
        for (_, sender) in self.senders().drain() {
            sender.pump.abort();
        }
        self.pc.close().await?;
        Ok(())
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Raw readings from one stats report.
///
/// Bandwidth comes only from the congestion controller's estimate; what we
/// happen to be sending says nothing about what the path could carry. A zero
/// estimate means none was made.
#[derive(Debug, Default)]
struct StatsSummary {
    available_outgoing_bps: Vec<f64>,
    rtt_ms: Vec<f64>,
    pair_rtt_ms: Vec<f64>,
    loss_percent: Vec<f64>,
}

impl StatsSummary {
    fn into_link_stats(mut self) -> Option<LinkStats> {
        self.available_outgoing_bps.retain(|bps| *bps > 0.0);
        self.pair_rtt_ms.retain(|ms| *ms > 0.0);
        let rtt_ms = mean(&self.rtt_ms).or_else(|| mean(&self.pair_rtt_ms));
        let stats = LinkStats {
            bandwidth_bps: mean(&self.available_outgoing_bps),
            rtt_ms,
            packet_loss_percent: mean(&self.loss_percent),
        };
        (!stats.is_empty()).then_some(stats)
    }
}

/// Feed a local track's frames into a webrtc sample track until either ends.
fn spawn_pump(
    track: MediaTrack,
    local: Arc<TrackLocalStaticSample>,
    codec: Arc<dyn FrameCodec>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut frames = track.subscribe();
        let mut last_video: Option<Duration> = None;
        loop {
            let frame = tokio::select! {
                _ = track.ended() => break,
                frame = frames.recv() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!(track = %track.id(), skipped = n, "sender lagged behind capture");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            for frame in split_for_wire(frame) {
                let duration = match &frame {
                    MediaFrame::Audio(audio) => audio.duration(),
                    MediaFrame::Video(video) => {
                        let duration = last_video
                            .map(|last| video.timestamp.saturating_sub(last))
                            .unwrap_or(Duration::from_millis(33));
                        last_video = Some(video.timestamp);
                        duration
                    }
                };
                let Some(data) = codec.encode(&frame) else {
                    continue;
                };
                let data = match frame.kind() {
                    TrackKind::Video => pad_video(data),
                    TrackKind::Audio => data,
                };
                if let Err(e) = local
                    .write_sample(&Sample {
                        data,
                        duration,
                        ..Default::default()
                    })
                    .await
                {
                    debug!(track = %track.id(), error = %e, "failed to write sample");
                }
            }
        }
    })
}

/// Pad so the final VP8 fragment is long enough to be depacketized.
fn pad_video(data: Bytes) -> Bytes {
    let fragment = RTP_MTU - RTP_HEADER - VP8_DESCRIPTOR;
    let tail = data.len() % fragment;
    let min_tail = MIN_VP8_PACKET - VP8_DESCRIPTOR;
    if tail == 0 || tail >= min_tail {
        return data;
    }
    let mut padded = BytesMut::with_capacity(data.len() + min_tail - tail);
    padded.put_slice(&data);
    padded.put_bytes(0, min_tail - tail);
    padded.freeze()
}

fn video_builder() -> SampleBuilder<Vp8Packet> {
    SampleBuilder::new(MAX_LATE_PACKETS, Vp8Packet::default(), VIDEO_CLOCK_RATE)
}

fn audio_builder() -> SampleBuilder<OpusPacket> {
    SampleBuilder::new(MAX_LATE_PACKETS, OpusPacket::default(), AUDIO_CLOCK_RATE)
}

async fn read_remote<D>(
    track: Arc<TrackRemote>,
    media: MediaTrack,
    codec: Arc<dyn FrameCodec>,
    mut builder: SampleBuilder<D>,
) where
    D: Depacketizer + Send,
{
    let started = Instant::now();
    loop {
        let packet = tokio::select! {
            _ = media.ended() => break,
            read = track.read_rtp() => match read {
                Ok((packet, _)) => packet,
                Err(e) => {
                    debug!(track = %media.id(), error = %e, "remote track closed");
                    break;
                }
            },
        };
        builder.push(packet);
        while let Some(sample) = builder.pop() {
            if let Some(frame) = codec.decode(media.kind(), &sample.data, started.elapsed()) {
                media.push(frame);
            }
        }
    }
    media.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp::codecs::opus::OpusPayloader;
    use webrtc::rtp::codecs::vp8::Vp8Payloader;
    use webrtc::rtp::packetizer::{new_packetizer, Packetizer, Payloader};
    use webrtc::rtp::sequence::new_random_sequencer;

    use crate::config::CaptureProfile;
    use crate::media::pattern::render;
    use crate::media::{AudioFrame, VideoFrame};
    use crate::metrics::{classify, QualityClass};

    /// Packetize payloads the way the sample track does and reassemble them
    /// the way the remote reader does. Returns the samples and the largest packet.
    fn carry<D: Depacketizer>(
        payloader: Box<dyn Payloader + Send + Sync>,
        mut builder: SampleBuilder<D>,
        clock_rate: u32,
        payloads: &[(Bytes, u32)],
    ) -> (Vec<Bytes>, usize) {
        let mut packetizer = new_packetizer(
            RTP_MTU,
            96,
            0x5eed,
            payloader,
            Box::new(new_random_sequencer()),
            clock_rate,
        );
        let mut samples = Vec::new();
        let mut largest = 0;
        for (payload, ticks) in payloads {
            for packet in packetizer.packetize(payload, *ticks).unwrap() {
                largest = largest.max(RTP_HEADER + packet.payload.len());
                builder.push(packet);
            }
            while let Some(sample) = builder.pop() {
                samples.push(sample.data);
            }
        }
        (samples, largest)
    }

    #[test]
    fn test_video_at_every_capture_level_survives_the_link() {
        let profile = CaptureProfile::default();
        for level in [profile.ideal, profile.medium, profile.low] {
            let payloads: Vec<(Bytes, u32)> = (0..3)
                .map(|tick| {
                    let frame = VideoFrame::new(
                        level.width,
                        level.height,
                        render(level.width, level.height, tick, 10),
                        Duration::from_millis(33 * tick as u64),
                    );
                    let payload = WireCodec.encode(&MediaFrame::Video(frame)).unwrap();
                    (pad_video(payload), VIDEO_CLOCK_RATE / 30)
                })
                .collect();

            let (samples, largest) = carry(
                Box::new(Vp8Payloader::default()),
                video_builder(),
                VIDEO_CLOCK_RATE,
                &payloads,
            );
            assert!(largest <= RTP_MTU);
            // The last frame is held until the next one starts.
            assert_eq!(samples.len(), 2, "{}x{}", level.width, level.height);
            for (sample, (sent, _)) in samples.iter().zip(&payloads) {
                assert_eq!(sample, sent);
                match WireCodec.decode(TrackKind::Video, sample, Duration::ZERO) {
                    Some(MediaFrame::Video(frame)) => {
                        assert_eq!((frame.width, frame.height), (level.width, level.height));
                    }
                    _ => panic!("undecodable frame at {}x{}", level.width, level.height),
                }
            }
        }
    }

    #[test]
    fn test_largest_video_payload_fits_the_reassembly_window() {
        assert!(MAX_VIDEO_PACKETS < MAX_LATE_PACKETS as usize);
        let payload = Bytes::from(vec![7u8; MAX_VIDEO_PAYLOAD]);
        let (samples, _) = carry(
            Box::new(Vp8Payloader::default()),
            video_builder(),
            VIDEO_CLOCK_RATE,
            &[(payload.clone(), 3000), (payload.clone(), 3000)],
        );
        assert_eq!(samples, vec![payload]);
    }

    #[test]
    fn test_short_final_fragment_is_padded() {
        let fragment = RTP_MTU - RTP_HEADER - VP8_DESCRIPTOR;
        let awkward = Bytes::from(vec![1u8; fragment + 1]);
        let padded = pad_video(awkward.clone());
        assert_eq!(padded.len(), fragment + 3);
        assert_eq!(&padded[..awkward.len()], &awkward[..]);

        let (samples, _) = carry(
            Box::new(Vp8Payloader::default()),
            video_builder(),
            VIDEO_CLOCK_RATE,
            &[(padded.clone(), 3000), (padded.clone(), 3000)],
        );
        assert_eq!(samples, vec![padded]);

        let even = Bytes::from(vec![1u8; fragment * 2]);
        assert_eq!(pad_video(even.clone()), even);
    }

    #[test]
    fn test_device_sized_audio_buffers_fit_single_packets() {
        let frame = MediaFrame::Audio(AudioFrame {
            sample_rate: 44_100,
            channels: 2,
            samples: vec![0.25f32; 1764].into(),
            timestamp: Duration::ZERO,
        });
        let payloads: Vec<(Bytes, u32)> = [frame.clone(), frame]
            .into_iter()
            .flat_map(split_for_wire)
            .map(|piece| {
                let ticks = match &piece {
                    MediaFrame::Audio(audio) => {
                        (audio.duration().as_secs_f64() * AUDIO_CLOCK_RATE as f64) as u32
                    }
                    MediaFrame::Video(_) => unreachable!(),
                };
                (WireCodec.encode(&piece).unwrap(), ticks)
            })
            .collect();
        assert_eq!(payloads.len(), 8);

        let (samples, largest) = carry(
            Box::new(OpusPayloader::default()),
            audio_builder(),
            AUDIO_CLOCK_RATE,
            &payloads,
        );
        assert!(largest <= RTP_MTU);
        assert_eq!(samples.len(), 7);
        for sample in &samples {
            match WireCodec.decode(TrackKind::Audio, sample, Duration::ZERO) {
                Some(MediaFrame::Audio(audio)) => {
                    assert_eq!(audio.sample_rate, 44_100);
                    assert_eq!(audio.channels, 2);
                }
                _ => panic!("undecodable audio"),
            }
        }
    }

    #[test]
    fn test_idle_link_is_not_mistaken_for_a_slow_one() {
        // Camera and microphone muted: nothing is sent and no estimate exists.
        let summary = StatsSummary {
            available_outgoing_bps: vec![0.0],
            rtt_ms: vec![40.0],
            pair_rtt_ms: vec![0.0],
            loss_percent: vec![0.0],
        };
        let stats = summary.into_link_stats().unwrap();
        assert_eq!(stats.bandwidth_bps, None);
        assert_ne!(classify(&stats), QualityClass::Poor);

        let estimated = StatsSummary {
            available_outgoing_bps: vec![50_000.0],
            ..Default::default()
        };
        let stats = estimated.into_link_stats().unwrap();
        assert_eq!(classify(&stats), QualityClass::Poor);
    }

    #[test]
    fn test_candidate_pair_rtt_fills_in_for_missing_reports() {
        let summary = StatsSummary {
            pair_rtt_ms: vec![120.0],
            ..Default::default()
        };
        assert_eq!(summary.into_link_stats().unwrap().rtt_ms, Some(120.0));
        assert!(StatsSummary::default().into_link_stats().is_none());
    }
}
