use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::{CaptureBackend, LocalStream, MediaTrack};
use crate::peer::PeerConnectionManager;
use crate::signaling::SignalingSender;

struct ActiveShare {
    generation: u64,
    stream: LocalStream,
    watcher: JoinHandle<()>,
}

/// The local screen share: at most one at a time, sent alongside the camera.
pub struct ScreenShareController {
    backend: Arc<dyn CaptureBackend>,
    signaling: SignalingSender,
    stream_id: String,
    active: Option<ActiveShare>,
    generation: u64,
    ended_tx: mpsc::UnboundedSender<u64>,
}

impl ScreenShareController {
    /// `ended_tx` receives the share's generation when the user ends it from
    /// outside. Check it with [`is_current`](Self::is_current) before acting:
    /// the share may have been stopped and restarted since.
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        signaling: SignalingSender,
        stream_id: impl Into<String>,
        ended_tx: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            backend,
            signaling,
            stream_id: stream_id.into(),
            active: None,
            generation: 0,
            ended_tx,
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|share| share.generation == generation)
    }

    pub fn is_sharing(&self) -> bool {
        self.active.is_some()
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.active
            .as_ref()
            .map(|share| share.stream.tracks().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn start(&mut self, peers: &mut PeerConnectionManager) -> Result<LocalStream> {
        if self.active.is_some() {
            return Err(Error::AlreadySharing);
        }
        let stream = self.backend.open_display(&self.stream_id).await?;
        let tracks: Vec<MediaTrack> = stream.tracks().cloned().collect();
        if tracks.is_empty() {
            return Err(Error::media("display capture produced no tracks"));
        }
        peers.add_local_tracks(&tracks).await?;
        if let Err(e) = self.signaling.screen_share(true) {
            warn!(error = %e, "failed to announce screen share");
        }

        self.generation += 1;
        let generation = self.generation;
        let watcher = match stream.video.clone() {
            Some(video) => {
                let ended_tx = self.ended_tx.clone();
                tokio::spawn(async move {
                    video.ended().await;
                    debug!(track = %video.id(), generation, "display track ended");
                    let _ = ended_tx.send(generation);
                })
            }
            None => tokio::spawn(async {}),
        };
        info!(tracks = tracks.len(), generation, "screen share started");
        self.active = Some(ActiveShare {
            generation,
            stream: stream.clone(),
            watcher,
        });
        Ok(stream)
    }

    /// Stop sharing. Returns `false` if nothing was being shared.
    pub async fn stop(&mut self, peers: &mut PeerConnectionManager) -> bool {
        let Some(share) = self.active.take() else {
            return false;
        };
        share.watcher.abort();
        let tracks: Vec<MediaTrack> = share.stream.tracks().cloned().collect();
        if let Err(e) = peers.remove_local_tracks(&tracks).await {
            warn!(error = %e, "failed to detach screen share");
        }
        share.stream.stop();
        if let Err(e) = self.signaling.screen_share(false) {
            warn!(error = %e, "failed to announce end of screen share");
        }
        info!("screen share stopped");
        true
    }

    /// End the share locally without renegotiating; the links are going away.
    pub fn shutdown(&mut self) {
        if let Some(share) = self.active.take() {
            share.watcher.abort();
            share.stream.stop();
        }
    }
}

impl Drop for ScreenShareController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::media::{CaptureError, DeviceInfo, TrackPurpose, VideoConstraints};
    use crate::peer::{PeerTransport, TransportEvents, TransportFactory};
    use crate::room::ParticipantId;
    use crate::signaling::SignalingMessage;

    struct DisplayOnly;

    #[async_trait]
    impl CaptureBackend for DisplayOnly {
        async fn enumerate(&self) -> std::result::Result<Vec<DeviceInfo>, CaptureError> {
            Ok(Vec::new())
        }

        async fn open_audio(
            &self,
            _device_id: Option<&str>,
            _stream_id: &str,
        ) -> std::result::Result<MediaTrack, CaptureError> {
            Err(CaptureError::DeviceMissing)
        }

        async fn open_video(
            &self,
            _device_id: Option<&str>,
            _constraints: Option<VideoConstraints>,
            _stream_id: &str,
        ) -> std::result::Result<MediaTrack, CaptureError> {
            Err(CaptureError::DeviceMissing)
        }

        async fn open_display(
            &self,
            stream_id: &str,
        ) -> std::result::Result<LocalStream, CaptureError> {
            let mut stream = LocalStream::new(stream_id);
            stream.video = Some(MediaTrack::local(TrackPurpose::Screen, "display", stream_id, None));
            Ok(stream)
        }
    }

    struct NoTransports;

    #[async_trait]
    impl TransportFactory for NoTransports {
        async fn create(
            &self,
            _remote: &ParticipantId,
            _events: TransportEvents,
        ) -> Result<Arc<dyn PeerTransport>> {
            Err(Error::negotiation("no transports in this test"))
        }
    }

    fn setup() -> (
        ScreenShareController,
        PeerConnectionManager,
        mpsc::UnboundedReceiver<SignalingMessage>,
        mpsc::UnboundedReceiver<u64>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let local = ParticipantId::from("alice");
        let signaling = SignalingSender::new("room", local.clone(), out_tx);
        let (peers, _events) = PeerConnectionManager::new(local, Arc::new(NoTransports), signaling.clone());
        let screen = ScreenShareController::new(Arc::new(DisplayOnly), signaling, "alice-screen", ended_tx);
        (screen, peers, out_rx, ended_rx)
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (mut screen, mut peers, mut out, _ended) = setup();
        let stream = screen.start(&mut peers).await.unwrap();
        assert_eq!(stream.id, "alice-screen");
        assert!(peers.local_tracks().iter().any(|t| t.purpose() == TrackPurpose::Screen));
        assert!(matches!(
            out.recv().await,
            Some(SignalingMessage::ScreenShareStarted { .. })
        ));

        assert!(matches!(screen.start(&mut peers).await, Err(Error::AlreadySharing)));

        assert!(screen.stop(&mut peers).await);
        assert!(!screen.stop(&mut peers).await);
        assert!(peers.local_tracks().is_empty());
        assert!(stream.video.unwrap().is_ended());
        assert!(matches!(
            out.recv().await,
            Some(SignalingMessage::ScreenShareStopped { .. })
        ));
    }

    #[tokio::test]
    async fn test_ended_track_is_reported() {
        let (mut screen, mut peers, _out, mut ended) = setup();
        let stream = screen.start(&mut peers).await.unwrap();
        stream.video.as_ref().unwrap().stop();

        let share = ended.recv().await.unwrap();
        assert!(screen.is_current(share));
        assert!(screen.stop(&mut peers).await);
        assert!(!screen.is_sharing());
        assert!(!screen.is_current(share));
    }

    #[tokio::test]
    async fn test_late_end_notice_does_not_stop_a_new_share() {
        let (mut screen, mut peers, _out, mut ended) = setup();
        let first = screen.start(&mut peers).await.unwrap();
        first.video.as_ref().unwrap().stop();
        tokio::task::yield_now().await;

        // user stops and restarts before the notice is handled
        assert!(screen.stop(&mut peers).await);
        let second = screen.start(&mut peers).await.unwrap();

        let stale = ended.recv().await.unwrap();
        assert!(!screen.is_current(stale));
        assert!(screen.is_sharing());

        second.video.as_ref().unwrap().stop();
        let fresh = ended.recv().await.unwrap();
        assert_ne!(fresh, stale);
        assert!(screen.is_current(fresh));
    }
}
