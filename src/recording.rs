//! Host-side recording of every attached track into one artifact, handed to an
//! upload collaborator when the recording stops.
//!
//! Artifact layout (all integers big-endian):
//!
//! ```text
//! MAGIC (8 bytes) | table length u32 | JSON track table
//! then per chunk: track index u16 | timestamp ms u64 | payload length u32 | payload
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::{split_for_wire, FrameCodec, MediaTrack, TrackKind, TrackPurpose, WireCodec};
use crate::room::ParticipantId;

pub const MAGIC: &[u8; 8] = b"MESHREC1";
/// Default cap on buffered chunk data, matching `upload.max_recording_mb`.
pub const DEFAULT_MAX_BYTES: usize = 512 * 1024 * 1024;
const CHUNK_HEADER: usize = 2 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedTrack {
    pub participant: ParticipantId,
    pub track_id: String,
    pub kind: TrackKind,
    pub purpose: TrackPurpose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTable {
    pub meeting_id: String,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub tracks: Vec<RecordedTrack>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedChunk {
    pub track: u16,
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub file_name: String,
    pub meeting_id: String,
    pub data: Bytes,
}

impl RecordingArtifact {
    /// Split an artifact back into its table and chunks.
    pub fn parse(data: &[u8]) -> Result<(TrackTable, Vec<RecordedChunk>)> {
        let mut buf = data;
        if buf.len() < MAGIC.len() + 4 || &buf[..MAGIC.len()] != MAGIC {
            return Err(Error::recording("not a recording artifact"));
        }
        buf.advance(MAGIC.len());
        let table_len = buf.get_u32() as usize;
        if buf.remaining() < table_len {
            return Err(Error::recording("truncated track table"));
        }
        let table: TrackTable = serde_json::from_slice(&buf[..table_len])?;
        buf.advance(table_len);

        let mut chunks = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < CHUNK_HEADER {
                return Err(Error::recording("truncated chunk header"));
            }
            let track = buf.get_u16();
            let timestamp_ms = buf.get_u64();
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(Error::recording("truncated chunk payload"));
            }
            chunks.push(RecordedChunk {
                track,
                timestamp_ms,
                payload: Bytes::copy_from_slice(&buf[..len]),
            });
            buf.advance(len);
        }
        Ok((table, chunks))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub link: String,
}

/// Where finished recordings go.
#[async_trait]
pub trait UploadCollaborator: Send + Sync {
    async fn upload(&self, artifact: &RecordingArtifact, access_token: &str) -> Result<UploadReceipt>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    success: bool,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Multipart POST to an upload endpoint.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUploader {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl UploadCollaborator for HttpUploader {
    async fn upload(&self, artifact: &RecordingArtifact, access_token: &str) -> Result<UploadReceipt> {
        let file = reqwest::multipart::Part::bytes(artifact.data.to_vec())
            .file_name(artifact.file_name.clone())
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("fileName", artifact.file_name.clone())
            .text("meetingId", artifact.meeting_id.clone())
            .text("accessToken", access_token.to_string());

        let res = self.client.post(&self.endpoint).multipart(form).send().await?;
        let status = res.status();
        let body: UploadResponse = res
            .json()
            .await
            .map_err(|e| Error::upload(format!("unexpected response ({}): {}", status, e)))?;
        match body {
            UploadResponse {
                success: true,
                link: Some(link),
                ..
            } => Ok(UploadReceipt { link }),
            UploadResponse { error, .. } => Err(Error::upload(
                error.unwrap_or_else(|| format!("upload rejected ({})", status)),
            )),
        }
    }
}

/// Chunk data shared by the capture tasks. Once the cap is hit everything is
/// dropped and nothing more is accepted.
struct ChunkBuffer {
    data: BytesMut,
    limit: usize,
    overflowed: bool,
}

impl ChunkBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            limit,
            overflowed: false,
        }
    }

    /// Returns `false` once the buffer has overflowed.
    fn append(&mut self, index: u16, timestamp_ms: u64, payload: &[u8]) -> bool {
        if self.overflowed {
            return false;
        }
        let needed = CHUNK_HEADER + payload.len();
        if self.data.len() + needed > self.limit {
            self.overflowed = true;
            self.data = BytesMut::new();
            return false;
        }
        self.data.reserve(needed);
        self.data.put_u16(index);
        self.data.put_u64(timestamp_ms);
        self.data.put_u32(payload.len() as u32);
        self.data.put_slice(payload);
        true
    }
}

struct ActiveRecording {
    token: String,
    started: Instant,
    started_at: DateTime<Utc>,
    tracks: Vec<RecordedTrack>,
    attached: HashSet<String>,
    chunks: Arc<Mutex<ChunkBuffer>>,
    overflow: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveRecording {
    fn halt(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

pub struct RecordingManager {
    is_host: bool,
    uploader: Option<Arc<dyn UploadCollaborator>>,
    codec: Arc<dyn FrameCodec>,
    max_bytes: usize,
    active: Option<ActiveRecording>,
}

impl RecordingManager {
    pub fn new(is_host: bool, uploader: Option<Arc<dyn UploadCollaborator>>) -> Self {
        Self {
            is_host,
            uploader,
            codec: Arc::new(WireCodec),
            max_bytes: DEFAULT_MAX_BYTES,
            active: None,
        }
    }

    /// Cap the buffered recording at `max_bytes`. Exceeding it fails the recording.
    pub fn with_limit(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn set_host(&mut self, is_host: bool) {
        self.is_host = is_host;
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Begin recording `tracks`. Rejected unless we host and hold an upload credential.
    pub fn start(
        &mut self,
        drive_token: &str,
        tracks: impl IntoIterator<Item = (ParticipantId, MediaTrack)>,
    ) -> Result<()> {
        if !self.is_host {
            return Err(Error::recording("only the host can record"));
        }
        let token = drive_token.trim();
        if token.is_empty() {
            return Err(Error::recording("an upload access token is required"));
        }
        if self.uploader.is_none() {
            return Err(Error::recording("no upload destination is configured"));
        }
        if self.active.is_some() {
            return Err(Error::recording("a recording is already in progress"));
        }

        self.active = Some(ActiveRecording {
            token: token.to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            tracks: Vec::new(),
            attached: HashSet::new(),
            chunks: Arc::new(Mutex::new(ChunkBuffer::new(self.max_bytes))),
            overflow: Arc::new(Notify::new()),
            tasks: Vec::new(),
        });
        for (participant, track) in tracks {
            self.attach_track(&participant, &track);
        }
        info!(
            tracks = self.active.as_ref().map_or(0, |a| a.tracks.len()),
            "recording started"
        );
        Ok(())
    }

    /// Add a track that appeared mid-recording. Returns `false` if not recording or already attached.
    pub fn attach_track(&mut self, participant: &ParticipantId, track: &MediaTrack) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if track.is_ended() || !active.attached.insert(track.id().to_string()) {
            return false;
        }
        let Ok(index) = u16::try_from(active.tracks.len()) else {
            warn!(track = %track.id(), "too many tracks to record");
            return false;
        };
        active.tracks.push(RecordedTrack {
            participant: participant.clone(),
            track_id: track.id().to_string(),
            kind: track.kind(),
            purpose: track.purpose(),
        });
        active.tasks.push(tokio::spawn(capture(
            index,
            track.clone(),
            active.started,
            active.chunks.clone(),
            active.overflow.clone(),
            self.codec.clone(),
        )));
        debug!(participant = %participant, track = %track.id(), index, "track attached to recording");
        true
    }

    /// Resolves when the active recording outgrows its cap. Never resolves
    /// while idle. The caller is expected to [`discard`](Self::discard) it.
    pub async fn overflowed(&self) {
        match &self.active {
            Some(active) => active.overflow.notified().await,
            None => std::future::pending().await,
        }
    }

    /// Discard a recording that outgrew its cap, returning the error to report.
    pub fn discard_overflowed(&mut self) -> Error {
        self.discard();
        overflow_error(self.max_bytes)
    }

    /// Drop buffered data without uploading. Returns `false` if not recording.
    pub fn discard(&mut self) -> bool {
        match self.active.take() {
            Some(mut active) => {
                active.halt();
                info!("recording discarded");
                true
            }
            None => false,
        }
    }

    /// Finish, assemble the artifact and upload it. Failures are not retried.
    pub async fn stop(&mut self, room_id: &str, title: &str) -> Result<UploadReceipt> {
        let mut active = self
            .active
            .take()
            .ok_or_else(|| Error::recording("no recording in progress"))?;
        active.halt();
        if lock(&active.chunks).overflowed {
            return Err(overflow_error(self.max_bytes));
        }
        let uploader = self
            .uploader
            .clone()
            .ok_or_else(|| Error::recording("no upload destination is configured"))?;

        let artifact = assemble(&active, room_id, title, Utc::now())?;
        info!(file = %artifact.file_name, bytes = artifact.data.len(), "uploading recording");
        match uploader.upload(&artifact, &active.token).await {
            Ok(receipt) => {
                info!(link = %receipt.link, "recording uploaded");
                Ok(receipt)
            }
            Err(Error::Upload(reason)) => Err(Error::Upload(reason)),
            Err(e) => Err(Error::upload(e)),
        }
    }
}

impl Drop for RecordingManager {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.halt();
        }
    }
}

fn overflow_error(max_bytes: usize) -> Error {
    Error::recording(format!(
        "recording exceeded {} MB and was discarded",
        max_bytes / (1024 * 1024)
    ))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Upload file name. The title is user text, so anything that could act as a
/// path is neutralised.
pub(crate) fn file_name(title: &str, at: DateTime<Utc>) -> String {
    let title: String = title
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let title = title.trim_start_matches('.');
    let title = if title.trim().is_empty() { "meeting" } else { title };
    format!("{}-{}.mrec", title, at.format("%Y%m%d-%H%M%S"))
}

fn assemble(
    active: &ActiveRecording,
    room_id: &str,
    title: &str,
    finished_at: DateTime<Utc>,
) -> Result<RecordingArtifact> {
    let table = serde_json::to_vec(&TrackTable {
        meeting_id: room_id.to_string(),
        title: title.to_string(),
        started_at: active.started_at,
        tracks: active.tracks.clone(),
    })?;
    let table_len =
        u32::try_from(table.len()).map_err(|_| Error::recording("track table too large"))?;
    let chunks = std::mem::take(&mut lock(&active.chunks).data);

    let mut data = BytesMut::with_capacity(MAGIC.len() + 4 + table.len() + chunks.len());
    data.put_slice(MAGIC);
    data.put_u32(table_len);
    data.put_slice(&table);
    data.put_slice(&chunks);

    Ok(RecordingArtifact {
        file_name: file_name(title, finished_at),
        meeting_id: room_id.to_string(),
        data: data.freeze(),
    })
}

async fn capture(
    index: u16,
    track: MediaTrack,
    started: Instant,
    chunks: Arc<Mutex<ChunkBuffer>>,
    overflow: Arc<Notify>,
    codec: Arc<dyn FrameCodec>,
) {
    let mut frames = track.subscribe();
    loop {
        let frame = tokio::select! {
            _ = track.ended() => break,
            frame = frames.recv() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(RecvError::Lagged(n)) => {
                debug!(track = %track.id(), skipped = n, "recorder lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let timestamp_ms = started.elapsed().as_millis() as u64;
        for piece in split_for_wire(frame) {
            let Some(payload) = codec.encode(&piece) else {
                continue;
            };
            if !lock(&chunks).append(index, timestamp_ms, &payload) {
                warn!(track = %track.id(), "recording buffer full");
                overflow.notify_one();
                return;
            }
        }
    }
}
