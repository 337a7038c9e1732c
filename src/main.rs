use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meshmeet::audio::AudioPlayback;
use meshmeet::background::VirtualBackgroundConfig;
use meshmeet::media::SystemCaptureBackend;
use meshmeet::recording::{HttpUploader, UploadCollaborator};
use meshmeet::signaling::{JoinRequest, SignalingClient};
use meshmeet::webrtc::RtcTransportFactory;
use meshmeet::{
    Conference, ConferenceDeps, ConferenceHandle, ConferenceUpdate, Config, DeviceSelection,
    JoinOptions, ParticipantId, TrackKind, ViewMode,
};

#[derive(Parser, Debug)]
#[command(name = "meshmeet", about = "Mesh video conferencing client")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "MESHMEET_CONFIG")]
    config: Option<PathBuf>,
    /// Overrides the signaling URL from the configuration
    #[arg(long, env = "MESHMEET_SIGNALING_URL")]
    signaling_url: Option<String>,
    #[arg(long, env = "MESHMEET_ROOM")]
    room: String,
    #[arg(long, env = "MESHMEET_NAME", default_value = "guest")]
    name: String,
    /// Generated when omitted
    #[arg(long, env = "MESHMEET_PARTICIPANT_ID")]
    participant_id: Option<String>,
    #[arg(long, default_value_t = false)]
    host: bool,
    #[arg(long, default_value_t = 8)]
    max_participants: usize,
    #[arg(long)]
    audio_device: Option<String>,
    #[arg(long)]
    video_device: Option<String>,
    /// Recording upload endpoint; overrides the configuration
    #[arg(long, env = "MESHMEET_UPLOAD_ENDPOINT")]
    upload_endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Input {
    Chat(String),
    Share,
    Unshare,
    Background(VirtualBackgroundConfig),
    Record(String),
    StopRecord(String),
    Audio(bool),
    Video(bool),
    View(ViewMode),
    Kick(String),
    Devices(DeviceSelection),
    Status,
    Leave,
}

fn parse_input(line: &str) -> Result<Input, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err("empty input".into());
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Ok(Input::Chat(trimmed.to_string()));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let input = match name {
        "share" => Input::Share,
        "unshare" => Input::Unshare,
        "blur" => {
            let intensity = if rest.is_empty() {
                50
            } else {
                rest.parse::<u8>()
                    .map_err(|_| "blur intensity must be 0-100".to_string())?
            };
            Input::Background(VirtualBackgroundConfig::blur(intensity))
        }
        "image" if !rest.is_empty() => Input::Background(VirtualBackgroundConfig::image(rest)),
        "image" => return Err("usage: /image <path>".into()),
        "nobg" => Input::Background(VirtualBackgroundConfig::none()),
        "record" if !rest.is_empty() => Input::Record(rest.to_string()),
        "record" => return Err("usage: /record <access token>".into()),
        "stoprecord" => Input::StopRecord(rest.to_string()),
        "mute" => Input::Audio(false),
        "unmute" => Input::Audio(true),
        "video" => match rest {
            "on" => Input::Video(true),
            "off" => Input::Video(false),
            _ => return Err("usage: /video on|off".into()),
        },
        "grid" => Input::View(ViewMode::Grid),
        "speaker" => Input::View(ViewMode::Speaker),
        "kick" if !rest.is_empty() => Input::Kick(rest.to_string()),
        "kick" => return Err("usage: /kick <participant id>".into()),
        "devices" => {
            let mut parts = rest.split_whitespace();
            let audio = parts.next().unwrap_or_default();
            let video = parts.next().unwrap_or_default();
            Input::Devices(DeviceSelection::new(audio, video))
        }
        "status" => Input::Status,
        "leave" | "quit" => Input::Leave,
        other => return Err(format!("unknown command /{}", other)),
    };
    Ok(input)
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(url) = &args.signaling_url {
        config.signaling_url = url.clone();
    }
    if let Some(endpoint) = &args.upload_endpoint {
        config.upload.endpoint = Some(endpoint.clone());
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let participant_id = args
        .participant_id
        .clone()
        .map(ParticipantId::from)
        .unwrap_or_else(ParticipantId::generate);

    let join = JoinRequest {
        room_id: args.room.clone(),
        participant_id: participant_id.clone(),
        display_name: args.name.clone(),
        is_host: args.host,
        max_participants: args.max_participants,
    };
    let signaling = SignalingClient::connect(&config.signaling_url, join, config.reconnect.clone())
        .await
        .context("connecting to the signaling server")?;

    let uploader = config
        .upload
        .endpoint
        .as_ref()
        .map(|endpoint| Arc::new(HttpUploader::new(endpoint.clone())) as Arc<dyn UploadCollaborator>);
    let deps = ConferenceDeps {
        signaling,
        capture: Arc::new(SystemCaptureBackend::new()),
        transports: Arc::new(RtcTransportFactory::new(&config.ice_servers)?),
        uploader,
        config,
    };
    let options = JoinOptions {
        room_id: args.room.clone(),
        participant_id,
        display_name: args.name.clone(),
        is_host: args.host,
        max_participants: args.max_participants,
        devices: DeviceSelection::new(
            args.audio_device.clone().unwrap_or_default(),
            args.video_device.clone().unwrap_or_default(),
        ),
    };

    let (conference, handle) = Conference::join(options, deps).await?;
    let updates = tokio::spawn(print_updates(handle.subscribe()));
    let input = tokio::spawn(read_input(handle.clone()));

    let outcome = conference.run().await;
    input.abort();
    if let Err(e) = updates.await {
        warn!(error = %e, "update printer ended abnormally");
    }
    match outcome {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "conference ended");
            Err(anyhow::anyhow!(e.user_message()))
        }
    }
}

async fn read_input(handle: ConferenceHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let input = match parse_input(&line) {
            Ok(input) => input,
            Err(e) if e == "empty input" => continue,
            Err(e) => {
                println!("! {}", e);
                continue;
            }
        };
        let leaving = input == Input::Leave;
        if let Err(e) = dispatch(&handle, input).await {
            println!("! {}", e.user_message());
        }
        if leaving {
            break;
        }
    }
}

async fn dispatch(handle: &ConferenceHandle, input: Input) -> meshmeet::Result<()> {
    match input {
        Input::Chat(text) => {
            handle.send_chat(text).await?;
        }
        Input::Share => {
            handle.start_screen_share().await?;
        }
        Input::Unshare => {
            if !handle.stop_screen_share().await? {
                println!("! not sharing");
            }
        }
        Input::Background(config) => handle.set_background(config).await?,
        Input::Record(token) => handle.start_recording(token).await?,
        Input::StopRecord(title) => {
            let receipt = handle.stop_recording(title).await?;
            println!("* recording uploaded: {}", receipt.link);
        }
        Input::Audio(enabled) => handle.set_audio_enabled(enabled).await?,
        Input::Video(enabled) => handle.set_video_enabled(enabled).await?,
        Input::View(mode) => handle.set_view_mode(mode).await?,
        Input::Kick(id) => handle.remove_participant(ParticipantId::from(id)).await?,
        Input::Devices(selection) => {
            let stream = handle.switch_devices(selection).await?;
            for track in stream.tracks() {
                println!("* {} now from {}", track.kind(), track.label());
            }
        }
        Input::Status => {
            let snapshot = handle.snapshot().await?;
            println!(
                "* room {} ({} participants, view {:?})",
                snapshot.room_id,
                snapshot.participants.len(),
                snapshot.view.mode()
            );
            for participant in &snapshot.participants {
                let link = snapshot
                    .links
                    .iter()
                    .find(|link| link.participant == participant.id)
                    .map(|link| link.state.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "*   {} [{}] video={} audio={} screen={} link={}",
                    participant.display_name,
                    participant.id,
                    participant.video_enabled,
                    participant.audio_enabled,
                    participant.screen_sharing,
                    link
                );
            }
            if let Some(quality) = snapshot.quality {
                println!("* network quality: {}", quality.quality_class);
            }
        }
        Input::Leave => handle.leave().await?,
    }
    Ok(())
}

async fn print_updates(mut updates: broadcast::Receiver<ConferenceUpdate>) {
    let mut playback: HashMap<String, AudioPlayback> = HashMap::new();
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "dropped conference updates");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match update {
            ConferenceUpdate::ParticipantJoined(info) => {
                println!("* {} joined", info.display_name)
            }
            ConferenceUpdate::ParticipantLeft(id) => println!("* {} left", id),
            ConferenceUpdate::TrackAdded { participant, track } => {
                info!(%participant, track = %track.id(), purpose = ?track.purpose(), "remote track");
                if track.kind() == TrackKind::Audio {
                    match AudioPlayback::new(track.clone()) {
                        Ok(player) => {
                            playback.insert(track.id().to_string(), player);
                        }
                        Err(e) => warn!(error = %e, "cannot play remote audio"),
                    }
                }
            }
            ConferenceUpdate::TrackRemoved { track, .. } => {
                playback.remove(track.id());
            }
            ConferenceUpdate::Chat(message) => {
                println!("<{}> {}", message.sender_name, message.text)
            }
            ConferenceUpdate::ScreenShare { participant, active } => {
                let verb = if active { "started" } else { "stopped" };
                println!("* {} {} sharing their screen", participant, verb);
            }
            ConferenceUpdate::ActiveSpeaker(Some(id)) => println!("* speaking: {}", id),
            ConferenceUpdate::Quality(reading) => {
                info!(quality = %reading.quality_class, links = reading.links, "network quality")
            }
            ConferenceUpdate::CaptureAdapted(c) => {
                println!("* video now {}x{}@{}", c.width, c.height, c.frame_rate)
            }
            ConferenceUpdate::RecordingStarted => println!("* recording"),
            ConferenceUpdate::RecordingUploaded { link } => println!("* recording at {}", link),
            ConferenceUpdate::RecordingFailed { message } => println!("! {}", message),
            ConferenceUpdate::Reconnecting { attempt } => {
                println!("* connection lost, reconnecting (attempt {})", attempt)
            }
            ConferenceUpdate::ConnectionRestored => println!("* reconnected"),
            ConferenceUpdate::Notice(message) => println!("! {}", message),
            ConferenceUpdate::Removed => println!("* the host removed you from the room"),
            ConferenceUpdate::Fatal { message } => println!("! {}", message),
            ConferenceUpdate::Left => break,
            _ => {}
        }
    }
}
