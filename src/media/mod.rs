//! Local and remote media: tracks, frames, capture backends and the device controller.

mod codec;
mod devices;
pub(crate) mod pattern;
mod system;
mod track;

pub use codec::{
    max_audio_samples, split_for_wire, FrameCodec, WireCodec, MAX_AUDIO_PAYLOAD, MAX_VIDEO_PAYLOAD,
};
pub use devices::{
    CaptureBackend, CaptureError, DeviceInfo, DeviceKind, DeviceList, DeviceSelection,
    MediaDeviceController, TrackReplacer,
};
pub use pattern::spawn_test_pattern;
pub use system::SystemCaptureBackend;
pub use track::{
    AudioFrame, LocalStream, MediaFrame, MediaTrack, TrackKind, TrackPurpose, VideoConstraints,
    VideoFrame,
};
