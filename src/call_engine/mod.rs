//! Call Engine Module - WebRTC Media Engine
//!
//! Dieses Modul verwaltet:
//! - Die prozessweite WebRTC-Umgebung (Codecs, Interceptors, ICE Server)
//! - Das Capture-Gerät und die lokalen Tracks
//! - Die Peer Connection eines Anrufversuchs

mod engine;
mod media;

pub use engine::{
    AttemptId, ConnectionState, EngineEvent, EngineEventKind, MediaEngine, MediaEngineError,
    WebRtcEngine,
};
pub use media::{
    CaptureDevice, CaptureSettings, EngineContext, LocalMedia, LocalTrack, TrackKind,
    AUDIO_CLOCK_RATE, LOCAL_STREAM_ID, VIDEO_CLOCK_RATE,
};
pub use webrtc::media::Sample;
