//! Prozessweite Media-Ressourcen
//!
//! - `EngineContext`: WebRTC API (Codecs + Interceptors) und ICE Server,
//!   einmal pro Prozess gebaut und per `Arc` geteilt
//! - `CaptureDevice`: Kamera/Mikrofon, idempotent gestartet und gestoppt
//! - `LocalMedia`: lokale Audio- und Video-Tracks für ausgehende Samples

use super::engine::MediaEngineError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Stream-ID der lokalen Tracks
pub const LOCAL_STREAM_ID: &str = "local_stream";

/// Audio Clock Rate (Opus)
pub const AUDIO_CLOCK_RATE: u32 = 48000;

/// Video Clock Rate (VP8)
pub const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// TRACK KIND
// ============================================================================

/// Art eines Media-Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

// ============================================================================
// ENGINE CONTEXT
// ============================================================================

/// Einmal pro Prozess initialisierte WebRTC-Umgebung
pub struct EngineContext {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl EngineContext {
    /// Registriert Default-Codecs und Interceptors (RTCP, NACK etc.)
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Result<Arc<Self>, MediaEngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaEngineError::WebRTC(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaEngineError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        tracing::info!(
            "Media engine initialized with {} ICE server(s)",
            ice_servers.len()
        );

        Ok(Arc::new(Self { api, ice_servers }))
    }

    pub fn api(&self) -> &API {
        &self.api
    }

    pub fn ice_servers(&self) -> &[RTCIceServer] {
        &self.ice_servers
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("ice_servers", &self.ice_servers.len())
            .finish()
    }
}

// ============================================================================
// CAPTURE DEVICE
// ============================================================================

/// Capture-Einstellungen für Kamera und Mikrofon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 60,
        }
    }
}

/// Prozessweites Capture-Gerät, von allen Anrufversuchen geteilt.
///
/// Die eigentliche Aufnahme liegt außerhalb dieser Crate; hier wird nur der
/// Lebenszyklus verwaltet.
#[derive(Debug)]
pub struct CaptureDevice {
    settings: CaptureSettings,
    running: AtomicBool,
}

impl CaptureDevice {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// Startet die Aufnahme. Gibt `true` zurück, wenn sie vorher nicht lief.
    pub fn start(&self) -> bool {
        let started = !self.running.swap(true, Ordering::SeqCst);
        if started {
            tracing::info!(
                "Capture started: {}x{} @ {} fps",
                self.settings.width,
                self.settings.height,
                self.settings.fps
            );
        }
        started
    }

    /// Stoppt die Aufnahme. Gibt `true` zurück, wenn sie vorher lief.
    pub fn stop(&self) -> bool {
        let stopped = self.running.swap(false, Ordering::SeqCst);
        if stopped {
            tracing::info!("Capture stopped");
        }
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> CaptureSettings {
        self.settings
    }
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Ein lokaler Track mit An/Aus-Schalter
#[derive(Debug)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    attached: AtomicBool,
}

impl LocalTrack {
    fn new(kind: TrackKind) -> Self {
        let (mime_type, clock_rate, channels) = match kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, AUDIO_CLOCK_RATE, 1),
            TrackKind::Video => (MIME_TYPE_VP8, VIDEO_CLOCK_RATE, 0),
        };

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                clock_rate,
                channels,
                ..Default::default()
            },
            format!("local_{}", kind),
            LOCAL_STREAM_ID.to_string(),
        ));

        Self {
            kind,
            track,
            attached: AtomicBool::new(true),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Schreibt ein Sample. Detached Tracks verwerfen Samples stillschweigend.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MediaEngineError> {
        if !self.is_attached() {
            return Ok(());
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(|e| MediaEngineError::WebRTC(e.to_string()))
    }
}

/// Lokale Audio- und Video-Tracks
#[derive(Debug)]
pub struct LocalMedia {
    audio: LocalTrack,
    video: LocalTrack,
}

impl LocalMedia {
    pub fn new() -> Self {
        Self {
            audio: LocalTrack::new(TrackKind::Audio),
            video: LocalTrack::new(TrackKind::Video),
        }
    }

    pub fn track(&self, kind: TrackKind) -> &LocalTrack {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    /// Hängt einen Track an (idempotent). Gibt `true` bei Änderung zurück.
    pub fn attach(&self, kind: TrackKind) -> bool {
        !self.track(kind).attached.swap(true, Ordering::SeqCst)
    }

    /// Hängt einen Track ab (idempotent). Gibt `true` bei Änderung zurück.
    pub fn detach(&self, kind: TrackKind) -> bool {
        self.track(kind).attached.swap(false, Ordering::SeqCst)
    }
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self::new()
    }
}
