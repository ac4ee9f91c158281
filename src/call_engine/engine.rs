//! WebRTC Media Engine Adapter
//!
//! Dünne Fassade um die Peer Connection: Offer/Answer erzeugen,
//! Descriptions anwenden, Candidates aufnehmen, Tracks an- und abhängen.
//! Observer-Callbacks der Peer Connection werden als `EngineEvent` über
//! einen Broadcast-Kanal veröffentlicht.

use super::media::{CaptureDevice, EngineContext, LocalMedia, TrackKind};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaEngineError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No open peer connection")]
    NoConnection,

    #[error("Malformed ICE candidate: {0}")]
    MalformedCandidate(String),
}

// ============================================================================
// ENGINE EVENTS
// ============================================================================

/// Kennung eines Anrufversuchs. Jeder Versuch bekommt eine neue ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AttemptId(pub u64);

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "attempt#{}", self.0)
    }
}

/// Zustand der darunterliegenden Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEventKind {
    /// Lokaler Candidate entdeckt (muss zum Peer)
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    /// Remote-Track ist verfügbar
    RemoteStreamAvailable(TrackKind),
}

/// Observer-Event, markiert mit dem Versuch, dessen Verbindung es ausgelöst hat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub attempt: AttemptId,
    pub kind: EngineEventKind,
}

// ============================================================================
// MEDIA ENGINE TRAIT
// ============================================================================

/// Fähigkeiten der Media Engine, wie sie die Negotiation nutzt.
///
/// Jede asynchrone Operation liefert genau ein Ergebnis (Erfolg oder Fehler).
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Öffnet die Verbindung für einen neuen Versuch (ersetzt eine alte)
    async fn open(&self, attempt: AttemptId) -> Result<(), MediaEngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, MediaEngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaEngineError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaEngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaEngineError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate)
        -> Result<(), MediaEngineError>;

    /// Synchron und idempotent
    fn attach_track(&self, kind: TrackKind);

    /// Synchron und idempotent
    fn detach_track(&self, kind: TrackKind);

    /// Gibt die Verbindung frei, ohne auf den Peer zu warten
    async fn release(&self);

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

// ============================================================================
// WEBRTC ENGINE
// ============================================================================

struct Connection {
    attempt: AttemptId,
    pc: Arc<RTCPeerConnection>,
}

/// `MediaEngine` über das `webrtc` Crate
pub struct WebRtcEngine {
    context: Arc<EngineContext>,
    capture: Arc<CaptureDevice>,
    media: Arc<LocalMedia>,
    connection: Mutex<Option<Connection>>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl WebRtcEngine {
    pub fn new(context: Arc<EngineContext>, capture: Arc<CaptureDevice>) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            context,
            capture,
            media: Arc::new(LocalMedia::new()),
            connection: Mutex::new(None),
            event_tx,
        }
    }

    /// Lokale Tracks, in die die externe Aufnahme ihre Samples schreibt
    pub fn media(&self) -> Arc<LocalMedia> {
        Arc::clone(&self.media)
    }

    fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaEngineError> {
        self.connection
            .lock()
            .as_ref()
            .map(|c| Arc::clone(&c.pc))
            .ok_or(MediaEngineError::NoConnection)
    }

    async fn add_local_tracks(&self, pc: &RTCPeerConnection) -> Result<(), MediaEngineError> {
        for kind in [TrackKind::Audio, TrackKind::Video] {
            let track = self.media.track(kind).track();
            let sender = pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| MediaEngineError::WebRTC(e.to_string()))?;

            // RTCP lesen, damit die Interceptors arbeiten können
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
            });
        }
        Ok(())
    }

    /// Registriert die Observer-Callbacks der Peer Connection
    fn register_handlers(&self, attempt: AttemptId, pc: &RTCPeerConnection) {
        let event_tx = self.event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state ({}): {:?}", attempt, s);
            let _ = event_tx.send(EngineEvent {
                attempt,
                kind: EngineEventKind::ConnectionStateChanged(s.into()),
            });
            Box::pin(async {})
        }));

        let event_tx = self.event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = event_tx.send(EngineEvent {
                            attempt,
                            kind: EngineEventKind::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }),
                        });
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let event_tx = self.event_tx.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            tracing::info!("Remote {} track available ({})", kind, attempt);
            let _ = event_tx.send(EngineEvent {
                attempt,
                kind: EngineEventKind::RemoteStreamAvailable(kind),
            });
            Box::pin(async {})
        }));
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, MediaEngineError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(|e| MediaEngineError::InvalidSdp(e.to_string()))
}

/// Schließt eine halb aufgebaute Verbindung, bevor der Fehler weitergereicht wird
async fn close_on_failure<T>(
    pc: &RTCPeerConnection,
    result: Result<T, MediaEngineError>,
) -> Result<T, MediaEngineError> {
    if result.is_err() {
        if let Err(e) = pc.close().await {
            tracing::warn!("Failed to close half-open peer connection: {}", e);
        }
    }
    result
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn open(&self, attempt: AttemptId) -> Result<(), MediaEngineError> {
        // Verbindung eines abgebrochenen Versuchs zuerst schließen
        self.release().await;

        self.capture.start();
        self.media.attach(TrackKind::Audio);
        self.media.attach(TrackKind::Video);

        let config = RTCConfiguration {
            ice_servers: self.context.ice_servers().to_vec(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.context
                .api()
                .new_peer_connection(config)
                .await
                .map_err(|e| MediaEngineError::WebRTC(e.to_string()))?,
        );

        self.register_handlers(attempt, &pc);
        let tracks = self.add_local_tracks(&pc).await;
        close_on_failure(&pc, tracks).await?;

        tracing::debug!("Peer connection opened for {}", attempt);
        *self.connection.lock() = Some(Connection { attempt, pc });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaEngineError> {
        let offer = self
            .peer_connection()?
            .create_offer(None)
            .await
            .map_err(|e| MediaEngineError::WebRTC(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaEngineError> {
        let answer = self
            .peer_connection()?
            .create_answer(None)
            .await
            .map_err(|e| MediaEngineError::WebRTC(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaEngineError> {
        let pc = self.peer_connection()?;
        pc.set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| MediaEngineError::WebRTC(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaEngineError> {
        let pc = self.peer_connection()?;
        pc.set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| MediaEngineError::WebRTC(e.to_string()))
    }

    async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), MediaEngineError> {
        let pc = self.peer_connection()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        pc.add_ice_candidate(init)
            .await
            .map_err(|e| MediaEngineError::MalformedCandidate(e.to_string()))
    }

    fn attach_track(&self, kind: TrackKind) {
        if self.media.attach(kind) {
            tracing::debug!("Local {} track attached", kind);
        }
    }

    fn detach_track(&self, kind: TrackKind) {
        if self.media.detach(kind) {
            tracing::debug!("Local {} track detached", kind);
        }
    }

    async fn release(&self) {
        let connection = self.connection.lock().take();
        if let Some(Connection { attempt, pc }) = connection {
            if let Err(e) = pc.close().await {
                tracing::warn!("Failed to close peer connection ({}): {}", attempt, e);
            }
            tracing::debug!("Peer connection released for {}", attempt);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for WebRtcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcEngine")
            .field("context", &self.context)
            .field(
                "attempt",
                &self.connection.lock().as_ref().map(|c| c.attempt),
            )
            .finish()
    }
}
