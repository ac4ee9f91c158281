//! Ein- und Ausgaben des Negotiation Controllers

use super::state::Phase;
use crate::call_engine::{AttemptId, ConnectionState, MediaEngineError, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription, SignalMessage};
use serde::Serialize;
use std::time::Duration;

// ============================================================================
// COMPLETIONS (Media Engine → Controller)
// ============================================================================

/// Ergebnis einer asynchronen Media-Engine-Anfrage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    ConnectionOpened(Result<(), MediaEngineError>),
    DescriptionCreated(Result<SessionDescription, MediaEngineError>),
    LocalDescriptionApplied(Result<(), MediaEngineError>),
    RemoteDescriptionApplied(Result<(), MediaEngineError>),
}

// ============================================================================
// ACTIONS (Controller → Media Engine / Relay / UI)
// ============================================================================

/// Befehl, den der Controller nach einem Event ausführen lässt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    OpenConnection(AttemptId),
    CreateOffer(AttemptId),
    CreateAnswer(AttemptId),
    ApplyLocalDescription(AttemptId, SessionDescription),
    ApplyRemoteDescription(AttemptId, SessionDescription),
    AddRemoteCandidate(IceCandidate),
    AttachTrack(TrackKind),
    DetachTrack(TrackKind),
    ReleaseConnection,
    Send(SignalMessage),
    ScheduleTimeout(AttemptId, Duration),
    Notify(CallNotification),
}

// ============================================================================
// NOTIFICATIONS (→ UI)
// ============================================================================

/// Warum ein Anrufversuch beendet wurde
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    LocalHangUp,
    MediaEngineFailure(String),
    ConnectionLost,
    Timeout,
    Shutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::LocalHangUp => write!(f, "hung up"),
            EndReason::MediaEngineFailure(e) => write!(f, "media engine failure: {}", e),
            EndReason::ConnectionLost => write!(f, "connection lost"),
            EndReason::Timeout => write!(f, "negotiation timed out"),
            EndReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Events für die Oberfläche
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallNotification {
    PhaseChanged { phase: Phase },
    CallEnded { reason: EndReason },
    MediaToggled { kind: TrackKind, enabled: bool },
    RemoteStreamAvailable { kind: TrackKind },
    ConnectionStateChanged { state: ConnectionState },
    /// Relay nicht erreichbar (vorübergehend, kein Abbruch)
    RelayUnavailable { message: String },
}
