//! Datenmodell eines Anrufversuchs

use super::controller::{NegotiationError, Operation};
use crate::call_engine::{AttemptId, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};
use serde::Serialize;

// ============================================================================
// PHASE
// ============================================================================

/// Aktueller Schritt der Negotiation
///
/// Anrufer: `Idle → Offering → AwaitingAnswer → Connected`
/// Angerufener: `Idle → OfferReceived → Answering → Connected`
/// Jede Phase kann nach `Ended`, `Ended` geht nur nach `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    /// Lokales Offer wird erzeugt und angewendet
    Offering,
    /// Offer gesendet, warte auf Answer
    AwaitingAnswer,
    /// Remote Offer wird angewendet
    OfferReceived,
    /// Lokales Answer wird erzeugt und angewendet
    Answering,
    Connected,
    Ended,
}

/// Grobe Sicht auf die Phase (Vokabular des Datenmodells)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    AwaitingLocalDescription,
    AwaitingRemoteDescription,
    Negotiating,
    Connected,
    Ended,
}

impl Phase {
    /// Ist der Übergang `self → next` erlaubt?
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Ended, Idle) => true,
            (Ended, _) => false,
            (_, Ended) => true,
            (Idle, Offering) | (Offering, AwaitingAnswer) | (AwaitingAnswer, Connected) => true,
            (Idle, OfferReceived) | (OfferReceived, Answering) | (Answering, Connected) => true,
            _ => false,
        }
    }

    pub fn stage(self) -> Stage {
        match self {
            Phase::Idle => Stage::Idle,
            Phase::Offering => Stage::AwaitingLocalDescription,
            Phase::AwaitingAnswer | Phase::OfferReceived => Stage::AwaitingRemoteDescription,
            Phase::Answering => Stage::Negotiating,
            Phase::Connected => Stage::Connected,
            Phase::Ended => Stage::Ended,
        }
    }

    /// Gehört die Phase zu einem laufenden Anrufversuch?
    pub fn is_active(self) -> bool {
        !matches!(self, Phase::Idle | Phase::Ended)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Offering => "offering",
            Phase::AwaitingAnswer => "awaiting_answer",
            Phase::OfferReceived => "offer_received",
            Phase::Answering => "answering",
            Phase::Connected => "connected",
            Phase::Ended => "ended",
        };
        f.write_str(name)
    }
}

// ============================================================================
// ROLE & MEDIA FLAGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sendet das Offer
    Caller,
    /// Sendet das Answer
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaFlags {
    pub video_enabled: bool,
    pub audio_enabled: bool,
}

impl MediaFlags {
    pub fn get(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio_enabled,
            TrackKind::Video => self.video_enabled,
        }
    }

    pub fn set(&mut self, kind: TrackKind, enabled: bool) {
        match kind {
            TrackKind::Audio => self.audio_enabled = enabled,
            TrackKind::Video => self.video_enabled = enabled,
        }
    }
}

impl Default for MediaFlags {
    fn default() -> Self {
        Self {
            video_enabled: true,
            audio_enabled: true,
        }
    }
}

// ============================================================================
// CALL SESSION STATE
// ============================================================================

/// Zustand des (einzigen) Anrufversuchs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSessionState {
    pub attempt: Option<AttemptId>,
    pub phase: Phase,
    pub role: Option<Role>,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    /// Remote Description, die gerade angewendet wird
    pub applying_remote: Option<SessionDescription>,
    /// Candidates, die vor der Remote Description ankamen (in Empfangsreihenfolge)
    pub pending_remote_candidates: Vec<IceCandidate>,
    pub media_flags: MediaFlags,
}

impl CallSessionState {
    pub fn new() -> Self {
        Self {
            attempt: None,
            phase: Phase::Idle,
            role: None,
            local_description: None,
            remote_description: None,
            applying_remote: None,
            pending_remote_candidates: Vec::new(),
            media_flags: MediaFlags::default(),
        }
    }

    /// Wechselt die Phase, sofern der Übergang erlaubt ist
    pub(crate) fn transition(
        &mut self,
        operation: Operation,
        next: Phase,
    ) -> Result<Phase, NegotiationError> {
        if !self.phase.can_transition_to(next) {
            return Err(NegotiationError::InvalidTransition {
                operation,
                phase: self.phase,
            });
        }
        let previous = self.phase;
        self.phase = next;
        Ok(previous)
    }

    /// Beginnt einen neuen Versuch in der gegebenen Rolle
    pub(crate) fn begin(&mut self, attempt: AttemptId, role: Role) {
        self.attempt = Some(attempt);
        self.role = Some(role);
    }

    /// Zurück auf einen frischen Idle-Zustand (nur aus `Ended`)
    pub(crate) fn reset(&mut self) {
        debug_assert_eq!(self.phase, Phase::Ended);
        *self = Self::new();
    }

    /// Gehört eine Completion zum aktuellen Versuch?
    pub fn is_current(&self, attempt: AttemptId) -> bool {
        self.phase.is_active() && self.attempt == Some(attempt)
    }
}

impl Default for CallSessionState {
    fn default() -> Self {
        Self::new()
    }
}
