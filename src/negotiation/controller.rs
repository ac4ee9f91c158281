//! Negotiation Controller - Zustandsmaschine eines Anrufs
//!
//! Der Controller ist rein synchron: jede Operation prüft die aktuelle Phase,
//! aktualisiert den `CallSessionState` und gibt eine Liste von `Action`s
//! zurück (Befehle an die Media Engine, Nachrichten ans Relay, UI-Events).
//! Asynchrone Ergebnisse kommen als `Completion` mit Attempt-ID zurück.

use super::events::{Action, CallNotification, Completion, EndReason};
use super::state::{CallSessionState, Phase, Role};
use crate::call_engine::{
    AttemptId, ConnectionState, EngineEvent, EngineEventKind, MediaEngineError, TrackKind,
};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription, SignalMessage};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vom Controller abgelehnte Operationen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartCall,
    HangUp,
    InboundOffer,
    ToggleVideo,
    ToggleAudio,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::StartCall => "start_call",
            Operation::HangUp => "hang_up",
            Operation::InboundOffer => "inbound_offer",
            Operation::ToggleVideo => "toggle_video",
            Operation::ToggleAudio => "toggle_audio",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("{operation} is not allowed in phase {phase}")]
    InvalidTransition { operation: Operation, phase: Phase },

    #[error("Discarded completion for superseded {0}")]
    StaleCompletion(AttemptId),

    #[error("Call runtime has stopped")]
    RuntimeStopped,
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Obergrenze für gepufferte Remote-Candidates
pub const MAX_PENDING_CANDIDATES: usize = 256;

#[derive(Debug)]
pub struct NegotiationController {
    session: CallSessionState,
    last_attempt: u64,
    negotiation_timeout: Option<Duration>,
}

impl NegotiationController {
    pub fn new(negotiation_timeout: Option<Duration>) -> Self {
        Self {
            session: CallSessionState::new(),
            last_attempt: 0,
            negotiation_timeout,
        }
    }

    pub fn session(&self) -> &CallSessionState {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        self.session.phase
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    /// Startet einen ausgehenden Anruf (nur aus `Idle`)
    pub fn start_call(&mut self) -> Result<Vec<Action>, NegotiationError> {
        self.session
            .transition(Operation::StartCall, Phase::Offering)?;

        let attempt = self.next_attempt();
        self.session.begin(attempt, Role::Caller);
        // Reste eines früheren Versuchs gehören nicht zu unserem Offer
        self.session.pending_remote_candidates.clear();

        tracing::info!("Starting call ({})", attempt);

        let mut actions = vec![
            Action::OpenConnection(attempt),
            Action::CreateOffer(attempt),
        ];
        self.push_timeout(attempt, &mut actions);
        actions.push(phase_changed(Phase::Offering));
        Ok(actions)
    }

    /// Beendet den aktuellen Versuch lokal, ohne auf den Peer zu warten
    pub fn hang_up(&mut self) -> Result<Vec<Action>, NegotiationError> {
        if self.session.phase == Phase::Ended {
            return Err(NegotiationError::InvalidTransition {
                operation: Operation::HangUp,
                phase: Phase::Ended,
            });
        }
        Ok(self.end_attempt(EndReason::LocalHangUp))
    }

    pub fn toggle_video(&mut self, on: bool) -> Result<Vec<Action>, NegotiationError> {
        self.toggle(Operation::ToggleVideo, TrackKind::Video, on)
    }

    pub fn toggle_audio(&mut self, on: bool) -> Result<Vec<Action>, NegotiationError> {
        self.toggle(Operation::ToggleAudio, TrackKind::Audio, on)
    }

    fn toggle(
        &mut self,
        operation: Operation,
        kind: TrackKind,
        on: bool,
    ) -> Result<Vec<Action>, NegotiationError> {
        if self.session.phase != Phase::Connected {
            return Err(NegotiationError::InvalidTransition {
                operation,
                phase: self.session.phase,
            });
        }
        if self.session.media_flags.get(kind) == on {
            return Ok(Vec::new());
        }

        self.session.media_flags.set(kind, on);
        let command = if on {
            Action::AttachTrack(kind)
        } else {
            Action::DetachTrack(kind)
        };
        Ok(vec![
            command,
            Action::Notify(CallNotification::MediaToggled { kind, enabled: on }),
        ])
    }

    // ========================================================================
    // INBOUND SIGNALING
    // ========================================================================

    /// Verteilt eine Relay-Nachricht auf den passenden Handler
    pub fn handle_signal(&mut self, message: SignalMessage) -> Result<Vec<Action>, NegotiationError> {
        match message {
            SignalMessage::Offer(desc) => self.handle_inbound_offer(desc),
            SignalMessage::Answer(desc) => Ok(self.handle_inbound_answer(desc)),
            SignalMessage::Candidate(candidate) => Ok(self.handle_inbound_candidate(candidate)),
        }
    }

    /// Unaufgefordertes Offer: nur ohne aktiven Anruf erlaubt
    pub fn handle_inbound_offer(
        &mut self,
        desc: SessionDescription,
    ) -> Result<Vec<Action>, NegotiationError> {
        if desc.kind != SdpKind::Offer {
            tracing::warn!("Ignoring offer message carrying an {:?} description", desc.kind);
            return Ok(Vec::new());
        }

        self.session
            .transition(Operation::InboundOffer, Phase::OfferReceived)?;

        let attempt = self.next_attempt();
        self.session.begin(attempt, Role::Callee);
        self.session.applying_remote = Some(desc.clone());

        tracing::info!(
            "Incoming call ({}), {} candidate(s) already buffered",
            attempt,
            self.session.pending_remote_candidates.len()
        );

        let mut actions = vec![
            Action::OpenConnection(attempt),
            Action::ApplyRemoteDescription(attempt, desc),
        ];
        self.push_timeout(attempt, &mut actions);
        actions.push(phase_changed(Phase::OfferReceived));
        Ok(actions)
    }

    /// Answer wirkt nur in `AwaitingAnswer`; Duplikate und Nachzügler werden verworfen
    pub fn handle_inbound_answer(&mut self, desc: SessionDescription) -> Vec<Action> {
        let session = &self.session;
        if session.phase != Phase::AwaitingAnswer
            || session.applying_remote.is_some()
            || session.remote_description.is_some()
            || desc.kind != SdpKind::Answer
        {
            tracing::debug!("Ignoring answer in phase {}", session.phase);
            return Vec::new();
        }
        let Some(attempt) = session.attempt else {
            return Vec::new();
        };

        tracing::info!("Answer received ({})", attempt);
        self.session.applying_remote = Some(desc.clone());
        vec![Action::ApplyRemoteDescription(attempt, desc)]
    }

    /// Candidates vor der Remote Description werden gepuffert, danach direkt weitergereicht
    pub fn handle_inbound_candidate(&mut self, candidate: IceCandidate) -> Vec<Action> {
        if self.session.phase.is_active() && self.session.remote_description.is_some() {
            return vec![Action::AddRemoteCandidate(candidate)];
        }

        let pending = &mut self.session.pending_remote_candidates;
        if pending.len() >= MAX_PENDING_CANDIDATES {
            // Älteste zuerst verwerfen (meist Nachzügler eines beendeten Anrufs)
            pending.remove(0);
            tracing::warn!(
                "Candidate buffer full ({}), dropped oldest candidate",
                MAX_PENDING_CANDIDATES
            );
        }
        pending.push(candidate);
        tracing::debug!(
            "Buffered remote candidate ({} pending)",
            self.session.pending_remote_candidates.len()
        );
        Vec::new()
    }

    // ========================================================================
    // MEDIA ENGINE
    // ========================================================================

    /// Verarbeitet das Ergebnis einer Media-Engine-Anfrage
    pub fn on_completion(
        &mut self,
        attempt: AttemptId,
        completion: Completion,
    ) -> Result<Vec<Action>, NegotiationError> {
        if !self.session.is_current(attempt) {
            return Err(NegotiationError::StaleCompletion(attempt));
        }

        let actions = match completion {
            Completion::ConnectionOpened(Ok(())) => Vec::new(),
            Completion::DescriptionCreated(Ok(desc)) => self.on_description_created(attempt, desc),
            Completion::LocalDescriptionApplied(Ok(())) => self.on_local_applied(),
            Completion::RemoteDescriptionApplied(Ok(())) => self.on_remote_applied(attempt),
            Completion::ConnectionOpened(Err(e))
            | Completion::DescriptionCreated(Err(e))
            | Completion::LocalDescriptionApplied(Err(e))
            | Completion::RemoteDescriptionApplied(Err(e)) => self.fail(e),
        };
        Ok(actions)
    }

    /// Observer-Events der Media Engine (Candidates, Verbindungszustand, Remote-Tracks)
    pub fn on_engine_event(&mut self, event: EngineEvent) -> Vec<Action> {
        if !self.session.is_current(event.attempt) {
            tracing::debug!(
                "Discarding engine event for {} in phase {}",
                event.attempt,
                self.session.phase
            );
            return Vec::new();
        }

        match event.kind {
            EngineEventKind::LocalCandidate(candidate) => {
                vec![Action::Send(SignalMessage::Candidate(candidate))]
            }
            EngineEventKind::ConnectionStateChanged(state) => {
                let mut actions = vec![Action::Notify(CallNotification::ConnectionStateChanged {
                    state,
                })];
                match state {
                    ConnectionState::Failed | ConnectionState::Closed => {
                        actions.extend(self.end_attempt(EndReason::ConnectionLost));
                    }
                    ConnectionState::Disconnected => {
                        tracing::warn!("Peer connection disconnected ({})", event.attempt);
                    }
                    _ => {}
                }
                actions
            }
            EngineEventKind::RemoteStreamAvailable(kind) => {
                vec![Action::Notify(CallNotification::RemoteStreamAvailable {
                    kind,
                })]
            }
        }
    }

    /// Negotiation-Timeout eines Versuchs ist abgelaufen
    pub fn on_timeout(&mut self, attempt: AttemptId) -> Vec<Action> {
        if !self.session.is_current(attempt) || self.session.phase == Phase::Connected {
            return Vec::new();
        }
        tracing::warn!(
            "Negotiation timed out in phase {} ({})",
            self.session.phase,
            attempt
        );
        self.end_attempt(EndReason::Timeout)
    }

    /// Beendet den Versuch beim Herunterfahren, falls einer läuft
    pub fn shutdown(&mut self) -> Vec<Action> {
        if self.session.phase.is_active() {
            self.end_attempt(EndReason::Shutdown)
        } else {
            vec![Action::ReleaseConnection]
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn on_description_created(&mut self, attempt: AttemptId, desc: SessionDescription) -> Vec<Action> {
        let expected = match self.session.phase {
            Phase::Offering => SdpKind::Offer,
            Phase::Answering => SdpKind::Answer,
            _ => return Vec::new(),
        };
        if desc.kind != expected || self.session.local_description.is_some() {
            tracing::debug!("Ignoring unexpected local description in {}", self.session.phase);
            return Vec::new();
        }

        self.session.local_description = Some(desc.clone());
        vec![Action::ApplyLocalDescription(attempt, desc)]
    }

    fn on_local_applied(&mut self) -> Vec<Action> {
        let Some(local) = self.session.local_description.clone() else {
            return Vec::new();
        };

        match self.session.phase {
            Phase::Offering => {
                self.advance(Phase::AwaitingAnswer, vec![Action::Send(SignalMessage::Offer(local))])
            }
            Phase::Answering => {
                self.advance(Phase::Connected, vec![Action::Send(SignalMessage::Answer(local))])
            }
            _ => Vec::new(),
        }
    }

    fn on_remote_applied(&mut self, attempt: AttemptId) -> Vec<Action> {
        let Some(remote) = self.session.applying_remote.take() else {
            return Vec::new();
        };
        self.session.remote_description = Some(remote);

        let mut actions: Vec<Action> = self
            .session
            .pending_remote_candidates
            .drain(..)
            .map(Action::AddRemoteCandidate)
            .collect();
        if !actions.is_empty() {
            tracing::debug!("Flushing {} buffered candidate(s)", actions.len());
        }

        match self.session.phase {
            Phase::AwaitingAnswer => self.advance(Phase::Connected, actions),
            Phase::OfferReceived => {
                actions.push(Action::CreateAnswer(attempt));
                self.advance(Phase::Answering, actions)
            }
            _ => actions,
        }
    }

    /// Wechselt vorwärts und hängt das UI-Event an
    fn advance(&mut self, next: Phase, mut actions: Vec<Action>) -> Vec<Action> {
        let operation = match self.session.role {
            Some(Role::Callee) => Operation::InboundOffer,
            _ => Operation::StartCall,
        };
        match self.session.transition(operation, next) {
            Ok(previous) => {
                tracing::info!("Phase {} -> {}", previous, next);
                actions.push(phase_changed(next));
            }
            Err(e) => tracing::error!("Refusing phase change: {}", e),
        }
        actions
    }

    fn fail(&mut self, error: MediaEngineError) -> Vec<Action> {
        tracing::warn!(
            "Media engine failed in phase {}: {}",
            self.session.phase,
            error
        );
        self.end_attempt(EndReason::MediaEngineFailure(error.to_string()))
    }

    /// `→ Ended → Idle`, Verbindung freigeben
    fn end_attempt(&mut self, reason: EndReason) -> Vec<Action> {
        let attempt = self.session.attempt;
        self.session.phase = Phase::Ended;
        tracing::info!("Call ended ({:?}): {}", attempt, reason);

        let actions = vec![
            Action::ReleaseConnection,
            phase_changed(Phase::Ended),
            Action::Notify(CallNotification::CallEnded { reason }),
            phase_changed(Phase::Idle),
        ];
        self.session.reset();
        actions
    }

    fn next_attempt(&mut self) -> AttemptId {
        self.last_attempt += 1;
        AttemptId(self.last_attempt)
    }

    fn push_timeout(&self, attempt: AttemptId, actions: &mut Vec<Action>) {
        if let Some(timeout) = self.negotiation_timeout {
            actions.push(Action::ScheduleTimeout(attempt, timeout));
        }
    }
}

impl Default for NegotiationController {
    fn default() -> Self {
        Self::new(None)
    }
}

fn phase_changed(phase: Phase) -> Action {
    Action::Notify(CallNotification::PhaseChanged { phase })
}
