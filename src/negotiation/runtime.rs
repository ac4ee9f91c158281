//! Call Runtime - führt den Controller auf einem einzigen Task aus
//!
//! Alle Eingaben (Benutzeraktionen, Relay-Nachrichten, Engine-Events,
//! Completions, Timer) laufen durch eine mpsc-Queue; nur dieser Task
//! verändert den `CallSessionState`. Die resultierenden Befehle führt ein
//! zweiter Task strikt in FIFO-Reihenfolge aus, damit Candidates in
//! Empfangsreihenfolge bei der Engine ankommen. Completions kommen mit
//! Attempt-ID zurück in die Queue.

use super::controller::{NegotiationController, NegotiationError};
use super::events::{Action, CallNotification, Completion};
use super::state::CallSessionState;
use crate::call_engine::{AttemptId, EngineEvent, MediaEngine};
use crate::signaling::{SignalingChannel, SignalingEvent};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

// ============================================================================
// INPUTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserAction {
    StartCall,
    HangUp,
    ToggleVideo(bool),
    ToggleAudio(bool),
}

type Reply = oneshot::Sender<Result<(), NegotiationError>>;

#[derive(Debug)]
enum Input {
    User(UserAction, Reply),
    Signal(SignalingEvent),
    Engine(EngineEvent),
    Completed(AttemptId, Completion),
    Timeout(AttemptId),
    Shutdown,
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Zugriff der Oberfläche auf den laufenden Controller
#[derive(Debug, Clone)]
pub struct CallHandle {
    inputs: mpsc::UnboundedSender<Input>,
    notifications: broadcast::Sender<CallNotification>,
    state: Arc<RwLock<CallSessionState>>,
}

impl CallHandle {
    /// Startet einen ausgehenden Anruf
    ///
    /// Wartet nur auf die Entscheidung des Controllers, nicht auf das Netz.
    pub async fn start_call(&self) -> Result<(), NegotiationError> {
        self.request(UserAction::StartCall).await
    }

    pub async fn hang_up(&self) -> Result<(), NegotiationError> {
        self.request(UserAction::HangUp).await
    }

    pub async fn toggle_video(&self, on: bool) -> Result<(), NegotiationError> {
        self.request(UserAction::ToggleVideo(on)).await
    }

    pub async fn toggle_audio(&self, on: bool) -> Result<(), NegotiationError> {
        self.request(UserAction::ToggleAudio(on)).await
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.notifications.subscribe()
    }

    /// Gibt den aktuellen Zustand zurück
    pub fn state(&self) -> CallSessionState {
        self.state.read().clone()
    }

    /// Beendet einen laufenden Anruf und stoppt die Runtime
    pub fn shutdown(&self) {
        let _ = self.inputs.send(Input::Shutdown);
    }

    async fn request(&self, action: UserAction) -> Result<(), NegotiationError> {
        let (tx, rx) = oneshot::channel();
        self.inputs
            .send(Input::User(action, tx))
            .map_err(|_| NegotiationError::RuntimeStopped)?;
        rx.await.map_err(|_| NegotiationError::RuntimeStopped)?
    }
}

// ============================================================================
// SPAWN
// ============================================================================

/// Startet Controller- und Worker-Task für eine Engine und einen Relay-Kanal
pub fn spawn<E, S>(
    engine: Arc<E>,
    signaling: Arc<S>,
    negotiation_timeout: Option<Duration>,
) -> (CallHandle, JoinHandle<()>)
where
    E: MediaEngine,
    S: SignalingChannel,
{
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (notify_tx, _) = broadcast::channel(100);
    let state = Arc::new(RwLock::new(CallSessionState::new()));

    // Vor dem Start abonnieren, damit kein Event verloren geht
    forward(signaling.subscribe(), input_tx.clone(), Input::Signal);
    forward(engine.subscribe(), input_tx.clone(), Input::Engine);

    let (work_tx, work_rx) = mpsc::unbounded_channel();
    let worker = ActionWorker {
        engine,
        signaling,
        inputs: input_tx.clone(),
        notifications: notify_tx.clone(),
    };
    let worker_handle = tokio::spawn(worker.run(work_rx));

    let runtime = ControllerLoop {
        controller: NegotiationController::new(negotiation_timeout),
        state: Arc::clone(&state),
        notifications: notify_tx.clone(),
        work_tx,
    };
    let handle = tokio::spawn(runtime.run(input_rx, worker_handle));

    (
        CallHandle {
            inputs: input_tx,
            notifications: notify_tx,
            state,
        },
        handle,
    )
}

/// Leitet einen Broadcast-Kanal in die Input-Queue weiter
fn forward<T>(
    mut rx: broadcast::Receiver<T>,
    tx: mpsc::UnboundedSender<Input>,
    wrap: fn(T) -> Input,
) where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    if tx.send(wrap(item)).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Event forwarder lagged, {} event(s) lost", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

// ============================================================================
// CONTROLLER LOOP
// ============================================================================

struct ControllerLoop {
    controller: NegotiationController,
    state: Arc<RwLock<CallSessionState>>,
    notifications: broadcast::Sender<CallNotification>,
    work_tx: mpsc::UnboundedSender<Action>,
}

impl ControllerLoop {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>, worker: JoinHandle<()>) {
        while let Some(input) = inputs.recv().await {
            let shutdown = matches!(input, Input::Shutdown);
            let actions = self.dispatch(input);
            self.apply(actions);
            if shutdown {
                break;
            }
        }

        // Worker arbeitet die Queue noch ab (Verbindung freigeben)
        drop(self.work_tx);
        let _ = worker.await;
        tracing::info!("Call runtime stopped");
    }

    fn dispatch(&mut self, input: Input) -> Vec<Action> {
        match input {
            Input::User(action, reply) => {
                let result = match action {
                    UserAction::StartCall => self.controller.start_call(),
                    UserAction::HangUp => self.controller.hang_up(),
                    UserAction::ToggleVideo(on) => self.controller.toggle_video(on),
                    UserAction::ToggleAudio(on) => self.controller.toggle_audio(on),
                };
                match result {
                    Ok(actions) => {
                        let _ = reply.send(Ok(()));
                        actions
                    }
                    Err(e) => {
                        tracing::info!("Refused {:?}: {}", action, e);
                        let _ = reply.send(Err(e));
                        Vec::new()
                    }
                }
            }

            Input::Signal(SignalingEvent::Message(message)) => {
                let kind = message.kind();
                self.controller.handle_signal(message).unwrap_or_else(|e| {
                    tracing::info!("Dropped inbound {}: {}", kind, e);
                    Vec::new()
                })
            }

            Input::Signal(SignalingEvent::Connected) => {
                tracing::info!("Signaling relay connected");
                Vec::new()
            }

            Input::Signal(SignalingEvent::Disconnected) => {
                tracing::warn!("Signaling relay disconnected");
                vec![Action::Notify(CallNotification::RelayUnavailable {
                    message: "relay connection lost".to_string(),
                })]
            }

            Input::Engine(event) => self.controller.on_engine_event(event),

            Input::Completed(attempt, completion) => self
                .controller
                .on_completion(attempt, completion)
                .unwrap_or_else(|e| {
                    tracing::debug!("{}", e);
                    Vec::new()
                }),

            Input::Timeout(attempt) => self.controller.on_timeout(attempt),

            Input::Shutdown => self.controller.shutdown(),
        }
    }

    /// Zustand veröffentlichen, dann Events senden und Befehle einreihen
    fn apply(&self, actions: Vec<Action>) {
        *self.state.write() = self.controller.session().clone();

        for action in actions {
            match action {
                Action::Notify(notification) => {
                    let _ = self.notifications.send(notification);
                }
                other => {
                    if self.work_tx.send(other).is_err() {
                        tracing::error!("Action worker is gone");
                    }
                }
            }
        }
    }
}

// ============================================================================
// ACTION WORKER
// ============================================================================

struct ActionWorker<E, S> {
    engine: Arc<E>,
    signaling: Arc<S>,
    inputs: mpsc::UnboundedSender<Input>,
    notifications: broadcast::Sender<CallNotification>,
}

impl<E: MediaEngine, S: SignalingChannel> ActionWorker<E, S> {
    async fn run(self, mut actions: mpsc::UnboundedReceiver<Action>) {
        while let Some(action) = actions.recv().await {
            self.execute(action).await;
        }
    }

    async fn execute(&self, action: Action) {
        match action {
            Action::OpenConnection(attempt) => {
                let result = self.engine.open(attempt).await;
                self.complete(attempt, Completion::ConnectionOpened(result));
            }
            Action::CreateOffer(attempt) => {
                let result = self.engine.create_offer().await;
                self.complete(attempt, Completion::DescriptionCreated(result));
            }
            Action::CreateAnswer(attempt) => {
                let result = self.engine.create_answer().await;
                self.complete(attempt, Completion::DescriptionCreated(result));
            }
            Action::ApplyLocalDescription(attempt, desc) => {
                let result = self.engine.set_local_description(desc).await;
                self.complete(attempt, Completion::LocalDescriptionApplied(result));
            }
            Action::ApplyRemoteDescription(attempt, desc) => {
                let result = self.engine.set_remote_description(desc).await;
                self.complete(attempt, Completion::RemoteDescriptionApplied(result));
            }
            Action::AddRemoteCandidate(candidate) => {
                if let Err(e) = self.engine.add_remote_candidate(candidate).await {
                    tracing::warn!("Ignoring remote candidate: {}", e);
                }
            }
            Action::AttachTrack(kind) => self.engine.attach_track(kind),
            Action::DetachTrack(kind) => self.engine.detach_track(kind),
            Action::ReleaseConnection => self.engine.release().await,
            Action::Send(message) => {
                let kind = message.kind();
                match self.signaling.send(message).await {
                    Ok(()) => tracing::debug!("Sent {} to peer", kind),
                    Err(e) => {
                        tracing::warn!("Failed to send {}: {}", kind, e);
                        let _ = self.notifications.send(CallNotification::RelayUnavailable {
                            message: e.to_string(),
                        });
                    }
                }
            }
            Action::ScheduleTimeout(attempt, after) => {
                let inputs = self.inputs.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = inputs.send(Input::Timeout(attempt));
                });
            }
            Action::Notify(notification) => {
                let _ = self.notifications.send(notification);
            }
        }
    }

    fn complete(&self, attempt: AttemptId, completion: Completion) {
        let _ = self.inputs.send(Input::Completed(attempt, completion));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::{EngineEventKind, MediaEngineError, TrackKind};
    use crate::negotiation::{EndReason, Phase};
    use crate::signaling::{IceCandidate, SessionDescription, SignalMessage, SignalingError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    // ========================================================================
    // MOCKS
    // ========================================================================

    struct MockEngine {
        calls: Mutex<Vec<String>>,
        offer_delay_ms: AtomicU64,
        reject_candidates: AtomicBool,
        event_tx: broadcast::Sender<EngineEvent>,
    }

    impl MockEngine {
        fn new() -> Arc<Self> {
            let (event_tx, _) = broadcast::channel(16);
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                offer_delay_ms: AtomicU64::new(0),
                reject_candidates: AtomicBool::new(false),
                event_tx,
            })
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn emit(&self, attempt: u64, kind: EngineEventKind) {
            self.event_tx
                .send(EngineEvent {
                    attempt: AttemptId(attempt),
                    kind,
                })
                .unwrap();
        }

        fn position(&self, call: &str) -> usize {
            self.calls()
                .iter()
                .position(|c| c == call)
                .unwrap_or_else(|| panic!("{} not called: {:?}", call, self.calls()))
        }
    }

    #[async_trait]
    impl MediaEngine for MockEngine {
        async fn open(&self, attempt: AttemptId) -> Result<(), MediaEngineError> {
            self.record(format!("open:{}", attempt.0));
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription, MediaEngineError> {
            let delay = self.offer_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.record("create_offer");
            Ok(SessionDescription::offer("mock-offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, MediaEngineError> {
            self.record("create_answer");
            Ok(SessionDescription::answer("mock-answer"))
        }

        async fn set_local_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), MediaEngineError> {
            self.record(format!("set_local:{}", description.sdp));
            Ok(())
        }

        async fn set_remote_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), MediaEngineError> {
            self.record(format!("set_remote:{}", description.sdp));
            Ok(())
        }

        async fn add_remote_candidate(
            &self,
            candidate: IceCandidate,
        ) -> Result<(), MediaEngineError> {
            self.record(format!("candidate:{}", candidate.candidate));
            if self.reject_candidates.load(Ordering::SeqCst) {
                return Err(MediaEngineError::MalformedCandidate(candidate.candidate));
            }
            Ok(())
        }

        fn attach_track(&self, kind: TrackKind) {
            self.record(format!("attach:{}", kind));
        }

        fn detach_track(&self, kind: TrackKind) {
            self.record(format!("detach:{}", kind));
        }

        async fn release(&self) {
            self.record("release");
        }

        fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
            self.event_tx.subscribe()
        }
    }

    struct MockChannel {
        sent: Mutex<Vec<SignalMessage>>,
        fail: AtomicBool,
        event_tx: broadcast::Sender<SignalingEvent>,
    }

    impl MockChannel {
        fn new() -> Arc<Self> {
            let (event_tx, _) = broadcast::channel(16);
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                event_tx,
            })
        }

        fn deliver(&self, message: SignalMessage) {
            self.event_tx
                .send(SignalingEvent::Message(message))
                .unwrap();
        }

        fn sent(&self) -> Vec<SignalMessage> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl SignalingChannel for MockChannel {
        async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SignalingError::NotConnected);
            }
            self.sent.lock().push(message);
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
            self.event_tx.subscribe()
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn wait_for<F>(rx: &mut broadcast::Receiver<CallNotification>, mut pred: F) -> CallNotification
    where
        F: FnMut(&CallNotification) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notification = rx.recv().await.unwrap();
                if pred(&notification) {
                    return notification;
                }
            }
        })
        .await
        .expect("notification not received in time")
    }

    async fn wait_for_phase(rx: &mut broadcast::Receiver<CallNotification>, phase: Phase) {
        wait_for(rx, |n| *n == CallNotification::PhaseChanged { phase }).await;
    }

    fn candidate(name: &str) -> IceCandidate {
        IceCandidate::new(name)
    }

    // ========================================================================
    // TESTS
    // ========================================================================

    #[tokio::test]
    async fn test_caller_flow_end_to_end() {
        let engine = MockEngine::new();
        let channel = MockChannel::new();
        let (handle, _task) = spawn(Arc::clone(&engine), Arc::clone(&channel), None);
        let mut rx = handle.subscribe();

        handle.start_call().await.unwrap();
        wait_for_phase(&mut rx, Phase::AwaitingAnswer).await;
        assert_eq!(
            channel.sent(),
            vec![SignalMessage::Offer(SessionDescription::offer("mock-offer"))]
        );
        assert_eq!(
            &engine.calls()[..3],
            &["open:1", "create_offer", "set_local:mock-offer"]
        );

        // Zweiter Start während des Anrufs wird abgelehnt
        assert!(matches!(
            handle.start_call().await,
            Err(NegotiationError::InvalidTransition { .. })
        ));

        channel.deliver(SignalMessage::Answer(SessionDescription::answer("remote")));
        wait_for_phase(&mut rx, Phase::Connected).await;
        assert_eq!(handle.state().phase, Phase::Connected);

        // Doppeltes Answer: keine zweite Anwendung
        channel.deliver(SignalMessage::Answer(SessionDescription::answer("remote")));
        handle.toggle_video(false).await.unwrap();
        wait_for(&mut rx, |n| matches!(n, CallNotification::MediaToggled { .. })).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let calls = engine.calls();
        assert_eq!(calls.iter().filter(|c| *c == "set_remote:remote").count(), 1);
        assert!(calls.contains(&"detach:video".to_string()));
        assert!(!calls.contains(&"detach:audio".to_string()));
        assert_eq!(handle.state().phase, Phase::Connected);
    }

    #[tokio::test]
    async fn test_callee_flushes_early_candidates_in_order() {
        let engine = MockEngine::new();
        let channel = MockChannel::new();
        let (handle, _task) = spawn(Arc::clone(&engine), Arc::clone(&channel), None);
        let mut rx = handle.subscribe();

        channel.deliver(SignalMessage::Candidate(candidate("c1")));
        channel.deliver(SignalMessage::Offer(SessionDescription::offer("remote-offer")));
        channel.deliver(SignalMessage::Candidate(candidate("c2")));

        wait_for_phase(&mut rx, Phase::Connected).await;
        assert_eq!(
            channel.sent(),
            vec![SignalMessage::Answer(SessionDescription::answer("mock-answer"))]
        );

        let remote = engine.position("set_remote:remote-offer");
        let c1 = engine.position("candidate:c1");
        let c2 = engine.position("candidate:c2");
        assert!(remote < c1 && c1 < c2);
        assert_eq!(
            engine
                .calls()
                .iter()
                .filter(|c| c.starts_with("candidate:"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_local_candidates_are_sent_to_peer() {
        let engine = MockEngine::new();
        let channel = MockChannel::new();
        let (handle, _task) = spawn(Arc::clone(&engine), Arc::clone(&channel), None);
        let mut rx = handle.subscribe();

        // Kein Anruf: verwerfen
        engine.emit(1, EngineEventKind::LocalCandidate(candidate("too-early")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.state().attempt, None);
        assert!(channel.sent().is_empty());

        handle.start_call().await.unwrap();
        wait_for_phase(&mut rx, Phase::AwaitingAnswer).await;

        // Nicht der aktuelle Versuch: verwerfen
        engine.emit(0, EngineEventKind::LocalCandidate(candidate("stale")));
        engine.emit(1, EngineEventKind::LocalCandidate(candidate("host")));

        let host = SignalMessage::Candidate(candidate("host"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while !channel.sent().contains(&host) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let sent = channel.sent();
        let offer = sent
            .iter()
            .position(|m| matches!(m, SignalMessage::Offer(_)))
            .unwrap();
        let host_at = sent.iter().position(|m| *m == host).unwrap();
        assert!(offer < host_at);
        assert!(!sent.contains(&SignalMessage::Candidate(candidate("too-early"))));
        assert!(!sent.contains(&SignalMessage::Candidate(candidate("stale"))));
    }

    #[tokio::test]
    async fn test_malformed_candidate_does_not_end_call() {
        let engine = MockEngine::new();
        engine.reject_candidates.store(true, Ordering::SeqCst);
        let channel = MockChannel::new();
        let (handle, _task) = spawn(Arc::clone(&engine), Arc::clone(&channel), None);
        let mut rx = handle.subscribe();

        channel.deliver(SignalMessage::Candidate(candidate("bogus-early")));
        channel.deliver(SignalMessage::Offer(SessionDescription::offer("remote-offer")));
        wait_for_phase(&mut rx, Phase::Connected).await;

        channel.deliver(SignalMessage::Candidate(candidate("bogus-late")));
        tokio::time::timeout(Duration::from_secs(5), async {
            while !engine.calls().contains(&"candidate:bogus-late".to_string()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.calls().contains(&"candidate:bogus-early".to_string()));
        assert!(!engine.calls().contains(&"release".to_string()));
        assert_eq!(handle.state().phase, Phase::Connected);
        while let Ok(notification) = rx.try_recv() {
            assert!(!matches!(notification, CallNotification::CallEnded { .. }));
        }
    }

    #[tokio::test]
    async fn test_offer_sent_on_relay_connect_is_answered() {
        use crate::signaling::RelayClient;
        use futures::{SinkExt, StreamExt};
        use tokio::net::TcpListener;
        use tokio_tungstenite::tungstenite::Message;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Relay schickt das Offer direkt nach dem Handshake
        let relay_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let offer = SignalMessage::Offer(SessionDescription::offer("early-offer"));
            ws.send(Message::Text(offer.to_json().unwrap())).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    return SignalMessage::from_json(&text).unwrap();
                }
            }
            panic!("relay closed without an answer");
        });

        let engine = MockEngine::new();
        let relay = Arc::new(RelayClient::new(
            format!("http://{}", addr),
            "lobby".to_string(),
            Duration::from_secs(25),
        ));
        let (handle, _task) = spawn(Arc::clone(&engine), Arc::clone(&relay), None);
        relay.connect().await.unwrap();

        let answer = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            answer,
            SignalMessage::Answer(SessionDescription::answer("mock-answer"))
        );
        assert!(engine.calls().contains(&"set_remote:early-offer".to_string()));
        assert_eq!(handle.state().role, Some(crate::negotiation::Role::Callee));
    }

    #[tokio::test]
    async fn test_relay_disconnect_is_reported() {
        let engine = MockEngine::new();
        let channel = MockChannel::new();
        let (handle, _task) = spawn(Arc::clone(&engine), Arc::clone(&channel), None);
        let mut rx = handle.subscribe();

        handle.start_call().await.unwrap();
        wait_for_phase(&mut rx, Phase::AwaitingAnswer).await;

        channel.event_tx.send(SignalingEvent::Disconnected).unwrap();
        let notification = wait_for(&mut rx, |n| {
            matches!(n, CallNotification::RelayUnavailable { .. })
        })
        .await;

        assert_eq!(
            notification,
            CallNotification::RelayUnavailable {
                message: "relay connection lost".to_string()
            }
        );
        assert_eq!(handle.state().phase, Phase::AwaitingAnswer);
    }

    #[tokio::test]
    async fn test_remote_stream_is_announced() {
        let engine = MockEngine::new();
        let channel = MockChannel::new();
        let (handle, _task) = spawn(Arc::clone(&engine), Arc::clone(&channel), None);
        let mut rx = handle.subscribe();

        handle.start_call().await.unwrap();
        wait_for_phase(&mut rx, Phase::AwaitingAnswer).await;

        engine.emit(1, EngineEventKind::RemoteStreamAvailable(TrackKind::Video));
        let notification = wait_for(&mut rx, |n| {
            matches!(n, CallNotification::RemoteStreamAvailable { .. })
        })
        .await;

        assert_eq!(
            notification,
            CallNotification::RemoteStreamAvailable {
                kind: TrackKind::Video
            }
        );
    }

    #[tokio::test]
    async fn test_relay_failure_does_not_tear_down() {
        let engine = MockEngine::new();
        let channel = MockChannel::new();
        channel.fail.store(true, Ordering::SeqCst);
        let (handle, _task) = spawn(Arc::clone(&engine), Arc::clone(&channel), None);
        let mut rx = handle.subscribe();

        handle.start_call().await.unwrap();
        let notification = wait_for(&mut rx, |n| {
            matches!(n, CallNotification::RelayUnavailable { .. })
        })
        .await;

        assert!(matches!(notification, CallNotification::RelayUnavailable { .. }));
        assert_eq!(handle.state().phase, Phase::AwaitingAnswer);
        assert!(!engine.calls().contains(&"release".to_string()));
    }

    #[tokio::test]
    async fn test_hang_up_mid_flight_discards_late_completion() {
        let engine = MockEngine::new();
        engine.offer_delay_ms.store(100, Ordering::SeqCst);
        let channel = MockChannel::new();
        let (handle, _task) = spawn(Arc::clone(&engine), Arc::clone(&channel), None);
        let mut rx = handle.subscribe();

        handle.start_call().await.unwrap();
        handle.hang_up().await.unwrap();
        let ended = wait_for(&mut rx, |n| matches!(n, CallNotification::CallEnded { .. })).await;
        assert_eq!(
            ended,
            CallNotification::CallEnded {
                reason: EndReason::LocalHangUp
            }
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(channel.sent().is_empty());
        assert_eq!(handle.state(), CallSessionState::new());
        assert!(!engine.calls().iter().any(|c| c.starts_with("set_local")));
        assert!(engine.position("create_offer") < engine.position("release"));
    }

    #[tokio::test]
    async fn test_negotiation_timeout_ends_call() {
        let engine = MockEngine::new();
        let channel = MockChannel::new();
        let (handle, _task) = spawn(
            Arc::clone(&engine),
            Arc::clone(&channel),
            Some(Duration::from_millis(50)),
        );
        let mut rx = handle.subscribe();

        handle.start_call().await.unwrap();
        let ended = wait_for(&mut rx, |n| matches!(n, CallNotification::CallEnded { .. })).await;

        assert_eq!(
            ended,
            CallNotification::CallEnded {
                reason: EndReason::Timeout
            }
        );
        assert_eq!(handle.state().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_releases_connection() {
        let engine = MockEngine::new();
        let channel = MockChannel::new();
        let (handle, task) = spawn(Arc::clone(&engine), Arc::clone(&channel), None);

        handle.start_call().await.unwrap();
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(engine.calls().last().map(String::as_str), Some("release"));
        assert_eq!(
            handle.start_call().await,
            Err(NegotiationError::RuntimeStopped)
        );
    }
}
