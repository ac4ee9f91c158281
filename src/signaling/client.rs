//! WebSocket Client für das Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Raum über Query-Parameter auswählen
//! - Heartbeat (WebSocket Ping) gegen Idle-Timeouts
//! - Eingehende Nachrichten parsen und als Events weiterleiten

use super::channel::{SignalingChannel, SignalingError, SignalingEvent};
use super::messages::SignalMessage;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    tx: Option<mpsc::Sender<Message>>,
}

// ============================================================================
// RELAY CLIENT
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
pub struct RelayClient {
    server_url: String,
    room: String,
    heartbeat_interval: Duration,
    state: Arc<RwLock<ClientState>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl RelayClient {
    /// Erstellt einen neuen RelayClient (noch nicht verbunden)
    pub fn new(server_url: String, room: String, heartbeat_interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url,
            room,
            heartbeat_interval,
            state: Arc::new(RwLock::new(ClientState::default())),
            event_tx,
        }
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Relay und startet Read-, Write- und Heartbeat-Task
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let ws_url = relay_url(&self.server_url, &self.room)?;

        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(100);

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.tx = Some(tx.clone());
        }

        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Read-Task
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match SignalMessage::from_json(&text) {
                        Ok(message) => {
                            tracing::debug!("Relay delivered {}", message.kind());
                            let _ = event_tx.send(SignalingEvent::Message(message));
                        }
                        Err(e) => {
                            tracing::warn!("Ignoring unparseable relay frame: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            {
                let mut state = state_clone.write();
                state.is_connected = false;
                state.tx = None;
            }
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        // Heartbeat-Task
        let state_clone = Arc::clone(&self.state);
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !state_clone.read().is_connected {
                    break;
                }
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    tracing::warn!("Heartbeat stopped: writer closed");
                    break;
                }
            }
        });

        Ok(())
    }

    /// Trennt die Verbindung zum Relay
    pub async fn disconnect(&self) {
        let tx = {
            let mut state = self.state.write();
            state.is_connected = false;
            state.tx.take()
        };

        if let Some(tx) = tx {
            let _ = tx.send(Message::Close(None)).await;
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Message>, SignalingError> {
        self.state.read().tx.clone().ok_or(SignalingError::NotConnected)
    }
}

#[async_trait]
impl SignalingChannel for RelayClient {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let tx = self.sender()?;
        let text = message
            .to_json()
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.send(Message::Text(text))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("server_url", &self.server_url)
            .field("room", &self.room)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}

/// Baut die WebSocket-URL (http → ws, https → wss) inklusive Raum
pub fn relay_url(server_url: &str, room: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(server_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };

    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(server_url.to_string()))?;
    url.query_pairs_mut().append_pair("room", room);

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SessionDescription;
    use tokio::net::TcpListener;

    #[test]
    fn test_relay_url_switches_scheme() {
        let url = relay_url("http://127.0.0.1:3000", "lobby").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:3000/?room=lobby");

        let url = relay_url("https://relay.example.org/signal", "a b").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/signal");
        assert_eq!(url.query(), Some("room=a+b"));
    }

    #[test]
    fn test_relay_url_rejects_other_schemes() {
        assert!(matches!(
            relay_url("ftp://example.org", "lobby"),
            Err(SignalingError::InvalidUrl(_))
        ));
        assert!(relay_url("not a url", "lobby").is_err());
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let client = RelayClient::new(
            "http://127.0.0.1:3000".to_string(),
            "lobby".to_string(),
            Duration::from_secs(25),
        );

        let result = client
            .send(SignalMessage::Offer(SessionDescription::offer("v=0")))
            .await;
        assert_eq!(result, Err(SignalingError::NotConnected));
    }

    #[tokio::test]
    async fn test_exchanges_messages_with_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            ws.send(Message::Text("not json".to_string())).await.unwrap();
            let offer = SignalMessage::Offer(SessionDescription::offer("remote-offer"));
            ws.send(Message::Text(offer.to_json().unwrap()))
                .await
                .unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    return text;
                }
            }
            String::new()
        });

        let client = RelayClient::new(
            format!("http://{}", addr),
            "test-room".to_string(),
            Duration::from_secs(25),
        );
        let mut events = client.subscribe();
        client.connect().await.unwrap();
        assert!(client.is_connected());

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let SignalingEvent::Message(msg) = events.recv().await.unwrap() {
                    return msg;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(
            received,
            SignalMessage::Offer(SessionDescription::offer("remote-offer"))
        );

        let answer = SignalMessage::Answer(SessionDescription::answer("local-answer"));
        client.send(answer.clone()).await.unwrap();

        let text = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(SignalMessage::from_json(&text).unwrap(), answer);
    }
}
