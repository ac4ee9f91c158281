//! Schmale Schnittstelle zwischen Negotiation und Signaling-Relay

use super::messages::SignalMessage;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom Signaling-Kanal ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Nachricht vom Peer
    Message(SignalMessage),
}

// ============================================================================
// CHANNEL TRAIT
// ============================================================================

/// Bidirektionaler Nachrichtenkanal zum anderen Endpunkt.
///
/// Das Relay garantiert weder Reihenfolge noch Zustellung.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    /// Sendet eine Nachricht an den Peer
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;

    /// Gibt einen Event-Receiver für eingehende Nachrichten zurück
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;
}
