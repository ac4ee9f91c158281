//! PeerCall - 1:1 Video-Call über WebRTC
//!
//! Bausteine:
//! - `call_engine`: WebRTC Media Engine (Peer Connection, lokale Tracks)
//! - `signaling`: WebSocket-Relay für Offer, Answer und ICE Candidates
//! - `negotiation`: Zustandsmaschine, die beides zu einem Anruf verbindet
//! - `config`: Konfigurationsdatei und Umgebungsvariablen

pub mod call_engine;
pub mod config;
pub mod negotiation;
pub mod signaling;

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "peercall=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// `RUST_LOG` hat Vorrang; ein zweiter Aufruf ist wirkungslos.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
