//! Signaling Module - Austausch von Offer, Answer und Candidates
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay:
//! - Nachrichtenformat (Offer / Answer / Candidate)
//! - Schnittstelle für die Negotiation
//! - WebSocket-Client als Implementierung
//!

mod channel;
mod client;
mod messages;

pub use channel::{SignalingChannel, SignalingError, SignalingEvent};
pub use client::{relay_url, RelayClient};
pub use messages::*;
