//! Negotiation Module - Offer/Answer-Zustandsmaschine eines 1:1-Anrufs
//!
//! - `controller`: reine Zustandsmaschine (Events rein, Actions raus)
//! - `runtime`: führt den Controller auf einem Task aus und verbindet ihn
//!   mit Media Engine und Signaling-Kanal

mod controller;
mod events;
mod runtime;
mod state;

pub use controller::{NegotiationController, NegotiationError, Operation, MAX_PENDING_CANDIDATES};
pub use events::{Action, CallNotification, Completion, EndReason};
pub use runtime::{spawn, CallHandle};
pub use state::{CallSessionState, MediaFlags, Phase, Role, Stage};
