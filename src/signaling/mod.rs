//! Signaling Module - REST/SSE-Client für den Relay-Server
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - Server-Push-Stream abonnieren und bei Abbruch neu verbinden
//! - Signal-Envelopes senden (best-effort)
//! - Leave-Notification und ICE-Konfiguration
//!

mod client;
mod messages;

pub use client::{HttpSignalClient, SignalTransport, SignalingError};
pub use messages::*;
