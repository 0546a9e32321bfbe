//! Room Call - P2P Voice und Chat für Zwei-Spieler-Räume
//!
//! Kommunikations-Subsystem für Raum-Sessions:
//! - REST/SSE-Signaling über einen Relay-Server
//! - WebRTC für P2P Audio und Chat-Datenkanal
//! - Automatischer Reconnect und ICE-Restart
//!
//! Typischer Ablauf: [`HttpSignalClient`] für den Raum erstellen,
//! optional die ICE-Konfiguration vom Server holen, dann über
//! [`RoomChannel::connect`] die Session mounten. Events kommen über
//! [`RoomChannel::subscribe`]; `close()` beendet die Session endgültig.

pub mod channel;
pub mod signaling;

pub use channel::{
    default_ice_servers, ChannelError, ChannelEvent, ChannelState, ChatMessage, PresenceUpdate,
    RoomChannel, RoomChannelOptions,
};
pub use signaling::{HttpSignalClient, SignalEnvelope, SignalKind, SignalTransport, SignalingError};
