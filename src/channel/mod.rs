//! Channel Module - P2P Voice- und Chat-Verbindung
//!
//! Kernstück der Raum-Kommunikation:
//! - WebRTC Peer Connection und Offer/Answer-Verhandlung
//! - Chat-Datenkanal (Text und Emotes)
//! - Mikrofon-Capture und Audio-Track-Verwaltung
//!

mod audio;
mod engine;

pub use audio::{AudioError, MicCapture, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use engine::{
    default_ice_servers, ChannelError, ChannelEvent, ChannelState, ChatMessage, PresenceUpdate,
    RoomChannel, RoomChannelOptions,
};
