//! Message Types für das Signaling-Protokoll
//!
//! Diese Strukturen spiegeln das JSON-Format des Relay-Servers wider
//! und ermöglichen typsichere Kommunikation mit Browser-Clients im
//! selben Raum.

use serde::{Deserialize, Serialize};

// ============================================================================
// SIGNAL ENVELOPE
// ============================================================================

/// Signal-Typen, die über den Relay-Server ausgetauscht werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// SDP Offer
    Offer,
    /// SDP Answer
    Answer,
    /// ICE Candidate
    Candidate,
    /// Ein Teilnehmer ist beigetreten oder gegangen
    Presence,
    /// Initiale Teilnehmerliste beim Subscribe
    Welcome,
    /// Ein Teilnehmer hat den Raum verlassen
    Leave,
}

/// Die Einheit, die über den Signaling-Transport läuft.
///
/// `target_id` fehlt bei Broadcasts; der Empfänger filtert Envelopes,
/// die an jemand anderen adressiert sind oder von ihm selbst stammen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub room_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SignalEnvelope {
    pub fn new(
        kind: SignalKind,
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        target_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            target_id,
            payload,
        }
    }
}

// ============================================================================
// PAYLOAD TYPES
// ============================================================================

/// SDP-Beschreibung im Browser-Format (`{"type":"offer","sdp":"..."}`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// Payload eines `presence`-Envelopes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresencePayload {
    #[serde(default)]
    pub action: String,
}

/// Payload eines `welcome`-Envelopes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WelcomePayload {
    #[serde(default)]
    pub participants: Vec<String>,
}

// ============================================================================
// ICE CONFIG (REST)
// ============================================================================

/// Antwort des `ice-config`-Endpoints. Der Server liefert die Liste
/// entweder direkt oder in einem `data`-Wrapper.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IceConfigResponse {
    pub data: Option<IceConfigData>,
    pub ice_servers: Option<Vec<IceServerEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IceConfigData {
    pub ice_servers: Option<Vec<IceServerEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IceServerEntry {
    pub urls: IceUrls,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// `urls` kommt je nach Server als String oder als Liste
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl Default for IceUrls {
    fn default() -> Self {
        IceUrls::Many(Vec::new())
    }
}

impl IceUrls {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url],
            IceUrls::Many(urls) => urls,
        }
    }
}

impl IceConfigResponse {
    /// Löst den optionalen `data`-Wrapper auf
    pub fn into_entries(self) -> Vec<IceServerEntry> {
        if let Some(data) = self.data {
            if let Some(servers) = data.ice_servers {
                return servers;
            }
        }
        self.ice_servers.unwrap_or_default()
    }
}
