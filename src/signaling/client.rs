//! HTTP-Client für den Signaling-Relay-Server
//!
//! Verwaltet den Server-Push-Stream (SSE) und die REST-Endpoints:
//! - Subscribe mit automatischer Reconnection und Backoff
//! - Fire-and-forget Senden von Signal-Envelopes
//! - Leave-Notification beim Verlassen des Raums
//! - ICE-Konfiguration vom Server laden

use super::messages::{IceConfigResponse, SignalEnvelope};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Failed to send signal: {0}")]
    SendFailed(String),

    #[error("Transport already closed")]
    Closed,
}

// ============================================================================
// TRANSPORT CONTRACT
// ============================================================================

/// Kontrakt des Signaling-Transports.
///
/// Der Empfangsstrom ist unidirektionaler Server-Push; `send` und `leave`
/// sind Request/Response und aus Sicht des Aufrufers best-effort. Hinter
/// dieser Schnittstelle lassen sich der HTTP-Relay-Client und Test-Mocks
/// austauschen.
#[async_trait::async_trait]
pub trait SignalTransport: Send + Sync {
    /// Öffnet den Empfangsstrom für den Raum. Pro Session genau einmal.
    async fn subscribe(&self) -> Result<mpsc::Receiver<SignalEnvelope>, SignalingError>;

    /// Sendet ein Envelope an den Relay-Server.
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;

    /// Best-effort Abmeldung; beendet auch die Reconnect-Schleife.
    async fn leave(&self) -> Result<(), SignalingError>;
}

// ============================================================================
// RECONNECT BACKOFF
// ============================================================================

const BACKOFF_INITIAL: Duration = Duration::from_millis(1000);
const BACKOFF_MAX: Duration = Duration::from_millis(10000);

/// Verdoppelnder Backoff für die Stream-Reconnection.
///
/// Der Backoff wird nach einem erfolgreichen Reconnect bewusst nicht
/// zurückgesetzt; nur ein Neustart der Session beginnt wieder bei 1s.
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            current: BACKOFF_INITIAL,
        }
    }

    /// Gibt die nächste Wartezeit zurück und verdoppelt bis zum Maximum.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(BACKOFF_MAX);
        delay
    }
}

// ============================================================================
// SSE PARSER
// ============================================================================

/// Ein vollständiges Server-Sent Event
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub(crate) name: String,
    pub(crate) data: String,
}

/// Inkrementeller Parser für `text/event-stream`.
///
/// Chunks dürfen an beliebigen Stellen geschnitten sein; nur vollständige
/// Zeilen werden verarbeitet. `id`- und `retry`-Felder sowie Kommentare
/// (Heartbeats) werden ignoriert.
pub(crate) struct SseParser {
    buf: Vec<u8>,
    event: String,
    data: String,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::new(),
            event: String::new(),
            data: String::new(),
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // '\n'
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event = value.strip_prefix(' ').unwrap_or(value).to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push_str(value.strip_prefix(' ').unwrap_or(value));
                self.data.push('\n');
            }
            // ':'-Kommentare, id und retry werden nicht ausgewertet
        }

        events
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event.clear();
            return None;
        }
        let mut data = std::mem::take(&mut self.data);
        data.pop(); // letztes '\n' gehört nicht zu den Daten
        let name = if self.event.is_empty() {
            "message".to_string()
        } else {
            std::mem::take(&mut self.event)
        };
        self.event.clear();
        Some(SseEvent { name, data })
    }
}

// ============================================================================
// HTTP SIGNAL CLIENT
// ============================================================================

/// Signaling-Transport über den REST/SSE-Relay-Server.
///
/// `base_url` zeigt auf das RTC-Prefix des Servers, z.B.
/// `https://host/api/game/rtc`.
pub struct HttpSignalClient {
    http: reqwest::Client,
    base_url: String,
    room_id: String,
    participant_id: String,
    auth_token: Option<String>,
    closed: Arc<AtomicBool>,
}

impl HttpSignalClient {
    pub fn new(
        base_url: impl Into<String>,
        room_id: impl Into<String>,
        participant_id: impl Into<String>,
        auth_token: Option<String>,
    ) -> Result<Self, SignalingError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        // Frühe Validierung; alle Endpoints leiten sich hiervon ab
        Url::parse(&base_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            room_id: room_id.into(),
            participant_id: participant_id.into(),
            auth_token,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn subscribe_url(&self) -> Result<Url, SignalingError> {
        let mut params = vec![
            ("roomId", self.room_id.clone()),
            ("participantId", self.participant_id.clone()),
        ];
        if let Some(token) = &self.auth_token {
            params.push(("token", token.clone()));
        }
        Url::parse_with_params(&format!("{}/signal/subscribe", self.base_url), params)
            .map_err(|e| SignalingError::InvalidUrl(e.to_string()))
    }

    /// Lädt die STUN/TURN-Konfiguration des Servers. Fehler sind hier
    /// nicht fatal; der Aufrufer fällt auf seine Defaults zurück.
    pub async fn fetch_ice_config(&self) -> Result<Vec<RTCIceServer>, SignalingError> {
        let url = Url::parse_with_params(
            &format!("{}/ice-config", self.base_url),
            [("participantId", self.participant_id.clone())],
        )
        .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        let response = self
            .http
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        let config: IceConfigResponse = response
            .json()
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        let servers: Vec<RTCIceServer> = config
            .into_entries()
            .into_iter()
            .map(|entry| RTCIceServer {
                urls: entry.urls.into_vec(),
                username: entry.username.unwrap_or_default(),
                credential: entry.credential.unwrap_or_default(),
                ..Default::default()
            })
            .filter(|server| !server.urls.is_empty())
            .collect();

        Ok(servers)
    }
}

#[async_trait::async_trait]
impl SignalTransport for HttpSignalClient {
    async fn subscribe(&self) -> Result<mpsc::Receiver<SignalEnvelope>, SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }

        let url = self.subscribe_url()?;
        let (tx, rx) = mpsc::channel::<SignalEnvelope>(64);
        let http = self.http.clone();
        let closed = Arc::clone(&self.closed);

        tokio::spawn(async move {
            let mut backoff = Backoff::new();
            loop {
                if closed.load(Ordering::SeqCst) || tx.is_closed() {
                    break;
                }

                match http
                    .get(url.as_str())
                    .header(reqwest::header::ACCEPT, "text/event-stream")
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => {
                        tracing::info!("Signal stream connected");
                        let mut stream = response.bytes_stream();
                        let mut parser = SseParser::new();
                        while let Some(chunk) = stream.next().await {
                            match chunk {
                                Ok(bytes) => {
                                    for event in parser.push(&bytes) {
                                        if event.name != "signal" {
                                            continue;
                                        }
                                        match serde_json::from_str::<SignalEnvelope>(&event.data) {
                                            Ok(envelope) => {
                                                if tx.send(envelope).await.is_err() {
                                                    return;
                                                }
                                            }
                                            Err(e) => {
                                                tracing::debug!(
                                                    "Dropping malformed signal: {}",
                                                    e
                                                );
                                            }
                                        }
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("Signal stream error: {}", e);
                                    break;
                                }
                            }
                        }
                        tracing::info!("Signal stream closed");
                    }
                    Ok(response) => {
                        tracing::warn!("Subscribe rejected: {}", response.status());
                    }
                    Err(e) => {
                        tracing::warn!("Subscribe failed: {}", e);
                    }
                }

                if closed.load(Ordering::SeqCst) || tx.is_closed() {
                    break;
                }
                let delay = backoff.next_delay();
                tracing::debug!("Reconnecting signal stream in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        });

        Ok(rx)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        let url = format!("{}/signal", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SignalingError::SendFailed(format!(
                "server returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn leave(&self) -> Result<(), SignalingError> {
        // Flag zuerst, damit die Reconnect-Schleife nicht weiterläuft
        self.closed.store(true, Ordering::SeqCst);

        let url = Url::parse_with_params(
            &format!("{}/signal/leave", self.base_url),
            [
                ("roomId", self.room_id.clone()),
                ("participantId", self.participant_id.clone()),
            ],
        )
        .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        self.http
            .delete(url.as_str())
            .send()
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for HttpSignalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSignalClient")
            .field("base_url", &self.base_url)
            .field("room_id", &self.room_id)
            .field("participant_id", &self.participant_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10000, 10000]);
    }

    #[test]
    fn sse_parser_handles_single_event() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: signal\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "signal");
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn sse_parser_handles_chunk_boundaries() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: sig").is_empty());
        assert!(parser.push(b"nal\r\ndata: hel").is_empty());
        let events = parser.push(b"lo\r\n\r\nevent: signal\ndata: world\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[1].data, "world");
    }

    #[test]
    fn sse_parser_joins_multiline_data_and_skips_comments() {
        let mut parser = SseParser::new();
        let events = parser.push(b": heartbeat\ndata: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "message");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn sse_parser_ignores_empty_dispatch() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"\n\n\n").is_empty());
    }

    #[test]
    fn subscribe_url_contains_room_and_participant() {
        let client =
            HttpSignalClient::new("http://api.test/rtc/", "room1", "p1", Some("tkn".into()))
                .unwrap();
        let url = client.subscribe_url().unwrap();
        assert_eq!(
            url.as_str(),
            "http://api.test/rtc/signal/subscribe?roomId=room1&participantId=p1&token=tkn"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(
            HttpSignalClient::new("not a url", "r", "p", None),
            Err(SignalingError::InvalidUrl(_))
        ));
    }
}
