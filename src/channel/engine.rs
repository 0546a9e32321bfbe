//! Raum-Kanal: WebRTC-Verhandlung, Chat-Datenkanal und Audio-Tracks
//!
//! Verwaltet genau eine Peer Connection pro Raum-Session und koordiniert
//! Offer/Answer/Candidate-Austausch über den Signaling-Transport.
//!
//! Hinweis: Opus Encoding wird später hinzugefügt; bis dahin werden
//! Audio-Tracks nur ausgehandelt, nicht mit Capture-Daten befüllt.

use super::audio::{AudioError, MicCapture, CHANNELS, SAMPLE_RATE};
use crate::signaling::{
    PresencePayload, SdpPayload, SignalEnvelope, SignalKind, SignalTransport, SignalingError,
    WelcomePayload,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Label des Chat-Datenkanals; muss mit den Browser-Clients übereinstimmen
const CHAT_CHANNEL_LABEL: &str = "chat";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("roomId is required")]
    MissingRoomId,

    #[error("participantId is required")]
    MissingParticipantId,

    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Channel already closed")]
    Closed,
}

// ============================================================================
// CHANNEL STATE & EVENTS
// ============================================================================

/// Verhandlungszustand des Raum-Kanals
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Gegenseite noch unbekannt
    Idle,
    /// Offer verschickt oder empfangen, noch nicht verbunden
    Negotiating,
    /// ICE verbunden
    Connected,
    /// Session beendet
    Closed,
}

/// Eingegangene Chat-Nachricht
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub sender_id: Option<String>,
    pub message: String,
    /// Zustellzeitpunkt in Millisekunden (Unix)
    pub sent_at: i64,
}

/// Presence-Änderung im Raum
#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    pub sender_id: String,
    pub action: String,
}

/// Events, die der RoomChannel auslöst
#[derive(Clone)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    Chat(ChatMessage),
    Emote(String),
    Presence(PresenceUpdate),
    /// Eingehender Audio-Track; die Wiedergabe übernimmt der Aufrufer
    RemoteAudio(Arc<TrackRemote>),
}

impl std::fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            ChannelEvent::Chat(msg) => f.debug_tuple("Chat").field(msg).finish(),
            ChannelEvent::Emote(emote) => f.debug_tuple("Emote").field(emote).finish(),
            ChannelEvent::Presence(update) => f.debug_tuple("Presence").field(update).finish(),
            ChannelEvent::RemoteAudio(_) => f.write_str("RemoteAudio"),
        }
    }
}

// ============================================================================
// DATA CHANNEL MESSAGES
// ============================================================================

/// Nachrichten auf dem Chat-Datenkanal (`{"type":"chat",...}`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ChannelMessage {
    Chat { message: String },
    Emote { emote: String },
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN-Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        ..Default::default()
    }]
}

/// Konfiguration einer Raum-Session
#[derive(Debug, Clone)]
pub struct RoomChannelOptions {
    pub room_id: String,
    pub participant_id: String,
    pub ice_servers: Vec<RTCIceServer>,
}

impl RoomChannelOptions {
    pub fn new(room_id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            participant_id: participant_id.into(),
            ice_servers: default_ice_servers(),
        }
    }

    /// Ersetzt die ICE-Server, z.B. durch die Antwort von
    /// [`HttpSignalClient::fetch_ice_config`](crate::signaling::HttpSignalClient::fetch_ice_config).
    pub fn with_ice_servers(mut self, ice_servers: Vec<RTCIceServer>) -> Self {
        self.ice_servers = ice_servers;
        self
    }
}

// ============================================================================
// ROLE ASSIGNMENT
// ============================================================================

/// Legt den Anrufer fest: die lexikographisch größere Teilnehmer-ID
/// erzeugt alle Offers, die kleinere antwortet nur.
///
/// Beim Join erfahren beide Seiten nahezu gleichzeitig voneinander
/// (`welcome` beim Beitretenden, `presence` beim Wartenden). Würden
/// beide anbieten, könnten Offers kollidieren, und der
/// Signaling-Automat kennt keinen lokalen Rollback; eine feste Rolle
/// schließt die Kollision aus.
fn initiates_negotiation(local_id: &str, remote_id: &str) -> bool {
    local_id > remote_id
}

/// ICE-Zustände, die einen Restart auslösen
fn ice_needs_restart(state: RTCIceConnectionState) -> bool {
    matches!(
        state,
        RTCIceConnectionState::Failed | RTCIceConnectionState::Disconnected
    )
}

// ============================================================================
// ROOM CHANNEL
// ============================================================================

struct ChannelInner {
    room_id: String,
    participant_id: String,
    transport: Arc<dyn SignalTransport>,
    pc: Arc<RTCPeerConnection>,
    state: Mutex<ChannelState>,
    /// First-writer-wins; wird innerhalb einer Session nie ersetzt
    remote_peer: Mutex<Option<String>>,
    chat_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    mic: Mutex<Option<MicCapture>>,
    closed: AtomicBool,
    event_tx: broadcast::Sender<ChannelEvent>,
}

/// P2P Voice- und Chat-Kanal für einen Zwei-Spieler-Raum.
///
/// Eine Instanz pro gemountetem Raum; besitzt genau eine Peer Connection
/// und genau eine Empfangsschleife auf dem Signaling-Transport. `close()`
/// reißt alles atomar ab; es gibt keine Persistenz über Sessions hinweg.
pub struct RoomChannel {
    inner: Arc<ChannelInner>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomChannel {
    /// Erstellt den Kanal und öffnet den Signaling-Stream.
    ///
    /// Fehlende IDs schlagen sofort fehl (Programmierfehler); alle
    /// Laufzeitfehler danach werden intern behandelt.
    pub async fn connect<T>(
        options: RoomChannelOptions,
        transport: Arc<T>,
    ) -> Result<Self, ChannelError>
    where
        T: SignalTransport + 'static,
    {
        if options.room_id.trim().is_empty() {
            return Err(ChannelError::MissingRoomId);
        }
        if options.participant_id.trim().is_empty() {
            return Err(ChannelError::MissingParticipantId);
        }
        let transport: Arc<dyn SignalTransport> = transport;

        let pc = Self::create_peer_connection(options.ice_servers).await?;
        // Der Audio-Track wird vor dem ersten Offer angemeldet, damit
        // jede Verhandlung die Audio-Sektion bereits enthält und mic-on
        // auf keiner Seite eine neue m-Line braucht
        register_audio_track(&pc).await?;
        let (event_tx, _) = broadcast::channel(100);

        let inner = Arc::new(ChannelInner {
            room_id: options.room_id,
            participant_id: options.participant_id,
            transport,
            pc,
            state: Mutex::new(ChannelState::Idle),
            remote_peer: Mutex::new(None),
            chat_channel: Mutex::new(None),
            mic: Mutex::new(None),
            closed: AtomicBool::new(false),
            event_tx,
        });

        inner.register_pc_handlers();

        let mut rx = inner.transport.subscribe().await?;
        let loop_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                loop_inner.handle_signal(envelope).await;
            }
        });

        tracing::info!("Room channel ready");

        Ok(Self {
            inner,
            recv_task: Mutex::new(Some(handle)),
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Gibt den aktuellen Verhandlungszustand zurück
    pub fn state(&self) -> ChannelState {
        self.inner.state.lock().clone()
    }

    /// Gibt die ID der Gegenseite zurück, sobald sie bekannt ist
    pub fn remote_participant(&self) -> Option<String> {
        self.inner.remote_peer.lock().clone()
    }

    /// Gibt den Mikrofonpegel zurück (0.0 wenn das Mikrofon aus ist)
    pub fn mic_level(&self) -> f32 {
        self.inner
            .mic
            .lock()
            .as_ref()
            .map(|capture| capture.input_level())
            .unwrap_or(0.0)
    }

    /// Sendet eine Chat-Nachricht über den Datenkanal (best-effort)
    pub async fn send_chat(&self, message: &str) {
        if message.is_empty() {
            return;
        }
        self.inner
            .send_channel_message(ChannelMessage::Chat {
                message: message.to_string(),
            })
            .await;
    }

    /// Sendet ein Emote-Symbol über den Datenkanal (best-effort)
    pub async fn send_emote(&self, emote: &str) {
        if emote.is_empty() {
            return;
        }
        self.inner
            .send_channel_message(ChannelMessage::Emote {
                emote: emote.to_string(),
            })
            .await;
    }

    /// Schaltet das Mikrofon ein oder aus.
    ///
    /// Einschalten erwirbt einmalig ein Capture-Device und meldet einen
    /// Audio-Track an; Capture-Fehler gehen an den Aufrufer. Ausschalten
    /// stoppt nur die Aufnahme; die Gegenseite erkennt Stille, erst
    /// erneutes Senden braucht ein frisches Offer.
    pub async fn set_mic(&self, on: bool) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }

        if on {
            if inner.mic.lock().is_none() {
                let mut capture = MicCapture::new()?;
                capture.start()?;
                *inner.mic.lock() = Some(capture);
                // TODO: Capture-Frames (MicCapture::read_frame) per Opus-Encoder
                // in den registrierten Track schreiben, sobald ein Encoder
                // eingebunden ist
            }
            // Der Track selbst ist seit dem Verbindungsaufbau angemeldet;
            // der Anrufer stößt hier höchstens eine Nachverhandlung an
            inner.create_offer_if_needed().await;
            Ok(())
        } else {
            if let Some(mut capture) = inner.mic.lock().take() {
                capture.stop();
            }
            Ok(())
        }
    }

    /// Beendet die Session. Idempotent; wiederholte Aufrufe sind no-ops.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Closing room channel");

        if let Some(handle) = self.recv_task.lock().take() {
            handle.abort();
        }

        let chat = self.inner.chat_channel.lock().take();
        if let Some(dc) = chat {
            let _ = dc.close().await;
        }
        let _ = self.inner.pc.close().await;

        if let Some(mut capture) = self.inner.mic.lock().take() {
            capture.stop();
        }

        // Best-effort; für die Korrektheit nicht erforderlich
        if let Err(e) = self.inner.transport.leave().await {
            tracing::debug!("Leave notification failed: {}", e);
        }

        self.inner.set_state(ChannelState::Closed);
    }

    /// Erstellt die Peer Connection mit Default-Codecs und -Interceptors
    async fn create_peer_connection(
        ice_servers: Vec<RTCIceServer>,
    ) -> Result<Arc<RTCPeerConnection>, ChannelError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| ChannelError::WebRTC(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| ChannelError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| ChannelError::WebRTC(e.to_string()))?;

        Ok(Arc::new(pc))
    }
}

/// Meldet den Opus-Audio-Track an der Peer Connection an.
///
/// Wird genau einmal beim Verbindungsaufbau aufgerufen; Mic-Toggles
/// starten und stoppen nur die Aufnahme und fügen nie weitere Sender
/// hinzu.
async fn register_audio_track(
    pc: &Arc<RTCPeerConnection>,
) -> Result<Arc<TrackLocalStaticRTP>, ChannelError> {
    let track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: SAMPLE_RATE,
            channels: CHANNELS,
            ..Default::default()
        },
        "audio".to_string(),
        "room-call".to_string(),
    ));
    pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| ChannelError::WebRTC(e.to_string()))?;
    Ok(track)
}

impl std::fmt::Debug for RoomChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomChannel")
            .field("room_id", &self.inner.room_id)
            .field("participant_id", &self.inner.participant_id)
            .field("state", &self.state())
            .field("remote", &self.remote_participant())
            .finish()
    }
}

// ============================================================================
// INTERNALS
// ============================================================================

impl ChannelInner {
    /// Registriert die Event Handler der Peer Connection
    fn register_pc_handlers(self: &Arc<Self>) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);
                Box::pin(async {})
            }));

        {
            let weak = Arc::downgrade(self);
            self.pc
                .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                    tracing::info!("ICE connection state: {:?}", state);
                    let weak = weak.clone();
                    Box::pin(async move {
                        let Some(inner) = weak.upgrade() else { return };
                        match state {
                            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                                inner.set_state(ChannelState::Connected);
                            }
                            state if ice_needs_restart(state) => {
                                // Genau ein Restart-Offer pro Zustandswechsel
                                inner.restart_ice().await;
                            }
                            _ => {}
                        }
                    })
                }));
        }

        {
            let weak = Arc::downgrade(self);
            self.pc
                .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let Some(inner) = weak.upgrade() else { return };
                        if inner.closed.load(Ordering::SeqCst) {
                            return;
                        }
                        let Some(candidate) = candidate else {
                            return; // ICE gathering abgeschlossen
                        };
                        let init = match candidate.to_json() {
                            Ok(init) => init,
                            Err(e) => {
                                tracing::debug!("Failed to convert ICE candidate: {}", e);
                                return;
                            }
                        };
                        match serde_json::to_value(&init) {
                            Ok(payload) => {
                                let target = inner.remote_peer.lock().clone();
                                inner.send_signal(SignalKind::Candidate, target, payload).await;
                            }
                            Err(e) => tracing::debug!("Failed to encode ICE candidate: {}", e),
                        }
                    })
                }));
        }

        {
            let weak = Arc::downgrade(self);
            self.pc.on_track(Box::new(move |track, _, _| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        tracing::info!("Remote track received: {:?}", track.kind());
                        let _ = inner.event_tx.send(ChannelEvent::RemoteAudio(track));
                    }
                })
            }));
        }

        {
            let weak = Arc::downgrade(self);
            self.pc
                .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let Some(inner) = weak.upgrade() else { return };
                        if dc.label() != CHAT_CHANNEL_LABEL {
                            tracing::debug!("Ignoring unexpected data channel '{}'", dc.label());
                            return;
                        }
                        inner.wire_chat_channel(&dc);
                        *inner.chat_channel.lock() = Some(dc);
                    })
                }));
        }
    }

    /// Verarbeitet ein Envelope vom Signaling-Stream
    async fn handle_signal(self: &Arc<Self>, envelope: SignalEnvelope) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        // An jemand anderen adressierte Envelopes ignorieren
        if let Some(target) = &envelope.target_id {
            if target != &self.participant_id {
                return;
            }
        }
        // Eigene Envelopes ignorieren; welcome trägt serverseitig die
        // eigene ID als Absender und ist deshalb ausgenommen
        if envelope.kind != SignalKind::Welcome && envelope.sender_id == self.participant_id {
            return;
        }

        // Streng zweiseitig: Verhandlungs-Signale einer dritten ID
        // ersetzen die Gegenseite nie
        if matches!(
            envelope.kind,
            SignalKind::Offer | SignalKind::Answer | SignalKind::Candidate
        ) {
            let remote = self.remote_peer.lock().clone();
            if let Some(remote) = remote {
                if remote != envelope.sender_id {
                    tracing::debug!(
                        "Ignoring {:?} from third participant {}",
                        envelope.kind,
                        envelope.sender_id
                    );
                    return;
                }
            }
        }

        match envelope.kind {
            SignalKind::Offer => self.handle_offer(envelope).await,
            SignalKind::Answer => self.handle_answer(envelope).await,
            SignalKind::Candidate => {
                match serde_json::from_value::<RTCIceCandidateInit>(envelope.payload) {
                    Ok(init) => {
                        // Späte/doppelte Candidates sind häufig und nicht fatal
                        if let Err(e) = self.pc.add_ice_candidate(init).await {
                            tracing::debug!("Ignoring ICE candidate: {}", e);
                        }
                    }
                    Err(e) => tracing::debug!("Malformed ICE candidate: {}", e),
                }
            }
            SignalKind::Presence => {
                let payload: PresencePayload =
                    serde_json::from_value(envelope.payload).unwrap_or_default();
                let _ = self.event_tx.send(ChannelEvent::Presence(PresenceUpdate {
                    sender_id: envelope.sender_id.clone(),
                    action: payload.action.clone(),
                }));
                // Wer die Gegenseite zuerst sieht, ruft an
                if payload.action == "join" && self.adopt_remote(&envelope.sender_id) {
                    self.create_offer_if_needed().await;
                }
            }
            SignalKind::Welcome => {
                if self.remote_peer.lock().is_some() {
                    return;
                }
                let payload: WelcomePayload =
                    serde_json::from_value(envelope.payload).unwrap_or_default();
                let candidate = payload
                    .participants
                    .iter()
                    .find(|p| !p.is_empty() && **p != self.participant_id);
                if let Some(candidate) = candidate {
                    if self.adopt_remote(candidate) {
                        self.create_offer_if_needed().await;
                    }
                }
            }
            SignalKind::Leave => {
                let _ = self.event_tx.send(ChannelEvent::Presence(PresenceUpdate {
                    sender_id: envelope.sender_id,
                    action: "leave".to_string(),
                }));
            }
        }
    }

    /// Eingehendes Offer: Remote Description setzen, Answer zurücksenden
    async fn handle_offer(self: &Arc<Self>, envelope: SignalEnvelope) {
        let sender = envelope.sender_id.clone();
        self.adopt_remote(&sender);

        // Mit fester Anrufer-Rolle kann ein kollidierendes Offer nur von
        // einem fehlerhaften Peer stammen; es wird verworfen
        if self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            tracing::warn!("Ignoring colliding offer from {}", sender);
            return;
        }

        let payload: SdpPayload = match serde_json::from_value(envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("Malformed offer payload: {}", e);
                return;
            }
        };
        let offer = match RTCSessionDescription::offer(payload.sdp) {
            Ok(offer) => offer,
            Err(e) => {
                tracing::debug!("Invalid offer SDP: {}", e);
                return;
            }
        };

        if let Err(e) = self.pc.set_remote_description(offer).await {
            tracing::debug!("Failed to apply remote offer: {}", e);
            return;
        }
        self.set_state(ChannelState::Negotiating);

        let answer = match self.pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::debug!("Failed to create answer: {}", e);
                return;
            }
        };
        if let Err(e) = self.pc.set_local_description(answer.clone()).await {
            tracing::debug!("Failed to apply local answer: {}", e);
            return;
        }

        match serde_json::to_value(&answer) {
            Ok(payload) => {
                // Immer an den ursprünglichen Absender, nie an Dritte
                self.send_signal(SignalKind::Answer, Some(sender), payload)
                    .await;
            }
            Err(e) => tracing::debug!("Failed to encode answer: {}", e),
        }
    }

    /// Eingehendes Answer: Remote Description setzen
    async fn handle_answer(self: &Arc<Self>, envelope: SignalEnvelope) {
        self.adopt_remote(&envelope.sender_id);

        let payload: SdpPayload = match serde_json::from_value(envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("Malformed answer payload: {}", e);
                return;
            }
        };
        let answer = match RTCSessionDescription::answer(payload.sdp) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::debug!("Invalid answer SDP: {}", e);
                return;
            }
        };
        if let Err(e) = self.pc.set_remote_description(answer).await {
            tracing::debug!("Failed to apply remote answer: {}", e);
        }
    }

    /// Erstellt ein Offer, wenn die Gegenseite bekannt ist, der Zustand
    /// stabil ist und kein lokales Offer aussteht.
    async fn create_offer_if_needed(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(remote) = self.remote_peer.lock().clone() else {
            return; // erst anrufen, wenn die Gegenseite bekannt ist
        };
        // Nur der Anrufer erzeugt Offers; die Gegenseite wartet und antwortet
        if !initiates_negotiation(&self.participant_id, &remote) {
            return;
        }
        if self.pc.signaling_state() != RTCSignalingState::Stable {
            return;
        }
        if self.pc.pending_local_description().await.is_some() {
            return; // Offer bereits unterwegs
        }

        // Chat-Kanal vor dem ersten Offer anlegen, damit er mitverhandelt wird
        if let Err(e) = self.ensure_chat().await {
            tracing::debug!("Chat channel creation failed: {}", e);
        }

        let offer = match self.pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::debug!("Failed to create offer: {}", e);
                return;
            }
        };
        if let Err(e) = self.pc.set_local_description(offer.clone()).await {
            tracing::debug!("Failed to apply local offer: {}", e);
            return;
        }
        self.set_state(ChannelState::Negotiating);

        match serde_json::to_value(&offer) {
            Ok(payload) => self.send_signal(SignalKind::Offer, Some(remote), payload).await,
            Err(e) => tracing::debug!("Failed to encode offer: {}", e),
        }
    }

    /// ICE-Restart nach `failed`/`disconnected`: ein Offer mit
    /// Restart-Flag direkt an die bekannte Gegenseite, ohne auf ein
    /// Presence-Event zu warten. Kein Cap, kein Backoff.
    async fn restart_ice(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(remote) = self.remote_peer.lock().clone() else {
            return;
        };
        // Auch den Restart fährt der Anrufer; die Gegenseite sieht den
        // Ausfall ebenfalls und bekommt das Restart-Offer zugestellt
        if !initiates_negotiation(&self.participant_id, &remote) {
            return;
        }
        tracing::warn!("ICE connection lost, restarting");

        let options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };
        let offer = match self.pc.create_offer(Some(options)).await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::debug!("Failed to create restart offer: {}", e);
                return;
            }
        };
        if let Err(e) = self.pc.set_local_description(offer.clone()).await {
            tracing::debug!("Failed to apply restart offer: {}", e);
            return;
        }
        self.set_state(ChannelState::Negotiating);

        match serde_json::to_value(&offer) {
            Ok(payload) => self.send_signal(SignalKind::Offer, Some(remote), payload).await,
            Err(e) => tracing::debug!("Failed to encode restart offer: {}", e),
        }
    }

    /// Erzeugt den Chat-Kanal höchstens einmal pro Connection
    async fn ensure_chat(self: &Arc<Self>) -> Result<Arc<RTCDataChannel>, ChannelError> {
        if let Some(dc) = self.chat_channel.lock().clone() {
            return Ok(dc);
        }

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(CHAT_CHANNEL_LABEL, Some(init))
            .await
            .map_err(|e| ChannelError::WebRTC(e.to_string()))?;
        self.wire_chat_channel(&dc);
        *self.chat_channel.lock() = Some(Arc::clone(&dc));
        Ok(dc)
    }

    /// Verdrahtet Message- und Open-Handler eines Chat-Kanals
    fn wire_chat_channel(self: &Arc<Self>, dc: &Arc<RTCDataChannel>) {
        {
            let weak = Arc::downgrade(self);
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else { return };
                    let text = String::from_utf8_lossy(&msg.data);
                    match serde_json::from_str::<ChannelMessage>(&text) {
                        Ok(ChannelMessage::Chat { message }) => {
                            let sender_id = inner.remote_peer.lock().clone();
                            let _ = inner.event_tx.send(ChannelEvent::Chat(ChatMessage {
                                sender_id,
                                message,
                                sent_at: chrono::Utc::now().timestamp_millis(),
                            }));
                        }
                        Ok(ChannelMessage::Emote { emote }) => {
                            let _ = inner.event_tx.send(ChannelEvent::Emote(emote));
                        }
                        Err(e) => tracing::debug!("Dropping malformed channel message: {}", e),
                    }
                })
            }));
        }
        {
            let label = dc.label().to_string();
            dc.on_open(Box::new(move || {
                tracing::info!("Data channel '{}' open", label);
                Box::pin(async {})
            }));
        }
    }

    /// Serialisiert und verschickt eine Kanal-Nachricht (best-effort)
    async fn send_channel_message(self: &Arc<Self>, message: ChannelMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let dc = match self.ensure_chat().await {
            Ok(dc) => dc,
            Err(e) => {
                tracing::debug!("Chat channel unavailable: {}", e);
                return;
            }
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            // Kanal noch nicht offen: Negotiation anstoßen; die Zustellung
            // selbst bleibt best-effort
            self.create_offer_if_needed().await;
        }
        match serde_json::to_string(&message) {
            Ok(json) => {
                if let Err(e) = dc.send_text(json).await {
                    tracing::debug!("Channel send failed: {}", e);
                }
            }
            Err(e) => tracing::debug!("Failed to encode channel message: {}", e),
        }
    }

    /// Übernimmt die Gegenseite beim ersten Signal (first-writer-wins)
    fn adopt_remote(&self, sender: &str) -> bool {
        let mut remote = self.remote_peer.lock();
        match remote.as_deref() {
            None => {
                tracing::info!("Remote participant: {}", sender);
                *remote = Some(sender.to_string());
                true
            }
            Some(existing) if existing == sender => false,
            Some(existing) => {
                tracing::debug!("Ignoring participant {} (remote is {})", sender, existing);
                false
            }
        }
    }

    /// Verschickt ein Envelope über den Transport (best-effort)
    async fn send_signal(
        &self,
        kind: SignalKind,
        target_id: Option<String>,
        payload: serde_json::Value,
    ) {
        let envelope = SignalEnvelope::new(
            kind,
            self.room_id.clone(),
            self.participant_id.clone(),
            target_id,
            payload,
        );
        if let Err(e) = self.transport.send(envelope).await {
            tracing::debug!("Signal send failed: {}", e);
        }
    }

    /// Aktualisiert den Zustand und sendet ein Event; `Closed` ist terminal
    fn set_state(&self, new_state: ChannelState) {
        {
            let mut state = self.state.lock();
            if *state == new_state || *state == ChannelState::Closed {
                return;
            }
            *state = new_state.clone();
        }
        let _ = self.event_tx.send(ChannelEvent::StateChanged(new_state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greater_participant_id_is_the_caller() {
        assert!(initiates_negotiation("bob", "alice"));
        assert!(!initiates_negotiation("alice", "bob"));
        // Bei identischen IDs (sollte nie vorkommen) ruft niemand an
        assert!(!initiates_negotiation("x", "x"));
    }

    #[tokio::test]
    async fn audio_track_is_registered_exactly_once() {
        let pc = RoomChannel::create_peer_connection(Vec::new())
            .await
            .unwrap();
        register_audio_track(&pc).await.unwrap();

        assert_eq!(pc.get_senders().await.len(), 1);

        // Das erste Offer enthält genau eine Audio-Sektion; Mic-Toggles
        // fügen keine weiteren Sender hinzu
        let offer = pc.create_offer(None).await.unwrap();
        assert_eq!(offer.sdp.matches("m=audio").count(), 1);

        pc.close().await.unwrap();
    }

    #[test]
    fn restart_only_on_failed_or_disconnected() {
        assert!(ice_needs_restart(RTCIceConnectionState::Failed));
        assert!(ice_needs_restart(RTCIceConnectionState::Disconnected));
        assert!(!ice_needs_restart(RTCIceConnectionState::Connected));
        assert!(!ice_needs_restart(RTCIceConnectionState::Checking));
        assert!(!ice_needs_restart(RTCIceConnectionState::Closed));
    }

    #[test]
    fn channel_message_matches_wire_format() {
        let json = serde_json::to_string(&ChannelMessage::Chat {
            message: "Hello".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"chat","message":"Hello"}"#);

        let parsed: ChannelMessage = serde_json::from_str(r#"{"type":"emote","emote":"😀"}"#).unwrap();
        assert!(matches!(parsed, ChannelMessage::Emote { emote } if emote == "😀"));
    }

    #[test]
    fn default_ice_servers_use_stun() {
        let servers = default_ice_servers();
        assert!(!servers.is_empty());
        assert!(servers[0].urls[0].starts_with("stun:"));
    }
}
