//! Test-Helfer: Mock-Transport und Envelope-Fabriken
#![allow(dead_code)]

use parking_lot::Mutex;
use room_call::{SignalEnvelope, SignalKind, SignalTransport, SignalingError};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// In-Memory-Transport für Tests.
///
/// Zeichnet alles Gesendete auf und erlaubt das Einspeisen von
/// Envelopes, als kämen sie vom Relay-Server. Über [`MockTransport::pair`]
/// lassen sich zwei Transporte direkt verdrahten.
pub struct MockTransport {
    sent: Mutex<Vec<SignalEnvelope>>,
    inbound: Mutex<Option<mpsc::Receiver<SignalEnvelope>>>,
    inject_tx: mpsc::Sender<SignalEnvelope>,
    peer_tx: Mutex<Option<mpsc::Sender<SignalEnvelope>>>,
    leave_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (inject_tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(Some(rx)),
            inject_tx,
            peer_tx: Mutex::new(None),
            leave_calls: AtomicUsize::new(0),
        })
    }

    /// Verbindet zwei Transporte: was der eine sendet, empfängt der andere
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Self::new();
        let b = Self::new();
        *a.peer_tx.lock() = Some(b.inject_tx.clone());
        *b.peer_tx.lock() = Some(a.inject_tx.clone());
        (a, b)
    }

    /// Speist ein Envelope ein, als käme es vom Server-Push-Stream
    pub async fn inject(&self, envelope: SignalEnvelope) {
        self.inject_tx
            .send(envelope)
            .await
            .expect("inbound channel closed");
    }

    pub fn sent(&self) -> Vec<SignalEnvelope> {
        self.sent.lock().clone()
    }

    pub fn sent_of_kind(&self, kind: SignalKind) -> Vec<SignalEnvelope> {
        self.sent
            .lock()
            .iter()
            .filter(|env| env.kind == kind)
            .cloned()
            .collect()
    }

    pub fn leave_calls(&self) -> usize {
        self.leave_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SignalTransport for MockTransport {
    async fn subscribe(&self) -> Result<mpsc::Receiver<SignalEnvelope>, SignalingError> {
        self.inbound.lock().take().ok_or(SignalingError::Closed)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        self.sent.lock().push(envelope.clone());
        let peer = self.peer_tx.lock().clone();
        if let Some(peer) = peer {
            let _ = peer.send(envelope).await;
        }
        Ok(())
    }

    async fn leave(&self) -> Result<(), SignalingError> {
        self.leave_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn presence_join(room_id: &str, sender_id: &str) -> SignalEnvelope {
    SignalEnvelope::new(
        SignalKind::Presence,
        room_id,
        sender_id,
        None,
        json!({"action": "join"}),
    )
}

pub fn welcome(room_id: &str, sender_id: &str, participants: &[&str]) -> SignalEnvelope {
    SignalEnvelope::new(
        SignalKind::Welcome,
        room_id,
        sender_id,
        None,
        json!({"participants": participants}),
    )
}

/// Initialisiert tracing für Testläufe; `RUST_LOG` steuert den Filter
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Pollt eine Bedingung bis zum Timeout
pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
