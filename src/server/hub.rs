use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::protocol::{DeviceStatus, MeasurementKind, ServerMessage};

pub type ConnId = u64;

#[derive(Debug, Clone)]
pub struct Identity {
    pub patient_id: String,
    pub account_id: i64,
}

/// Per-connection state for the lifetime of one transport session.
/// Outbound frames go through a bounded channel drained by the
/// connection's write pump; a full or closed channel drops the frame
/// rather than blocking the hub.
pub struct ClientState {
    pub id: ConnId,
    send_tx: mpsc::Sender<Message>,
    alive: AtomicBool,
    closed: AtomicBool,
    shutdown: Notify,
    identity: RwLock<Option<Identity>>,
}

impl ClientState {
    pub fn new(id: ConnId, send_tx: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            id,
            send_tx,
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            identity: RwLock::new(None),
        })
    }

    pub async fn is_authenticated(&self) -> bool {
        self.identity.read().await.is_some()
    }

    pub async fn set_identity(&self, patient_id: String, account_id: i64) {
        *self.identity.write().await = Some(Identity {
            patient_id,
            account_id,
        });
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.identity.read().await.clone()
    }

    /// Liveness response from the peer; the only path that re-arms the
    /// flag between heartbeat sweeps.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// One heartbeat tick: clears the flag and reports whether the peer
    /// answered since the previous tick.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn send(&self, msg: &ServerMessage) {
        if let Ok(text) = serde_json::to_string(msg) {
            self.send_text(text);
        }
    }

    pub fn send_error(&self, message: &str) {
        self.send(&ServerMessage::Error {
            message: message.to_string(),
        });
    }

    pub(crate) fn send_text(&self, text: String) {
        if self.is_open() {
            self.send_tx.try_send(Message::Text(text)).ok();
        }
    }

    pub(crate) fn send_ping(&self) {
        if self.is_open() {
            self.send_tx.try_send(Message::Ping(Vec::new())).ok();
        }
    }

    /// Forcibly end the session: further sends are dropped, a close frame
    /// is queued, and the read pump is woken so the task can exit.
    pub fn terminate(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.send_tx.try_send(Message::Close(None)).ok();
            self.shutdown.notify_one();
        }
    }

    pub(crate) async fn terminated(&self) {
        self.shutdown.notified().await;
    }
}

#[derive(Clone)]
struct Membership {
    patient_id: String,
    device_id: Option<String>,
}

#[derive(Default)]
struct HubInner {
    connections: HashMap<ConnId, Arc<ClientState>>,
    by_patient: HashMap<String, HashSet<ConnId>>,
    by_device: HashMap<String, HashSet<ConnId>>,
    membership: HashMap<ConnId, Membership>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub total_clients: usize,
    pub patient_subscriptions: usize,
    pub device_subscriptions: usize,
}

/// Shared fan-out state: the full connection set plus the two
/// subscription indices. Everything sits behind one mutex so a broadcast
/// can never observe a half-applied subscribe or teardown.
pub struct Hub {
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
        }
    }

    pub fn register(&self, client: Arc<ClientState>) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.insert(client.id, client);
        debug!(total = inner.connections.len(), "connection registered");
    }

    /// Record a subscription for `client`. A connection holds at most one
    /// subscription; a repeat call replaces the previous membership.
    pub fn subscribe(&self, client: &Arc<ClientState>, patient_id: &str, device_id: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        remove_membership(&mut inner, client.id);

        inner
            .by_patient
            .entry(patient_id.to_string())
            .or_default()
            .insert(client.id);
        if let Some(device_id) = device_id {
            inner
                .by_device
                .entry(device_id.to_string())
                .or_default()
                .insert(client.id);
        }
        inner.membership.insert(
            client.id,
            Membership {
                patient_id: patient_id.to_string(),
                device_id: device_id.map(str::to_string),
            },
        );
        info!(conn = client.id, patient = patient_id, device = ?device_id, "subscribed");
    }

    /// Remove the connection from the registry and from both indices.
    /// Idempotent; safe to call for a connection that never subscribed.
    pub fn teardown(&self, client: &ClientState) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.remove(&client.id);
        remove_membership(&mut inner, client.id);
        debug!(conn = client.id, total = inner.connections.len(), "connection removed");
    }

    pub fn broadcast_to_patient(&self, patient_id: &str, msg: &ServerMessage) {
        let Ok(text) = serde_json::to_string(msg) else {
            return;
        };
        let inner = self.inner.lock().unwrap();
        if let Some(ids) = inner.by_patient.get(patient_id) {
            fan_out(&inner, ids, text);
        }
    }

    pub fn broadcast_to_device(&self, device_id: &str, msg: &ServerMessage) {
        let Ok(text) = serde_json::to_string(msg) else {
            return;
        };
        let inner = self.inner.lock().unwrap();
        if let Some(ids) = inner.by_device.get(device_id) {
            fan_out(&inner, ids, text);
        }
    }

    /// Out-of-band entry point for other server components (e.g. REST
    /// handlers) to push a stored measurement to subscribers.
    pub fn broadcast_data_update(
        &self,
        patient_id: &str,
        measurement_kind: MeasurementKind,
        device_id: &str,
        data: serde_json::Value,
    ) {
        self.broadcast_to_patient(
            patient_id,
            &ServerMessage::DataUpdate {
                measurement_kind,
                device_id: device_id.to_string(),
                data,
                timestamp: Utc::now().to_rfc3339(),
            },
        );
    }

    /// Out-of-band device status push, patient subscribers only.
    pub fn broadcast_device_status(&self, patient_id: &str, device_id: &str, status: DeviceStatus) {
        self.broadcast_to_patient(
            patient_id,
            &ServerMessage::DeviceStatusUpdate {
                device_id: device_id.to_string(),
                status,
                timestamp: Utc::now(),
            },
        );
    }

    /// Snapshot of every registered connection, for the heartbeat sweep.
    pub fn connections(&self) -> Vec<Arc<ClientState>> {
        self.inner.lock().unwrap().connections.values().cloned().collect()
    }

    pub fn stats(&self) -> HubStats {
        let inner = self.inner.lock().unwrap();
        HubStats {
            total_clients: inner.connections.len(),
            patient_subscriptions: inner.by_patient.len(),
            device_subscriptions: inner.by_device.len(),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn fan_out(inner: &HubInner, ids: &HashSet<ConnId>, text: String) {
    for id in ids {
        if let Some(client) = inner.connections.get(id) {
            // closed sockets are skipped; removal happens via teardown
            if client.is_open() {
                client.send_text(text.clone());
            }
        }
    }
}

fn remove_membership(inner: &mut HubInner, id: ConnId) {
    let Some(membership) = inner.membership.remove(&id) else {
        return;
    };
    if let Some(ids) = inner.by_patient.get_mut(&membership.patient_id) {
        ids.remove(&id);
        if ids.is_empty() {
            inner.by_patient.remove(&membership.patient_id);
        }
    }
    if let Some(device_id) = membership.device_id {
        if let Some(ids) = inner.by_device.get_mut(&device_id) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.by_device.remove(&device_id);
            }
        }
    }
}
