pub mod hub;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::auth::TokenVerifier;
use crate::protocol::{
    decode_frame, ClientMessage, DeviceStatus, Measurement, MeasurementRecord, ServerMessage,
};
use crate::storage::Storage;
use hub::{ClientState, Hub};

/// Fixed upgrade path; handshakes for any other path are rejected.
pub const WS_PATH: &str = "/ws/telemetry";

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const SEND_BUF: usize = 256;

// ─── Server ─────────────────────────────────────────────────────────────────

pub struct Server {
    storage: Arc<dyn Storage>,
    verifier: Arc<dyn TokenVerifier>,
    hub: Hub,
    conn_counter: AtomicU64,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(
        storage: Arc<dyn Storage>,
        verifier: Arc<dyn TokenVerifier>,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            verifier,
            hub: Hub::new(),
            conn_counter: AtomicU64::new(0),
            heartbeat_interval,
            heartbeat: Mutex::new(None),
        })
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub async fn listen_and_serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, path = WS_PATH, "listening");
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "inbound connection");
                    let srv = self.clone();
                    tokio::spawn(srv.serve_conn(stream));
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_conn(self: Arc<Self>, stream: TcpStream) {
        let callback = |req: &Request, resp: Response| {
            if req.uri().path() == WS_PATH {
                Ok(resp)
            } else {
                let mut err = ErrorResponse::new(Some("not found".to_string()));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        };
        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(error = %e, "handshake rejected");
                return;
            }
        };

        let id = self.conn_counter.fetch_add(1, Ordering::Relaxed);
        let (send_tx, mut send_rx) = mpsc::channel::<Message>(SEND_BUF);
        let client = ClientState::new(id, send_tx);
        self.hub.register(client.clone());
        info!(conn = id, "connection established");

        let (mut ws_tx, mut ws_rx) = ws.split();

        // Write pump: drains the outbound channel; stops after an error or
        // once a close frame has gone out.
        let write_id = id;
        tokio::spawn(async move {
            while let Some(msg) = send_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_tx.send(msg).await.is_err() || closing {
                    break;
                }
            }
            debug!(conn = write_id, "write pump ended");
        });

        // Read pump; also woken by terminate() so a heartbeat reap does
        // not leave the task parked on a dead socket.
        loop {
            tokio::select! {
                _ = client.terminated() => break,
                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&client, &text).await,
                    Some(Ok(Message::Pong(_))) => client.mark_alive(),
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {} // pings are answered by the library
                    Some(Err(e)) => {
                        debug!(conn = id, error = %e, "transport error");
                        break;
                    }
                    None => break,
                }
            }
        }

        self.hub.teardown(&client);
        client.terminate();
        info!(conn = id, "connection closed");
    }

    // ─── Router ─────────────────────────────────────────────────────────

    pub(crate) async fn handle_frame(&self, client: &Arc<ClientState>, text: &str) {
        match decode_frame(text) {
            Ok(msg) => self.handle_message(client, msg).await,
            Err(e) => {
                debug!(conn = client.id, error = %e, "rejected frame");
                client.send_error(&e.to_string());
            }
        }
    }

    async fn handle_message(&self, client: &Arc<ClientState>, msg: ClientMessage) {
        match msg {
            ClientMessage::Auth { token } => self.handle_auth(client, token).await,
            ClientMessage::Subscribe {
                patient_id,
                device_id,
            } => self.handle_subscribe(client, patient_id, device_id).await,
            ClientMessage::Telemetry {
                measurement,
                device_id,
                patient_id,
                timestamp,
            } => {
                self.handle_telemetry(client, measurement, device_id, patient_id, timestamp)
                    .await
            }
            ClientMessage::DeviceStatus {
                device_id,
                status,
                patient_id,
            } => self.handle_device_status(client, device_id, status, patient_id).await,
        }
    }

    // ─── Handlers ───────────────────────────────────────────────────────

    async fn handle_auth(&self, client: &Arc<ClientState>, token: Option<String>) {
        let auth_error = |message: &str| ServerMessage::AuthError {
            message: message.to_string(),
        };

        let Some(token) = token.filter(|t| !t.is_empty()) else {
            client.send(&auth_error("Token required"));
            return;
        };

        let claims = match self.verifier.verify(&token) {
            Ok(claims) => claims,
            Err(e) => {
                warn!(conn = client.id, error = %e, "token verification failed");
                client.send(&auth_error("Authentication failed"));
                return;
            }
        };

        let user = match self.storage.get_user(claims.user_id).await {
            Ok(user) => user,
            Err(e) => {
                error!(conn = client.id, error = %e, "user lookup failed");
                client.send(&auth_error("Authentication failed"));
                return;
            }
        };
        let Some(user) = user else {
            client.send(&auth_error("Invalid token"));
            return;
        };

        // prefer the stable patient identifier over the raw account id
        let patient_id = user
            .patient_id
            .clone()
            .unwrap_or_else(|| user.id.to_string());
        client.set_identity(patient_id.clone(), user.id).await;
        client.send(&ServerMessage::AuthSuccess {
            patient_id: patient_id.clone(),
        });
        info!(conn = client.id, user = user.id, patient = %patient_id, "authenticated");
    }

    async fn handle_subscribe(
        &self,
        client: &Arc<ClientState>,
        patient_id: String,
        device_id: Option<String>,
    ) {
        if !client.is_authenticated().await {
            client.send_error("Authentication required");
            return;
        }

        self.hub.subscribe(client, &patient_id, device_id.as_deref());
        client.send(&ServerMessage::SubscriptionSuccess {
            patient_id,
            device_id,
        });
    }

    async fn handle_telemetry(
        &self,
        client: &Arc<ClientState>,
        measurement: Measurement,
        device_id: String,
        patient_id: String,
        timestamp: String,
    ) {
        let kind = measurement.kind();

        let persisted = match measurement {
            Measurement::Ecg(p) => self
                .storage
                .save_ecg(&patient_id, &device_id, p)
                .await
                .map(record_json),
            Measurement::BloodOxygen(p) => self
                .storage
                .save_blood_oxygen(&patient_id, &device_id, p)
                .await
                .map(record_json),
            Measurement::BloodPressure(p) => self
                .storage
                .save_blood_pressure(&patient_id, &device_id, p)
                .await
                .map(record_json),
            Measurement::BloodGlucose(p) => self
                .storage
                .save_blood_glucose(&patient_id, &device_id, p)
                .await
                .map(record_json),
            Measurement::Temperature(p) => self
                .storage
                .save_temperature(&patient_id, &device_id, p)
                .await
                .map(record_json),
            // battery updates mutate device state; echo a minimal record
            Measurement::Battery(p) => self
                .storage
                .update_device_battery(&device_id, p.battery_level, p.charging_status)
                .await
                .map(|()| {
                    json!({
                        "batteryLevel": p.battery_level,
                        "chargingStatus": p.charging_status,
                    })
                }),
        };

        let data = match persisted {
            Ok(data) => data,
            Err(e) => {
                error!(conn = client.id, kind = %kind, error = %e, "failed to persist telemetry");
                client.send_error("Failed to process data");
                return;
            }
        };

        self.hub.broadcast_to_patient(
            &patient_id,
            &ServerMessage::DataUpdate {
                measurement_kind: kind,
                device_id: device_id.clone(),
                data,
                timestamp: timestamp.clone(),
            },
        );
        client.send(&ServerMessage::DataReceived {
            measurement_kind: kind,
            timestamp,
        });
        info!(kind = %kind, device = %device_id, patient = %patient_id, "telemetry stored");
    }

    async fn handle_device_status(
        &self,
        client: &Arc<ClientState>,
        device_id: String,
        status: DeviceStatus,
        patient_id: String,
    ) {
        if let Err(e) = self.storage.update_device_status(&device_id, status).await {
            error!(conn = client.id, device = %device_id, error = %e, "failed to update device status");
            client.send_error("Failed to update device status");
            return;
        }

        let event = ServerMessage::DeviceStatusUpdate {
            device_id: device_id.clone(),
            status,
            timestamp: Utc::now(),
        };
        self.hub.broadcast_to_patient(&patient_id, &event);
        self.hub.broadcast_to_device(&device_id, &event);
        info!(device = %device_id, status = %status, "device status updated");
    }

    // ─── Heartbeat ──────────────────────────────────────────────────────

    /// Start the periodic liveness sweep. Idempotent.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let mut guard = self.heartbeat.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let srv = Arc::clone(self);
        let period = self.heartbeat_interval;
        *guard = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut tick = tokio::time::interval_at(start, period);
            loop {
                tick.tick().await;
                srv.heartbeat_sweep();
            }
        }));
    }

    pub fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// One sweep: reap connections that never answered the previous ping,
    /// then challenge the rest.
    pub(crate) fn heartbeat_sweep(&self) {
        for client in self.hub.connections() {
            if !client.take_alive() {
                warn!(conn = client.id, "terminating unresponsive connection");
                self.hub.teardown(&client);
                client.terminate();
            } else {
                client.send_ping();
            }
        }
    }
}

fn record_json(record: MeasurementRecord) -> serde_json::Value {
    serde_json::to_value(record).unwrap_or(serde_json::Value::Null)
}
