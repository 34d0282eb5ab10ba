//! Printer session
//!
//! One task per configured printer owns the MQTT-over-TLS connection and
//! the canonical `PrinterState`. The task is the only writer of that state;
//! everything else reads snapshot clones from a watch channel and talks to
//! the session through a `SessionHandle`.
//!
//! Connection lifecycle: Disconnected -> Connecting -> Connected, dropping
//! to Backoff on any socket or TLS failure. Backoff is exponential from
//! `reconnect_min_ms` to `reconnect_max_ms` and resets on a clean connect.
//! Telemetry survives disconnects; only the active-tray selectors are
//! invalidated, so UIs show stale data labeled offline instead of a blank.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event as MqttEvent, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::events::{Event, EventBus};
use crate::mqtt::dispatcher::{self, CommandDispatcher};
use crate::state::PrinterState;
use crate::state::reducer::Reducer;

const KEEPALIVE: Duration = Duration::from_secs(30);
/// Bambu status frames can be large; pushall responses approach this.
const MAX_PACKET_SIZE: usize = 1024 * 1024;
const CONNACK_ATTEMPTS: u32 = 30;
const CLEAN_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// A publish that cannot enqueue within this window fails `Unavailable`.
const PUBLISH_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
/// More than this many connect failures inside the window flags the
/// printer unreachable.
const UNREACHABLE_THRESHOLD: usize = 10;
const UNREACHABLE_WINDOW: Duration = Duration::from_secs(300);

/// Persisted identity of a printer, loaded from the registry.
#[derive(Debug, Clone)]
pub struct PrinterConfig {
    pub serial: String,
    pub ip_address: String,
    pub access_code: String,
    pub name: Option<String>,
    pub dual_nozzle: bool,
    pub nozzle_diameter: String,
}

/// Connection parameters shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub pushall_min_interval: Duration,
}

impl From<&crate::config::Config> for SessionSettings {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            mqtt_port: config.mqtt_port,
            mqtt_user: config.mqtt_user.clone(),
            reconnect_min: Duration::from_millis(config.reconnect_min_ms),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms),
            pushall_min_interval: Duration::from_millis(config.pushall_min_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

/// Cheap clonable handle to a session: publish path plus status and state
/// snapshots. Tests build detached handles and play the printer side.
#[derive(Clone)]
pub struct SessionHandle {
    serial: String,
    outbound_tx: mpsc::Sender<String>,
    status_rx: watch::Receiver<SessionStatus>,
    state_rx: watch::Receiver<PrinterState>,
}

/// Session-side ends of a handle's channels.
pub struct SessionChannels {
    pub outbound_rx: mpsc::Receiver<String>,
    pub status_tx: watch::Sender<SessionStatus>,
    pub state_tx: watch::Sender<PrinterState>,
}

impl SessionChannels {
    pub fn set_status(&mut self, status: SessionStatus) {
        let _ = self.status_tx.send(status);
    }

    pub fn set_state(&mut self, state: PrinterState) {
        let _ = self.state_tx.send(state);
    }
}

impl SessionHandle {
    pub fn channel(serial: impl Into<String>, queue: usize) -> (Self, SessionChannels) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Disconnected);
        let (state_tx, state_rx) = watch::channel(PrinterState::default());
        (
            Self {
                serial: serial.into(),
                outbound_tx,
                status_rx,
                state_rx,
            },
            SessionChannels {
                outbound_rx,
                status_tx,
                state_tx,
            },
        )
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    pub fn status_receiver(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    pub fn state_snapshot(&self) -> PrinterState {
        self.state_rx.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<PrinterState> {
        self.state_rx.clone()
    }

    /// Hands a raw payload to the session for publishing. No buffering
    /// while disconnected: fails `Unavailable` immediately.
    pub async fn publish(&self, payload: String) -> Result<(), CoreError> {
        if !self.is_connected() {
            return Err(CoreError::Unavailable(self.serial.clone()));
        }
        self.outbound_tx
            .send_timeout(payload, PUBLISH_ENQUEUE_TIMEOUT)
            .await
            .map_err(|_| CoreError::Unavailable(self.serial.clone()))
    }
}

struct ConnectAttemptError {
    message: String,
    reached_connected: bool,
}

enum SessionExit {
    /// Stop signal or handle dropped; the session is done.
    Finished,
}

pub struct PrinterSession {
    config: PrinterConfig,
    settings: SessionSettings,
    channels: SessionChannels,
    bus: Arc<EventBus>,
    dispatcher: Arc<CommandDispatcher>,
    stop_rx: watch::Receiver<bool>,
    state: PrinterState,
    reducer: Reducer,
    last_pushall: Option<Instant>,
    connect_failures: VecDeque<Instant>,
    unreachable_flagged: bool,
}

impl PrinterSession {
    pub fn new(
        config: PrinterConfig,
        settings: SessionSettings,
        channels: SessionChannels,
        bus: Arc<EventBus>,
        dispatcher: Arc<CommandDispatcher>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut state = PrinterState::default();
        state.nozzle_count = if config.dual_nozzle { 2 } else { 1 };
        let reducer = Reducer::new(config.serial.clone());
        Self {
            config,
            settings,
            channels,
            bus,
            dispatcher,
            stop_rx,
            state,
            reducer,
            last_pushall: None,
            connect_failures: VecDeque::new(),
            unreachable_flagged: false,
        }
    }

    pub async fn run(mut self) {
        let mut backoff = self.settings.reconnect_min;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            self.channels.set_status(SessionStatus::Connecting);

            let attempt = self.connect_and_run().await;

            if self.state.connected {
                self.state.mark_disconnected();
                self.channels.set_state(self.state.clone());
                self.bus.publish(Event::PrinterDisconnected {
                    serial: self.config.serial.clone(),
                });
            }

            match attempt {
                Ok(SessionExit::Finished) => break,
                Err(e) => {
                    if e.reached_connected {
                        backoff = self.settings.reconnect_min;
                        self.connect_failures.clear();
                        self.unreachable_flagged = false;
                        warn!(
                            serial = %self.config.serial,
                            "connection lost: {}, reconnecting in {:?}",
                            e.message, backoff
                        );
                    } else {
                        self.record_connect_failure();
                        debug!(
                            serial = %self.config.serial,
                            "connect failed: {}, retrying in {:?}",
                            e.message, backoff
                        );
                    }

                    self.channels.set_status(SessionStatus::Backoff);
                    let mut stop_rx = self.stop_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                break;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(self.settings.reconnect_max);
                }
            }
        }

        self.channels.set_status(SessionStatus::Disconnected);
        info!(serial = %self.config.serial, "printer session ended");
    }

    async fn connect_and_run(&mut self) -> Result<SessionExit, ConnectAttemptError> {
        let serial = self.config.serial.clone();
        let report_topic = format!("device/{serial}/report");
        let request_topic = format!("device/{serial}/request");

        info!(
            serial = %serial,
            "connecting to printer at {}:{}",
            self.config.ip_address, self.settings.mqtt_port
        );

        // Client id must be unique per process: the printer drops the older
        // session on a collision.
        let client_id = format!("spoolbuddy-{}-{}", serial, std::process::id());
        let mut options = MqttOptions::new(client_id, self.config.ip_address.clone(), self.settings.mqtt_port);
        options.set_keep_alive(KEEPALIVE);
        options.set_credentials(&self.settings.mqtt_user, &self.config.access_code);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options.set_transport(Transport::tls_with_config(tls_config()));

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        // Poll until ConnAck or give up on this attempt.
        let mut connected = false;
        for _ in 0..CONNACK_ATTEMPTS {
            if *self.stop_rx.borrow() {
                return Ok(SessionExit::Finished);
            }
            match tokio::time::timeout(Duration::from_secs(1), eventloop.poll()).await {
                Ok(Ok(MqttEvent::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(self.attempt_error(
                            format!("connection rejected: {:?}", ack.code),
                            false,
                        ));
                    }
                    connected = true;
                    break;
                }
                Ok(Ok(event)) => debug!(serial = %serial, "pre-connect event: {event:?}"),
                Ok(Err(e)) => return Err(self.attempt_error(format!("{e:?}"), false)),
                Err(_) => {}
            }
        }
        if !connected {
            return Err(self.attempt_error("no ConnAck received".into(), false));
        }

        client
            .subscribe(&report_topic, QoS::AtMostOnce)
            .await
            .map_err(|e| self.attempt_error(format!("subscribe failed: {e}"), false))?;

        info!(serial = %serial, "printer connected, subscribed to {report_topic}");
        self.state.connected = true;
        self.channels.set_state(self.state.clone());
        self.channels.set_status(SessionStatus::Connected);
        self.bus.publish(Event::PrinterConnected {
            serial: serial.clone(),
        });
        self.connect_failures.clear();
        self.unreachable_flagged = false;

        self.send_startup_commands(&client, &request_topic).await;

        enum Step {
            Frame(Vec<u8>),
            MqttError(String),
            Outbound(Option<String>),
            StopChanged,
            Nothing,
        }

        let mut stop_rx = self.stop_rx.clone();
        loop {
            let step = tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => Step::Frame(publish.payload.to_vec()),
                    Ok(_) => Step::Nothing,
                    Err(e) => Step::MqttError(format!("{e:?}")),
                },
                outbound = self.channels.outbound_rx.recv() => Step::Outbound(outbound),
                _ = stop_rx.changed() => Step::StopChanged,
            };

            match step {
                Step::Frame(payload) => self.handle_frame(&payload),
                Step::Nothing => {}
                Step::MqttError(message) => return Err(self.attempt_error(message, true)),
                Step::Outbound(Some(payload)) => {
                    debug!(serial = %serial, "publishing to {request_topic}");
                    if let Err(e) = client
                        .publish(&request_topic, QoS::AtMostOnce, false, payload)
                        .await
                    {
                        return Err(self.attempt_error(format!("publish failed: {e}"), true));
                    }
                }
                Step::Outbound(None) => {
                    // Handle dropped: the printer was removed.
                    self.clean_disconnect(&client).await;
                    return Ok(SessionExit::Finished);
                }
                Step::StopChanged => {
                    if *self.stop_rx.borrow() {
                        self.clean_disconnect(&client).await;
                        return Ok(SessionExit::Finished);
                    }
                }
            }
        }
    }

    fn attempt_error(&self, message: String, reached_connected: bool) -> ConnectAttemptError {
        ConnectAttemptError {
            message,
            reached_connected,
        }
    }

    async fn clean_disconnect(&self, client: &AsyncClient) {
        let _ = tokio::time::timeout(CLEAN_DISCONNECT_TIMEOUT, client.disconnect()).await;
    }

    /// Pushall (rate-limited) plus a version request on every connect.
    async fn send_startup_commands(&mut self, client: &AsyncClient, request_topic: &str) {
        let now = Instant::now();
        let allowed = self
            .last_pushall
            .is_none_or(|last| now.duration_since(last) >= self.settings.pushall_min_interval);
        if allowed {
            self.last_pushall = Some(now);
            let seq = dispatcher::next_sequence_id().to_string();
            let payload = serde_json::json!({
                "pushing": {"sequence_id": seq, "command": "pushall"}
            });
            let _ = client
                .publish(request_topic, QoS::AtMostOnce, false, payload.to_string())
                .await;
        }
        let seq = dispatcher::next_sequence_id().to_string();
        let payload = serde_json::json!({
            "info": {"sequence_id": seq, "command": "get_version"}
        });
        let _ = client
            .publish(request_topic, QoS::AtMostOnce, false, payload.to_string())
            .await;

        // Prime the pressure-advance catalog for the installed nozzle.
        let seq = dispatcher::next_sequence_id().to_string();
        let cali = crate::mqtt::bambu_api::ExtrusionCaliGetCommand::new(
            &seq,
            &self.config.nozzle_diameter,
        );
        if let Ok(payload) = serde_json::to_string(&cali) {
            let _ = client
                .publish(request_topic, QoS::AtMostOnce, false, payload)
                .await;
        }
    }

    fn handle_frame(&mut self, payload: &[u8]) {
        let now_ts = chrono::Utc::now().timestamp();
        let outcome = self.reducer.apply(&mut self.state, payload, now_ts);

        if let Some(echo) = &outcome.echo {
            self.dispatcher.complete(echo);
        }
        for event in outcome.events {
            self.bus.publish(event);
        }
        if !outcome.deltas.is_empty() {
            self.channels.set_state(self.state.clone());
            self.bus.publish(Event::PrinterState {
                serial: self.config.serial.clone(),
                state: Arc::new(self.state.clone()),
                deltas: outcome.deltas.into(),
                snapshot: outcome.snapshot,
            });
        }
    }

    /// TLS handshake and socket failures are normal reconnect causes; a
    /// persistent streak is surfaced once per streak.
    fn record_connect_failure(&mut self) {
        let now = Instant::now();
        self.connect_failures.push_back(now);
        while let Some(first) = self.connect_failures.front() {
            if now.duration_since(*first) > UNREACHABLE_WINDOW {
                self.connect_failures.pop_front();
            } else {
                break;
            }
        }
        if self.connect_failures.len() > UNREACHABLE_THRESHOLD && !self.unreachable_flagged {
            self.unreachable_flagged = true;
            warn!(serial = %self.config.serial, "printer unreachable, still retrying");
            self.bus.publish(Event::PrinterUnreachable {
                serial: self.config.serial.clone(),
            });
        }
    }
}

fn tls_config() -> TlsConfiguration {
    // Bambu Lab printers present self-signed certificates; LAN-mode clients
    // authenticate with the access code instead.
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    TlsConfiguration::Rustls(Arc::new(config))
}

/// Certificate verifier that accepts any certificate. Only used toward
/// printers on the LAN.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_requires_connected() {
        let (handle, _channels) = SessionHandle::channel("P1", 4);
        let err = handle.publish("{}".into()).await.unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_publish_reaches_session_side() {
        let (handle, mut channels) = SessionHandle::channel("P1", 4);
        channels.set_status(SessionStatus::Connected);
        handle.publish("{\"a\":1}".into()).await.unwrap();
        assert_eq!(channels.outbound_rx.recv().await.unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_backoff_progression() {
        let min = Duration::from_millis(1000);
        let max = Duration::from_millis(60000);
        let mut backoff = min;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(backoff);
            backoff = (backoff * 2).min(max);
        }
        assert_eq!(seen[0], Duration::from_secs(1));
        assert_eq!(seen[1], Duration::from_secs(2));
        assert_eq!(seen[5], Duration::from_secs(32));
        // Capped at the configured maximum
        assert_eq!(seen[6], Duration::from_secs(60));
        assert_eq!(seen[7], Duration::from_secs(60));
    }

    #[test]
    fn test_state_snapshot_is_a_copy() {
        let (handle, mut channels) = SessionHandle::channel("P1", 4);
        let mut state = PrinterState::default();
        state.print_progress = 42;
        channels.set_state(state);

        let mut snapshot = handle.state_snapshot();
        snapshot.print_progress = 0;
        // Mutating the snapshot does not touch the session's state
        assert_eq!(handle.state_snapshot().print_progress, 42);
    }
}
