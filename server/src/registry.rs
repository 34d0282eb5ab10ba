//! Printer registry
//!
//! Lifecycle of all printer sessions: add/update/remove configuration,
//! connect/disconnect sessions, status introspection, LAN discovery. At
//! most one session runs per serial. Sessions that die on a programmer
//! error are restarted once; a second fatal within a minute disables the
//! printer until an explicit reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::db::{self, Printer};
use crate::discovery::{DiscoveredPrinter, SsdpDiscovery};
use crate::error::CoreError;
use crate::events::{Event, EventBus};
use crate::mqtt::{
    CommandDispatcher, PrinterConfig, PrinterSession, SessionHandle, SessionSettings,
    SessionStatus,
};
use crate::state::PrinterState;

/// A second fatal inside this window disables the session.
const REFATAL_WINDOW: Duration = Duration::from_secs(60);
/// last_seen writes are coalesced to at most one per printer per minute.
const LAST_SEEN_INTERVAL: Duration = Duration::from_secs(60);
const SESSION_OUTBOUND_QUEUE: usize = 32;

/// Input for creating or updating a printer.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PrinterInput {
    pub serial: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub ip_address: Option<String>,
    pub access_code: Option<String>,
    pub auto_connect: Option<bool>,
    pub dual_nozzle: Option<bool>,
    pub nozzle_diameter: Option<String>,
}

/// Printer with live status, as returned by `list`.
#[derive(Debug, Serialize)]
pub struct PrinterWithStatus {
    #[serde(flatten)]
    pub printer: Printer,
    pub connected: bool,
    pub disabled: bool,
}

#[derive(Debug, Serialize)]
pub struct PrinterStatus {
    pub serial: String,
    pub status: SessionStatus,
    pub disabled: bool,
}

struct SessionEntry {
    handle: SessionHandle,
    stop_tx: watch::Sender<bool>,
    disabled: bool,
    last_fatal: Option<Instant>,
}

type SessionMap = Arc<RwLock<HashMap<String, SessionEntry>>>;

pub struct PrinterRegistry {
    db: SqlitePool,
    bus: Arc<EventBus>,
    dispatcher: Arc<CommandDispatcher>,
    settings: SessionSettings,
    sessions: SessionMap,
    discovery: SsdpDiscovery,
}

impl PrinterRegistry {
    pub fn new(
        db: SqlitePool,
        bus: Arc<EventBus>,
        dispatcher: Arc<CommandDispatcher>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            db,
            bus,
            dispatcher,
            settings,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            discovery: SsdpDiscovery::new(),
        }
    }

    // ----------------------------------------------------------------------
    // Configuration
    // ----------------------------------------------------------------------

    /// Creates the printer, or merges into the existing row when the serial
    /// is already known.
    pub async fn add(&self, input: PrinterInput) -> Result<Printer, CoreError> {
        sqlx::query(
            r#"
            INSERT INTO printers (serial, name, model, ip_address, access_code, auto_connect, dual_nozzle, nozzle_diameter, last_seen)
            VALUES (?, ?, ?, ?, ?, COALESCE(?, 0), COALESCE(?, 0), COALESCE(?, '0.4'), NULL)
            ON CONFLICT(serial) DO UPDATE SET
                name = COALESCE(excluded.name, printers.name),
                model = COALESCE(excluded.model, printers.model),
                ip_address = COALESCE(excluded.ip_address, printers.ip_address),
                access_code = COALESCE(excluded.access_code, printers.access_code),
                auto_connect = COALESCE(?, printers.auto_connect),
                dual_nozzle = COALESCE(?, printers.dual_nozzle),
                nozzle_diameter = COALESCE(?, printers.nozzle_diameter)
            "#,
        )
        .bind(&input.serial)
        .bind(&input.name)
        .bind(&input.model)
        .bind(&input.ip_address)
        .bind(&input.access_code)
        .bind(input.auto_connect)
        .bind(input.dual_nozzle)
        .bind(&input.nozzle_diameter)
        .bind(input.auto_connect)
        .bind(input.dual_nozzle)
        .bind(&input.nozzle_diameter)
        .execute(&self.db)
        .await?;

        db::get_printer(&self.db, &input.serial)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("printer {}", input.serial)))
    }

    pub async fn update(&self, serial: &str, mut input: PrinterInput) -> Result<Printer, CoreError> {
        if db::get_printer(&self.db, serial).await?.is_none() {
            return Err(CoreError::NotFound(format!("printer {serial}")));
        }
        input.serial = serial.to_string();
        self.add(input).await
    }

    /// Removes the printer; disconnects its session first.
    pub async fn remove(&self, serial: &str) -> Result<(), CoreError> {
        self.disconnect(serial).await;
        let result = sqlx::query("DELETE FROM printers WHERE serial = ?")
            .bind(serial)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("printer {serial}")));
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Session lifecycle
    // ----------------------------------------------------------------------

    /// Starts the session for a configured printer. Idempotent: connecting
    /// a printer with a live session is a no-op.
    pub async fn connect(&self, serial: &str) -> Result<(), CoreError> {
        {
            let sessions = self.sessions.read().await;
            if let Some(entry) = sessions.get(serial) {
                if !entry.disabled {
                    return Ok(());
                }
            }
        }

        let printer = db::get_printer(&self.db, serial)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("printer {serial}")))?;
        let ip_address = printer
            .ip_address
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| CoreError::NotFound(format!("ip address for printer {serial}")))?;
        let access_code = printer
            .access_code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| CoreError::NotFound(format!("access code for printer {serial}")))?;

        let config = PrinterConfig {
            serial: serial.to_string(),
            ip_address,
            access_code,
            name: printer.name,
            dual_nozzle: printer.dual_nozzle.unwrap_or(false),
            nozzle_diameter: printer.nozzle_diameter.unwrap_or_else(|| "0.4".into()),
        };
        self.spawn_supervised(config).await;
        Ok(())
    }

    /// Stops the session. Idempotent.
    pub async fn disconnect(&self, serial: &str) {
        let entry = self.sessions.write().await.remove(serial);
        if let Some(entry) = entry {
            info!(serial = %serial, "disconnecting printer session");
            let _ = entry.stop_tx.send(true);
        }
    }

    /// Signals every session to stop; used by shutdown.
    pub async fn disconnect_all(&self) {
        let sessions = self.sessions.read().await;
        for entry in sessions.values() {
            let _ = entry.stop_tx.send(true);
        }
    }

    /// Connects every printer flagged auto-connect.
    pub async fn auto_connect_all(&self) {
        let printers: Vec<Printer> =
            match sqlx::query_as("SELECT * FROM printers WHERE auto_connect = 1")
                .fetch_all(&self.db)
                .await
            {
                Ok(printers) => printers,
                Err(e) => {
                    error!("failed to fetch auto-connect printers: {e}");
                    return;
                }
            };
        for printer in printers {
            info!(serial = %printer.serial, "auto-connecting printer");
            if let Err(e) = self.connect(&printer.serial).await {
                warn!(serial = %printer.serial, "auto-connect failed: {e}");
            }
        }
    }

    async fn spawn_supervised(&self, config: PrinterConfig) {
        let serial = config.serial.clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (handle, channels) = SessionHandle::channel(&serial, SESSION_OUTBOUND_QUEUE);

        {
            let mut sessions = self.sessions.write().await;
            if let Some(prev) = sessions.insert(
                serial.clone(),
                SessionEntry {
                    handle,
                    stop_tx,
                    disabled: false,
                    last_fatal: None,
                },
            ) {
                let _ = prev.stop_tx.send(true);
            }
        }

        let sessions = self.sessions.clone();
        let bus = self.bus.clone();
        let dispatcher = self.dispatcher.clone();
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let mut channels = Some(channels);
            loop {
                let session_channels = match channels.take() {
                    Some(first) => first,
                    None => {
                        // Restarting: the old channels died with the task,
                        // so the entry gets a fresh handle.
                        let (new_handle, new_channels) =
                            SessionHandle::channel(&serial, SESSION_OUTBOUND_QUEUE);
                        let mut map = sessions.write().await;
                        match map.get_mut(&serial) {
                            Some(entry) => entry.handle = new_handle,
                            None => break, // removed while restarting
                        }
                        new_channels
                    }
                };

                let session = PrinterSession::new(
                    config.clone(),
                    settings.clone(),
                    session_channels,
                    bus.clone(),
                    dispatcher.clone(),
                    stop_rx.clone(),
                );

                match tokio::spawn(session.run()).await {
                    Ok(()) => break, // clean stop or removal
                    Err(join_error) => {
                        error!(serial = %serial, "printer session died: {join_error}");
                        let mut map = sessions.write().await;
                        let Some(entry) = map.get_mut(&serial) else {
                            break;
                        };
                        let now = Instant::now();
                        if entry
                            .last_fatal
                            .is_some_and(|t| now.duration_since(t) < REFATAL_WINDOW)
                        {
                            warn!(serial = %serial, "second fatal within a minute, disabling session");
                            entry.disabled = true;
                            break;
                        }
                        entry.last_fatal = Some(now);
                        warn!(serial = %serial, "restarting printer session once");
                    }
                }
            }
        });
    }

    /// Adopts an externally driven session handle under a serial. This is
    /// the transport injection point: simulators and tests script the
    /// printer side of the handle instead of running a live MQTT session.
    pub async fn adopt_session(&self, serial: &str, handle: SessionHandle) {
        let (stop_tx, _stop_rx) = watch::channel(false);
        self.sessions.write().await.insert(
            serial.to_string(),
            SessionEntry {
                handle,
                stop_tx,
                disabled: false,
                last_fatal: None,
            },
        );
    }

    // ----------------------------------------------------------------------
    // Introspection
    // ----------------------------------------------------------------------

    pub async fn list(&self) -> Result<Vec<PrinterWithStatus>, CoreError> {
        let printers: Vec<Printer> = sqlx::query_as("SELECT * FROM printers ORDER BY name")
            .fetch_all(&self.db)
            .await?;
        let sessions = self.sessions.read().await;
        Ok(printers
            .into_iter()
            .map(|printer| {
                let entry = sessions.get(&printer.serial);
                PrinterWithStatus {
                    connected: entry.is_some_and(|e| e.handle.is_connected()),
                    disabled: entry.is_some_and(|e| e.disabled),
                    printer,
                }
            })
            .collect())
    }

    pub async fn get_status(&self, serial: &str) -> PrinterStatus {
        let sessions = self.sessions.read().await;
        match sessions.get(serial) {
            Some(entry) => PrinterStatus {
                serial: serial.to_string(),
                status: entry.handle.status(),
                disabled: entry.disabled,
            },
            None => PrinterStatus {
                serial: serial.to_string(),
                status: SessionStatus::Disconnected,
                disabled: false,
            },
        }
    }

    pub async fn is_connected(&self, serial: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(serial)
            .is_some_and(|e| e.handle.is_connected())
    }

    pub async fn handle(&self, serial: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(serial).map(|e| e.handle.clone())
    }

    pub async fn state_snapshot(&self, serial: &str) -> Option<PrinterState> {
        self.sessions
            .read()
            .await
            .get(serial)
            .map(|e| e.handle.state_snapshot())
    }

    // ----------------------------------------------------------------------
    // Discovery
    // ----------------------------------------------------------------------

    /// Listens for SSDP notifies for `timeout` and returns the candidates
    /// seen, deduplicated by serial.
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredPrinter>, CoreError> {
        self.discovery
            .collect(timeout)
            .await
            .map_err(|e| CoreError::Protocol(format!("discovery failed: {e}")))
    }

    /// Coalesced last_seen maintenance: telemetry receipt stamps the
    /// printer row at most once per minute.
    pub fn spawn_last_seen_task(&self, mut shutdown: watch::Receiver<bool>) {
        let db = self.db.clone();
        let mut rx = self.bus.watch();
        tokio::spawn(async move {
            let mut last_write: HashMap<String, Instant> = HashMap::new();
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(Event::PrinterState { serial, state, .. }) => {
                            let now = Instant::now();
                            let due = last_write
                                .get(&serial)
                                .is_none_or(|t| now.duration_since(*t) >= LAST_SEEN_INTERVAL);
                            if due {
                                if let Some(ts) = state.last_seen_ts {
                                    if db::update_last_seen(&db, &serial, ts).await.is_ok() {
                                        last_write.insert(serial, now);
                                    }
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}
