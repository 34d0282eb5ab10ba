//! SpoolBuddy server
//!
//! Filament management for Bambu Lab printers: one self-healing MQTT
//! session per printer, a canonical telemetry projection with delta
//! fan-out to WebSocket subscribers, command RPC with response
//! correlation, the tag/scale device session, and the spool-to-slot
//! assignment workflow.

pub mod api;
pub mod assignment;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod events;
pub mod mqtt;
pub mod registry;
pub mod state;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::assignment::SlotAssigner;
use crate::config::Config;
use crate::events::EventBus;
use crate::mqtt::{CommandDispatcher, SessionSettings};
use crate::registry::PrinterRegistry;
use crate::websocket::DeviceRegistry;

/// Shared application state
pub struct AppState {
    pub db: SqlitePool,
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub registry: Arc<PrinterRegistry>,
    pub assigner: Arc<SlotAssigner>,
    pub device: DeviceRegistry,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(config: Config, db: SqlitePool, shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(config.subscriber_queue_depth));
        let dispatcher = Arc::new(CommandDispatcher::new(Duration::from_millis(
            config.command_timeout_ms,
        )));
        let registry = Arc::new(PrinterRegistry::new(
            db.clone(),
            bus.clone(),
            dispatcher.clone(),
            SessionSettings::from(&config),
        ));
        let assigner = Arc::new(SlotAssigner::new(
            db.clone(),
            registry.clone(),
            dispatcher.clone(),
            bus.clone(),
            config.staged_assignment_ttl_ms,
        ));
        Arc::new(Self {
            db,
            config,
            bus,
            dispatcher,
            registry,
            assigner,
            device: DeviceRegistry::new(),
            shutdown,
        })
    }
}

/// Build the full application router
pub fn router(state: Arc<AppState>) -> Router {
    let static_dir = state.config.static_dir.clone();
    Router::new()
        .nest("/api", api::router())
        .nest("/ws", websocket::router())
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
