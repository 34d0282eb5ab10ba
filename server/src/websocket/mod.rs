//! WebSocket endpoints
//!
//! `/ws/ui` fans core events out to any number of dashboard clients;
//! `/ws/device` is the single privileged socket from the embedded
//! tag-reader/scale.

mod device;
mod ui;

use std::sync::Arc;

use axum::Router;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::AppState;

pub use device::device_ws;
pub use ui::ui_ws;

/// Build the WebSocket router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/device", axum::routing::get(device_ws))
        .route("/ui", axum::routing::get(ui_ws))
}

/// Commands the server pushes down to the embedded device.
#[derive(Debug, Clone)]
pub enum DeviceCommand {
    TareScale,
    CalibrateScale { known_weight: f64 },
    WriteTag { request_id: String, data: serde_json::Value },
    Notify { message: String, duration_ms: u32 },
}

struct DeviceInner {
    generation: u64,
    command_tx: Option<mpsc::Sender<DeviceCommand>>,
    evict_tx: Option<oneshot::Sender<()>>,
}

/// Tracks the one live device session. A second connection evicts the
/// first: newest wins.
pub struct DeviceRegistry {
    inner: Mutex<DeviceInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DeviceInner {
                generation: 0,
                command_tx: None,
                evict_tx: None,
            }),
        }
    }

    /// Registers a new session, evicting any prior one. Returns the
    /// generation token the session must present on teardown.
    pub async fn begin_session(
        &self,
        command_tx: mpsc::Sender<DeviceCommand>,
        evict_tx: oneshot::Sender<()>,
    ) -> u64 {
        let mut inner = self.inner.lock().await;
        if let Some(prev) = inner.evict_tx.take() {
            let _ = prev.send(());
        }
        inner.generation += 1;
        inner.command_tx = Some(command_tx);
        inner.evict_tx = Some(evict_tx);
        inner.generation
    }

    /// Clears the session if `generation` is still current. An evicted
    /// session tearing down late must not clobber its successor.
    pub async fn end_session(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return false;
        }
        inner.command_tx = None;
        inner.evict_tx = None;
        true
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.command_tx.is_some()
    }

    pub async fn command_sender(&self) -> Option<mpsc::Sender<DeviceCommand>> {
        self.inner.lock().await.command_tx.clone()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_newest_session_wins() {
        let registry = DeviceRegistry::new();

        let (tx1, _rx1) = mpsc::channel(1);
        let (evict1_tx, evict1_rx) = oneshot::channel();
        let gen1 = registry.begin_session(tx1, evict1_tx).await;

        let (tx2, _rx2) = mpsc::channel(1);
        let (evict2_tx, _evict2_rx) = oneshot::channel();
        let gen2 = registry.begin_session(tx2, evict2_tx).await;

        // The first session was told to go away
        assert!(evict1_rx.await.is_ok());
        assert!(gen2 > gen1);

        // Its late teardown must not disconnect the new session
        assert!(!registry.end_session(gen1).await);
        assert!(registry.is_connected().await);

        assert!(registry.end_session(gen2).await);
        assert!(!registry.is_connected().await);
    }
}
