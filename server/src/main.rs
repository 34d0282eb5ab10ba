use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spoolbuddy_server::{AppState, assignment, config::Config, db, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spoolbuddy_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    // Connect to database and migrate
    let db = db::connect(&config.database_url).await?;
    db::migrate(&db).await?;

    // Global shutdown signal; every long-lived task observes it
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = AppState::new(config, db, shutdown_rx.clone());

    // Staged-assignment commit watcher + TTL sweep
    assignment::spawn_staged_watcher(
        state.assigner.clone(),
        state.bus.clone(),
        shutdown_rx.clone(),
    );

    // Coalesced last_seen maintenance from telemetry
    state.registry.spawn_last_seen_task(shutdown_rx.clone());

    // Auto-connect printers once the server has settled
    {
        let registry = state.registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            registry.auto_connect_all().await;
        });
    }

    // Build router and start server
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(&state.config.bind_address).await?;
    tracing::info!("SpoolBuddy server listening on {}", state.config.bind_address);

    // Ctrl-C starts the drain: stop accepting subscribers, close sessions
    // with a clean MQTT DISCONNECT, fail in-flight commands as canceled.
    {
        let state = state.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::info!("shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
            state.registry.disconnect_all().await;
            state.dispatcher.cancel_all();
        });
    }

    let drain_deadline = {
        let mut shutdown = shutdown_rx.clone();
        let drain = Duration::from_millis(state.config.shutdown_drain_ms);
        async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            tokio::time::sleep(drain).await;
        }
    };

    let server = {
        let mut shutdown = shutdown_rx.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        if shutdown.changed().await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                })
                .await
        }
    };

    // Anything still running past the drain window is abandoned.
    tokio::select! {
        result = server => result?,
        _ = drain_deadline => {
            tracing::warn!("shutdown drain deadline reached, abandoning remaining tasks");
        }
    }

    tracing::info!("SpoolBuddy server stopped");
    Ok(())
}
