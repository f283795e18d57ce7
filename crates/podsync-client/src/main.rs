use std::sync::Arc;
use std::time::Duration;

use podsync_client::connection::WsConnector;
use podsync_client::startup::{with_retry, ApiClient, RetryPolicy};
use podsync_client::sync::SyncEngine;
use podsync_client::toast::{spawn_presenter, Notifier, ToastManager};
use podsync_proto::config::ClientConfig;
use podsync_proto::state::StateStore;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = podsync_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("podsync.log");

    // ── Load config ──────────────────────────────────────────────────────────
    let config = ClientConfig::load().unwrap_or_default();

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log.filter.clone());
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(log_filter.as_str())
        .with_ansi(false)
        .init();

    eprintln!("podsync log: {}", log_path.display());
    tracing::info!("podsync starting, api {}", config.server.api_url);

    // ── Store, presenter, engine ─────────────────────────────────────────────
    let store = StateStore::new();
    let (notifier, acks) = Notifier::channel();
    let presenter = spawn_presenter(
        ToastManager::new(&config.notifications),
        acks,
        std::io::stdout(),
    );

    let shutdown = CancellationToken::new();
    let engine = SyncEngine::new(WsConnector::new(), store.clone(), notifier, &config.reconnect)
        .spawn(shutdown.clone());

    // ── Startup fetches ──────────────────────────────────────────────────────
    let api = ApiClient::new(
        &config.server.api_url,
        Duration::from_secs(config.startup.request_timeout_secs),
    )?;
    let policy = RetryPolicy::from_config(&config.startup);

    let server_config = match with_retry("server config", &policy, || api.fetch_server_config()).await {
        Ok(server_config) => server_config,
        Err(e) => {
            tracing::error!("cannot load server config: {}", e);
            shutdown.cancel();
            let _ = engine.await;
            return Err(e.into());
        }
    };
    tracing::info!("server url {}", server_config.server_url);
    store.set_server_config(Some(Arc::new(server_config)));

    match with_retry("unread notifications", &policy, || api.fetch_unread_notifications()).await {
        Ok(notifications) => {
            tracing::info!("{} unread notifications", notifications.len());
            store.set_notifications(notifications);
        }
        Err(e) => tracing::warn!("continuing without notifications: {}", e),
    }

    // ── Run until Ctrl-C ─────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("podsync stopping");
    shutdown.cancel();
    engine.await??;
    presenter.abort();
    Ok(())
}
