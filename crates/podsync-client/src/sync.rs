//! The sync engine: one task that follows the server configuration, owns the
//! push connection and feeds its events to the handlers in delivery order.

use std::sync::Arc;

use podsync_proto::config::ReconnectConfig;
use podsync_proto::protocol::ServerConfig;
use podsync_proto::state::StateStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::connection::{ConnectionEvent, ConnectionEventKind, ConnectionManager, ConnectionState, Connector};
use crate::handlers::PushHandler;
use crate::toast::Notifier;

pub struct SyncEngine<C: Connector> {
    store: StateStore,
    manager: ConnectionManager<C>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    handler: PushHandler,
    /// `None` when reconnection is disabled.
    reconnect: Option<Backoff>,
}

impl<C: Connector> SyncEngine<C> {
    pub fn new(connector: C, store: StateStore, notifier: Notifier, reconnect: &ReconnectConfig) -> Self {
        let (manager, events) = ConnectionManager::new(connector);
        let reconnect = reconnect.enabled.then(|| {
            Backoff::new(
                Duration::from_millis(reconnect.initial_delay_ms),
                Duration::from_millis(reconnect.max_delay_ms),
            )
        });
        Self {
            handler: PushHandler::new(store.clone(), notifier),
            store,
            manager,
            events,
            reconnect,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut config_rx = self.store.config_watch();
        let initial = config_rx.borrow_and_update().clone();
        self.follow_config(initial);

        let mut retry_at: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("sync: shutting down");
                    self.manager.close();
                    break;
                }

                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let config = config_rx.borrow_and_update().clone();
                    retry_at = None;
                    self.follow_config(config);
                }

                Some(event) = self.events.recv() => {
                    let opened = event.kind == ConnectionEventKind::Opened;
                    let closed = event.kind == ConnectionEventKind::Closed;
                    if !self.manager.dispatch(event, &mut self.handler) {
                        continue;
                    }
                    if opened {
                        if let Some(backoff) = self.reconnect.as_mut() {
                            backoff.reset();
                        }
                    }
                    if closed {
                        retry_at = self.schedule_reconnect();
                    }
                }

                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                    info!("sync: reconnecting");
                    if let Err(e) = self.manager.recreate() {
                        warn!("sync: reconnect failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Open a fresh connection unless the current one was built from this
    /// exact configuration.
    fn follow_config(&mut self, config: Option<Arc<ServerConfig>>) {
        match config {
            Some(config) => {
                if !self.manager.is_stale_for(&config) {
                    debug!("sync: configuration unchanged");
                    return;
                }
                if let Some(backoff) = self.reconnect.as_mut() {
                    backoff.reset();
                }
                // An unusable URL leaves the manager in the error state until
                // the next configuration.
                let _ = self.manager.open(config);
            }
            None => {
                if self.manager.state() != &ConnectionState::Idle {
                    info!("sync: configuration withdrawn, closing connection");
                }
                self.manager.close();
            }
        }
    }

    fn schedule_reconnect(&mut self) -> Option<Instant> {
        let delay = self.reconnect.as_mut()?.next_delay();
        info!("sync: connection lost, retrying in {:?}", delay);
        Some(Instant::now() + delay)
    }
}
