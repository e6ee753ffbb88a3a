//! Server process: storage, node registry, HTTP/WebSocket listeners and
//! the mDNS responder, started and stopped together.

pub mod dispatcher;
pub mod http;

pub use dispatcher::{CommandError, Dispatcher};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::events::EventBus;
use crate::mdns::{protocol, MatterZone, Responder};
use crate::models::{EventType, ServerInfo};
use crate::storage::{JsonStorage, Storage};
use crate::websocket::Handler;

/// Upper bound for draining the HTTP listeners on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const ZONE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_LISTEN: &str = "0.0.0.0";

pub struct MatterServer {
    config: ServerConfig,
    storage: Arc<dyn Storage>,
    dispatcher: Arc<Dispatcher>,
    ws: Handler,
    zone: Option<Arc<MatterZone>>,
}

impl MatterServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let storage = Arc::new(JsonStorage::new(&config.storage_path));
        Self::with_storage(config, storage)
    }

    pub fn with_storage(config: ServerConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(
            storage.clone(),
            EventBus::new(),
            ServerInfo::new(config.fabric_id),
        ));
        let ws = Handler::new(dispatcher.clone());

        let zone = if config.mdns.enabled {
            let zone = MatterZone::new(&config.mdns.hostname);
            protocol::encode_name(zone.hostname(), &mut Vec::new())
                .context(format!("invalid mdns hostname {:?}", config.mdns.hostname))?;
            Some(Arc::new(zone))
        } else {
            None
        };

        Ok(Self {
            config,
            storage,
            dispatcher,
            ws,
            zone,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn handler(&self) -> &Handler {
        &self.ws
    }

    pub fn zone(&self) -> Option<&Arc<MatterZone>> {
        self.zone.as_ref()
    }

    pub fn router(&self) -> Router {
        http::router(http::AppState {
            dispatcher: self.dispatcher.clone(),
            ws: self.ws.clone(),
        })
    }

    /// Bind every listen address on the configured port (all interfaces
    /// when none are configured). Port 0 picks a free port.
    pub async fn bind(&self) -> Result<Vec<TcpListener>> {
        let port = self.config.port();
        let hosts: Vec<&str> = if self.config.listen_addresses.is_empty() {
            vec![DEFAULT_LISTEN]
        } else {
            self.config.listen_addresses.iter().map(String::as_str).collect()
        };
        let mut listeners = Vec::with_capacity(hosts.len());
        for host in hosts {
            let listener = TcpListener::bind((host, port))
                .await
                .context(format!("failed to bind {}:{}", host, port))?;
            listeners.push(listener);
        }
        Ok(listeners)
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners, shutdown).await
    }

    fn start_mdns(&self) -> Option<Responder> {
        let zone = self.zone.clone()?;
        let responder = Responder::new(zone.clone(), self.config.primary_interface.clone());
        match responder.start() {
            Ok(()) => {
                log::info!("mdns hostname advertisement enabled for {}", zone.hostname());
                Some(responder)
            }
            Err(e) => {
                log::error!("failed to start mdns responder: {:#}", e);
                None
            }
        }
    }

    /// Serve on `listeners` until `shutdown` is cancelled or a listener
    /// fails, then stop everything in order.
    pub async fn serve(self, listeners: Vec<TcpListener>, shutdown: CancellationToken) -> Result<()> {
        log::info!(
            "starting matter server on port {} (listen: {})",
            self.config.port,
            if self.config.listen_addresses.is_empty() {
                DEFAULT_LISTEN.to_owned()
            } else {
                self.config.listen_addresses.join(", ")
            }
        );
        self.storage.start().context("failed to start storage")?;
        self.dispatcher.load_nodes();
        let responder = self.start_mdns();

        let mut background = JoinSet::new();
        if let Some(zone) = self.zone.clone() {
            let token = shutdown.clone();
            background.spawn(async move {
                let start = tokio::time::Instant::now() + ZONE_REFRESH_INTERVAL;
                let mut tick = tokio::time::interval_at(start, ZONE_REFRESH_INTERVAL);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => zone.refresh_addresses(),
                    }
                }
            });
        }

        let router = self.router();
        let mut servers = JoinSet::new();
        for listener in listeners {
            let addr = listener.local_addr()?;
            log::info!("http server listening on {}", addr);
            let app = router.clone();
            let token = shutdown.clone();
            servers.spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await
                    .context(format!("http server on {}", addr))
            });
        }

        let result = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            Some(res) = servers.join_next() => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("http server task failed: {}", e)),
            },
        };

        log::info!("shutting down server");
        shutdown.cancel();
        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while let Some(res) = servers.join_next().await {
                if let Ok(Err(e)) = res {
                    log::error!("failed to shutdown http server: {:#}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("http servers did not drain within {:?}", SHUTDOWN_TIMEOUT);
            servers.abort_all();
        }

        self.ws.shutdown_all();
        if let Some(responder) = responder {
            responder.shutdown().await;
        }
        background.abort_all();

        self.dispatcher
            .events()
            .publish(EventType::ServerShutdown, Value::Null);
        self.dispatcher.events().close(EVENT_DRAIN_TIMEOUT).await;

        if let Err(e) = self.storage.stop() {
            log::error!("failed to stop storage: {:#}", e);
        }
        log::info!("server shutdown complete");
        result
    }
}
