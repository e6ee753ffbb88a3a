//! Matter server front-end
//!
//! Serves a JSON command protocol over WebSocket plus a small read-only HTTP
//! API on top of a persisted node registry, and advertises its hostname on
//! the local network using mDNS.
//! Following are main parts of api:
//! - [MatterServer](server::MatterServer) - Owns storage, the command [Dispatcher](server::Dispatcher),
//!                                 the WebSocket [Handler](websocket::Handler) and the mDNS [Responder](mdns::Responder).
//!                                 Binds the configured addresses and shuts everything down in order when cancelled.
//! - [Storage](storage::Storage) - Trait for node, vendor and settings persistence.
//!                        Default implementation [storage::JsonStorage] keeps JSON files in one directory.
//! - [EventBus](events::EventBus) - Fan-out of server events to subscribers, each delivery runs on its own task.
//! - [mdns] - Minimal responder answering A/AAAA questions for the server hostname.
//! - [config] - Defaults, JSON config file, environment and command line flags.
//!
//! Example how to run server until ctrl-c:
//! ```no_run
//! # use matter_server::{config::ServerConfig, server::MatterServer};
//! # use anyhow::Result;
//! # use tokio_util::sync::CancellationToken;
//! # async fn run() -> Result<()> {
//! let server = MatterServer::new(ServerConfig::default())?;
//! let token = CancellationToken::new();
//! let t = token.clone();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     t.cancel();
//! });
//! server.run(token).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod events;
pub mod logging;
pub mod mdns;
pub mod models;
pub mod server;
pub mod storage;
pub mod websocket;
