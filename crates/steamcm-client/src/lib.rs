//! steamcm-client: async client for the CM gateway protocol.
//!
//! Bootstraps a server list from the directory web API, connects over
//! WebSocket, logs on with caller-supplied credentials, keeps the connection
//! alive, and dispatches decoded envelopes to parsers, pending listeners and
//! the event bus. Game Coordinator traffic is routed per app by
//! [`GcDispatcher`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use steamcm_client::{ClientConfig, ConnectOptions, Gateway, StaticCredentials};
//! use steamcm_core::SteamId;
//!
//! # async fn example() -> steamcm_core::CmResult<()> {
//! let config = ClientConfig::load(Some("~/.config/steamcm/config.toml".as_ref()))?;
//! let credentials = Arc::new(StaticCredentials::new(
//!     "alice",
//!     SteamId::individual(22202),
//!     "eyJ...",
//! ));
//!
//! let gateway = Gateway::connect(ConnectOptions::new(config, credentials)).await?;
//! gateway.events().subscribe("logged_off", |event| {
//!     println!("logged off: {}", event.detail);
//! });
//!
//! let err = gateway.wait_closed().await;
//! if let Some(address) = err.failed_address() {
//!     gateway.servers().mark_bad(address).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod events;
pub mod gateway;
pub mod gc;
pub mod keepalive;
pub mod multi;
pub mod servers;
pub mod transport;

// Re-export primary public types.
pub use config::ClientConfig;
pub use credentials::{Credentials, StaticCredentials};
pub use dispatch::{Dispatcher, Waiter};
pub use events::{topics, Event, EventBus};
pub use gateway::{ConnectOptions, ConnectionState, Gateway};
pub use gc::GcDispatcher;
pub use servers::{DirectoryClient, HttpDirectory, Quality, ServerCandidate, ServerList};
pub use transport::{Connector, Transport, WebSocketConnector};

// Re-export steamcm-core error types for convenience.
pub use steamcm_core::{CmError, CmResult};
