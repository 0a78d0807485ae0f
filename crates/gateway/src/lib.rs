//! Fan-out gateway from an AMQP headers exchange to WebSocket clients.
//!
//! This service:
//! - Accepts authenticated WebSocket connections and files them under a group
//! - Binds its private broker queue for every group it currently serves
//! - Consumes that queue and fans each message out to the addressed groups
//! - Acknowledges a delivery once its fan-out has been attempted
//!
//! ## Architecture
//!
//! ```text
//! headers exchange ──(UserID:<id> bindings, x-match=any)──▶ instance queue
//!         ↓
//! Dispatcher ingestion (parse UserIDs / groupName)
//!         ↓
//! bounded job queue ──▶ dispatch workers × N
//!         ↓
//! Registry (sharded DashMap, per-group lock)
//!         ↓
//! WebSocket clients
//! ```

pub mod auth;
pub mod broker;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod header;
pub mod registry;
pub mod ws_server;

pub use config::GatewayConfig;
pub use connection::{Connection, WsConnection};
pub use dispatch::{Acknowledger, DispatchConfig, DispatchStats, Dispatcher, InboundMessage, Job};
pub use error::{GatewayError, Result};
pub use header::{GroupId, ParsedHeader, RoutingMode};
pub use registry::{Binder, BroadcastReport, Registry, UnbindPolicy};
pub use ws_server::{create_router, AppState};
