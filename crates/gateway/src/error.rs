//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// AMQP protocol or channel error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Anyhow error (for compatibility with amqp_client).
    #[error("Error: {0}")]
    Anyhow(#[from] anyhow::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),

    /// Write attempted on a connection that is already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Missing or invalid credentials on a session request.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A supervised task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
