//! Error types for the lapmap environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Outbound delivery failed (bus gone, buffer full, ...)
    #[error("Sink error: {0}")]
    SinkError(String),

    /// Clock operation failed
    #[error("Clock error: {0}")]
    ClockError(String),
}

impl EnvError {
    /// Creates a sink error.
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::SinkError(msg.into())
    }
}
