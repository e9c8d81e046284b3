use thiserror::Error;

use crate::handshake::HandshakeError;

/// Failure of the bridge itself, as opposed to a failure the plugin reports.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,

    /// The serving side could not produce an outcome for this call.
    #[error("plugin failed: {0}")]
    PluginFailed(String),

    /// The serving side hit an unrecoverable failure and stopped serving.
    #[error("connection poisoned: {0}")]
    Poisoned(String),

    #[error("no local implementation registered for plugin {0:?}")]
    NoImplementation(&'static str),
}

impl BridgeError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
