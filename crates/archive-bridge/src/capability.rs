//! The archive capability shared by local implementations and remote stubs.
//!
//! Callers hold an `Arc<dyn Archive>` and never learn whether it runs in
//! process or behind a connection.

use async_trait::async_trait;

use crate::error::BridgeError;

/// Archive a named payload and report whether it worked.
#[async_trait]
pub trait Archive: Send + Sync + 'static {
    async fn execute(&self, payload: &str) -> Outcome;
}

/// Result of one `execute` call. Produced per call and consumed once.
///
/// When `error` is set, `succeeded` is not to be trusted.
#[derive(Debug)]
pub struct Outcome {
    pub succeeded: bool,
    pub error: Option<CallError>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            error: None,
        }
    }

    /// The implementation ran and reported failure without detail.
    pub fn failure() -> Self {
        Self {
            succeeded: false,
            error: None,
        }
    }

    /// The implementation ran and reported failure with a reason.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error: Some(CallError::Reported(error.into())),
        }
    }

    /// The call could not be completed or interpreted.
    pub fn transport(error: BridgeError) -> Self {
        Self {
            succeeded: false,
            error: Some(CallError::Transport(error)),
        }
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(self.error, Some(CallError::Transport(_)))
    }

    /// Reported error text, the form that crosses the wire.
    pub fn reported_error(&self) -> Option<&str> {
        match &self.error {
            Some(CallError::Reported(message)) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Error value returned by the implementation, relayed unchanged.
    #[error("{0}")]
    Reported(String),

    #[error("transport failure: {0}")]
    Transport(#[from] BridgeError),
}
