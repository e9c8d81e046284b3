//! Client stub: the remote-backed [`Archive`].
//!
//! How a transport failure reaches the caller depends on the generation the
//! connection speaks:
//! - **V3**: a distinct [`CallError::Transport`], separate from `succeeded`
//! - **V1/V2**: collapsed into `succeeded == false` with no error, exactly as
//!   a failure reported by the plugin would look

use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::connection::Connection;
use crate::bridge::protocol::{ExecuteRequest, Generation, WireOutcome};
use crate::capability::{Archive, CallError, Outcome};

/// Implements [`Archive`] by forwarding each call over a shared connection.
///
/// Holds no per-call state, so one instance serves any number of concurrent
/// callers.
pub struct ArchiveClient {
    connection: Arc<Connection>,
}

impl ArchiveClient {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn generation(&self) -> Generation {
        self.connection.generation()
    }
}

#[async_trait]
impl Archive for ArchiveClient {
    async fn execute(&self, payload: &str) -> Outcome {
        let generation = self.connection.generation();

        match self.connection.call(ExecuteRequest::new(payload)).await {
            Ok(wire) => decode(wire, generation),
            Err(e) if generation.preserves_errors() => {
                tracing::debug!(error = %e, %generation, "Archive call failed in transport");
                Outcome::transport(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, %generation, "Archive call failed, reporting as unsuccessful");
                Outcome::failure()
            }
        }
    }
}

/// Any generation's shape is accepted, but an error only survives on a
/// connection whose generation carries one.
fn decode(wire: WireOutcome, generation: Generation) -> Outcome {
    let (succeeded, error) = wire.into_parts();
    Outcome {
        succeeded,
        error: error
            .filter(|_| generation.preserves_errors())
            .map(CallError::Reported),
    }
}
