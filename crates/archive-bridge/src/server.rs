//! Server stub: relays decoded requests to the local implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::protocol::{ExecuteRequest, Generation, WireOutcome};
use crate::capability::{Archive, Outcome};

/// Transport-facing side of a capability: one request in, one outcome out.
///
/// A panic escapes to the serving loop, which reports it to the caller as a
/// transport failure.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: ExecuteRequest) -> WireOutcome;
}

/// Serves [`Archive`] over a connection of a fixed wire generation.
pub struct ArchiveServer {
    archive: Arc<dyn Archive>,
    generation: Generation,
}

impl ArchiveServer {
    pub fn new(archive: Arc<dyn Archive>, generation: Generation) -> Self {
        Self {
            archive,
            generation,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Maps a local outcome onto the wire shape of this generation.
    ///
    /// Boolean-only generations cannot carry the error, so it is dropped.
    pub fn encode(&self, outcome: Outcome) -> WireOutcome {
        match self.generation {
            Generation::V1 => WireOutcome::V1 {
                proceed: outcome.succeeded,
            },
            Generation::V2 => WireOutcome::V2 {
                succeeded: outcome.succeeded,
            },
            Generation::V3 => WireOutcome::V3 {
                succeeded: outcome.succeeded,
                error: outcome.error.map(|e| e.to_string()),
            },
        }
    }
}

#[async_trait]
impl RequestHandler for ArchiveServer {
    async fn handle(&self, request: ExecuteRequest) -> WireOutcome {
        let outcome = self.archive.execute(&request.payload).await;
        tracing::debug!(
            payload_len = request.payload.len(),
            succeeded = outcome.succeeded,
            has_error = outcome.error.is_some(),
            generation = %self.generation,
            "Archive executed"
        );
        self.encode(outcome)
    }
}
