//! Plugin side of a bridge connection.
//!
//! Flow:
//! 1. Read `Hello`, validate it, answer `Accepted` or `Rejected`
//! 2. Run each `Execute` as its own task so calls proceed concurrently
//! 3. Answer with `Done`, or `Failed` when the implementation panicked or
//!    the `Done` frame could not be written
//!
//! A panic poisons the connection: the loop stops, in-flight calls are
//! aborted and the stream is closed. There is no local recovery.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{CallId, ExecuteRequest, HostMessage, PluginMessage};
use crate::config::PluginConfig;
use crate::error::BridgeError;
use crate::handshake::{self, HandshakeError};
use crate::server::RequestHandler;

type PluginWriter<IO> = Arc<Mutex<FramedWrite<WriteHalf<IO>, JsonCodec<PluginMessage>>>>;

struct CallCompletion {
    id: CallId,
    /// Set when the connection can no longer be trusted to answer this call.
    fatal: Option<BridgeError>,
}

/// Serves one connection until the host closes it.
///
/// Returns an error if the handshake fails, a frame cannot be read, or the
/// implementation panics.
pub async fn serve_connection<IO>(
    io: IO,
    plugin: &str,
    config: &PluginConfig,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), BridgeError>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let mut reader = FramedRead::new(
        read_half,
        JsonCodec::<HostMessage>::with_max_frame_length(config.max_frame_length),
    );
    let writer: PluginWriter<IO> = Arc::new(Mutex::new(FramedWrite::new(
        write_half,
        JsonCodec::<PluginMessage>::with_max_frame_length(config.max_frame_length),
    )));

    accept_handshake(&mut reader, &writer, plugin, config).await?;
    tracing::info!(plugin, "Host connected");

    let mut calls: JoinSet<CallCompletion> = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            Some(joined) = calls.join_next() => {
                match joined {
                    Ok(CallCompletion { id, fatal: Some(e) }) => {
                        tracing::error!(plugin, call_id = %id, error = %e, "Call failed fatally, closing connection");
                        return Err(e);
                    }
                    Ok(CallCompletion { id, fatal: None }) => {
                        tracing::trace!(call_id = %id, "Call finished");
                    }
                    Err(e) => {
                        // The call's id is lost with the task; closing the stream fails it on the host.
                        tracing::error!(plugin, error = %e, "Call task failed, closing connection");
                        return Err(BridgeError::Poisoned(format!("call task failed: {e}")));
                    }
                }
            }

            msg = reader.next() => {
                match msg {
                    Some(Ok(HostMessage::Execute { id, request })) => {
                        tracing::trace!(call_id = %id, "Execute received");
                        calls.spawn(run_call(id, request, Arc::clone(&handler), Arc::clone(&writer)));
                    }
                    Some(Ok(HostMessage::Hello { .. })) => {
                        tracing::warn!(plugin, "Received Hello after handshake, ignoring");
                    }
                    Some(Err(e)) => {
                        tracing::error!(plugin, error = %e, "Connection read error");
                        return Err(e.into());
                    }
                    None => {
                        tracing::info!(plugin, in_flight = calls.len(), "Host closed connection");
                        break;
                    }
                }
            }
        }
    }

    // Let calls already running finish their side effects.
    while let Some(joined) = calls.join_next().await {
        match joined {
            Ok(CallCompletion { fatal: None, .. }) => {}
            Ok(CallCompletion { id, fatal: Some(e) }) => {
                tracing::error!(plugin, call_id = %id, error = %e, "Call failed fatally after host left");
                return Err(e);
            }
            Err(e) => {
                tracing::error!(plugin, error = %e, "Call task failed after host left");
                return Err(BridgeError::Poisoned(format!("call task failed: {e}")));
            }
        }
    }
    Ok(())
}

async fn accept_handshake<IO>(
    reader: &mut FramedRead<ReadHalf<IO>, JsonCodec<HostMessage>>,
    writer: &PluginWriter<IO>,
    plugin: &str,
    config: &PluginConfig,
) -> Result<(), BridgeError>
where
    IO: AsyncRead + AsyncWrite,
{
    let verdict = match reader.next().await {
        Some(Ok(HostMessage::Hello {
            plugin: requested,
            handshake: presented,
        })) => handshake::validate(&presented, &config.handshake).and_then(|()| {
            if requested == plugin {
                Ok(())
            } else {
                Err(HandshakeError::UnknownPlugin(requested))
            }
        }),
        Some(Ok(HostMessage::Execute { id, .. })) => {
            tracing::error!(call_id = %id, "Execute received before Hello");
            let mut w = writer.lock().await;
            let _ = w
                .send(PluginMessage::Rejected {
                    reason: "expected hello before any call".to_string(),
                })
                .await;
            return Err(BridgeError::protocol("execute received before hello"));
        }
        Some(Err(e)) => return Err(e.into()),
        None => return Err(BridgeError::ConnectionClosed),
    };

    let mut w = writer.lock().await;
    match verdict {
        Ok(()) => {
            w.send(PluginMessage::Accepted {
                handshake: config.handshake.clone(),
            })
            .await?;
            Ok(())
        }
        Err(e) => {
            tracing::error!(plugin, error = %e, "Rejecting host handshake");
            let _ = w
                .send(PluginMessage::Rejected {
                    reason: e.to_string(),
                })
                .await;
            Err(e.into())
        }
    }
}

async fn run_call<IO>(
    id: CallId,
    request: ExecuteRequest,
    handler: Arc<dyn RequestHandler>,
    writer: PluginWriter<IO>,
) -> CallCompletion
where
    IO: AsyncRead + AsyncWrite,
{
    // Building the future inside the guard also catches panics raised before its first poll.
    let result = AssertUnwindSafe(async move { handler.handle(request).await })
        .catch_unwind()
        .await;

    let (response, mut fatal) = match result {
        Ok(outcome) => (PluginMessage::Done { id, outcome }, None),
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            (
                PluginMessage::Failed {
                    id,
                    error: reason.clone(),
                },
                Some(BridgeError::Poisoned(reason)),
            )
        }
    };

    let mut w = writer.lock().await;
    if let Err(e) = w.send(response).await {
        tracing::error!(call_id = %id, error = %e, "Failed to send call response, reporting failure instead");
        let fallback = PluginMessage::Failed {
            id,
            error: format!("response could not be sent: {e}"),
        };
        if let Err(e) = w.send(fallback).await {
            tracing::error!(call_id = %id, error = %e, "Failed to report call failure");
            if fatal.is_none() {
                fatal = Some(BridgeError::Io(e));
            }
        }
    }

    CallCompletion { id, fatal }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("implementation panicked: {detail}")
}
