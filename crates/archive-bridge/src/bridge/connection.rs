//! Host side of a bridge connection.
//!
//! Flow:
//! 1. Send `Hello`, wait for `Accepted` or `Rejected`
//! 2. Check the plugin's descriptor in turn
//! 3. Spawn one reader task that routes `Done`/`Failed` to waiting callers
//! 4. On stream close or decode error: fail every outstanding and later call
//!
//! Frames from concurrent callers go through one writer lock, so they never
//! interleave on the stream. There is no per-call timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{CallId, ExecuteRequest, Generation, HostMessage, PluginMessage, WireOutcome};
use crate::config::PluginConfig;
use crate::error::BridgeError;
use crate::handshake::{self, HandshakeError};

type CallReply = Result<WireOutcome, BridgeError>;

type HostWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<HostMessage>>;

/// A handshake-validated, multiplexed connection to one plugin.
pub struct Connection {
    plugin: String,
    generation: Generation,
    writer: Mutex<HostWriter>,
    calls: Arc<PendingCalls>,
    reader_task: JoinHandle<()>,
}

#[derive(Default)]
struct PendingCalls {
    waiting: DashMap<CallId, oneshot::Sender<CallReply>>,
    closed: AtomicBool,
}

impl PendingCalls {
    fn complete(&self, id: CallId, reply: CallReply) {
        match self.waiting.remove(&id) {
            Some((_, tx)) => {
                if tx.send(reply).is_err() {
                    tracing::debug!(call_id = %id, "Caller gone before response arrived");
                }
            }
            None => {
                tracing::warn!(call_id = %id, "Response for unknown call");
            }
        }
    }

    /// Dropping the senders wakes every waiter with a closed-connection error.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.waiting.clear();
    }
}

impl Connection {
    /// Performs the host side of the handshake over `io`.
    ///
    /// On any mismatch the stream is dropped and no call can be issued.
    pub async fn handshake<IO>(io: IO, plugin: &str, config: &PluginConfig) -> Result<Self, BridgeError>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let generation = config.generation()?;
        let (read_half, write_half) = tokio::io::split(io);

        let mut reader = FramedRead::new(
            read_half,
            JsonCodec::<PluginMessage>::with_max_frame_length(config.max_frame_length),
        );
        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        let mut writer = FramedWrite::new(
            boxed,
            JsonCodec::<HostMessage>::with_max_frame_length(config.max_frame_length),
        );

        tracing::debug!(plugin, %generation, "Sending Hello to plugin");
        writer
            .send(HostMessage::Hello {
                plugin: plugin.to_string(),
                handshake: config.handshake.clone(),
            })
            .await?;

        match reader.next().await {
            Some(Ok(PluginMessage::Accepted { handshake: presented })) => {
                if let Err(e) = handshake::validate(&presented, &config.handshake) {
                    tracing::error!(plugin, error = %e, "Plugin presented a mismatched handshake");
                    return Err(e.into());
                }
            }
            Some(Ok(PluginMessage::Rejected { reason })) => {
                tracing::error!(plugin, %reason, "Plugin rejected handshake");
                return Err(HandshakeError::Rejected(reason).into());
            }
            Some(Ok(other)) => {
                return Err(BridgeError::protocol(format!(
                    "expected handshake reply, got {other:?}"
                )));
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(BridgeError::ConnectionClosed),
        }

        tracing::debug!(plugin, %generation, "Handshake accepted");

        let calls = Arc::new(PendingCalls::default());
        let reader_task = tokio::spawn(route_replies(reader, Arc::clone(&calls)));

        Ok(Self {
            plugin: plugin.to_string(),
            generation,
            writer: Mutex::new(writer),
            calls,
            reader_task,
        })
    }

    /// Sends one request and waits for its reply. Never retries.
    pub async fn call(&self, request: ExecuteRequest) -> Result<WireOutcome, BridgeError> {
        let id = CallId::new();
        let (tx, rx) = oneshot::channel();
        self.calls.waiting.insert(id, tx);

        // Checked after registering so a concurrent close cannot strand the waiter.
        if self.calls.closed.load(Ordering::SeqCst) {
            self.calls.waiting.remove(&id);
            return Err(BridgeError::ConnectionClosed);
        }

        tracing::trace!(plugin = %self.plugin, call_id = %id, "Sending execute");
        let sent = {
            let mut writer = self.writer.lock().await;
            writer.send(HostMessage::Execute { id, request }).await
        };
        if let Err(e) = sent {
            self.calls.waiting.remove(&id);
            tracing::warn!(plugin = %self.plugin, call_id = %id, error = %e, "Failed to send execute");
            return Err(e.into());
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(BridgeError::ConnectionClosed),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.calls.closed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.calls.waiting.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn route_replies<R>(mut reader: FramedRead<R, JsonCodec<PluginMessage>>, calls: Arc<PendingCalls>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(PluginMessage::Done { id, outcome })) => {
                tracing::trace!(call_id = %id, succeeded = outcome.succeeded(), "Call done");
                calls.complete(id, Ok(outcome));
            }
            Some(Ok(PluginMessage::Failed { id, error })) => {
                tracing::warn!(call_id = %id, %error, "Plugin failed call");
                calls.complete(id, Err(BridgeError::PluginFailed(error)));
            }
            Some(Ok(other)) => {
                tracing::warn!(?other, "Unexpected message after handshake");
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Connection read error");
                break;
            }
            None => {
                tracing::debug!("Plugin closed connection");
                break;
            }
        }
    }
    calls.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeConfig;
    use tokio::io::DuplexStream;

    const TEST_HANDSHAKE: HandshakeConfig = HandshakeConfig::new(3, "TEST_PLUGIN", "s3cret");

    type PluginSide = (
        FramedRead<tokio::io::ReadHalf<DuplexStream>, JsonCodec<HostMessage>>,
        FramedWrite<tokio::io::WriteHalf<DuplexStream>, JsonCodec<PluginMessage>>,
    );

    /// Hand-driven plugin end, for behavior a well-behaved server never shows.
    fn raw_plugin(io: DuplexStream) -> PluginSide {
        let (r, w) = tokio::io::split(io);
        (
            FramedRead::new(r, JsonCodec::new()),
            FramedWrite::new(w, JsonCodec::new()),
        )
    }

    async fn accept_any(side: &mut PluginSide, reply: HandshakeConfig) {
        match side.0.next().await {
            Some(Ok(HostMessage::Hello { plugin, .. })) => assert_eq!(plugin, "archive"),
            other => panic!("expected hello, got {other:?}"),
        }
        side.1
            .send(PluginMessage::Accepted { handshake: reply })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn host_rejects_plugin_with_wrong_cookie() {
        let (host_io, plugin_io) = tokio::io::duplex(4096);
        let mut plugin = raw_plugin(plugin_io);
        let config = PluginConfig::new(TEST_HANDSHAKE);

        let fake = tokio::spawn(async move {
            accept_any(&mut plugin, HandshakeConfig::new(3, "TEST_PLUGIN", "wrong")).await;
        });

        let result = Connection::handshake(host_io, "archive", &config).await;
        assert!(matches!(
            result,
            Err(BridgeError::Handshake(HandshakeError::CookieValueMismatch))
        ));
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn rejection_surfaces_reason() {
        let (host_io, plugin_io) = tokio::io::duplex(4096);
        let mut plugin = raw_plugin(plugin_io);
        let config = PluginConfig::new(TEST_HANDSHAKE);

        tokio::spawn(async move {
            let _ = plugin.0.next().await;
            plugin
                .1
                .send(PluginMessage::Rejected {
                    reason: "cookie value mismatch".to_string(),
                })
                .await
                .unwrap();
        });

        match Connection::handshake(host_io, "archive", &config).await {
            Err(BridgeError::Handshake(HandshakeError::Rejected(reason))) => {
                assert_eq!(reason, "cookie value mismatch");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("handshake should fail"),
        }
    }

    #[tokio::test]
    async fn unsupported_version_fails_before_sending() {
        let (host_io, _plugin_io) = tokio::io::duplex(4096);
        let config = PluginConfig::new(HandshakeConfig::new(9, "TEST_PLUGIN", "s3cret"));

        let result = Connection::handshake(host_io, "archive", &config).await;
        assert!(matches!(
            result,
            Err(BridgeError::Handshake(HandshakeError::UnsupportedVersion(9)))
        ));
    }

    #[tokio::test]
    async fn closed_before_reply_is_connection_closed() {
        let (host_io, plugin_io) = tokio::io::duplex(4096);
        let mut plugin = raw_plugin(plugin_io);
        let config = PluginConfig::new(TEST_HANDSHAKE);

        tokio::spawn(async move {
            let _ = plugin.0.next().await;
            drop(plugin);
        });

        let result = Connection::handshake(host_io, "archive", &config).await;
        assert!(matches!(result, Err(BridgeError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn replies_are_routed_by_call_id() {
        let (host_io, plugin_io) = tokio::io::duplex(4096);
        let mut plugin = raw_plugin(plugin_io);
        let config = PluginConfig::new(TEST_HANDSHAKE);

        // Answers two calls in reverse order of arrival.
        let fake = tokio::spawn(async move {
            accept_any(&mut plugin, TEST_HANDSHAKE).await;
            let mut received = Vec::new();
            for _ in 0..2 {
                match plugin.0.next().await {
                    Some(Ok(HostMessage::Execute { id, request })) => received.push((id, request)),
                    other => panic!("expected execute, got {other:?}"),
                }
            }
            for (id, request) in received.into_iter().rev() {
                let outcome = WireOutcome::V3 {
                    succeeded: request.payload == "first",
                    error: Some(request.payload),
                };
                plugin
                    .1
                    .send(PluginMessage::Done { id, outcome })
                    .await
                    .unwrap();
            }
            plugin
        });

        let conn = Connection::handshake(host_io, "archive", &config)
            .await
            .unwrap();
        assert_eq!(conn.generation(), Generation::V3);
        assert_eq!(conn.plugin(), "archive");

        let (first, second) = tokio::join!(
            conn.call(ExecuteRequest::new("first")),
            conn.call(ExecuteRequest::new("second")),
        );
        assert_eq!(
            first.unwrap().into_parts(),
            (true, Some("first".to_string()))
        );
        assert_eq!(
            second.unwrap().into_parts(),
            (false, Some("second".to_string()))
        );
        assert_eq!(conn.in_flight(), 0);

        let _plugin = fake.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_fails_outstanding_and_later_calls() {
        let (host_io, plugin_io) = tokio::io::duplex(4096);
        let mut plugin = raw_plugin(plugin_io);
        let config = PluginConfig::new(TEST_HANDSHAKE);

        tokio::spawn(async move {
            accept_any(&mut plugin, TEST_HANDSHAKE).await;
            // Read the call, then vanish without answering.
            let _ = plugin.0.next().await;
            drop(plugin);
        });

        let conn = Connection::handshake(host_io, "archive", &config)
            .await
            .unwrap();

        let result = conn.call(ExecuteRequest::new("report.tar")).await;
        assert!(matches!(result, Err(BridgeError::ConnectionClosed)));
        assert!(conn.is_closed());

        let later = conn.call(ExecuteRequest::new("again")).await;
        assert!(matches!(later, Err(BridgeError::ConnectionClosed)));
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn failed_reply_is_plugin_failure() {
        let (host_io, plugin_io) = tokio::io::duplex(4096);
        let mut plugin = raw_plugin(plugin_io);
        let config = PluginConfig::new(TEST_HANDSHAKE);

        tokio::spawn(async move {
            accept_any(&mut plugin, TEST_HANDSHAKE).await;
            if let Some(Ok(HostMessage::Execute { id, .. })) = plugin.0.next().await {
                plugin
                    .1
                    .send(PluginMessage::Failed {
                        id,
                        error: "implementation panicked: boom".to_string(),
                    })
                    .await
                    .unwrap();
            }
            // Keep the stream open until the host is done.
            let _ = plugin.0.next().await;
        });

        let conn = Connection::handshake(host_io, "archive", &config)
            .await
            .unwrap();
        match conn.call(ExecuteRequest::new("x")).await {
            Err(BridgeError::PluginFailed(error)) => assert!(error.contains("boom")),
            other => panic!("expected plugin failure, got {other:?}"),
        }
        assert!(!conn.is_closed());
    }
}
