//! Plugin registration: binds a capability name to its stub factories.
//!
//! A plugin host runtime only needs the two extension points on [`Plugin`]:
//! attach a server stub on the plugin side, build a client on the host side.
//! [`serve`] and [`dispense`] drive them over an already-open stream.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::bridge::connection::Connection;
use crate::bridge::protocol::Generation;
use crate::capability::Archive;
use crate::client::ArchiveClient;
use crate::config::PluginConfig;
use crate::error::BridgeError;
use crate::serve::serve_connection;
use crate::server::{ArchiveServer, RequestHandler};

pub trait Plugin: Send + Sync + 'static {
    /// What the host gets back: the capability, backed by a client stub.
    type Client: Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Server stub relaying to the local implementation.
    fn server(&self, generation: Generation) -> Result<Arc<dyn RequestHandler>, BridgeError>;

    /// Client stub over a validated connection.
    fn client(&self, connection: Arc<Connection>) -> Self::Client;
}

/// The archive capability registration.
///
/// The plugin process builds it with its implementation; a host builds it
/// empty with [`ArchivePlugin::host`].
#[derive(Clone, Default)]
pub struct ArchivePlugin {
    archive: Option<Arc<dyn Archive>>,
}

impl ArchivePlugin {
    pub const NAME: &'static str = "archive";

    pub fn new(archive: Arc<dyn Archive>) -> Self {
        Self {
            archive: Some(archive),
        }
    }

    pub fn host() -> Self {
        Self::default()
    }
}

impl Plugin for ArchivePlugin {
    type Client = Arc<dyn Archive>;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn server(&self, generation: Generation) -> Result<Arc<dyn RequestHandler>, BridgeError> {
        let archive = self
            .archive
            .clone()
            .ok_or(BridgeError::NoImplementation(Self::NAME))?;
        Ok(Arc::new(ArchiveServer::new(archive, generation)))
    }

    fn client(&self, connection: Arc<Connection>) -> Self::Client {
        Arc::new(ArchiveClient::new(connection))
    }
}

/// Serves `plugin` on one connection until the host goes away.
pub async fn serve<P, IO>(plugin: &P, io: IO, config: &PluginConfig) -> Result<(), BridgeError>
where
    P: Plugin,
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let generation = config.generation()?;
    let handler = plugin.server(generation)?;
    tracing::info!(plugin = plugin.name(), %generation, "Serving plugin connection");
    serve_connection(io, plugin.name(), config, handler).await
}

/// Handshakes over `io` and returns the host-side capability.
pub async fn dispense<P, IO>(plugin: &P, io: IO, config: &PluginConfig) -> Result<P::Client, BridgeError>
where
    P: Plugin,
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let connection = Connection::handshake(io, plugin.name(), config).await?;
    tracing::info!(
        plugin = plugin.name(),
        generation = %connection.generation(),
        "Plugin connection established"
    );
    Ok(plugin.client(Arc::new(connection)))
}
