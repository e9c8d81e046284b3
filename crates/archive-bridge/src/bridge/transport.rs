//! Unix socket transport for plugin connections.
//!
//! The plugin binds a socket and announces it on stdout with one address line:
//! `{protocol_version}|unix|{path}|json`. The host parses that line and dials
//! the path; the resulting stream goes straight into the handshake.
//!
//! Socket path format: `{temp_dir}/archive-bridge-{pid}/plugin.sock`

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};

use crate::error::BridgeError;

const SOCKET_NAME: &str = "plugin.sock";

/// Listening socket owned by the plugin process.
pub struct PluginSocket {
    dir: PathBuf,
    path: PathBuf,
    listener: UnixListener,
    owns_dir: bool,
}

impl PluginSocket {
    /// Binds in a per-process directory under the system temp dir.
    pub fn bind() -> io::Result<Self> {
        let dir = std::env::temp_dir().join(format!("archive-bridge-{}", std::process::id()));
        Self::bind_in(dir)
    }

    /// Binds in `dir`. The directory is removed on drop only if this call created it.
    pub fn bind_in(dir: PathBuf) -> io::Result<Self> {
        let owns_dir = !dir.exists();
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(SOCKET_NAME);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::debug!(path = %path.display(), "Bound plugin socket");

        Ok(Self {
            dir,
            path,
            listener,
            owns_dir,
        })
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        tracing::trace!(path = %self.path.display(), "Host connected to socket");
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn address_line(&self, protocol_version: u32) -> String {
        format!("{}|unix|{}|json", protocol_version, self.path.display())
    }

    pub fn cleanup(&mut self) -> io::Result<()> {
        if self.owns_dir && self.dir.exists() {
            tracing::debug!(dir = %self.dir.display(), "Cleaning up socket directory");
            std::fs::remove_dir_all(&self.dir)?;
        } else if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for PluginSocket {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to cleanup plugin socket");
        }
    }
}

/// Address announced by a plugin process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginAddress {
    pub protocol_version: u32,
    pub path: PathBuf,
}

impl PluginAddress {
    pub fn parse(line: &str) -> Result<Self, BridgeError> {
        let parts: Vec<&str> = line.trim_end().splitn(4, '|').collect();
        let [version, network, path, codec] = parts.as_slice() else {
            return Err(BridgeError::protocol(format!(
                "malformed address line: {line:?}"
            )));
        };

        let protocol_version = version.parse().map_err(|_| {
            BridgeError::protocol(format!("invalid protocol version in address line: {version:?}"))
        })?;
        if *network != "unix" {
            return Err(BridgeError::protocol(format!(
                "unsupported network type: {network:?}"
            )));
        }
        if *codec != "json" {
            return Err(BridgeError::protocol(format!("unsupported codec: {codec:?}")));
        }
        if path.is_empty() {
            return Err(BridgeError::protocol("empty socket path in address line"));
        }

        Ok(Self {
            protocol_version,
            path: PathBuf::from(path),
        })
    }
}

/// Dials a plugin socket from the host side.
pub async fn connect_socket(path: impl AsRef<Path>) -> io::Result<UnixStream> {
    let path = path.as_ref();
    tracing::trace!(path = %path.display(), "Connecting to plugin socket");
    UnixStream::connect(path).await
}
