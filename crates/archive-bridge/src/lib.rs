//! archive-bridge: cross-process bridge for the archive plugin capability.

pub mod bridge;
pub mod capability;
pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod plugin;
mod serve;
pub mod server;
pub mod telemetry;

pub use bridge::protocol::{Generation, WireOutcome};
pub use bridge::transport::{PluginAddress, PluginSocket, connect_socket};
pub use capability::{Archive, CallError, Outcome};
pub use client::ArchiveClient;
pub use config::PluginConfig;
pub use error::BridgeError;
pub use handshake::{ARCHIVE_HANDSHAKE, HandshakeConfig, HandshakeError};
pub use plugin::{ArchivePlugin, Plugin, dispense, serve};
pub use server::{ArchiveServer, RequestHandler};
