//! Per-connection settings shared by both ends of the bridge.

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::bridge::protocol::Generation;
use crate::handshake::{ARCHIVE_HANDSHAKE, HandshakeConfig, HandshakeError};

#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub handshake: HandshakeConfig,
    pub max_frame_length: usize,
}

impl PluginConfig {
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn generation(&self) -> Result<Generation, HandshakeError> {
        self.handshake.generation()
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self::new(ARCHIVE_HANDSHAKE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_archive_handshake() {
        let config = PluginConfig::default();
        assert_eq!(config.handshake, ARCHIVE_HANDSHAKE);
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        assert_eq!(config.generation(), Ok(Generation::LATEST));
    }

    #[test]
    fn builder_overrides_frame_length() {
        let config = PluginConfig::new(HandshakeConfig::new(1, "K", "V")).with_max_frame_length(1024);
        assert_eq!(config.max_frame_length, 1024);
        assert_eq!(config.generation(), Ok(Generation::V1));
    }
}
