//! Handshake descriptor shared by host and plugin.
//!
//! Both ends present the same `(protocol_version, cookie_key, cookie_value)`
//! triple before any call is trusted. A mismatch on any field is fatal for the
//! connection and is never retried: the other side is incompatible or hostile,
//! not temporarily unavailable.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::Generation;

/// Handshake of the archive plugin and every host that loads it.
///
/// Changing any field breaks compatibility with deployed plugins.
pub const ARCHIVE_HANDSHAKE: HandshakeConfig = HandshakeConfig::new(
    3,
    "ARCHIVE_PLUGIN",
    "c4f1e2a7b9d84f3e8a6b0d5c2e7f91a3b6d8e0f2a4c6e8b1d3f5a7c9e2b4d6f8",
);

/// Protocol version plus a magic cookie.
///
/// The cookie is not a security boundary. It keeps a plugin from being run by
/// anything other than a host built against the same descriptor.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub cookie_key: Cow<'static, str>,
    pub cookie_value: Cow<'static, str>,
}

impl HandshakeConfig {
    pub const fn new(
        protocol_version: u32,
        cookie_key: &'static str,
        cookie_value: &'static str,
    ) -> Self {
        Self {
            protocol_version,
            cookie_key: Cow::Borrowed(cookie_key),
            cookie_value: Cow::Borrowed(cookie_value),
        }
    }

    /// Wire generation selected by the protocol version.
    pub fn generation(&self) -> Result<Generation, HandshakeError> {
        Generation::try_from(self.protocol_version)
    }

    /// Environment variable a host exports when launching the plugin process.
    pub fn env_pair(&self) -> (&str, &str) {
        (&*self.cookie_key, &*self.cookie_value)
    }

    /// Checks the launch cookie in this process's environment.
    pub fn verify_env(&self) -> Result<(), HandshakeError> {
        let presented = std::env::var(&*self.cookie_key).ok();
        self.verify_cookie(presented.as_deref())
    }

    pub fn verify_cookie(&self, presented: Option<&str>) -> Result<(), HandshakeError> {
        match presented {
            Some(value) if value == self.cookie_value => Ok(()),
            _ => Err(HandshakeError::NotLaunchedByHost {
                key: self.cookie_key.to_string(),
            }),
        }
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("protocol_version", &self.protocol_version)
            .field("cookie_key", &self.cookie_key)
            .field("cookie_value", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("protocol version mismatch: presented {presented}, expected {expected}")]
    VersionMismatch { presented: u32, expected: u32 },

    #[error("cookie key mismatch: presented {presented:?}, expected {expected:?}")]
    CookieKeyMismatch { presented: String, expected: String },

    /// Never carries the values: one of them is the secret.
    #[error("cookie value mismatch")]
    CookieValueMismatch,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("plugin {0:?} is not served on this connection")]
    UnknownPlugin(String),

    #[error("rejected by peer: {0}")]
    Rejected(String),

    #[error("not launched by a plugin host: {key} does not hold the expected cookie")]
    NotLaunchedByHost { key: String },
}

/// Compares a presented handshake against the expected one, field by field.
pub fn validate(
    presented: &HandshakeConfig,
    expected: &HandshakeConfig,
) -> Result<(), HandshakeError> {
    if presented.protocol_version != expected.protocol_version {
        return Err(HandshakeError::VersionMismatch {
            presented: presented.protocol_version,
            expected: expected.protocol_version,
        });
    }
    if presented.cookie_key != expected.cookie_key {
        return Err(HandshakeError::CookieKeyMismatch {
            presented: presented.cookie_key.to_string(),
            expected: expected.cookie_key.to_string(),
        });
    }
    if presented.cookie_value != expected.cookie_value {
        return Err(HandshakeError::CookieValueMismatch);
    }
    Ok(())
}

pub fn is_valid(presented: &HandshakeConfig, expected: &HandshakeConfig) -> bool {
    validate(presented, expected).is_ok()
}
