//! Wire protocol types for host-plugin communication.
//!
//! One duplex stream per connection carries both directions:
//! - **Host → plugin**: `Hello` (must be first), then `Execute` calls
//! - **Plugin → host**: `Accepted` or `Rejected`, then `Done`/`Failed` per call
//!
//! Calls are correlated by [`CallId`], so any number may be outstanding at once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::handshake::{HandshakeConfig, HandshakeError};

/// Unique identifier for one in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Schema generation of the call outcome.
///
/// `V1` and `V2` only carry a boolean, so a transport failure and a failure
/// reported by the plugin look the same to the caller. `V3` keeps them apart
/// and is what new peers speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    V1,
    V2,
    V3,
}

impl Generation {
    pub const LATEST: Self = Self::V3;

    pub fn protocol_version(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }

    pub fn preserves_errors(self) -> bool {
        matches!(self, Self::V3)
    }
}

impl TryFrom<u32> for Generation {
    type Error = HandshakeError;

    fn try_from(version: u32) -> Result<Self, Self::Error> {
        match version {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            other => Err(HandshakeError::UnsupportedVersion(other)),
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.protocol_version())
    }
}

/// Argument of a remote `execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// First-generation peers call this field `name`.
    #[serde(alias = "name")]
    pub payload: String,
}

impl ExecuteRequest {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Result of a remote `execute`, tagged with the generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "generation", rename_all = "snake_case")]
pub enum WireOutcome {
    V1 {
        proceed: bool,
    },
    V2 {
        succeeded: bool,
    },
    V3 {
        succeeded: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WireOutcome {
    pub fn generation(&self) -> Generation {
        match self {
            Self::V1 { .. } => Generation::V1,
            Self::V2 { .. } => Generation::V2,
            Self::V3 { .. } => Generation::V3,
        }
    }

    pub fn succeeded(&self) -> bool {
        match self {
            Self::V1 { proceed } => *proceed,
            Self::V2 { succeeded } | Self::V3 { succeeded, .. } => *succeeded,
        }
    }

    /// Splits into the success flag and the error the plugin reported, if any.
    pub fn into_parts(self) -> (bool, Option<String>) {
        match self {
            Self::V1 { proceed } => (proceed, None),
            Self::V2 { succeeded } => (succeeded, None),
            Self::V3 { succeeded, error } => (succeeded, error),
        }
    }
}

/// Messages from host to plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Must be the first frame on a connection.
    Hello {
        plugin: String,
        handshake: HandshakeConfig,
    },

    Execute {
        id: CallId,
        request: ExecuteRequest,
    },
}

/// Messages from plugin to host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginMessage {
    /// Handshake accepted. Carries the plugin's own descriptor so the host can
    /// check it in turn.
    Accepted { handshake: HandshakeConfig },

    /// Handshake refused. The plugin closes the stream after sending this.
    Rejected { reason: String },

    Done { id: CallId, outcome: WireOutcome },

    /// The implementation could not produce an outcome (it panicked).
    Failed { id: CallId, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_call_id() -> CallId {
        CallId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn hello_serializes() {
        let msg = HostMessage::Hello {
            plugin: "archive".to_string(),
            handshake: HandshakeConfig::new(3, "TEST_PLUGIN", "s3cret"),
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "hello",
          "plugin": "archive",
          "handshake": {
            "protocol_version": 3,
            "cookie_key": "TEST_PLUGIN",
            "cookie_value": "s3cret"
          }
        }
        "#);
    }

    #[test]
    fn execute_serializes() {
        let msg = HostMessage::Execute {
            id: test_call_id(),
            request: ExecuteRequest::new("report.tar"),
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "execute",
          "id": "550e8400-e29b-41d4-a716-446655440000",
          "request": {
            "payload": "report.tar"
          }
        }
        "#);
    }

    #[test]
    fn done_v3_serializes_without_error() {
        let msg = PluginMessage::Done {
            id: test_call_id(),
            outcome: WireOutcome::V3 {
                succeeded: true,
                error: None,
            },
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "done",
          "id": "550e8400-e29b-41d4-a716-446655440000",
          "outcome": {
            "generation": "v3",
            "succeeded": true
          }
        }
        "#);
    }

    #[test]
    fn done_v3_serializes_with_error() {
        let msg = PluginMessage::Done {
            id: test_call_id(),
            outcome: WireOutcome::V3 {
                succeeded: false,
                error: Some("empty payload".to_string()),
            },
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "done",
          "id": "550e8400-e29b-41d4-a716-446655440000",
          "outcome": {
            "generation": "v3",
            "succeeded": false,
            "error": "empty payload"
          }
        }
        "#);
    }

    #[test]
    fn legacy_outcomes_serialize() {
        insta::assert_json_snapshot!(WireOutcome::V1 { proceed: true }, @r#"
        {
          "generation": "v1",
          "proceed": true
        }
        "#);
        insta::assert_json_snapshot!(WireOutcome::V2 { succeeded: false }, @r#"
        {
          "generation": "v2",
          "succeeded": false
        }
        "#);
    }

    #[test]
    fn rejected_serializes() {
        let msg = PluginMessage::Rejected {
            reason: "cookie value mismatch".to_string(),
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "rejected",
          "reason": "cookie value mismatch"
        }
        "#);
    }

    #[test]
    fn legacy_request_field_name_decodes() {
        let msg: HostMessage = serde_json::from_str(
            r#"{"type":"execute","id":"550e8400-e29b-41d4-a716-446655440000","request":{"name":"report.tar"}}"#,
        )
        .unwrap();
        match msg {
            HostMessage::Execute { id, request } => {
                assert_eq!(id, test_call_id());
                assert_eq!(request.payload, "report.tar");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn v3_outcome_without_error_field_decodes() {
        let outcome: WireOutcome =
            serde_json::from_str(r#"{"generation":"v3","succeeded":false}"#).unwrap();
        assert_eq!(outcome.generation(), Generation::V3);
        assert_eq!(outcome.into_parts(), (false, None));
    }

    #[test]
    fn every_generation_exposes_its_flag() {
        assert!(WireOutcome::V1 { proceed: true }.succeeded());
        assert!(!WireOutcome::V2 { succeeded: false }.succeeded());
        let v3 = WireOutcome::V3 {
            succeeded: false,
            error: Some("disk full".to_string()),
        };
        assert!(!v3.succeeded());
        assert_eq!(v3.into_parts(), (false, Some("disk full".to_string())));
    }

    #[test]
    fn generation_display_and_versions() {
        assert_eq!(Generation::V1.to_string(), "v1");
        assert_eq!(Generation::LATEST.protocol_version(), 3);
        assert!(Generation::V3.preserves_errors());
        assert!(!Generation::V2.preserves_errors());
        for generation in [Generation::V1, Generation::V2, Generation::V3] {
            assert_eq!(
                Generation::try_from(generation.protocol_version()),
                Ok(generation)
            );
        }
        assert_eq!(
            Generation::try_from(0),
            Err(HandshakeError::UnsupportedVersion(0))
        );
    }
}
