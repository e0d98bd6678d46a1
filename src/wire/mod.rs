// =============================================================================
// Wire protocol — frames on the streaming transport
// =============================================================================
//
// JSON is the canonical encoding; the binary codec in `binary` carries the
// same schema in a compact self-describing form. Every server frame carries
// the aggregator sequence and an RFC3339 timestamp.
// =============================================================================

pub mod binary;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Channel, ChannelSet, WireFormat};

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Snapshot,
    Update,
    Pong,
    Error,
}

/// One outbound frame. `data` is set on snapshots, `changes` on updates,
/// `error` on error frames; pong carries neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerFrame {
    pub fn snapshot(seq: u64, data: JsonMap) -> Self {
        Self {
            frame_type: FrameType::Snapshot,
            seq,
            timestamp: Utc::now(),
            data: Some(data),
            changes: None,
            error: None,
        }
    }

    pub fn update(seq: u64, changes: JsonMap) -> Self {
        Self {
            frame_type: FrameType::Update,
            seq,
            timestamp: Utc::now(),
            data: None,
            changes: None,
            error: None,
        }
        .with_changes(changes)
    }

    fn with_changes(mut self, changes: JsonMap) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn pong(seq: u64) -> Self {
        Self {
            frame_type: FrameType::Pong,
            seq,
            timestamp: Utc::now(),
            data: None,
            changes: None,
            error: None,
        }
    }

    pub fn error(seq: u64, code: &str) -> Self {
        Self {
            frame_type: FrameType::Error,
            seq,
            timestamp: Utc::now(),
            data: None,
            changes: None,
            error: Some(code.to_string()),
        }
    }

    /// Channel payloads of this frame, wherever they live.
    pub fn body(&self) -> Option<&JsonMap> {
        self.data.as_ref().or(self.changes.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe {
        #[serde(default)]
        channels: Vec<String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Unsubscribe {
        #[serde(default)]
        channels: Vec<String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Refresh {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

/// Resolve wire channel names into a set. Any unknown name rejects the whole
/// command.
pub fn parse_channels(names: &[String]) -> Result<ChannelSet> {
    let mut set = ChannelSet::empty();
    for name in names {
        let channel = Channel::parse(name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown channel {name:?}")))?;
        set.insert(channel);
    }
    Ok(set)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// One encoded frame ready for the socket.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub payload: Vec<u8>,
    pub is_binary: bool,
}

/// Encode a frame in the client's selected format.
pub fn encode_frame(frame: &ServerFrame, format: WireFormat) -> Result<EncodedFrame> {
    match format {
        WireFormat::Json => Ok(EncodedFrame {
            payload: serde_json::to_vec(frame)?,
            is_binary: false,
        }),
        WireFormat::Binary => Ok(EncodedFrame {
            payload: binary::encode_frame(frame)?,
            is_binary: true,
        }),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;

    #[test]
    fn server_frame_json_shape() {
        let mut data = JsonMap::new();
        data.insert("account".into(), serde_json::json!({"total_balance": 1.0}));
        let frame = ServerFrame::snapshot(7, data);

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["seq"], 7);
        assert!(value["timestamp"].is_string());
        assert!(value.get("changes").is_none());
        assert!(value.get("error").is_none());
        assert!(value["data"]["account"]["total_balance"].is_number());
    }

    #[test]
    fn update_frame_uses_changes_key() {
        let mut changes = JsonMap::new();
        changes.insert("positions".into(), serde_json::json!({}));
        let value = serde_json::to_value(ServerFrame::update(3, changes)).unwrap();
        assert_eq!(value["type"], "update");
        assert!(value.get("data").is_none());
        assert!(value["changes"]["positions"].is_object());
    }

    #[test]
    fn client_commands_decode() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"subscribe","channels":["account","positions"]}"#)
                .unwrap();
        match cmd {
            ClientCommand::Subscribe { channels, .. } => {
                assert_eq!(channels, vec!["account", "positions"]);
            }
            other => panic!("wrong command: {other:?}"),
        }

        assert!(matches!(
            serde_json::from_str::<ClientCommand>(r#"{"type":"ping","timestamp":123}"#).unwrap(),
            ClientCommand::Ping { timestamp: Some(123) }
        ));
        assert!(matches!(
            serde_json::from_str::<ClientCommand>(r#"{"type":"refresh"}"#).unwrap(),
            ClientCommand::Refresh { .. }
        ));
    }

    #[test]
    fn unknown_command_type_is_rejected() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"hello"}"#).is_err());
    }

    #[test]
    fn parse_channels_rejects_unknown_names() {
        let ok = parse_channels(&["account".into(), "orders".into()]).unwrap();
        assert!(ok.contains(Channel::Account));
        assert!(ok.contains(Channel::Orders));
        assert_eq!(ok.len(), 2);

        let err = parse_channels(&["account".into(), "candles".into()]).unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn encode_selects_format() {
        let frame = ServerFrame::pong(1);
        let json = encode_frame(&frame, WireFormat::Json).unwrap();
        assert!(!json.is_binary);
        assert!(serde_json::from_slice::<ServerFrame>(&json.payload).is_ok());

        let bin = encode_frame(&frame, WireFormat::Binary).unwrap();
        assert!(bin.is_binary);
        assert!(binary::decode_frame(&bin.payload).is_ok());
    }
}
