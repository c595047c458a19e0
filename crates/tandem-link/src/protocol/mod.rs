//! Wire messages exchanged over the peer data channel.
//!
//! Every variant is UTF-8 JSON tagged by `type`. The `__chunked` envelope is
//! internal to the framed transport: it never crosses the transport boundary
//! in either direction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

/// Sanitized projection of a domain message, safe to hand to a remote peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub is_remote: bool,
}

/// Point-in-time snapshot of whether something is generating right now.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStreamState {
    pub is_running: bool,
    #[serde(default)]
    pub partial_text: String,
    #[serde(default)]
    pub partial_reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tool_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Received,
    Executing,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProtocolMessage {
    Ping {
        timestamp_ms: u64,
    },
    Pong {
        timestamp_ms: u64,
    },
    Handshake {
        device_code: String,
        device_name: String,
    },
    HandshakeAck {
        device_code: String,
        device_name: String,
    },
    ChatThreadSwitch {
        thread_id: String,
    },
    ChatStateFull {
        thread_id: String,
        messages: Vec<RemoteChatMessage>,
        stream_state: RemoteStreamState,
        total_messages: usize,
    },
    ChatStateDelta {
        thread_id: String,
        new_messages: Vec<RemoteChatMessage>,
        stream_state: RemoteStreamState,
        from_index: usize,
    },
    ChatStreamChunk {
        thread_id: String,
        stream_state: RemoteStreamState,
    },
    ChatCommand {
        message: String,
        command_id: String,
    },
    ChatCommandAck {
        command_id: String,
        status: CommandStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Disconnect {
        reason: String,
    },
    #[serde(rename = "__chunked")]
    Chunked {
        id: String,
        index: u32,
        total: u32,
        data: String,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub fn encode_message(message: &ProtocolMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::from)
}

pub fn decode_message(text: &str) -> Result<ProtocolMessage, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_wire_names_are_stable() {
        let encoded = encode_message(&ProtocolMessage::ChatStateDelta {
            thread_id: "t1".into(),
            new_messages: vec![],
            stream_state: RemoteStreamState::default(),
            from_index: 12,
        })
        .unwrap();
        assert!(encoded.contains("\"type\":\"chat_state_delta\""));
        assert!(encoded.contains("\"threadId\":\"t1\""));
        assert!(encoded.contains("\"fromIndex\":12"));
    }

    #[test]
    fn chunk_envelope_uses_reserved_tag() {
        let encoded = encode_message(&ProtocolMessage::Chunked {
            id: "c".into(),
            index: 0,
            total: 2,
            data: "{}".into(),
        })
        .unwrap();
        assert!(encoded.contains("\"type\":\"__chunked\""));
    }

    #[test]
    fn command_ack_round_trips() {
        let ack = ProtocolMessage::ChatCommandAck {
            command_id: "c1".into(),
            status: CommandStatus::Error,
            detail: Some("generation failed".into()),
        };
        let decoded = decode_message(&encode_message(&ack).unwrap()).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn unknown_optional_fields_default() {
        let decoded = decode_message(
            "{\"type\":\"chat_stream_chunk\",\"threadId\":\"t\",\"streamState\":{\"isRunning\":true}}",
        )
        .unwrap();
        match decoded {
            ProtocolMessage::ChatStreamChunk { stream_state, .. } => {
                assert!(stream_state.is_running);
                assert!(stream_state.partial_text.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
