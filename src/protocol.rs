//! Wire codec for the assistant channel.
//!
//! Text frames carry JSON objects discriminated by `type`. Binary frames
//! are raw audio with no header: microphone recordings client -> server,
//! f32 PCM playback chunks server -> client.

use crate::messages::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const SERVER_EVENT_TYPES: &[&str] = &[
    "audio_format",
    "transcript",
    "assistant_start",
    "token",
    "task_queue",
    "task_update",
    "done",
    "interrupt",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AudioFormat {
        #[serde(alias = "sampleRate")]
        sample_rate: u32,
    },
    Transcript {
        text: String,
    },
    AssistantStart,
    Token {
        #[serde(alias = "token")]
        text: String,
    },
    TaskQueue {
        #[serde(default)]
        tasks: Vec<Task>,
    },
    TaskUpdate {
        #[serde(alias = "id")]
        task_id: String,
        status: TaskStatus,
    },
    Done {
        #[serde(default, alias = "text")]
        assistant_text: Option<String>,
    },
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start { session_id: String, filename: String },
    TextInput { text: String },
    Interrupt,
}

impl ClientMessage {
    pub fn encode(&self) -> String {
        // Only string fields; serialisation cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A frame as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame has no type field")]
    MissingType,

    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

pub fn decode(text: &str) -> Result<ServerEvent, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?;
    if !SERVER_EVENT_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Builds the websocket endpoint from the service base address.
///
/// `http`/`https` are mapped onto `ws`/`wss`; a bare host gets `ws://`.
pub fn endpoint_url(base: &str, voice: bool) -> String {
    let base = base.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{}", base)
    };
    let suffix = if voice { "/ws/voice" } else { "/ws/chat" };
    format!("{}{}", base, suffix)
}
