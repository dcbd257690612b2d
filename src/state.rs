use crate::messages::{Message, Task};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Disconnected,
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Idle => "idle",
            SessionStatus::Listening => "listening",
            SessionStatus::Processing => "processing",
            SessionStatus::Speaking => "speaking",
        };
        f.write_str(s)
    }
}

/// Voice-capable or text-only endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Voice,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
}

impl Session {
    /// Uses `id` when given, otherwise a time-based one.
    pub fn new(id: Option<String>) -> Self {
        let id = id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis().to_string());
        Self {
            id,
            status: SessionStatus::Disconnected,
        }
    }
}

/// Read-only view published to the UI after every controller step.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub messages: Vec<Message>,
    pub tasks: Vec<Task>,
    pub microphone_available: bool,
}

/// Latest byte-frequency frame for visualisers.
pub type SharedSpectrum = Arc<Mutex<Vec<u8>>>;
