//! Conversation history retrieval used when resuming a stored session.

use crate::error::{Error, Result};
use crate::messages::{Message, Source, Task};
use serde::Deserialize;
use std::time::Duration;

const HISTORY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct HistoryTurn {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "role")]
    source: Source,
    #[serde(alias = "content")]
    text: String,
    #[serde(default)]
    tasks: Option<Vec<Task>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryBody {
    List(Vec<HistoryTurn>),
    Wrapped { messages: Vec<HistoryTurn> },
}

/// `http(s)://host[:port]/api/sessions/<id>/messages` from any accepted base.
pub fn history_url(base: &str, session_id: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = base.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("http://{}", base)
    };
    format!("{}/api/sessions/{}/messages", base, session_id)
}

pub fn parse_history(session_id: &str, body: &str) -> Result<Vec<Message>> {
    let parsed: HistoryBody = serde_json::from_str(body)
        .map_err(|e| Error::History(format!("bad history payload: {}", e)))?;
    let turns = match parsed {
        HistoryBody::List(turns) => turns,
        HistoryBody::Wrapped { messages } => messages,
    };
    Ok(turns
        .into_iter()
        .enumerate()
        .map(|(i, turn)| Message {
            id: turn
                .id
                .unwrap_or_else(|| format!("history-{}-{}", session_id, i)),
            source: turn.source,
            text: turn.text,
            tasks: turn.tasks,
        })
        .collect())
}

pub async fn fetch_history(base_url: &str, session_id: &str) -> Result<Vec<Message>> {
    let url = history_url(base_url, session_id);
    log::info!("[history] fetching {}", url);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(HISTORY_TIMEOUT_SECS))
        .build()?;
    let resp = client.get(&url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::History(format!("{} returned {}", url, status)));
    }
    let body = resp.text().await?;
    parse_history(session_id, &body)
}
