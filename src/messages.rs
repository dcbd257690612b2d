use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    User,
    #[serde(alias = "bot")]
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[serde(alias = "pending")]
    Queued,
    #[serde(alias = "in_progress")]
    Running,
    #[serde(alias = "completed", alias = "done")]
    Complete,
    #[serde(alias = "error")]
    Failed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Running => 1,
            TaskStatus::Complete | TaskStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Tasks only move forward: queued -> running -> complete | failed.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(alias = "task_id")]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_task_status")]
    pub status: TaskStatus,
}

fn default_task_status() -> TaskStatus {
    TaskStatus::Queued
}

impl Task {
    /// Applies `next` if it moves the task forward. Returns whether it changed.
    pub fn advance(&mut self, next: TaskStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Applies a status change to the task with `id`. Missing ids are ignored.
pub fn update_task_in(tasks: &mut [Task], id: &str, status: TaskStatus) -> bool {
    match tasks.iter_mut().find(|t| t.id == id) {
        Some(task) => task.advance(status),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub source: Source,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
}

/// Ordered log of conversation turns.
///
/// Only the active-stream message can change; everything before it is
/// sealed. The active pointer is an index into `messages`.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    active: Option<usize>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with persisted turns when resuming a session.
    pub fn preload(&mut self, history: Vec<Message>) {
        self.messages = history;
        self.active = None;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn active(&self) -> Option<&Message> {
        self.active.and_then(|i| self.messages.get(i))
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active().map(|m| m.id.as_str())
    }

    pub fn push_user(&mut self, text: &str) -> &Message {
        let id = self.next_id("user");
        self.messages.push(Message {
            id,
            source: Source::User,
            text: text.to_string(),
            tasks: None,
        });
        &self.messages[self.messages.len() - 1]
    }

    /// Opens a new active-stream message. A stream that was never closed is
    /// sealed with whatever text it accumulated.
    pub fn begin_assistant(&mut self) -> String {
        if let Some(prev) = self.active.take() {
            log::warn!(
                "[messages] sealing unfinished stream {} before new turn",
                self.messages[prev].id
            );
        }
        let id = self.next_id("assistant");
        self.messages.push(Message {
            id: id.clone(),
            source: Source::Assistant,
            text: String::new(),
            tasks: None,
        });
        self.active = Some(self.messages.len() - 1);
        id
    }

    /// Appends a streamed fragment. No-op when nothing is streaming.
    pub fn append_token(&mut self, fragment: &str) -> bool {
        match self.active_mut() {
            Some(msg) => {
                msg.text.push_str(fragment);
                true
            }
            None => false,
        }
    }

    /// Closes the active stream. `authoritative` replaces the accumulated
    /// text when present. Without an active stream a non-empty text is
    /// recorded as a completed assistant message.
    pub fn finalize(&mut self, authoritative: Option<&str>) -> bool {
        match self.active.take() {
            Some(idx) => {
                if let Some(text) = authoritative {
                    self.messages[idx].text = text.to_string();
                }
                true
            }
            None => match authoritative {
                Some(text) if !text.is_empty() => {
                    let id = self.next_id("assistant");
                    self.messages.push(Message {
                        id,
                        source: Source::Assistant,
                        text: text.to_string(),
                        tasks: None,
                    });
                    true
                }
                _ => false,
            },
        }
    }

    pub fn attach_tasks(&mut self, tasks: Vec<Task>) -> bool {
        match self.active_mut() {
            Some(msg) => {
                msg.tasks = Some(tasks);
                true
            }
            None => false,
        }
    }

    pub fn update_task(&mut self, task_id: &str, status: TaskStatus) -> bool {
        match self.active_mut().and_then(|m| m.tasks.as_mut()) {
            Some(tasks) => update_task_in(tasks, task_id, status),
            None => false,
        }
    }

    fn active_mut(&mut self) -> Option<&mut Message> {
        match self.active {
            Some(i) => self.messages.get_mut(i),
            None => None,
        }
    }

    fn next_id(&mut self, kind: &str) -> String {
        self.next_seq += 1;
        format!(
            "{}-{}-{}",
            kind,
            chrono::Utc::now().timestamp_millis(),
            self.next_seq
        )
    }
}
