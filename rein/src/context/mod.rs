//! Conversation state sent to the model: phase instructions, operation records,
//! history and system instructions.
//!
//! `ContextData` is a plain value. The functions in [`builder`] and [`evictor`]
//! take a snapshot and return a new one; [`ContextStore`] holds the single live
//! snapshot for a session.

pub mod builder;
pub mod evictor;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;

pub use builder::{
    build_message_context, get_message_context, purge_phase_context, record_operation, reset,
    set_system_instructions,
};
pub use evictor::{cleanup_context, estimate_tokens};

/// Characters of operation output shown in a rendered record.
const CONTENT_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("invalid message role: {0}")]
    InvalidRole(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(ContextError::InvalidRole(other.to_string())),
        }
    }
}

/// One message of the list sent to the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Read,
    Write,
    Command,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Command => "command",
        }
    }
}

/// The latest known state of one file or command operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub kind: OperationKind,
    /// File path or command text.
    pub key: String,
    pub timestamp: DateTime<Utc>,
    /// Store version at which this record was last written; orders same-instant records.
    #[serde(default)]
    pub sequence: u64,
    /// `None` while pending.
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl OperationRecord {
    pub fn pending(kind: OperationKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            timestamp: Utc::now(),
            sequence: 0,
            success: None,
            error: None,
            content: None,
        }
    }

    pub fn completed(
        kind: OperationKind,
        key: impl Into<String>,
        success: bool,
        content: Option<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            success: Some(success),
            content,
            error,
            ..Self::pending(kind, key)
        }
    }

    pub fn status(&self) -> &'static str {
        match self.success {
            Some(true) => "SUCCESS",
            Some(false) => "FAILED",
            None => "PENDING",
        }
    }

    /// Status line plus error and a content preview, as shown to the model.
    pub fn render(&self) -> String {
        let mut out = format!("[{}] {}: {}", self.kind.as_str(), self.key, self.status());
        if let Some(error) = &self.error {
            out.push_str("\nError: ");
            out.push_str(error);
        }
        if let Some(content) = self.content.as_deref().filter(|c| !c.is_empty()) {
            out.push('\n');
            match content.char_indices().nth(CONTENT_PREVIEW_CHARS) {
                Some((cut, _)) => {
                    out.push_str(&content[..cut]);
                    out.push_str("\n[...]");
                }
                None => out.push_str(content),
            }
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseInstruction {
    pub phase: Phase,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    /// Set for phase-scoped entries, which a phase transition removes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
}

/// The whole conversation state for one session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextData {
    /// Bumped by every builder call that produced this snapshot.
    pub version: u64,
    pub phase_instructions: BTreeMap<Phase, PhaseInstruction>,
    pub file_operations: BTreeMap<String, OperationRecord>,
    pub command_operations: BTreeMap<String, OperationRecord>,
    pub conversation_history: Vec<HistoryEntry>,
    pub system_instructions: Option<String>,
}

impl ContextData {
    /// The instruction written most recently, across all phases.
    pub fn latest_instruction(&self) -> Option<&PhaseInstruction> {
        self.phase_instructions
            .values()
            .max_by_key(|i| (i.timestamp, i.sequence))
    }

    /// All operation records, oldest first.
    pub fn operations(&self) -> Vec<&OperationRecord> {
        let mut ops: Vec<&OperationRecord> = self
            .file_operations
            .values()
            .chain(self.command_operations.values())
            .collect();
        ops.sort_by_key(|r| (r.timestamp, r.sequence));
        ops
    }

    pub fn operation(&self, kind: OperationKind, key: &str) -> Option<&OperationRecord> {
        match kind {
            OperationKind::Command => self.command_operations.get(key),
            OperationKind::Read | OperationKind::Write => self.file_operations.get(key),
        }
    }
}

/// Holds the live snapshot; every update replaces it with the builder's result.
#[derive(Clone, Debug, Default)]
pub struct ContextStore {
    data: ContextData,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &ContextData {
        &self.data
    }

    pub fn add_message(
        &mut self,
        role: Role,
        content: &str,
        phase: Phase,
    ) -> Result<(), ContextError> {
        self.data = build_message_context(&self.data, role, content, phase)?;
        Ok(())
    }

    pub fn record(&mut self, record: OperationRecord) {
        self.data = record_operation(&self.data, record);
    }

    pub fn set_system_instructions(&mut self, text: impl Into<String>) {
        self.data = set_system_instructions(&self.data, text);
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        get_message_context(&self.data)
    }

    pub fn purge_phase_context(&mut self) {
        self.data = purge_phase_context(&self.data);
    }

    /// Evict down to `max_tokens`. Returns true if anything was dropped.
    pub fn evict(&mut self, max_tokens: usize) -> bool {
        let (data, dropped) = cleanup_context(&self.data, max_tokens, estimate_tokens);
        self.data = data;
        dropped
    }

    pub fn estimated_tokens(&self) -> usize {
        self.messages()
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum()
    }

    pub fn reset(&mut self) {
        self.data = reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_known_names_only() {
        assert_eq!("assistant".parse::<Role>(), Ok(Role::Assistant));
        assert_eq!(
            "tool".parse::<Role>(),
            Err(ContextError::InvalidRole("tool".into()))
        );
    }

    #[test]
    fn record_render_shows_status_error_and_preview() {
        let record = OperationRecord::completed(
            OperationKind::Command,
            "cargo test",
            false,
            Some("x".repeat(CONTENT_PREVIEW_CHARS + 5)),
            Some("exit 101".into()),
        );
        let text = record.render();
        assert!(text.starts_with("[command] cargo test: FAILED"));
        assert!(text.contains("Error: exit 101"));
        assert!(text.ends_with("[...]"));
        assert_eq!(
            OperationRecord::pending(OperationKind::Read, "a").render(),
            "[read] a: PENDING"
        );
    }

    #[test]
    fn operations_sort_by_time_then_sequence() {
        let mut data = ContextData::default();
        let now = Utc::now();
        let mut a = OperationRecord::pending(OperationKind::Read, "a");
        a.timestamp = now;
        a.sequence = 2;
        let mut b = OperationRecord::pending(OperationKind::Command, "ls");
        b.timestamp = now;
        b.sequence = 1;
        data.file_operations.insert("a".into(), a);
        data.command_operations.insert("ls".into(), b);
        let keys: Vec<_> = data.operations().iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec!["ls", "a"]);
    }
}
