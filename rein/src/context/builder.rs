use chrono::Utc;

use super::{
    ChatMessage, ContextData, ContextError, HistoryEntry, OperationKind, OperationRecord,
    PhaseInstruction, Role,
};
use crate::actions::catalog::PHASE_PROMPT_TAG;
use crate::actions::scanner::{extract_fields, extract_outer_field, take_blocks};
use crate::phase::Phase;

/// Add one message to a copy of `data`.
///
/// A `<phase_prompt>` block inside a system message replaces the stored
/// instruction for `phase` and is removed from the text. Embedded
/// `read_file`/`write_file`/`execute_command` tags are upserted as pending
/// operation records. Whatever text remains is appended to history; system
/// entries are tagged with `phase` so a transition can purge them.
pub fn build_message_context(
    data: &ContextData,
    role: Role,
    content: &str,
    phase: Phase,
) -> Result<ContextData, ContextError> {
    if content.trim().is_empty() {
        return Err(ContextError::EmptyContent);
    }
    let mut next = data.clone();
    next.version += 1;

    let mut text = content.to_string();
    if role == Role::System {
        let (remainder, prompts) = take_blocks(content, PHASE_PROMPT_TAG);
        if let Some(prompt) = prompts.last() {
            next.phase_instructions.insert(
                phase,
                PhaseInstruction {
                    phase,
                    content: prompt.trim().to_string(),
                    timestamp: Utc::now(),
                    sequence: next.version,
                },
            );
        }
        text = remainder;
    }

    for record in operation_markers(&text) {
        upsert(&mut next, record);
    }

    if !text.trim().is_empty() {
        next.conversation_history.push(HistoryEntry {
            role,
            content: text.trim().to_string(),
            phase: (role == Role::System).then_some(phase),
        });
    }
    Ok(next)
}

fn operation_markers(text: &str) -> Vec<OperationRecord> {
    let mut records = Vec::new();
    for body in extract_fields(text, "read_file") {
        for path in extract_fields(&body, "path") {
            let path = path.trim();
            if !path.is_empty() {
                records.push(OperationRecord::pending(OperationKind::Read, path));
            }
        }
    }
    for body in extract_fields(text, "write_file") {
        let path = extract_fields(&body, "path")
            .into_iter()
            .next()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        if let Some(path) = path {
            let mut record = OperationRecord::pending(OperationKind::Write, path);
            record.content = extract_outer_field(&body, "content");
            records.push(record);
        }
    }
    for body in extract_fields(text, "execute_command") {
        let command = body.trim();
        if !command.is_empty() {
            records.push(OperationRecord::pending(OperationKind::Command, command));
        }
    }
    records
}

/// Sticky merge: a recorded success is never replaced by a pending or failed
/// record for the same key. Otherwise the incoming record wins, inheriting the
/// previous content when it carries none.
fn upsert(data: &mut ContextData, mut record: OperationRecord) {
    record.sequence = data.version;
    let map = match record.kind {
        OperationKind::Command => &mut data.command_operations,
        OperationKind::Read | OperationKind::Write => &mut data.file_operations,
    };
    if let Some(existing) = map.get(&record.key) {
        if existing.success == Some(true) && record.success != Some(true) {
            return;
        }
        if record.content.is_none() {
            record.content = existing.content.clone();
        }
    }
    map.insert(record.key.clone(), record);
}

/// Upsert one operation result into a copy of `data`.
pub fn record_operation(data: &ContextData, record: OperationRecord) -> ContextData {
    let mut next = data.clone();
    next.version += 1;
    upsert(&mut next, record);
    next
}

pub fn set_system_instructions(data: &ContextData, text: impl Into<String>) -> ContextData {
    let mut next = data.clone();
    next.version += 1;
    let text = text.into();
    next.system_instructions = (!text.trim().is_empty()).then_some(text);
    next
}

/// The linear message list for the model: system instructions, the latest phase
/// instruction, operation records oldest first, then history in order.
pub fn get_message_context(data: &ContextData) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(system) = &data.system_instructions {
        messages.push(ChatMessage::new(Role::System, system.clone()));
    }
    if let Some(instruction) = data.latest_instruction() {
        messages.push(ChatMessage::new(Role::System, instruction.content.clone()));
    }
    for record in data.operations() {
        messages.push(ChatMessage::new(Role::System, record.render()));
    }
    for entry in &data.conversation_history {
        messages.push(ChatMessage::new(entry.role, entry.content.clone()));
    }
    messages
}

/// Drop every phase instruction and every phase-scoped history entry.
pub fn purge_phase_context(data: &ContextData) -> ContextData {
    let mut next = data.clone();
    next.version += 1;
    next.phase_instructions.clear();
    next.conversation_history.retain(|e| e.phase.is_none());
    next
}

pub fn reset() -> ContextData {
    ContextData::default()
}
