use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::{ContextData, HistoryEntry, OperationKind, builder::get_message_context};

static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment pattern"));

/// Roughly four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn strip_comments(text: &str) -> String {
    COMMENT.replace_all(text, "").trim().to_string()
}

/// Shrink `data` until its message list fits `max_tokens`.
///
/// System instructions and the active phase instruction are always kept. History
/// is then kept newest-first, with comment annotations stripped, until the first
/// entry that no longer fits; everything older goes. Operation records share
/// what budget is left, newest first. Returns the new snapshot and whether
/// anything was dropped.
pub fn cleanup_context<F>(data: &ContextData, max_tokens: usize, estimator: F) -> (ContextData, bool)
where
    F: Fn(&str) -> usize,
{
    let total: usize = get_message_context(data)
        .iter()
        .map(|m| estimator(&m.content))
        .sum();
    if total <= max_tokens {
        return (data.clone(), false);
    }

    let reserved = data
        .system_instructions
        .as_deref()
        .map_or(0, &estimator)
        + data
            .latest_instruction()
            .map_or(0, |i| estimator(&i.content));
    let mut remaining = max_tokens.saturating_sub(reserved);
    let mut dropped = false;

    let mut kept: Vec<HistoryEntry> = Vec::new();
    for (i, entry) in data.conversation_history.iter().enumerate().rev() {
        let content = strip_comments(&entry.content);
        if content.is_empty() {
            dropped = true;
            continue;
        }
        let cost = estimator(&content);
        if cost > remaining {
            dropped = true;
            tracing::debug!(evicted = i + 1, "evicting older history");
            break;
        }
        remaining -= cost;
        kept.push(HistoryEntry {
            content,
            ..entry.clone()
        });
    }
    kept.reverse();

    let mut keep_ops: HashSet<(bool, String)> = HashSet::new();
    for record in data.operations().into_iter().rev() {
        let cost = estimator(&record.render());
        if cost > remaining {
            dropped = true;
            continue;
        }
        remaining -= cost;
        keep_ops.insert((record.kind == OperationKind::Command, record.key.clone()));
    }

    let mut next = data.clone();
    next.version += 1;
    next.conversation_history = kept;
    next.file_operations
        .retain(|key, _| keep_ops.contains(&(false, key.clone())));
    next.command_operations
        .retain(|key, _| keep_ops.contains(&(true, key.clone())));
    (next, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::builder::{build_message_context, record_operation, set_system_instructions};
    use crate::context::{OperationRecord, Role};
    use crate::phase::Phase;

    fn history(messages: &[&str]) -> ContextData {
        let mut data = set_system_instructions(&ContextData::default(), "s".repeat(40));
        for (i, m) in messages.iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            data = build_message_context(&data, role, m, Phase::Execute).unwrap();
        }
        data
    }

    fn total(data: &ContextData) -> usize {
        get_message_context(data)
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum()
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn under_budget_is_noop() {
        let data = history(&["hi", "hello"]);
        let (next, dropped) = cleanup_context(&data, 1_000, estimate_tokens);
        assert!(!dropped);
        assert_eq!(next, data);
    }

    #[test]
    fn drops_oldest_and_fits_budget() {
        let long = "x".repeat(40);
        let data = history(&[&long, &long, &long, "newest"]);
        // system 10 + 10 + 10 + 10 + 2 tokens
        let (next, dropped) = cleanup_context(&data, 25, estimate_tokens);
        assert!(dropped);
        assert!(total(&next) <= 25);
        let last = next.conversation_history.last().unwrap();
        assert_eq!(last.content, "newest");
        assert_eq!(next.system_instructions, data.system_instructions);
        assert_eq!(next.conversation_history.len(), 2);
    }

    #[test]
    fn stops_at_first_message_that_does_not_fit() {
        let data = history(&["a", &"y".repeat(400), "b"]);
        let (next, _) = cleanup_context(&data, 20, estimate_tokens);
        let contents: Vec<_> = next
            .conversation_history
            .iter()
            .map(|e| e.content.as_str())
            .collect();
        assert_eq!(contents, vec!["b"]);
    }

    #[test]
    fn strips_comments_from_kept_messages() {
        let data = history(&[&"z".repeat(200), "keep <!-- note to self --> this"]);
        let (next, dropped) = cleanup_context(&data, 30, estimate_tokens);
        assert!(dropped);
        assert_eq!(next.conversation_history.len(), 1);
        assert_eq!(next.conversation_history[0].content, "keep  this");
    }

    #[test]
    fn operations_fill_leftover_budget() {
        let data = history(&[&"q".repeat(200), "recent"]);
        let data = record_operation(
            &data,
            OperationRecord::completed(OperationKind::Read, "a.rs", true, None, None),
        );
        let (next, dropped) = cleanup_context(&data, 20, estimate_tokens);
        assert!(dropped);
        assert!(next.file_operations.contains_key("a.rs"));
        assert!(total(&next) <= 20);
    }

    #[test]
    fn custom_estimator_is_used() {
        let data = history(&["one", "two", "three"]);
        let (next, dropped) = cleanup_context(&data, 3, |_| 1);
        assert!(dropped);
        assert_eq!(next.conversation_history.len(), 2);
    }
}
