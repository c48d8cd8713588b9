use std::collections::HashSet;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use super::catalog::{ActionKind, PHASE_PROMPT_TAG, structural_tags};

// Tag names are plain snake_case identifiers; attributes are not part of the language.
static TAG_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(/?)([a-z][a-z_]*)>").expect("tag token pattern"));

/// One complete, top-level tag found in the buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct ScannedTag {
    /// Unique for the lifetime of the scanner (and therefore per parse pass).
    pub id: String,
    pub tag: String,
    /// Text between the opening and closing tag.
    pub body: String,
    /// The full `<tag>...</tag>` text.
    pub raw: String,
    /// Byte range of `raw` inside the scanner buffer.
    pub span: Range<usize>,
}

impl ScannedTag {
    pub fn kind(&self) -> Option<ActionKind> {
        ActionKind::from_tag(&self.tag)
    }
}

/// The buffer's tag structure is inconsistent (a close without a matching open).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("mismatched </{found}> at byte {offset} (expected {expected})")]
pub struct NestingError {
    pub found: String,
    pub expected: String,
    pub offset: usize,
}

/// A complete outermost tag span as located by [`validate_nesting`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagSpan {
    pub tag: String,
    pub outer: Range<usize>,
    pub inner: Range<usize>,
}

/// Walk all structural tags in `text` and return the complete outermost spans.
///
/// Properly nested inner tags belong to their outer span. An unclosed trailing
/// tag is a partial and is simply not reported. A close tag that does not match
/// the innermost open tag is a structural violation.
pub fn validate_nesting(text: &str) -> Result<Vec<TagSpan>, NestingError> {
    let known: HashSet<&str> = structural_tags().collect();
    let mut stack: Vec<(&str, usize, usize)> = Vec::new();
    let mut spans = Vec::new();

    for caps in TAG_TOKEN.captures_iter(text) {
        let (Some(whole), Some(slash), Some(name)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        let name = name.as_str();
        if !known.contains(name) {
            continue;
        }
        if slash.as_str().is_empty() {
            stack.push((name, whole.start(), whole.end()));
            continue;
        }
        match stack.pop() {
            Some((open, open_start, open_end)) if open == name => {
                if stack.is_empty() {
                    spans.push(TagSpan {
                        tag: name.to_string(),
                        outer: open_start..whole.end(),
                        inner: open_end..whole.start(),
                    });
                }
            }
            other => {
                return Err(NestingError {
                    found: name.to_string(),
                    expected: other
                        .map(|(open, _, _)| format!("</{open}>"))
                        .unwrap_or_else(|| "no open tag".to_string()),
                    offset: whole.start(),
                });
            }
        }
    }

    Ok(spans)
}

/// Incremental tokenizer shared by the batch and streaming entry points.
///
/// Text is appended with [`TagScanner::feed`]; every call returns only tags that
/// became complete since the last call. Spans already returned are remembered
/// until [`TagScanner::clear`].
pub struct TagScanner {
    buffer: String,
    processed: HashSet<(usize, usize)>,
    next_id: usize,
}

impl TagScanner {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            processed: HashSet::new(),
            next_id: 0,
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Append a chunk and return newly completed action tags.
    pub fn feed(&mut self, chunk: &str) -> Vec<ScannedTag> {
        self.buffer.push_str(chunk);
        self.scan()
    }

    /// Re-scan the buffer. Returns nothing on a structural violation.
    pub fn scan(&mut self) -> Vec<ScannedTag> {
        let spans = match validate_nesting(&self.buffer) {
            Ok(spans) => spans,
            Err(e) => {
                tracing::warn!(error = %e, "tag structure invalid, discarding actions");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for span in spans {
            if span.tag == PHASE_PROMPT_TAG {
                continue;
            }
            if !self.processed.insert((span.outer.start, span.outer.end)) {
                continue;
            }
            self.next_id += 1;
            found.push(ScannedTag {
                id: format!("action-{}", self.next_id),
                tag: span.tag,
                body: self.buffer[span.inner.clone()].to_string(),
                raw: self.buffer[span.outer.clone()].to_string(),
                span: span.outer,
            });
        }
        found
    }

    /// True when the buffer holds at least one complete action tag not yet returned.
    pub fn has_unprocessed(&self) -> bool {
        validate_nesting(&self.buffer)
            .map(|spans| {
                spans.iter().any(|s| {
                    s.tag != PHASE_PROMPT_TAG
                        && !self.processed.contains(&(s.outer.start, s.outer.end))
                })
            })
            .unwrap_or(false)
    }

    /// Drop buffered text and the dedup set. Ids keep increasing.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.processed.clear();
    }
}

impl Default for TagScanner {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Sub-field extraction ───

/// All non-overlapping `<name>...</name>` bodies in `text`, in order.
pub fn extract_fields(text: &str, name: &str) -> Vec<String> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        out.push(after[..end].to_string());
        rest = &after[end + close.len()..];
    }
    out
}

/// The first `<name>...</name>` body, trimmed. Empty values count as missing.
pub fn extract_field(text: &str, name: &str) -> Option<String> {
    extract_fields(text, name)
        .into_iter()
        .next()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Body between the first `<name>` and the last `</name>`.
///
/// Used for free-form payloads (file content) that may themselves mention the tag.
pub fn extract_outer_field(text: &str, name: &str) -> Option<String> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = text.find(&open)? + open.len();
    let end = text.rfind(&close)?;
    if end < start {
        return None;
    }
    Some(strip_one_newline(&text[start..end]).to_string())
}

/// Remove `<name>...</name>` blocks from `text`, returning the remainder and the bodies.
pub fn take_blocks(text: &str, name: &str) -> (String, Vec<String>) {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let mut remainder = String::with_capacity(text.len());
    let mut bodies = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        remainder.push_str(&rest[..start]);
        bodies.push(after[..end].trim().to_string());
        rest = &after[end + close.len()..];
    }
    remainder.push_str(rest);
    (remainder, bodies)
}

/// Strip a single leading and trailing newline (the ones around a block's content).
pub fn strip_one_newline(s: &str) -> &str {
    let s = s
        .strip_prefix("\r\n")
        .or_else(|| s.strip_prefix('\n'))
        .unwrap_or(s);
    s.strip_suffix("\r\n")
        .or_else(|| s.strip_suffix('\n'))
        .unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_complete_tags_in_order() {
        let mut scanner = TagScanner::new();
        let tags = scanner.feed(
            "first <read_file><path>a.txt</path></read_file> then \
             <execute_command>ls -la</execute_command>",
        );
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].tag, "read_file");
        assert_eq!(tags[0].body, "<path>a.txt</path>");
        assert_eq!(tags[0].raw, "<read_file><path>a.txt</path></read_file>");
        assert_eq!(tags[1].kind(), Some(ActionKind::ExecuteCommand));
        assert_ne!(tags[0].id, tags[1].id);
    }

    #[test]
    fn partial_tag_waits_for_next_chunk() {
        let mut scanner = TagScanner::new();
        assert!(scanner.feed("<read_f").is_empty());
        assert!(!scanner.has_unprocessed());
        let tags = scanner.feed("ile><path>x</path></read_file>");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].body, "<path>x</path>");
    }

    #[test]
    fn open_tag_without_close_is_pending() {
        let mut scanner = TagScanner::new();
        assert!(scanner.feed("<write_file><path>a</path><content>hel").is_empty());
        let tags = scanner.feed("lo</content></write_file>");
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn rescan_does_not_repeat_tags() {
        let mut scanner = TagScanner::new();
        assert_eq!(scanner.feed("<end_task>done</end_task>").len(), 1);
        assert!(scanner.scan().is_empty());
        assert!(scanner.feed(" more text").is_empty());
        assert!(!scanner.has_unprocessed());
    }

    #[test]
    fn identical_tags_are_distinct_actions() {
        let mut scanner = TagScanner::new();
        let tags = scanner.feed(
            "<execute_command>make</execute_command><execute_command>make</execute_command>",
        );
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn clear_allows_rescan() {
        let mut scanner = TagScanner::new();
        scanner.feed("<end_task>x</end_task>");
        scanner.clear();
        assert!(scanner.buffer().is_empty());
        let tags = scanner.feed("<end_task>x</end_task>");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].id, "action-2");
    }

    #[test]
    fn mismatched_close_fails_closed() {
        let mut scanner = TagScanner::new();
        let tags = scanner.feed(
            "<read_file><path>a</path></read_file></write_file><delete_file><path>b</path></delete_file>",
        );
        assert!(tags.is_empty());
        assert!(!scanner.has_unprocessed());
    }

    #[test]
    fn crossed_tags_fail_closed() {
        let err = validate_nesting("<read_file><write_file></read_file></write_file>").unwrap_err();
        assert_eq!(err.found, "read_file");
        assert_eq!(err.expected, "</write_file>");
    }

    #[test]
    fn nested_action_stays_inside_outer() {
        let mut scanner = TagScanner::new();
        let tags = scanner.feed(
            "<write_file><path>doc.md</path><content>use <read_file>...</read_file></content></write_file>",
        );
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].tag, "write_file");
    }

    #[test]
    fn unknown_tags_are_ignored_by_structure() {
        let spans = validate_nesting("<foo>bar</foo> <b>bold</b>").unwrap();
        assert!(spans.is_empty());
    }

    #[test]
    fn phase_prompt_is_structural_only() {
        let mut scanner = TagScanner::new();
        let tags = scanner.feed("<phase_prompt>do things</phase_prompt>");
        assert!(tags.is_empty());
    }

    #[test]
    fn field_helpers() {
        let body = "<path> a.txt </path>\n<path>b.txt</path><content>\nline1\nline2\n</content>";
        assert_eq!(extract_fields(body, "path"), vec![" a.txt ", "b.txt"]);
        assert_eq!(extract_field(body, "path").as_deref(), Some("a.txt"));
        assert_eq!(extract_field(body, "missing"), None);
        assert_eq!(
            extract_outer_field(body, "content").as_deref(),
            Some("line1\nline2")
        );
        assert_eq!(extract_field("<path>  </path>", "path"), None);
    }

    #[test]
    fn take_blocks_removes_and_returns() {
        let (rest, bodies) = take_blocks("a <phase_prompt> x </phase_prompt> b", "phase_prompt");
        assert_eq!(rest, "a  b");
        assert_eq!(bodies, vec!["x"]);
    }
}
