use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ActionError;
use super::catalog::{ActionKind, ParamSpec, blueprint};
use super::plan::ExecutionPlan;
use super::scanner::{
    ScannedTag, TagScanner, extract_field, extract_fields, extract_outer_field, strip_one_newline,
};

static EDIT_OP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(replace|insert_before|insert_after|delete)>").expect("edit op pattern")
});

/// Default similarity floor for `relative_path_lookup`.
pub const DEFAULT_LOOKUP_THRESHOLD: f64 = 0.6;

/// One edit operation inside an `edit_file` `<file>` block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditOp {
    Replace { pattern: String, content: String },
    InsertBefore { pattern: String, content: String },
    InsertAfter { pattern: String, content: String },
    Delete { pattern: String },
}

impl EditOp {
    pub fn pattern(&self) -> &str {
        match self {
            EditOp::Replace { pattern, .. }
            | EditOp::InsertBefore { pattern, .. }
            | EditOp::InsertAfter { pattern, .. }
            | EditOp::Delete { pattern } => pattern,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub ops: Vec<EditOp>,
}

/// A typed action: one variant per tag in the catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    ReadFile {
        paths: Vec<String>,
    },
    WriteFile {
        path: String,
        content: String,
    },
    DeleteFile {
        path: String,
    },
    MoveFile {
        source: String,
        destination: String,
    },
    CopyFileSlice {
        source: String,
        destination: String,
        start_line: Option<usize>,
        end_line: Option<usize>,
    },
    ExecuteCommand {
        command: String,
    },
    SearchString {
        directory: String,
        term: String,
    },
    SearchFile {
        directory: String,
        term: String,
    },
    EditFile {
        files: Vec<FileEdit>,
    },
    RelativePathLookup {
        source_path: String,
        path: String,
        threshold: f64,
    },
    FetchUrl {
        url: String,
    },
    EndTask {
        summary: String,
    },
    EndPhase {
        summary: String,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::ReadFile { .. } => ActionKind::ReadFile,
            Action::WriteFile { .. } => ActionKind::WriteFile,
            Action::DeleteFile { .. } => ActionKind::DeleteFile,
            Action::MoveFile { .. } => ActionKind::MoveFile,
            Action::CopyFileSlice { .. } => ActionKind::CopyFileSlice,
            Action::ExecuteCommand { .. } => ActionKind::ExecuteCommand,
            Action::SearchString { .. } => ActionKind::SearchString,
            Action::SearchFile { .. } => ActionKind::SearchFile,
            Action::EditFile { .. } => ActionKind::EditFile,
            Action::RelativePathLookup { .. } => ActionKind::RelativePathLookup,
            Action::FetchUrl { .. } => ActionKind::FetchUrl,
            Action::EndTask { .. } => ActionKind::EndTask,
            Action::EndPhase { .. } => ActionKind::EndPhase,
        }
    }

    /// Parse the body of a `<tag>` into a typed action.
    pub fn parse(tag: &str, body: &str) -> Result<Action, ActionError> {
        let kind = ActionKind::from_tag(tag).ok_or_else(|| ActionError::unknown_type(tag))?;
        if let Some(missing) = blueprint(kind)
            .required_params()
            .find(|p| !param_present(body, p))
        {
            return Err(ActionError::missing_field(tag, missing.name));
        }
        let required = |field: &str| {
            extract_field(body, field).ok_or_else(|| ActionError::missing_field(tag, field))
        };

        let action = match kind {
            ActionKind::ReadFile => {
                let paths: Vec<String> = extract_fields(body, "path")
                    .into_iter()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
                if paths.is_empty() {
                    return Err(ActionError::missing_field(tag, "path"));
                }
                Action::ReadFile { paths }
            }
            ActionKind::WriteFile => Action::WriteFile {
                path: required("path")?,
                content: extract_outer_field(body, "content")
                    .ok_or_else(|| ActionError::missing_field(tag, "content"))?,
            },
            ActionKind::DeleteFile => Action::DeleteFile {
                path: required("path")?,
            },
            ActionKind::MoveFile => Action::MoveFile {
                source: required("source_path")?,
                destination: required("destination_path")?,
            },
            ActionKind::CopyFileSlice => {
                let start_line = parse_line_number(tag, body, "start_line")?;
                let end_line = parse_line_number(tag, body, "end_line")?;
                if let (Some(start), Some(end)) = (start_line, end_line)
                    && end < start
                {
                    return Err(ActionError::Validation(format!(
                        "<{tag}> end_line {end} is before start_line {start}"
                    )));
                }
                Action::CopyFileSlice {
                    source: required("source_path")?,
                    destination: required("destination_path")?,
                    start_line,
                    end_line,
                }
            }
            ActionKind::ExecuteCommand => {
                let command = body.trim();
                if command.is_empty() {
                    return Err(ActionError::Validation(format!(
                        "<{tag}> requires a command"
                    )));
                }
                Action::ExecuteCommand {
                    command: command.to_string(),
                }
            }
            ActionKind::SearchString => Action::SearchString {
                directory: required("directory")?,
                term: required("term")?,
            },
            ActionKind::SearchFile => Action::SearchFile {
                directory: required("directory")?,
                term: required("term")?,
            },
            ActionKind::EditFile => Action::EditFile {
                files: parse_edit_changes(tag, body)?,
            },
            ActionKind::RelativePathLookup => {
                let threshold = match extract_field(body, "threshold") {
                    None => DEFAULT_LOOKUP_THRESHOLD,
                    Some(raw) => match raw.parse::<f64>() {
                        Ok(t) if (0.0..=1.0).contains(&t) => t,
                        _ => {
                            return Err(ActionError::Validation(format!(
                                "<{tag}> threshold must be a number between 0 and 1, got {raw:?}"
                            )));
                        }
                    },
                };
                Action::RelativePathLookup {
                    source_path: required("source_path")?,
                    path: required("path")?,
                    threshold,
                }
            }
            ActionKind::FetchUrl => Action::FetchUrl {
                url: required("url")?,
            },
            ActionKind::EndTask => Action::EndTask {
                summary: summary_text(body),
            },
            ActionKind::EndPhase => Action::EndPhase {
                summary: summary_text(body),
            },
        };
        Ok(action)
    }

    /// Paths this action reads before acting.
    pub fn read_paths(&self) -> Vec<&str> {
        match self {
            Action::ReadFile { paths } => paths.iter().map(String::as_str).collect(),
            Action::MoveFile { source, .. } | Action::CopyFileSlice { source, .. } => {
                vec![source.as_str()]
            }
            Action::DeleteFile { path } => vec![path.as_str()],
            Action::EditFile { files } => files.iter().map(|f| f.path.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    /// Paths whose contents this action replaces or edits.
    pub fn written_paths(&self) -> Vec<&str> {
        match self {
            Action::WriteFile { path, .. } => vec![path.as_str()],
            Action::EditFile { files } => files.iter().map(|f| f.path.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

fn param_present(body: &str, param: &ParamSpec) -> bool {
    if param.verbatim {
        extract_outer_field(body, param.name).is_some()
    } else if param.multiple {
        extract_fields(body, param.name)
            .iter()
            .any(|v| !v.trim().is_empty())
    } else {
        extract_field(body, param.name).is_some()
    }
}

/// `<summary>` when present, otherwise the whole body.
fn summary_text(body: &str) -> String {
    extract_field(body, "summary").unwrap_or_else(|| body.trim().to_string())
}

fn parse_line_number(tag: &str, body: &str, field: &str) -> Result<Option<usize>, ActionError> {
    match extract_field(body, field) {
        None => Ok(None),
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(Some(n)),
            _ => Err(ActionError::Validation(format!(
                "<{tag}> {field} must be a positive line number, got {raw:?}"
            ))),
        },
    }
}

fn parse_edit_changes(tag: &str, body: &str) -> Result<Vec<FileEdit>, ActionError> {
    let changes =
        extract_outer_field(body, "changes").ok_or_else(|| ActionError::missing_field(tag, "changes"))?;
    let blocks = extract_fields(&changes, "file");
    if blocks.is_empty() {
        return Err(ActionError::missing_field("changes", "file"));
    }

    let mut files = Vec::with_capacity(blocks.len());
    for (i, block) in blocks.iter().enumerate() {
        let path = extract_field(block, "path")
            .ok_or_else(|| ActionError::missing_field("file", "path"))?;
        let mut ops = Vec::new();
        let mut rest = block.as_str();
        while let Some(caps) = EDIT_OP.captures(rest) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                break;
            };
            let name = name.as_str();
            let close = format!("</{name}>");
            let after = &rest[whole.end()..];
            let Some(end) = after.find(&close) else {
                return Err(ActionError::Format(format!(
                    "Unclosed <{name}> in <file> #{} of <{tag}>",
                    i + 1
                )));
            };
            let op_body = &after[..end];
            rest = &after[end + close.len()..];

            let pattern = extract_fields(op_body, "pattern")
                .into_iter()
                .next()
                .map(|p| strip_one_newline(&p).to_string())
                .filter(|p| !p.is_empty())
                .ok_or_else(|| ActionError::missing_field(name, "pattern"))?;
            let content = extract_outer_field(op_body, "content");
            let op = match name {
                "delete" => EditOp::Delete { pattern },
                _ => {
                    let content = content.ok_or_else(|| ActionError::missing_field(name, "content"))?;
                    match name {
                        "replace" => EditOp::Replace { pattern, content },
                        "insert_before" => EditOp::InsertBefore { pattern, content },
                        _ => EditOp::InsertAfter { pattern, content },
                    }
                }
            };
            ops.push(op);
        }
        if ops.is_empty() {
            return Err(ActionError::Validation(format!(
                "<file> {path} in <{tag}> has no edit operations"
            )));
        }
        files.push(FileEdit { path, ops });
    }
    Ok(files)
}

/// An action located in model output, parsed and annotated with dependencies.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedAction {
    pub id: String,
    /// Tag name as written by the model.
    pub tag: String,
    /// Full source text of the tag.
    pub raw: String,
    /// Text between the tags.
    pub body: String,
    pub action: Result<Action, ActionError>,
    /// Ids of actions that must complete first.
    pub dependencies: BTreeSet<String>,
}

impl ParsedAction {
    pub fn new(id: impl Into<String>, tag: &str, body: &str, raw: &str) -> Self {
        Self {
            id: id.into(),
            tag: tag.to_string(),
            raw: raw.to_string(),
            body: body.to_string(),
            action: Action::parse(tag, body),
            dependencies: BTreeSet::new(),
        }
    }

    pub fn from_scanned(tag: ScannedTag) -> Self {
        let action = Action::parse(&tag.tag, &tag.body);
        Self {
            id: tag.id,
            tag: tag.tag,
            raw: tag.raw,
            body: tag.body,
            action,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn kind(&self) -> Option<ActionKind> {
        self.action.as_ref().ok().map(Action::kind)
    }

    pub fn is_mutating(&self) -> bool {
        self.kind().is_some_and(ActionKind::is_mutating)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_some_and(ActionKind::is_terminal)
    }
}

/// Annotate each action with the ids of earlier actions it must wait for.
///
/// Only earlier actions are considered, so the result is always acyclic.
pub fn infer_dependencies(actions: &mut [ParsedAction]) {
    for i in 0..actions.len() {
        let (earlier, rest) = actions.split_at_mut(i);
        let current = &mut rest[0];
        let Ok(action) = &current.action else {
            continue;
        };
        for prior in earlier.iter() {
            let Ok(prior_action) = &prior.action else {
                continue;
            };
            if depends_on(action, prior_action, &prior.body) {
                current.dependencies.insert(prior.id.clone());
            }
        }
    }
}

fn depends_on(action: &Action, prior: &Action, prior_body: &str) -> bool {
    match prior {
        Action::ReadFile { paths } => match action {
            Action::WriteFile { path, content } => {
                // Models often echo the read request before writing.
                let echoed = prior_body.trim();
                (!echoed.is_empty() && content.contains(echoed)) || paths.contains(path)
            }
            Action::EditFile { files } => files.iter().any(|f| paths.contains(&f.path)),
            _ => false,
        },
        Action::WriteFile { .. } | Action::EditFile { .. } => {
            let written = prior.written_paths();
            match action {
                Action::DeleteFile { .. }
                | Action::MoveFile { .. }
                | Action::CopyFileSlice { .. }
                | Action::EditFile { .. }
                | Action::ReadFile { .. } => {
                    action.read_paths().iter().any(|p| written.contains(p))
                }
                _ => false,
            }
        }
        _ => false,
    }
}

/// Turns model text into dependency-annotated actions and execution plans.
///
/// Wraps a [`TagScanner`], so carried-over partial tags complete on later calls and
/// already-returned tags are never returned twice.
pub struct ActionParser {
    scanner: TagScanner,
}

impl ActionParser {
    pub fn new() -> Self {
        Self {
            scanner: TagScanner::new(),
        }
    }

    /// Append text and return the actions that became complete, without dependencies.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParsedAction> {
        self.scanner
            .feed(chunk)
            .into_iter()
            .map(ParsedAction::from_scanned)
            .collect()
    }

    /// Append text and plan every newly completed action.
    pub fn parse(&mut self, text: &str) -> ExecutionPlan {
        let actions = self.feed(text);
        Self::plan(actions)
    }

    /// Infer dependencies over one batch and group it into a plan.
    pub fn plan(mut actions: Vec<ParsedAction>) -> ExecutionPlan {
        infer_dependencies(&mut actions);
        ExecutionPlan::build(actions)
    }

    pub fn has_unprocessed(&self) -> bool {
        self.scanner.has_unprocessed()
    }

    pub fn buffer(&self) -> &str {
        self.scanner.buffer()
    }

    pub fn clear(&mut self) {
        self.scanner.clear();
    }
}

impl Default for ActionParser {
    fn default() -> Self {
        Self::new()
    }
}
