use serde::{Deserialize, Serialize};

/// Every action tag the model may emit. The set is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ReadFile,
    WriteFile,
    DeleteFile,
    MoveFile,
    CopyFileSlice,
    ExecuteCommand,
    SearchString,
    SearchFile,
    EditFile,
    RelativePathLookup,
    FetchUrl,
    EndTask,
    EndPhase,
}

/// Structural wrapper carrying phase instructions inside system messages.
pub const PHASE_PROMPT_TAG: &str = "phase_prompt";

impl ActionKind {
    pub const ALL: [ActionKind; 13] = [
        ActionKind::ReadFile,
        ActionKind::WriteFile,
        ActionKind::DeleteFile,
        ActionKind::MoveFile,
        ActionKind::CopyFileSlice,
        ActionKind::ExecuteCommand,
        ActionKind::SearchString,
        ActionKind::SearchFile,
        ActionKind::EditFile,
        ActionKind::RelativePathLookup,
        ActionKind::FetchUrl,
        ActionKind::EndTask,
        ActionKind::EndPhase,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            ActionKind::ReadFile => "read_file",
            ActionKind::WriteFile => "write_file",
            ActionKind::DeleteFile => "delete_file",
            ActionKind::MoveFile => "move_file",
            ActionKind::CopyFileSlice => "copy_file_slice",
            ActionKind::ExecuteCommand => "execute_command",
            ActionKind::SearchString => "search_string",
            ActionKind::SearchFile => "search_file",
            ActionKind::EditFile => "edit_file",
            ActionKind::RelativePathLookup => "relative_path_lookup",
            ActionKind::FetchUrl => "fetch_url",
            ActionKind::EndTask => "end_task",
            ActionKind::EndPhase => "end_phase",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    /// Actions that change the file system or run arbitrary commands.
    /// At most one of these may share a parallel group.
    pub fn is_mutating(self) -> bool {
        !blueprint(self).parallel_safe
    }

    /// Terminal actions have no side effect; their dependencies count as satisfied.
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionKind::EndTask | ActionKind::EndPhase)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// How the body of a tag is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyKind {
    /// Body holds `<field>` sub-tags described by `params`.
    Fields,
    /// Body is free text (a command line or a summary).
    RawText,
}

/// One sub-field of an action tag.
#[derive(Clone, Copy, Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub required: bool,
    /// The field may appear more than once (e.g. several `path`s in `read_file`).
    pub multiple: bool,
    /// Taken untrimmed between the first open and last close tag; may be empty.
    pub verbatim: bool,
    pub description: &'static str,
}

impl ParamSpec {
    const fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            required: true,
            multiple: false,
            verbatim: false,
            description,
        }
    }

    const fn verbatim(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            required: true,
            multiple: false,
            verbatim: true,
            description,
        }
    }

    const fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            required: false,
            multiple: false,
            verbatim: false,
            description,
        }
    }

    const fn repeated(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            required: true,
            multiple: true,
            verbatim: false,
            description,
        }
    }
}

/// Static metadata for one action tag.
#[derive(Clone, Copy, Debug)]
pub struct ActionBlueprint {
    pub kind: ActionKind,
    pub description: &'static str,
    pub body: BodyKind,
    pub params: &'static [ParamSpec],
    pub parallel_safe: bool,
}

impl ActionBlueprint {
    pub fn tag(&self) -> &'static str {
        self.kind.tag()
    }

    pub fn required_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| p.required)
    }
}

const CATALOG: [ActionBlueprint; 13] = [
    ActionBlueprint {
        kind: ActionKind::ReadFile,
        description: "Read one or more files.",
        body: BodyKind::Fields,
        params: &[ParamSpec::repeated("path", "File to read; repeat for several files")],
        parallel_safe: true,
    },
    ActionBlueprint {
        kind: ActionKind::WriteFile,
        description: "Write complete file contents, creating parent directories.",
        body: BodyKind::Fields,
        params: &[
            ParamSpec::required("path", "File to write"),
            ParamSpec::verbatim("content", "Full new contents"),
        ],
        parallel_safe: false,
    },
    ActionBlueprint {
        kind: ActionKind::DeleteFile,
        description: "Delete a file.",
        body: BodyKind::Fields,
        params: &[ParamSpec::required("path", "File to delete")],
        parallel_safe: false,
    },
    ActionBlueprint {
        kind: ActionKind::MoveFile,
        description: "Move or rename a file.",
        body: BodyKind::Fields,
        params: &[
            ParamSpec::required("source_path", "Existing file"),
            ParamSpec::required("destination_path", "New location"),
        ],
        parallel_safe: false,
    },
    ActionBlueprint {
        kind: ActionKind::CopyFileSlice,
        description: "Copy a file, or a line range of it, to a new location.",
        body: BodyKind::Fields,
        params: &[
            ParamSpec::required("source_path", "File to copy from"),
            ParamSpec::required("destination_path", "File to write"),
            ParamSpec::optional("start_line", "First line to copy (1-based)"),
            ParamSpec::optional("end_line", "Last line to copy (inclusive)"),
        ],
        parallel_safe: false,
    },
    ActionBlueprint {
        kind: ActionKind::ExecuteCommand,
        description: "Run a shell command in the project directory.",
        body: BodyKind::RawText,
        params: &[],
        parallel_safe: false,
    },
    ActionBlueprint {
        kind: ActionKind::SearchString,
        description: "Search file contents under a directory for a literal term.",
        body: BodyKind::Fields,
        params: &[
            ParamSpec::required("directory", "Directory to search"),
            ParamSpec::required("term", "Text to look for"),
        ],
        parallel_safe: true,
    },
    ActionBlueprint {
        kind: ActionKind::SearchFile,
        description: "Find files under a directory whose name matches a term or glob.",
        body: BodyKind::Fields,
        params: &[
            ParamSpec::required("directory", "Directory to search"),
            ParamSpec::required("term", "Name fragment or glob pattern"),
        ],
        parallel_safe: true,
    },
    ActionBlueprint {
        kind: ActionKind::EditFile,
        description: "Apply pattern-anchored edits (replace, insert_before, insert_after, delete) to files.",
        body: BodyKind::Fields,
        params: &[ParamSpec::verbatim(
            "changes",
            "One or more <file> blocks, each with <path> and edit operations holding <pattern> and optional <content>",
        )],
        parallel_safe: false,
    },
    ActionBlueprint {
        kind: ActionKind::RelativePathLookup,
        description: "Resolve a path relative to a source file, falling back to fuzzy file-name matching.",
        body: BodyKind::Fields,
        params: &[
            ParamSpec::required("source_path", "File the reference appears in"),
            ParamSpec::required("path", "Relative path to resolve"),
            ParamSpec::optional("threshold", "Minimum name similarity between 0 and 1"),
        ],
        parallel_safe: true,
    },
    ActionBlueprint {
        kind: ActionKind::FetchUrl,
        description: "Fetch a URL and return its text content.",
        body: BodyKind::Fields,
        params: &[ParamSpec::required("url", "URL to fetch")],
        parallel_safe: true,
    },
    ActionBlueprint {
        kind: ActionKind::EndTask,
        description: "Finish the whole task with a summary.",
        body: BodyKind::RawText,
        params: &[ParamSpec::optional(
            "summary",
            "Summary text; the whole body is used when absent",
        )],
        parallel_safe: true,
    },
    ActionBlueprint {
        kind: ActionKind::EndPhase,
        description: "Finish the current phase with a summary.",
        body: BodyKind::RawText,
        params: &[ParamSpec::optional(
            "summary",
            "Summary text; the whole body is used when absent",
        )],
        parallel_safe: true,
    },
];

/// The full, immutable catalog in declaration order.
pub fn catalog() -> &'static [ActionBlueprint] {
    &CATALOG
}

pub fn blueprint(kind: ActionKind) -> &'static ActionBlueprint {
    // CATALOG is declared in ActionKind::ALL order.
    let idx = ActionKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or_default();
    &CATALOG[idx]
}

/// Tag names the scanner treats as structure: every action plus `phase_prompt`.
pub fn structural_tags() -> impl Iterator<Item = &'static str> {
    ActionKind::ALL
        .into_iter()
        .map(ActionKind::tag)
        .chain(std::iter::once(PHASE_PROMPT_TAG))
}

/// Render the catalog as a documentation block for phase prompts.
pub fn format_action_docs() -> String {
    catalog()
        .iter()
        .map(|bp| {
            let mut doc = format!("- `<{}>`: {}", bp.tag(), bp.description);
            if bp.body == BodyKind::RawText {
                doc.push_str(&format!("\n    body: free text, e.g. `<{0}>...</{0}>`", bp.tag()));
            }
            for p in bp.params {
                let marker = match (p.required, p.multiple) {
                    (true, true) => "required, repeatable",
                    (true, false) => "required",
                    (false, _) => "optional",
                };
                doc.push_str(&format!(
                    "\n    - `<{}>` ({}): {}",
                    p.name, marker, p.description
                ));
            }
            doc
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_order_matches_kinds() {
        for (bp, kind) in catalog().iter().zip(ActionKind::ALL) {
            assert_eq!(bp.kind, kind);
        }
        assert_eq!(catalog().len(), ActionKind::ALL.len());
    }

    #[test]
    fn tag_round_trip() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(ActionKind::from_tag("foo"), None);
        assert_eq!(ActionKind::from_tag(PHASE_PROMPT_TAG), None);
    }

    #[test]
    fn mutating_set() {
        assert!(ActionKind::WriteFile.is_mutating());
        assert!(ActionKind::DeleteFile.is_mutating());
        assert!(ActionKind::MoveFile.is_mutating());
        assert!(ActionKind::ExecuteCommand.is_mutating());
        assert!(!ActionKind::ReadFile.is_mutating());
        assert!(!ActionKind::SearchString.is_mutating());
        assert!(!ActionKind::EndTask.is_mutating());
    }

    #[test]
    fn terminal_kinds() {
        assert!(ActionKind::EndTask.is_terminal());
        assert!(ActionKind::EndPhase.is_terminal());
        assert!(!ActionKind::FetchUrl.is_terminal());
    }

    #[test]
    fn docs_mention_every_tag() {
        let docs = format_action_docs();
        for kind in ActionKind::ALL {
            assert!(docs.contains(&format!("`<{}>`", kind.tag())), "{kind}");
        }
        assert!(docs.contains("`<path>` (required, repeatable)"));
        assert!(docs.contains("`<threshold>` (optional)"));
        assert!(docs.contains("`<summary>` (optional)"));
    }

    #[test]
    fn structural_tags_include_phase_prompt() {
        let tags: Vec<_> = structural_tags().collect();
        assert!(tags.contains(&"phase_prompt"));
        assert!(tags.contains(&"edit_file"));
        assert_eq!(tags.len(), 14);
    }
}
