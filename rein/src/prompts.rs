use std::path::Path;

use crate::actions::catalog::{PHASE_PROMPT_TAG, format_action_docs};
use crate::phase::Phase;

/// Inputs shared by the phase prompt generators.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PromptArgs {
    pub environment: String,
    pub project_info: Option<String>,
    pub test_command: Option<String>,
    pub typecheck_command: Option<String>,
}

impl PromptArgs {
    /// Gather environment and project info for `cwd`.
    pub fn for_dir(cwd: &Path) -> Self {
        Self {
            environment: environment_summary(cwd),
            project_info: project_info(cwd),
            ..Default::default()
        }
    }

    pub fn with_commands(mut self, test: Option<String>, typecheck: Option<String>) -> Self {
        self.test_command = test;
        self.typecheck_command = typecheck;
        self
    }
}

/// Working directory, git presence and top-level entries.
pub fn environment_summary(cwd: &Path) -> String {
    let mut parts = vec![format!("Working directory: {}", cwd.display())];

    if cwd.join(".git").exists() {
        parts.push("Git repository: yes".into());
    }

    if let Ok(entries) = std::fs::read_dir(cwd) {
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    format!("{name}/")
                } else {
                    name
                }
            })
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        if !names.is_empty() {
            parts.push(format!("Top-level entries: {}", names.join(", ")));
        }
    }

    parts.join("\n")
}

const MANIFESTS: &[(&str, &str)] = &[
    ("Cargo.toml", "Rust (Cargo)"),
    ("package.json", "JavaScript/TypeScript (npm)"),
    ("pyproject.toml", "Python (pyproject)"),
    ("go.mod", "Go (modules)"),
    ("pom.xml", "Java (Maven)"),
    ("build.gradle", "Java/Kotlin (Gradle)"),
];

/// Build systems detected from manifest files in `cwd`.
pub fn project_info(cwd: &Path) -> Option<String> {
    let found: Vec<String> = MANIFESTS
        .iter()
        .filter(|(file, _)| cwd.join(file).exists())
        .map(|(file, kind)| format!("{kind} via {file}"))
        .collect();
    (!found.is_empty()).then(|| format!("Project type: {}", found.join("; ")))
}

fn context_block(args: &PromptArgs) -> String {
    let mut out = String::from("## Environment\n");
    out.push_str(&args.environment);
    if let Some(info) = &args.project_info {
        out.push('\n');
        out.push_str(info);
    }
    out
}

fn commands_block(args: &PromptArgs) -> String {
    let mut lines = Vec::new();
    if let Some(test) = &args.test_command {
        lines.push(format!("- Run tests with: `{test}`"));
    }
    if let Some(check) = &args.typecheck_command {
        lines.push(format!("- Type-check with: `{check}`"));
    }
    if lines.is_empty() {
        return String::new();
    }
    format!("\n## Verification\n{}\n", lines.join("\n"))
}

const RULES: &str = "\
## How to act
Request actions by writing the tags below in your reply. Several actions may appear in one reply; \
independent ones run together, and an action that uses the result of another runs after it. \
Results come back in the next message. Never invent file contents you have not read.";

fn discovery_prompt(args: &PromptArgs) -> String {
    format!(
        "You are in the DISCOVERY phase of a coding task.\n\
         Explore the project until you understand the code involved in the request: read files, \
         search for symbols, run read-only commands. Do not modify anything yet.\n\
         When you understand enough to plan, summarize what you found inside <end_phase>.\n\n\
         {}\n\n{RULES}\n\n## Actions\n{}",
        context_block(args),
        format_action_docs()
    )
}

fn strategy_prompt(args: &PromptArgs) -> String {
    format!(
        "You are in the STRATEGY phase of a coding task.\n\
         Using what discovery found, write a concrete step-by-step plan: which files change, \
         how, and how the result will be verified. Read more files only if the plan depends on them.\n\
         When the plan is complete, put it inside <end_phase>.\n\n\
         {}\n{}\n{RULES}\n\n## Actions\n{}",
        context_block(args),
        commands_block(args),
        format_action_docs()
    )
}

fn execute_prompt(args: &PromptArgs) -> String {
    format!(
        "You are in the EXECUTE phase of a coding task.\n\
         Carry out the plan. Prefer <edit_file> for small changes and <write_file> for new files. \
         After changing code, verify it. If an action fails, read the error, fix the cause and retry.\n\
         When the task is done and verified, summarize the result inside <end_task>.\n\n\
         {}\n{}\n{RULES}\n\n## Actions\n{}",
        context_block(args),
        commands_block(args),
        format_action_docs()
    )
}

/// The prompt for `phase`, wrapped in a `<phase_prompt>` block.
pub fn phase_prompt(phase: Phase, args: &PromptArgs) -> String {
    let body = match phase {
        Phase::Discovery => discovery_prompt(args),
        Phase::Strategy => strategy_prompt(args),
        Phase::Execute => execute_prompt(args),
    };
    format!("<{PHASE_PROMPT_TAG}>\n{body}\n</{PHASE_PROMPT_TAG}>")
}
