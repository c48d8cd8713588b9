use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::ActionError;
use super::parser::{Action, ParsedAction};
use super::plan::{ActionGroup, ExecutionPlan};
use crate::tools::{LineRange, OpResult, Toolbox, lookup_relative_path};

/// Uniform outcome of one action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    fn ok(parsed: &ParsedAction, action: &Action, data: impl Into<String>) -> Self {
        Self {
            id: parsed.id.clone(),
            tag: parsed.tag.clone(),
            action: Some(action.clone()),
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    fn failed(parsed: &ParsedAction, error: &ActionError) -> Self {
        Self {
            id: parsed.id.clone(),
            tag: parsed.tag.clone(),
            action: parsed.action.as_ref().ok().cloned(),
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }

    fn from_op(parsed: &ParsedAction, action: &Action, op: OpResult) -> Self {
        if op.success {
            Self::ok(parsed, action, op.data.unwrap_or_default())
        } else {
            let msg = op.error.unwrap_or_else(|| "operation failed".into());
            Self::failed(parsed, &ActionError::Operation(msg))
        }
    }

    pub fn is_end_task(&self) -> bool {
        self.success && matches!(self.action, Some(Action::EndTask { .. }))
    }
}

/// Dispatches one parsed action to the matching collaborator.
#[derive(Clone)]
pub struct ActionExecutor {
    tools: Toolbox,
}

impl ActionExecutor {
    pub fn new(tools: Toolbox) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &Toolbox {
        &self.tools
    }

    /// Never fails: parse and operation errors come back as unsuccessful results.
    pub async fn execute(&self, parsed: &ParsedAction) -> ActionResult {
        let action = match &parsed.action {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(action_id = %parsed.id, tag = %parsed.tag, error = %e, "invalid action");
                return ActionResult::failed(parsed, e);
            }
        };
        tracing::debug!(action_id = %parsed.id, tag = %parsed.tag, "executing action");

        let result = self.dispatch(parsed, action).await;
        if let Some(error) = &result.error {
            tracing::warn!(action_id = %parsed.id, tag = %parsed.tag, error = %error, "action failed");
        }
        result
    }

    async fn dispatch(&self, parsed: &ParsedAction, action: &Action) -> ActionResult {
        let files = &self.tools.files;
        match action {
            Action::ReadFile { paths } => {
                let reads = files.read_multiple(paths).await;
                read_result(parsed, action, reads)
            }
            Action::WriteFile { path, content } => {
                ActionResult::from_op(parsed, action, files.write(path, content).await)
            }
            Action::DeleteFile { path } => {
                ActionResult::from_op(parsed, action, files.delete(path).await)
            }
            Action::MoveFile {
                source,
                destination,
            } => ActionResult::from_op(parsed, action, files.rename(source, destination).await),
            Action::CopyFileSlice {
                source,
                destination,
                start_line,
                end_line,
            } => {
                let lines = LineRange {
                    start: *start_line,
                    end: *end_line,
                };
                ActionResult::from_op(parsed, action, files.copy(source, destination, lines).await)
            }
            Action::EditFile { files: edits } => {
                let mut applied = Vec::with_capacity(edits.len());
                for edit in edits {
                    let op = files.edit(&edit.path, &edit.ops).await;
                    if !op.success {
                        return ActionResult::from_op(parsed, action, op);
                    }
                    applied.push(op.data.unwrap_or_else(|| format!("Edited {}", edit.path)));
                }
                ActionResult::ok(parsed, action, applied.join("\n"))
            }
            Action::ExecuteCommand { command } => match self.tools.commands.run(command).await {
                Ok(out) => {
                    let data = format_command_output(&out.stdout, &out.stderr);
                    if out.succeeded() {
                        ActionResult::ok(parsed, action, data)
                    } else {
                        let code = out
                            .exit_code
                            .map_or_else(|| "signal".to_string(), |c| c.to_string());
                        let mut result = ActionResult::failed(
                            parsed,
                            &ActionError::Operation(format!(
                                "Command exited with status {code}\n{data}"
                            )),
                        );
                        result.data = Some(data);
                        result
                    }
                }
                Err(e) => ActionResult::failed(parsed, &ActionError::Operation(e.to_string())),
            },
            Action::SearchString { directory, term } => {
                match self.tools.search.find_by_content(directory, term).await {
                    Ok(matches) if matches.is_empty() => {
                        ActionResult::ok(parsed, action, "No matches found.")
                    }
                    Ok(matches) => {
                        let lines: Vec<String> = matches
                            .iter()
                            .map(|m| format!("{}:{}:{}", m.path, m.line, m.text))
                            .collect();
                        ActionResult::ok(parsed, action, lines.join("\n"))
                    }
                    Err(e) => ActionResult::failed(parsed, &ActionError::Operation(e.to_string())),
                }
            }
            Action::SearchFile { directory, term } => {
                match self.tools.search.find_by_name(directory, term).await {
                    Ok(names) if names.is_empty() => {
                        ActionResult::ok(parsed, action, "No files found.")
                    }
                    Ok(names) => ActionResult::ok(parsed, action, names.join("\n")),
                    Err(e) => ActionResult::failed(parsed, &ActionError::Operation(e.to_string())),
                }
            }
            Action::RelativePathLookup {
                source_path,
                path,
                threshold,
            } => {
                let found = lookup_relative_path(
                    files.as_ref(),
                    self.tools.search.as_ref(),
                    source_path,
                    path,
                    *threshold,
                )
                .await;
                match found {
                    Ok(Some(m)) => ActionResult::ok(parsed, action, m.path),
                    Ok(None) => ActionResult::failed(
                        parsed,
                        &ActionError::Operation(format!(
                            "No file matching {path} relative to {source_path} (threshold {threshold})"
                        )),
                    ),
                    Err(e) => ActionResult::failed(parsed, &ActionError::Operation(e.to_string())),
                }
            }
            Action::FetchUrl { url } => {
                ActionResult::from_op(parsed, action, self.tools.fetcher.fetch(url).await)
            }
            Action::EndTask { summary } | Action::EndPhase { summary } => {
                ActionResult::ok(parsed, action, summary.clone())
            }
        }
    }
}

fn read_result(
    parsed: &ParsedAction,
    action: &Action,
    reads: Vec<(String, OpResult)>,
) -> ActionResult {
    let failures: Vec<String> = reads
        .iter()
        .filter(|(_, r)| !r.success)
        .map(|(path, r)| {
            r.error
                .clone()
                .unwrap_or_else(|| format!("Failed to read {path}"))
        })
        .collect();
    if !failures.is_empty() {
        return ActionResult::failed(parsed, &ActionError::Operation(failures.join("\n")));
    }
    let data = match reads.as_slice() {
        [(_, only)] => only.data.clone().unwrap_or_default(),
        many => many
            .iter()
            .map(|(path, r)| format!("--- {path} ---\n{}", r.data.as_deref().unwrap_or("")))
            .collect::<Vec<_>>()
            .join("\n"),
    };
    ActionResult::ok(parsed, action, data)
}

fn format_command_output(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();
    if !stdout.trim().is_empty() {
        out.push_str("stdout:\n");
        out.push_str(stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("stderr:\n");
        out.push_str(stderr.trim_end());
    }
    if out.is_empty() {
        out.push_str("(no output)");
    }
    out
}

/// Render a result as the text fed back to the model.
pub fn format_result(result: &ActionResult) -> String {
    let data = result.data.as_deref().unwrap_or("");
    if !result.success {
        let error = result.error.as_deref().unwrap_or("unknown error");
        return format!("Action <{}> ({}) failed: {error}", result.tag, result.id);
    }
    let Some(action) = &result.action else {
        return data.to_string();
    };
    match action {
        Action::ReadFile { paths } if paths.len() == 1 => {
            format!(
                "Here's the content of the requested file: {}\n{data}",
                paths[0]
            )
        }
        Action::ReadFile { .. } => {
            format!("Here's the content of the requested files:\n{data}")
        }
        Action::WriteFile { path, .. } => format!("File {path} written successfully."),
        Action::DeleteFile { path } => format!("File {path} deleted successfully."),
        Action::MoveFile {
            source,
            destination,
        } => format!("File {source} moved to {destination}."),
        Action::CopyFileSlice { .. } => data.to_string(),
        Action::ExecuteCommand { command } => {
            format!("Command `{command}` completed.\n{data}")
        }
        Action::SearchString { directory, term } => {
            format!("Search results for \"{term}\" in {directory}:\n{data}")
        }
        Action::SearchFile { directory, term } => {
            format!("Files matching \"{term}\" in {directory}:\n{data}")
        }
        Action::EditFile { .. } => format!("Edits applied:\n{data}"),
        Action::RelativePathLookup {
            source_path, path, ..
        } => format!("Resolved {path} relative to {source_path}: {data}"),
        Action::FetchUrl { url } => format!("Here's the content fetched from {url}:\n{data}"),
        Action::EndTask { .. } => format!("Task complete: {data}"),
        Action::EndPhase { .. } => format!("Phase complete: {data}"),
    }
}

/// Everything one plan execution produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlanOutcome {
    /// Results of the actions that ran, in execution order.
    pub results: Vec<ActionResult>,
    /// A group failed; later groups were not started.
    pub failed: bool,
    /// Summary of a successful `end_task`, if one ran.
    pub end_task: Option<String>,
    /// Summary of a successful `end_phase`, if one ran.
    pub end_phase: Option<String>,
}

impl PlanOutcome {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Text for the next model turn. `None` after a failure, after `end_task`, or
    /// when nothing ran.
    pub fn follow_up(&self) -> Option<String> {
        if self.failed || self.end_task.is_some() || self.results.is_empty() {
            return None;
        }
        Some(
            self.results
                .iter()
                .map(format_result)
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }

    /// Error summary for the model after a failed plan, including what did succeed.
    pub fn failure_report(&self) -> Option<String> {
        if !self.failed {
            return None;
        }
        let mut report = String::from("Some actions failed:\n");
        for r in self.results.iter().filter(|r| !r.success) {
            report.push_str(&format!(
                "- <{}> ({}): {}\n",
                r.tag,
                r.id,
                r.error.as_deref().unwrap_or("unknown error")
            ));
        }
        let succeeded: Vec<String> = self
            .results
            .iter()
            .filter(|r| r.success)
            .map(format_result)
            .collect();
        if !succeeded.is_empty() {
            report.push_str("\nThese actions completed before the failure:\n\n");
            report.push_str(&succeeded.join("\n\n"));
            report.push('\n');
        }
        report.push_str("\nActions after the failure were not run. Fix the problem and retry.");
        Some(report)
    }
}

/// Runs an [`ExecutionPlan`] group by group.
#[derive(Clone)]
pub struct PlanRunner {
    executor: ActionExecutor,
}

impl PlanRunner {
    pub fn new(executor: ActionExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    /// Group N+1 starts only after group N settles. A failed group stops the plan;
    /// a successful `end_task` short-circuits it.
    pub async fn run(&self, plan: &ExecutionPlan) -> PlanOutcome {
        let mut outcome = PlanOutcome::default();
        for (index, group) in plan.groups.iter().enumerate() {
            tracing::debug!(
                group = index,
                size = group.actions.len(),
                parallel = group.parallel,
                "running action group"
            );
            let results = self.run_group(group).await;
            let group_failed = results.iter().any(|r| !r.success);

            for result in &results {
                match &result.action {
                    Some(Action::EndTask { summary }) if result.success => {
                        outcome.end_task = Some(summary.clone());
                    }
                    Some(Action::EndPhase { summary }) if result.success => {
                        outcome.end_phase = Some(summary.clone());
                    }
                    _ => {}
                }
            }
            outcome.results.extend(results);

            if group_failed {
                outcome.failed = true;
                tracing::warn!(group = index, "action group failed, stopping plan");
                break;
            }
            if outcome.end_task.is_some() {
                break;
            }
        }
        outcome
    }

    async fn run_group(&self, group: &ActionGroup) -> Vec<ActionResult> {
        if group.parallel {
            // Siblings already started are allowed to finish.
            return join_all(group.actions.iter().map(|a| self.executor.execute(a))).await;
        }
        let mut results = Vec::with_capacity(group.actions.len());
        for action in &group.actions {
            let result = self.executor.execute(action).await;
            let ok = result.success;
            results.push(result);
            if !ok {
                break;
            }
        }
        results
    }
}
