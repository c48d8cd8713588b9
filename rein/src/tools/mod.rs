//! Collaborator capabilities consumed by the action executor, plus local adapters.
//!
//! The executor only sees the traits. `Toolbox::local` wires the file-system,
//! shell, search and HTTP adapters used by the CLI; tests substitute fakes.

mod fetch;
mod files;
mod lookup;
mod search;
mod shell;
#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::actions::EditOp;

pub use fetch::HttpFetcher;
pub use files::{LocalFiles, apply_edits};
pub use lookup::{LookupMatch, lookup_relative_path};
pub use search::LocalSearch;
pub use shell::ShellRunner;

/// Uniform result of a file or fetch operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpResult {
    pub fn ok(data: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn err_fmt(args: std::fmt::Arguments<'_>) -> Self {
        Self::err(args.to_string())
    }
}

/// Inclusive, 1-based line range for slice copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineRange {
    pub start: Option<usize>,
    pub end: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub size: u64,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid pattern: {0}")]
    Pattern(String),
    #[error("{0}")]
    Other(String),
}

#[async_trait::async_trait]
pub trait FileOperations: Send + Sync {
    async fn read(&self, path: &str) -> OpResult;
    async fn write(&self, path: &str, content: &str) -> OpResult;
    async fn delete(&self, path: &str) -> OpResult;
    async fn rename(&self, source: &str, destination: &str) -> OpResult;
    async fn copy(&self, source: &str, destination: &str, lines: LineRange) -> OpResult;
    async fn edit(&self, path: &str, ops: &[EditOp]) -> OpResult;
    async fn exists(&self, path: &str) -> bool;
    async fn stats(&self, path: &str) -> OpResult;

    async fn read_multiple(&self, paths: &[String]) -> Vec<(String, OpResult)> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            out.push((path.clone(), self.read(path).await));
        }
        out
    }
}

#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput, ToolError>;
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    /// Lines containing `term` under `directory`.
    async fn find_by_content(&self, directory: &str, term: &str)
    -> Result<Vec<SearchMatch>, ToolError>;
    /// Files under `directory` whose name matches `term` (substring or glob).
    async fn find_by_name(&self, directory: &str, term: &str) -> Result<Vec<String>, ToolError>;
}

#[async_trait::async_trait]
pub trait UrlFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> OpResult;
}

/// The collaborator set one executor dispatches to.
#[derive(Clone)]
pub struct Toolbox {
    pub files: Arc<dyn FileOperations>,
    pub commands: Arc<dyn CommandRunner>,
    pub search: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn UrlFetcher>,
}

impl Toolbox {
    /// Local adapters rooted at `root` (relative paths resolve against it).
    pub fn local(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            files: Arc::new(LocalFiles::new(root.clone())),
            commands: Arc::new(ShellRunner::new().with_cwd(root.clone())),
            search: Arc::new(LocalSearch::new(root)),
            fetcher: Arc::new(HttpFetcher::new()),
        }
    }
}

/// Resolve `path` against `root` unless it is already absolute.
pub(crate) fn resolve(root: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if matches!(path.trim(), "" | ".") {
        root.to_path_buf()
    } else if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// Run blocking file-system work off the async runtime.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, ToolError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ToolError::Other(format!("blocking task failed: {e}")))
}
