//! In-memory collaborators for executor and agent tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::actions::EditOp;

use super::{
    CommandOutput, CommandRunner, FileOperations, LineRange, OpResult, SearchMatch,
    SearchProvider, ToolError, Toolbox, UrlFetcher, apply_edits,
};

#[derive(Default)]
pub struct MemoryFiles {
    pub files: Mutex<BTreeMap<String, String>>,
    pub fail: HashSet<String>,
    pub log: Mutex<Vec<String>>,
}

impl MemoryFiles {
    pub fn with(files: &[(&str, &str)]) -> Self {
        Self {
            files: Mutex::new(
                files
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    pub fn failing(mut self, path: &str) -> Self {
        self.fail.insert(path.to_string());
        self
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn check(&self, path: &str) -> Result<(), OpResult> {
        if self.fail.contains(path) {
            return Err(OpResult::err(format!("Permission denied: {path}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileOperations for MemoryFiles {
    async fn read(&self, path: &str) -> OpResult {
        self.record(format!("read {path}"));
        if let Err(e) = self.check(path) {
            return e;
        }
        match self.get(path) {
            Some(content) => OpResult::ok(content),
            None => OpResult::err(format!("File does not exist: {path}")),
        }
    }

    async fn write(&self, path: &str, content: &str) -> OpResult {
        self.record(format!("write {path}"));
        if let Err(e) = self.check(path) {
            return e;
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        OpResult::ok(format!("Wrote {} bytes to {path}", content.len()))
    }

    async fn delete(&self, path: &str) -> OpResult {
        self.record(format!("delete {path}"));
        if let Err(e) = self.check(path) {
            return e;
        }
        match self.files.lock().unwrap().remove(path) {
            Some(_) => OpResult::ok(format!("Deleted {path}")),
            None => OpResult::err(format!("File does not exist: {path}")),
        }
    }

    async fn rename(&self, source: &str, destination: &str) -> OpResult {
        self.record(format!("move {source} {destination}"));
        let mut files = self.files.lock().unwrap();
        match files.remove(source) {
            Some(content) => {
                files.insert(destination.to_string(), content);
                OpResult::ok(format!("Moved {source} to {destination}"))
            }
            None => OpResult::err(format!("File does not exist: {source}")),
        }
    }

    async fn copy(&self, source: &str, destination: &str, _lines: LineRange) -> OpResult {
        self.record(format!("copy {source} {destination}"));
        let mut files = self.files.lock().unwrap();
        match files.get(source).cloned() {
            Some(content) => {
                files.insert(destination.to_string(), content);
                OpResult::ok(format!("Copied {source} to {destination}"))
            }
            None => OpResult::err(format!("File does not exist: {source}")),
        }
    }

    async fn edit(&self, path: &str, ops: &[EditOp]) -> OpResult {
        self.record(format!("edit {path}"));
        let mut files = self.files.lock().unwrap();
        let Some(content) = files.get(path).cloned() else {
            return OpResult::err(format!("File does not exist: {path}"));
        };
        match apply_edits(&content, ops) {
            Ok(edited) => {
                files.insert(path.to_string(), edited);
                OpResult::ok(format!("Applied {} edits to {path}", ops.len()))
            }
            Err(e) => OpResult::err(e),
        }
    }

    async fn exists(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    async fn stats(&self, path: &str) -> OpResult {
        match self.get(path) {
            Some(content) => OpResult::ok(format!("{{\"size\":{},\"is_dir\":false}}", content.len())),
            None => OpResult::err(format!("File does not exist: {path}")),
        }
    }
}

/// Returns canned output for every command and remembers what ran.
#[derive(Default)]
pub struct ScriptedCommands {
    pub exit_code: i32,
    pub stdout: String,
    pub ran: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedCommands {
    async fn run(&self, command: &str) -> Result<CommandOutput, ToolError> {
        self.ran.lock().unwrap().push(command.to_string());
        Ok(CommandOutput {
            stdout: self.stdout.clone(),
            stderr: if self.exit_code == 0 {
                String::new()
            } else {
                "boom".into()
            },
            exit_code: Some(self.exit_code),
        })
    }
}

#[derive(Default)]
pub struct FixedSearch {
    pub matches: Vec<SearchMatch>,
    pub names: Vec<String>,
}

#[async_trait::async_trait]
impl SearchProvider for FixedSearch {
    async fn find_by_content(
        &self,
        _directory: &str,
        term: &str,
    ) -> Result<Vec<SearchMatch>, ToolError> {
        Ok(self
            .matches
            .iter()
            .filter(|m| m.text.contains(term))
            .cloned()
            .collect())
    }

    async fn find_by_name(&self, _directory: &str, term: &str) -> Result<Vec<String>, ToolError> {
        Ok(self
            .names
            .iter()
            .filter(|n| n.contains(term))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct EchoFetcher;

#[async_trait::async_trait]
impl UrlFetcher for EchoFetcher {
    async fn fetch(&self, url: &str) -> OpResult {
        OpResult::ok(format!("body of {url}"))
    }
}

/// Toolbox over the given in-memory files with default fakes elsewhere.
pub fn toolbox(files: Arc<MemoryFiles>) -> Toolbox {
    Toolbox {
        files,
        commands: Arc::new(ScriptedCommands::default()),
        search: Arc::new(FixedSearch::default()),
        fetcher: Arc::new(EchoFetcher),
    }
}
