use std::path::{Path, PathBuf};

use crate::actions::EditOp;

use super::{FileOperations, FileStats, LineRange, OpResult, resolve, run_blocking};

/// Max text file size we'll read (1 MB).
const MAX_TEXT_BYTES: u64 = 1_000_000;

/// File-system adapter. Relative paths resolve against `root`.
pub struct LocalFiles {
    root: PathBuf,
}

impl LocalFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, path: &str) -> PathBuf {
        resolve(&self.root, path)
    }
}

fn blocking_result(result: Result<OpResult, super::ToolError>) -> OpResult {
    result.unwrap_or_else(|e| OpResult::err(e.to_string()))
}

fn ensure_parent(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        return Err(format!("Failed to create directories: {e}"));
    }
    Ok(())
}

fn read_text(path: &Path, display: &str) -> Result<String, String> {
    if !path.exists() {
        return Err(format!("File does not exist: {display}"));
    }
    if path.is_dir() {
        return Err(format!("{display} is a directory, not a file"));
    }
    let size = path.metadata().map(|m| m.len()).unwrap_or(0);
    if size > MAX_TEXT_BYTES {
        return Err(format!(
            "{display} is too large to read ({size} bytes, limit {MAX_TEXT_BYTES})"
        ));
    }
    std::fs::read_to_string(path).map_err(|e| format!("Failed to read {display}: {e}"))
}

fn write_text(path: &Path, display: &str, content: &str) -> OpResult {
    if let Err(e) = ensure_parent(path) {
        return OpResult::err(e);
    }
    match std::fs::write(path, content) {
        Ok(()) => OpResult::ok(format!("Wrote {} bytes to {display}", content.len())),
        Err(e) => OpResult::err_fmt(format_args!("Failed to write {display}: {e}")),
    }
}

/// Lines `start..=end` (1-based) of `content`; open ends default to the file bounds.
fn slice_lines(content: &str, lines: LineRange) -> Result<String, String> {
    if lines.start.is_none() && lines.end.is_none() {
        return Ok(content.to_string());
    }
    let all: Vec<&str> = content.split_inclusive('\n').collect();
    let start = lines.start.unwrap_or(1);
    let end = lines.end.unwrap_or(all.len()).min(all.len());
    if start == 0 || start > all.len() {
        return Err(format!(
            "start_line {start} is outside the file ({} lines)",
            all.len()
        ));
    }
    if end < start {
        return Err(format!("end_line {end} is before start_line {start}"));
    }
    Ok(all[start - 1..end].concat())
}

/// Apply edit operations in order. Each pattern is a literal and must be present;
/// only its first occurrence is affected. Nothing is written if any op fails.
pub fn apply_edits(content: &str, ops: &[EditOp]) -> Result<String, String> {
    let mut text = content.to_string();
    for (i, op) in ops.iter().enumerate() {
        let pattern = op.pattern();
        let Some(at) = text.find(pattern) else {
            return Err(format!("Edit #{}: pattern not found: {pattern:?}", i + 1));
        };
        let end = at + pattern.len();
        text = match op {
            EditOp::Replace { content, .. } => {
                format!("{}{}{}", &text[..at], content, &text[end..])
            }
            EditOp::InsertBefore { content, .. } => {
                format!("{}{}{}", &text[..at], content, &text[at..])
            }
            EditOp::InsertAfter { content, .. } => {
                format!("{}{}{}", &text[..end], content, &text[end..])
            }
            EditOp::Delete { .. } => format!("{}{}", &text[..at], &text[end..]),
        };
    }
    Ok(text)
}

#[async_trait::async_trait]
impl FileOperations for LocalFiles {
    async fn read(&self, path: &str) -> OpResult {
        let full = self.path(path);
        let display = path.to_string();
        blocking_result(
            run_blocking(move || match read_text(&full, &display) {
                Ok(text) => OpResult::ok(text),
                Err(e) => OpResult::err(e),
            })
            .await,
        )
    }

    async fn write(&self, path: &str, content: &str) -> OpResult {
        let full = self.path(path);
        let display = path.to_string();
        let content = content.to_string();
        blocking_result(run_blocking(move || write_text(&full, &display, &content)).await)
    }

    async fn delete(&self, path: &str) -> OpResult {
        let full = self.path(path);
        let display = path.to_string();
        blocking_result(
            run_blocking(move || {
                if !full.exists() {
                    return OpResult::err_fmt(format_args!("File does not exist: {display}"));
                }
                if full.is_dir() {
                    return OpResult::err_fmt(format_args!(
                        "{display} is a directory; only files can be deleted"
                    ));
                }
                match std::fs::remove_file(&full) {
                    Ok(()) => OpResult::ok(format!("Deleted {display}")),
                    Err(e) => OpResult::err_fmt(format_args!("Failed to delete {display}: {e}")),
                }
            })
            .await,
        )
    }

    async fn rename(&self, source: &str, destination: &str) -> OpResult {
        let from = self.path(source);
        let to = self.path(destination);
        let (source, destination) = (source.to_string(), destination.to_string());
        blocking_result(
            run_blocking(move || {
                if !from.exists() {
                    return OpResult::err_fmt(format_args!("File does not exist: {source}"));
                }
                if let Err(e) = ensure_parent(&to) {
                    return OpResult::err(e);
                }
                match std::fs::rename(&from, &to) {
                    Ok(()) => OpResult::ok(format!("Moved {source} to {destination}")),
                    Err(e) => OpResult::err_fmt(format_args!(
                        "Failed to move {source} to {destination}: {e}"
                    )),
                }
            })
            .await,
        )
    }

    async fn copy(&self, source: &str, destination: &str, lines: LineRange) -> OpResult {
        let from = self.path(source);
        let to = self.path(destination);
        let (source, destination) = (source.to_string(), destination.to_string());
        blocking_result(
            run_blocking(move || {
                let text = match read_text(&from, &source) {
                    Ok(t) => t,
                    Err(e) => return OpResult::err(e),
                };
                let slice = match slice_lines(&text, lines) {
                    Ok(s) => s,
                    Err(e) => return OpResult::err_fmt(format_args!("{source}: {e}")),
                };
                let written = write_text(&to, &destination, &slice);
                if !written.success {
                    return written;
                }
                OpResult::ok(format!(
                    "Copied {} lines from {source} to {destination}",
                    slice.lines().count()
                ))
            })
            .await,
        )
    }

    async fn edit(&self, path: &str, ops: &[EditOp]) -> OpResult {
        let full = self.path(path);
        let display = path.to_string();
        let ops = ops.to_vec();
        blocking_result(
            run_blocking(move || {
                let original = match read_text(&full, &display) {
                    Ok(t) => t,
                    Err(e) => return OpResult::err(e),
                };
                let edited = match apply_edits(&original, &ops) {
                    Ok(t) => t,
                    Err(e) => return OpResult::err_fmt(format_args!("{display}: {e}")),
                };
                match std::fs::write(&full, &edited) {
                    Ok(()) => OpResult::ok(format!("Applied {} edits to {display}", ops.len())),
                    Err(e) => OpResult::err_fmt(format_args!("Failed to write {display}: {e}")),
                }
            })
            .await,
        )
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(self.path(path)).await.unwrap_or(false)
    }

    async fn stats(&self, path: &str) -> OpResult {
        let meta = match tokio::fs::metadata(self.path(path)).await {
            Ok(m) => m,
            Err(e) => return OpResult::err_fmt(format_args!("Failed to stat {path}: {e}")),
        };
        let stats = FileStats {
            size: meta.len(),
            is_dir: meta.is_dir(),
            modified: meta.modified().ok().map(chrono::DateTime::<chrono::Utc>::from),
        };
        match serde_json::to_string(&stats) {
            Ok(json) => OpResult::ok(json),
            Err(e) => OpResult::err_fmt(format_args!("Failed to encode stats: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalFiles) {
        let dir = TempDir::new().unwrap();
        let files = LocalFiles::new(dir.path());
        (dir, files)
    }

    #[tokio::test]
    async fn write_creates_parents_and_read_returns_content() {
        let (dir, files) = setup();
        let result = files.write("a/b/c.txt", "nested").await;
        assert!(result.success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a/b/c.txt")).unwrap(),
            "nested"
        );
        assert_eq!(files.read("a/b/c.txt").await.data.as_deref(), Some("nested"));
    }

    #[tokio::test]
    async fn read_missing_file_fails() {
        let (_dir, files) = setup();
        let result = files.read("nope.txt").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn read_multiple_keeps_order() {
        let (dir, files) = setup();
        std::fs::write(dir.path().join("x"), "1").unwrap();
        std::fs::write(dir.path().join("y"), "2").unwrap();
        let results = files
            .read_multiple(&["y".to_string(), "x".to_string()])
            .await;
        assert_eq!(results[0].0, "y");
        assert_eq!(results[0].1.data.as_deref(), Some("2"));
        assert_eq!(results[1].1.data.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn delete_and_exists() {
        let (dir, files) = setup();
        std::fs::write(dir.path().join("gone.txt"), "x").unwrap();
        assert!(files.exists("gone.txt").await);
        assert!(files.delete("gone.txt").await.success);
        assert!(!files.exists("gone.txt").await);
        assert!(!files.delete("gone.txt").await.success);
    }

    #[tokio::test]
    async fn rename_moves_into_new_directory() {
        let (dir, files) = setup();
        std::fs::write(dir.path().join("src.txt"), "data").unwrap();
        assert!(files.rename("src.txt", "out/dst.txt").await.success);
        assert!(!dir.path().join("src.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/dst.txt")).unwrap(),
            "data"
        );
    }

    #[tokio::test]
    async fn copy_slice_takes_inclusive_range() {
        let (dir, files) = setup();
        std::fs::write(dir.path().join("f.txt"), "one\ntwo\nthree\nfour\n").unwrap();
        let range = LineRange {
            start: Some(2),
            end: Some(3),
        };
        assert!(files.copy("f.txt", "g.txt", range).await.success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("g.txt")).unwrap(),
            "two\nthree\n"
        );
    }

    #[tokio::test]
    async fn copy_slice_out_of_range_fails() {
        let (dir, files) = setup();
        std::fs::write(dir.path().join("f.txt"), "one\n").unwrap();
        let range = LineRange {
            start: Some(5),
            end: None,
        };
        assert!(!files.copy("f.txt", "g.txt", range).await.success);
        assert!(!dir.path().join("g.txt").exists());
    }

    #[tokio::test]
    async fn edit_applies_ops_atomically() {
        let (dir, files) = setup();
        std::fs::write(dir.path().join("e.rs"), "fn a() {}\nfn b() {}\n").unwrap();
        let ops = vec![
            EditOp::Replace {
                pattern: "fn a()".into(),
                content: "fn alpha()".into(),
            },
            EditOp::Delete {
                pattern: "missing".into(),
            },
        ];
        let result = files.edit("e.rs", &ops).await;
        assert!(!result.success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("e.rs")).unwrap(),
            "fn a() {}\nfn b() {}\n"
        );
    }

    #[tokio::test]
    async fn stats_reports_size() {
        let (dir, files) = setup();
        std::fs::write(dir.path().join("s.txt"), "12345").unwrap();
        let result = files.stats("s.txt").await;
        let stats: FileStats = serde_json::from_str(result.data.as_deref().unwrap()).unwrap();
        assert_eq!(stats.size, 5);
        assert!(!stats.is_dir);
    }

    #[test]
    fn apply_edits_inserts_around_pattern() {
        let ops = vec![
            EditOp::InsertBefore {
                pattern: "b".into(),
                content: "<".into(),
            },
            EditOp::InsertAfter {
                pattern: "b".into(),
                content: ">".into(),
            },
        ];
        assert_eq!(apply_edits("abc", &ops).unwrap(), "a<b>c");
    }

    #[test]
    fn apply_edits_replaces_first_occurrence_only() {
        let ops = vec![EditOp::Replace {
            pattern: "x".into(),
            content: "y".into(),
        }];
        assert_eq!(apply_edits("x x", &ops).unwrap(), "y x");
    }
}
