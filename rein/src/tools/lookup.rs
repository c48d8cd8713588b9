use std::path::{Component, Path, PathBuf};

use similar::TextDiff;

use super::{FileOperations, SearchProvider, ToolError};

/// A resolved path and how closely it matched the requested one (1.0 = exact).
#[derive(Clone, Debug, PartialEq)]
pub struct LookupMatch {
    pub path: String,
    pub score: f64,
}

/// Lexically collapse `.` and `..` without touching the file system.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn similarity(a: &str, b: &str) -> f64 {
    f64::from(TextDiff::from_chars(a, b).ratio())
}

/// Resolve `path` as written inside `source_path` (e.g. an import) to a real file.
///
/// The path is first joined to the source file's directory. If nothing exists
/// there, files sharing the target's stem are ranked by character similarity to
/// the joined path and the best one at or above `threshold` wins.
pub async fn lookup_relative_path(
    files: &dyn FileOperations,
    search: &dyn SearchProvider,
    source_path: &str,
    path: &str,
    threshold: f64,
) -> Result<Option<LookupMatch>, ToolError> {
    let base = Path::new(source_path).parent().unwrap_or(Path::new(""));
    let joined = normalize(&base.join(path));
    let wanted = joined.to_string_lossy().into_owned();

    if files.exists(&wanted).await {
        return Ok(Some(LookupMatch {
            path: wanted,
            score: 1.0,
        }));
    }

    let stem = joined
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    if stem.is_empty() {
        return Ok(None);
    }

    let candidates = search.find_by_name(".", &stem).await?;
    let best = candidates
        .into_iter()
        .map(|candidate| {
            let score = similarity(&wanted, &candidate);
            LookupMatch {
                path: candidate,
                score,
            }
        })
        .filter(|m| m.score >= threshold)
        .max_by(|a, b| a.score.total_cmp(&b.score));

    tracing::debug!(
        source_path,
        path,
        found = best.as_ref().map(|m| m.path.as_str()),
        "relative path lookup"
    );
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{LocalFiles, LocalSearch};
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src/utils")).unwrap();
        std::fs::write(dir.path().join("src/app.ts"), "").unwrap();
        std::fs::write(dir.path().join("src/utils/format.ts"), "").unwrap();
        dir
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(
            normalize(Path::new("src/a/../b/./c.rs")),
            PathBuf::from("src/b/c.rs")
        );
    }

    #[tokio::test]
    async fn exact_relative_path_resolves() {
        let dir = fixture();
        let files = LocalFiles::new(dir.path());
        let search = LocalSearch::new(dir.path());
        let found = lookup_relative_path(&files, &search, "src/app.ts", "./utils/format.ts", 0.6)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.path, "src/utils/format.ts");
        assert_eq!(found.score, 1.0);
    }

    #[tokio::test]
    async fn missing_extension_falls_back_to_similarity() {
        let dir = fixture();
        let files = LocalFiles::new(dir.path());
        let search = LocalSearch::new(dir.path());
        let found = lookup_relative_path(&files, &search, "src/app.ts", "./utils/format", 0.6)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.path, "src/utils/format.ts");
        assert!(found.score < 1.0);
    }

    #[tokio::test]
    async fn nothing_above_threshold_is_none() {
        let dir = fixture();
        let files = LocalFiles::new(dir.path());
        let search = LocalSearch::new(dir.path());
        let found = lookup_relative_path(&files, &search, "src/app.ts", "./nothing/here", 0.6)
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
