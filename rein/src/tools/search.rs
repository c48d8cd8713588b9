use std::path::{Path, PathBuf};

use super::{SearchMatch, SearchProvider, ToolError, resolve, run_blocking};

const MAX_RESULTS: usize = 100;
const MAX_LINE_LEN: usize = 500;

/// Walks the tree with `ignore` (respecting .gitignore) for content and name searches.
pub struct LocalSearch {
    root: PathBuf,
}

impl LocalSearch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl SearchProvider for LocalSearch {
    async fn find_by_content(
        &self,
        directory: &str,
        term: &str,
    ) -> Result<Vec<SearchMatch>, ToolError> {
        let base = resolve(&self.root, directory);
        let root = self.root.clone();
        let term = term.to_string();
        run_blocking(move || content_matches(&root, &base, &term)).await?
    }

    async fn find_by_name(&self, directory: &str, term: &str) -> Result<Vec<String>, ToolError> {
        let base = resolve(&self.root, directory);
        let root = self.root.clone();
        let term = term.to_string();
        run_blocking(move || name_matches(&root, &base, &term)).await?
    }
}

fn walk(base: &Path) -> Result<ignore::Walk, ToolError> {
    if !base.exists() {
        return Err(ToolError::Other(format!(
            "Path does not exist: {}",
            base.display()
        )));
    }
    Ok(ignore::WalkBuilder::new(base)
        .hidden(false)
        .git_ignore(true)
        .build())
}

fn display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn content_matches(root: &Path, base: &Path, term: &str) -> Result<Vec<SearchMatch>, ToolError> {
    if term.is_empty() {
        return Err(ToolError::Pattern("empty search term".into()));
    }
    let mut matches = Vec::new();
    for entry in walk(base)?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        // Binary and unreadable files are skipped.
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for (i, line) in content.lines().enumerate() {
            if !line.contains(term) {
                continue;
            }
            let text = match line.char_indices().nth(MAX_LINE_LEN) {
                Some((cut, _)) => format!("{}...", &line[..cut]),
                None => line.to_string(),
            };
            matches.push(SearchMatch {
                path: display(root, path),
                line: i + 1,
                text,
            });
            if matches.len() >= MAX_RESULTS {
                return Ok(matches);
            }
        }
    }
    Ok(matches)
}

fn is_glob(term: &str) -> bool {
    term.contains(['*', '?', '['])
}

fn name_matches(root: &Path, base: &Path, term: &str) -> Result<Vec<String>, ToolError> {
    let matcher = if is_glob(term) {
        let glob = globset::GlobBuilder::new(term)
            .literal_separator(false)
            .build()
            .map_err(|e| ToolError::Pattern(e.to_string()))?;
        Some(
            globset::GlobSetBuilder::new()
                .add(glob)
                .build()
                .map_err(|e| ToolError::Pattern(e.to_string()))?,
        )
    } else {
        None
    };
    let needle = term.to_lowercase();

    let mut found = Vec::new();
    for entry in walk(base)?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let hit = match &matcher {
            Some(set) => {
                set.is_match(name) || path.strip_prefix(base).is_ok_and(|rel| set.is_match(rel))
            }
            None => name.to_lowercase().contains(&needle),
        };
        if hit {
            found.push(display(root, path));
            if found.len() >= MAX_RESULTS {
                break;
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src/main.rs"),
            "fn main() {\n    hello();\n}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn hello() {}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "nothing here\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn content_search_reports_lines() {
        let dir = fixture();
        let search = LocalSearch::new(dir.path());
        let hits = search.find_by_content(".", "hello").await.unwrap();
        assert_eq!(hits.len(), 2);
        let main = hits.iter().find(|m| m.path.ends_with("main.rs")).unwrap();
        assert_eq!(main.line, 2);
        assert!(main.text.contains("hello();"));
    }

    #[tokio::test]
    async fn content_search_without_matches_is_empty() {
        let dir = fixture();
        let search = LocalSearch::new(dir.path());
        assert!(search.find_by_content("src", "xyz").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn name_search_substring_is_case_insensitive() {
        let dir = fixture();
        let search = LocalSearch::new(dir.path());
        let hits = search.find_by_name(".", "readme").await.unwrap();
        assert_eq!(hits, vec!["README.md".to_string()]);
    }

    #[tokio::test]
    async fn name_search_accepts_globs() {
        let dir = fixture();
        let search = LocalSearch::new(dir.path());
        let hits = search.find_by_name(".", "*.rs").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.ends_with(".rs")));
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = fixture();
        let search = LocalSearch::new(dir.path());
        assert!(search.find_by_name("nope", "x").await.is_err());
    }
}
