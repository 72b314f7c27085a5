//! File-pattern and text search over the working directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use glob::{MatchOptions, Pattern, PatternError};
use regex::Regex;
use serde_json::Value;
use walkdir::{DirEntry, WalkDir};

use crate::registry::{CapabilityHandler, CapabilityOutcome, ExecutionContext};

/// Directories never descended into by searches.
pub(crate) const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "__pycache__"];

const MAX_GLOB_RESULTS: usize = 1000;
const MAX_GREP_LINES: usize = 500;

pub(crate) fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|n| SKIPPED_DIRS.contains(&n))
}

/// Files under `root`, as paths relative to `root` with `/` separators.
fn walk_files(root: &Path) -> impl Iterator<Item = (PathBuf, String)> + '_ {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_skipped(e))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(move |e| {
            let rel = e.path().strip_prefix(root).ok()?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            Some((e.into_path(), rel))
        })
}

/// Compile a file glob. `*` and `?` stay within one path component and
/// `**/` spans directories.
pub fn glob_matcher(pattern: &str) -> Result<GlobMatcher, PatternError> {
    Pattern::new(pattern).map(GlobMatcher)
}

/// A compiled glob matched against `/`-separated relative paths.
#[derive(Debug, Clone)]
pub struct GlobMatcher(Pattern);

impl GlobMatcher {
    const OPTIONS: MatchOptions = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    pub fn is_match(&self, rel: &str) -> bool {
        self.0.matches_with(rel, Self::OPTIONS)
    }
}

fn search_root(arguments: &Value, ctx: &ExecutionContext) -> PathBuf {
    let base = arguments.get("path").and_then(Value::as_str).unwrap_or(".");
    ctx.resolve(base)
}

/// `glob { pattern, path? }`
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobHandler;

#[async_trait]
impl CapabilityHandler for GlobHandler {
    async fn execute(
        &self,
        arguments: &Value,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<CapabilityOutcome> {
        let Some(pattern) = arguments.get("pattern").and_then(Value::as_str) else {
            return Ok(CapabilityOutcome::failure("argument 'pattern' must be a string"));
        };
        let matcher = match glob_matcher(pattern) {
            Ok(m) => m,
            Err(e) => return Ok(CapabilityOutcome::failure(format!("invalid glob '{pattern}': {e}"))),
        };
        let root = search_root(arguments, ctx);
        if !root.is_dir() {
            return Ok(CapabilityOutcome::failure(format!(
                "ENOENT: no such file or directory, scandir '{}'",
                root.display()
            )));
        }

        let mut matches = tokio::task::spawn_blocking(move || {
            walk_files(&root)
                .map(|(_, rel)| rel)
                .filter(|rel| matcher.is_match(rel))
                .take(MAX_GLOB_RESULTS)
                .collect::<Vec<_>>()
        })
        .await?;
        matches.sort();

        if matches.is_empty() {
            return Ok(CapabilityOutcome::success("no files matched"));
        }
        Ok(CapabilityOutcome::success(matches.join("\n")))
    }
}

/// `grep { pattern, path?, glob? }`: regex search, one `file:line: text`
/// per match.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrepHandler;

#[async_trait]
impl CapabilityHandler for GrepHandler {
    async fn execute(
        &self,
        arguments: &Value,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<CapabilityOutcome> {
        let Some(pattern) = arguments.get("pattern").and_then(Value::as_str) else {
            return Ok(CapabilityOutcome::failure("argument 'pattern' must be a string"));
        };
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => return Ok(CapabilityOutcome::failure(format!("invalid regex '{pattern}': {e}"))),
        };
        let filter = match arguments.get("glob").and_then(Value::as_str).map(glob_matcher) {
            Some(Ok(f)) => Some(f),
            Some(Err(e)) => return Ok(CapabilityOutcome::failure(format!("invalid glob: {e}"))),
            None => None,
        };
        let root = search_root(arguments, ctx);
        if !root.exists() {
            return Ok(CapabilityOutcome::failure(format!(
                "ENOENT: no such file or directory, scandir '{}'",
                root.display()
            )));
        }

        let lines = tokio::task::spawn_blocking(move || {
            let mut lines = Vec::new();
            for (path, rel) in walk_files(&root) {
                if filter.as_ref().is_some_and(|f| !f.is_match(&rel)) {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let shown = if rel.is_empty() {
                    path.display().to_string()
                } else {
                    rel
                };
                for (n, line) in text.lines().enumerate() {
                    if re.is_match(line) {
                        lines.push(format!("{shown}:{}: {line}", n + 1));
                        if lines.len() >= MAX_GREP_LINES {
                            return lines;
                        }
                    }
                }
            }
            lines
        })
        .await?;

        if lines.is_empty() {
            return Ok(CapabilityOutcome::success("no matches"));
        }
        Ok(CapabilityOutcome::success(lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/util")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("src/calc.py"), "def divide(x, y):\n    return x - y\n").unwrap();
        std::fs::write(dir.path().join("src/util/io.py"), "import os\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "divide things\n").unwrap();
        std::fs::write(dir.path().join("target/calc.py"), "ignored\n").unwrap();
        dir
    }

    fn ctx(dir: &Path) -> ExecutionContext {
        ExecutionContext::new(dir, Uuid::nil(), "test")
    }

    #[test]
    fn test_glob_matcher() {
        let m = glob_matcher("**/*.py").unwrap();
        assert!(m.is_match("calc.py"));
        assert!(m.is_match("src/util/io.py"));
        assert!(!m.is_match("src/calc.pyc"));
        let m = glob_matcher("src/?.rs").unwrap();
        assert!(m.is_match("src/a.rs"));
        assert!(!m.is_match("src/ab.rs"));
        assert!(!glob_matcher("*.py").unwrap().is_match("src/calc.py"));
    }

    #[test]
    fn test_glob_character_classes() {
        let m = glob_matcher("src/[c]alc.py").unwrap();
        assert!(m.is_match("src/calc.py"));
        assert!(!m.is_match("src/[c]alc.py"));
        let m = glob_matcher("*.[ch]").unwrap();
        assert!(m.is_match("main.c"));
        assert!(m.is_match("main.h"));
        assert!(!m.is_match("main.o"));
        assert!(glob_matcher("[").is_err());
    }

    #[tokio::test]
    async fn test_glob_handler_character_class() {
        let dir = fixture();
        let out = GlobHandler
            .execute(&json!({"pattern": "src/[a-c]*.py"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out, CapabilityOutcome::success("src/calc.py"));
    }

    #[tokio::test]
    async fn test_glob_skips_build_dirs() {
        let dir = fixture();
        let out = GlobHandler
            .execute(&json!({"pattern": "**/*.py"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(
            out,
            CapabilityOutcome::success("src/calc.py\nsrc/util/io.py")
        );
    }

    #[tokio::test]
    async fn test_glob_missing_root() {
        let dir = fixture();
        let out = GlobHandler
            .execute(&json!({"pattern": "*", "path": "nope"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(!out.is_success());
    }

    #[tokio::test]
    async fn test_grep_with_filter() {
        let dir = fixture();
        let out = GrepHandler
            .execute(&json!({"pattern": "divide", "glob": "**/*.py"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(
            out,
            CapabilityOutcome::success("src/calc.py:1: def divide(x, y):")
        );
    }

    #[tokio::test]
    async fn test_grep_invalid_regex() {
        let dir = fixture();
        let out = GrepHandler
            .execute(&json!({"pattern": "("}), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(matches!(out, CapabilityOutcome::Failure { error } if error.starts_with("invalid regex")));
    }
}
