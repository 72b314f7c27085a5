//! Best-effort extraction of structured data from free-text agent replies.
//!
//! These adapters may return partial or empty results; whether that is
//! acceptable is the validator's call.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn path_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?:^|[\s`'"(\[])((?:\.{0,2}/)?(?:[\w.-]+/)*[\w-][\w.-]*\.[A-Za-z][A-Za-z0-9]{0,7})\b"#).ok()
    })
    .as_ref()
}

fn fence_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[ \t]*(?:json|JSON)?[ \t]*\n(.*?)```").ok())
        .as_ref()
}

/// File paths mentioned in `text`, de-duplicated in order of appearance.
pub fn extract_file_paths(text: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    let Some(re) = path_pattern() else {
        return paths;
    };
    for caps in re.captures_iter(text) {
        let Some(m) = caps.get(1) else { continue };
        let path = m.as_str().trim_end_matches('.');
        if path.len() <= 3 || (path.contains("..") && !path.starts_with("../")) {
            continue;
        }
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
    }
    paths
}

/// The first fenced code block in `text` that parses as JSON.
pub fn extract_fenced_json(text: &str) -> Option<Value> {
    fence_pattern()?
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .find_map(|m| serde_json::from_str(m.as_str().trim()).ok())
}
