//! Capability identifiers and per-stage allow-lists.

use std::convert::Infallible;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A named action a stage may invoke.
///
/// Names are parsed case-insensitively and `-`/`_` are interchangeable, so
/// `"Read"`, `"read-file"` and `"read_file"` all resolve to
/// [`CapabilityId::ReadFile`]. Anything unrecognised becomes
/// `Custom(name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CapabilityId {
    ReadFile,
    WriteFile,
    EditFile,
    RunShell,
    Glob,
    Grep,
    WebFetch,
    CodeSearch,
    Custom(String),
}

/// Observable side effect of a capability, used to decide whether the
/// postcondition verifier applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    None,
    FileWrite,
    FileEdit,
    Command,
}

impl CapabilityId {
    /// Canonical snake_case name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::EditFile => "edit_file",
            Self::RunShell => "run_shell",
            Self::Glob => "glob",
            Self::Grep => "grep",
            Self::WebFetch => "web_fetch",
            Self::CodeSearch => "code_search",
            Self::Custom(name) => name,
        }
    }

    pub fn side_effect(&self) -> SideEffect {
        match self {
            Self::WriteFile => SideEffect::FileWrite,
            Self::EditFile => SideEffect::FileEdit,
            Self::RunShell => SideEffect::Command,
            _ => SideEffect::None,
        }
    }

    /// Whether the capability mutates state outside the pipeline.
    pub fn is_mutating(&self) -> bool {
        self.side_effect() != SideEffect::None
    }

    fn parse(raw: &str) -> Self {
        let key = raw.trim().to_ascii_lowercase().replace('-', "_");
        match key.as_str() {
            "read" | "read_file" => Self::ReadFile,
            "write" | "write_file" => Self::WriteFile,
            "edit" | "edit_file" => Self::EditFile,
            "bash" | "shell" | "run_shell" => Self::RunShell,
            "glob" => Self::Glob,
            "grep" | "search" => Self::Grep,
            "fetch" | "webfetch" | "web_fetch" => Self::WebFetch,
            "codesearch" | "code_search" | "semantic_search" => Self::CodeSearch,
            _ => Self::Custom(raw.trim().to_string()),
        }
    }
}

impl std::fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for CapabilityId {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for CapabilityId {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<CapabilityId> for String {
    fn from(id: CapabilityId) -> Self {
        id.as_str().to_string()
    }
}

/// Ordered, de-duplicated set of capabilities a stage may invoke.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<CapabilityId>", into = "Vec<CapabilityId>")]
pub struct CapabilitySet {
    ids: Vec<CapabilityId>,
}

impl CapabilitySet {
    pub fn new<I, C>(ids: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<CapabilityId>,
    {
        let mut set = Self::default();
        for id in ids {
            set.insert(id.into());
        }
        set
    }

    /// Nothing allowed.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read/search capabilities only.
    pub fn read_only() -> Self {
        Self::new([
            CapabilityId::ReadFile,
            CapabilityId::Glob,
            CapabilityId::Grep,
            CapabilityId::CodeSearch,
        ])
    }

    pub fn insert(&mut self, id: CapabilityId) {
        if !self.ids.contains(&id) {
            self.ids.push(id);
        }
    }

    pub fn contains(&self, id: &CapabilityId) -> bool {
        self.ids.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityId> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl From<Vec<CapabilityId>> for CapabilitySet {
    fn from(ids: Vec<CapabilityId>) -> Self {
        Self::new(ids)
    }
}

impl From<CapabilitySet> for Vec<CapabilityId> {
    fn from(set: CapabilitySet) -> Self {
        set.ids
    }
}

impl<C: Into<CapabilityId>> FromIterator<C> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = C>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_resolve_to_builtin_ids() {
        assert_eq!(CapabilityId::from("Read"), CapabilityId::ReadFile);
        assert_eq!(CapabilityId::from("read-file"), CapabilityId::ReadFile);
        assert_eq!(CapabilityId::from("Bash"), CapabilityId::RunShell);
        assert_eq!(CapabilityId::from("run-shell"), CapabilityId::RunShell);
        assert_eq!(CapabilityId::from("WebFetch"), CapabilityId::WebFetch);
        assert_eq!(CapabilityId::from("Glob"), CapabilityId::Glob);
    }

    #[test]
    fn test_unknown_name_is_custom() {
        assert_eq!(
            CapabilityId::from("deploy"),
            CapabilityId::Custom("deploy".into())
        );
        assert_eq!(CapabilityId::Custom("deploy".into()).to_string(), "deploy");
    }

    #[test]
    fn test_side_effects() {
        assert_eq!(CapabilityId::WriteFile.side_effect(), SideEffect::FileWrite);
        assert_eq!(CapabilityId::EditFile.side_effect(), SideEffect::FileEdit);
        assert_eq!(CapabilityId::RunShell.side_effect(), SideEffect::Command);
        assert!(!CapabilityId::ReadFile.is_mutating());
    }

    #[test]
    fn test_set_deduplicates_and_keeps_order() {
        let set = CapabilitySet::new(["Read", "Glob", "read_file"]);
        assert_eq!(set.len(), 2);
        let ids: Vec<_> = set.iter().cloned().collect();
        assert_eq!(ids, vec![CapabilityId::ReadFile, CapabilityId::Glob]);
    }

    #[test]
    fn test_set_membership() {
        let set = CapabilitySet::new(["Read", "Glob"]);
        assert!(set.contains(&CapabilityId::ReadFile));
        assert!(!set.contains(&CapabilityId::WriteFile));
    }

    #[test]
    fn test_serde_uses_canonical_names() {
        let set = CapabilitySet::new(["Read", "Bash"]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["read_file","run_shell"]"#);
        let back: CapabilitySet = serde_json::from_str(r#"["Read","Bash"]"#).unwrap();
        assert_eq!(set, back);
    }
}
