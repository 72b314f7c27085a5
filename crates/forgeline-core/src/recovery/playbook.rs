//! Category → recovery action pairing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::classify::ErrorCategory;

/// An automated fix attempted before re-invoking a failed capability.
///
/// Actions are stateless and idempotent: applying one twice leaves the
/// world (and the arguments) as applying it once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Create the parent directory of the `path` argument.
    CreateParentDirectory,
    /// Point the `path` argument at the unique same-named file under the
    /// working directory.
    ResolvePath,
    /// Swap the program of the `command` argument for an equivalent one.
    SubstituteCommand,
    /// Re-invoke with unchanged arguments.
    RetryUnchanged,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoveryAction::CreateParentDirectory => "create_parent_directory",
            RecoveryAction::ResolvePath => "resolve_path",
            RecoveryAction::SubstituteCommand => "substitute_command",
            RecoveryAction::RetryUnchanged => "retry_unchanged",
        };
        write!(f, "{s}")
    }
}

/// One `from → to` program swap used by [`RecoveryAction::SubstituteCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSubstitution {
    pub from: String,
    pub to: String,
}

impl CommandSubstitution {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Which action (if any) answers each error category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPlaybook {
    pub actions: BTreeMap<ErrorCategory, RecoveryAction>,
    pub command_substitutions: Vec<CommandSubstitution>,
}

impl Default for RecoveryPlaybook {
    fn default() -> Self {
        Self::standard()
    }
}

impl RecoveryPlaybook {
    /// No automated actions; every classified error escalates.
    pub fn empty() -> Self {
        Self {
            actions: BTreeMap::new(),
            command_substitutions: Vec::new(),
        }
    }

    /// Default pairing.
    ///
    /// | Category                 | Action                  |
    /// |--------------------------|-------------------------|
    /// | missing-parent-directory | create parent directory |
    /// | missing-resource         | resolve path            |
    /// | missing-dependency       | substitute command      |
    /// | malformed-output         | retry unchanged         |
    /// | timeout                  | retry unchanged         |
    /// | permission-denied        | (escalate)              |
    /// | assertion-failure        | (escalate)              |
    pub fn standard() -> Self {
        Self::empty()
            .with_action(
                ErrorCategory::MissingParentDirectory,
                RecoveryAction::CreateParentDirectory,
            )
            .with_action(ErrorCategory::MissingResource, RecoveryAction::ResolvePath)
            .with_action(
                ErrorCategory::MissingDependency,
                RecoveryAction::SubstituteCommand,
            )
            .with_action(ErrorCategory::MalformedOutput, RecoveryAction::RetryUnchanged)
            .with_action(ErrorCategory::Timeout, RecoveryAction::RetryUnchanged)
            .with_substitution("python", "python3")
            .with_substitution("pip", "pip3")
            .with_substitution("python3", "python")
            .with_substitution("pip3", "pip")
            .with_substitution("node", "nodejs")
    }

    pub fn with_action(mut self, category: ErrorCategory, action: RecoveryAction) -> Self {
        self.actions.insert(category, action);
        self
    }

    pub fn without_action(mut self, category: ErrorCategory) -> Self {
        self.actions.remove(&category);
        self
    }

    pub fn with_substitution(mut self, from: &str, to: &str) -> Self {
        self.command_substitutions
            .push(CommandSubstitution::new(from, to));
        self
    }

    pub fn action_for(&self, category: ErrorCategory) -> Option<RecoveryAction> {
        self.actions.get(&category).copied()
    }

    /// First substitution registered for `program`.
    pub fn substitute_for(&self, program: &str) -> Option<&CommandSubstitution> {
        self.command_substitutions.iter().find(|s| s.from == program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_pairs() {
        let pb = RecoveryPlaybook::standard();
        assert_eq!(
            pb.action_for(ErrorCategory::MissingParentDirectory),
            Some(RecoveryAction::CreateParentDirectory)
        );
        assert_eq!(
            pb.action_for(ErrorCategory::MissingResource),
            Some(RecoveryAction::ResolvePath)
        );
        assert_eq!(pb.action_for(ErrorCategory::PermissionDenied), None);
        assert_eq!(pb.action_for(ErrorCategory::AssertionFailure), None);
    }

    #[test]
    fn test_substitution_lookup_takes_first_match() {
        let pb = RecoveryPlaybook::standard();
        assert_eq!(pb.substitute_for("python").unwrap().to, "python3");
        assert_eq!(pb.substitute_for("python3").unwrap().to, "python");
        assert!(pb.substitute_for("cargo").is_none());
    }

    #[test]
    fn test_without_action_disables_category() {
        let pb = RecoveryPlaybook::standard().without_action(ErrorCategory::Timeout);
        assert_eq!(pb.action_for(ErrorCategory::Timeout), None);
    }

    #[test]
    fn test_playbook_toml_roundtrip() {
        let pb = RecoveryPlaybook::standard();
        let text = toml::to_string(&pb).unwrap();
        let back: RecoveryPlaybook = toml::from_str(&text).unwrap();
        assert_eq!(pb, back);
    }
}
