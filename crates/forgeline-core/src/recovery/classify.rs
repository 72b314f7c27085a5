//! Error classification for capability failures.
//!
//! Classification is a pure function of the error text: the same message
//! always yields the same category.

use serde::{Deserialize, Serialize};

/// Known failure categories, in match priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MissingParentDirectory,
    PermissionDenied,
    MissingDependency,
    MissingResource,
    AssertionFailure,
    MalformedOutput,
    Timeout,
}

impl ErrorCategory {
    /// All categories in the order they are tried.
    pub const ORDERED: [ErrorCategory; 7] = [
        ErrorCategory::MissingParentDirectory,
        ErrorCategory::PermissionDenied,
        ErrorCategory::MissingDependency,
        ErrorCategory::MissingResource,
        ErrorCategory::AssertionFailure,
        ErrorCategory::MalformedOutput,
        ErrorCategory::Timeout,
    ];

    /// Lowercase substrings that identify the category.
    pub fn markers(self) -> &'static [&'static str] {
        match self {
            ErrorCategory::MissingParentDirectory => &[
                "parent directory does not exist",
                "missing parent directory",
                "no such parent directory",
            ],
            ErrorCategory::PermissionDenied => &[
                "eacces",
                "eperm",
                "permission denied",
                "operation not permitted",
            ],
            ErrorCategory::MissingDependency => &[
                "command not found",
                "no module named",
                "modulenotfounderror",
                "cannot find module",
                "executable file not found",
                "not found in path",
            ],
            ErrorCategory::MissingResource => &[
                "enoent",
                "no such file or directory",
                "file not found",
                "does not exist",
            ],
            ErrorCategory::AssertionFailure => &[
                "assertionerror",
                "assertion failed",
                "assertion `left == right` failed",
                "test result: failed",
            ],
            ErrorCategory::MalformedOutput => &[
                "malformed",
                "invalid json",
                "unexpected token",
                "unexpected end of",
                "expected value at line",
                "parse error",
            ],
            ErrorCategory::Timeout => &["timed out", "timeout", "deadline exceeded"],
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::MissingParentDirectory => "missing-parent-directory",
            ErrorCategory::PermissionDenied => "permission-denied",
            ErrorCategory::MissingDependency => "missing-dependency",
            ErrorCategory::MissingResource => "missing-resource",
            ErrorCategory::AssertionFailure => "assertion-failure",
            ErrorCategory::MalformedOutput => "malformed-output",
            ErrorCategory::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Classify an error message; `None` when no category matches.
pub fn classify_error(message: &str) -> Option<ErrorCategory> {
    let msg = message.to_lowercase();
    ErrorCategory::ORDERED
        .into_iter()
        .find(|category| category.markers().iter().any(|m| msg.contains(m)))
}
