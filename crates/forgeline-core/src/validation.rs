//! Declarative validation rules.
//!
//! A [`ValidationRuleSet`] evaluates a stage's proposed output and its
//! invocation records into a [`ValidationResult`]. Every rule set enforces
//! [`ValidationRule::NoBoundaryViolations`], so a stage built on rules can
//! never pass with a denied invocation in its evidence.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::capability::CapabilityId;
use crate::invoker::InvocationRecord;
use crate::stage::{StageOutput, ValidationResult};

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// A single check on a stage attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationRule {
    /// No invocation was rejected by the allow-list.
    NoBoundaryViolations,
    /// `capability` completed cleanly at least `min_calls` times.
    RequireCapability {
        capability: CapabilityId,
        #[serde(default = "one")]
        min_calls: usize,
    },
    /// Every allowed invocation succeeded.
    NoFailedInvocations,
    /// No invocation carries verifier issues.
    NoVerificationIssues,
    /// Output text is not blank.
    NonEmptyOutput,
    /// `output.data` has a non-null top-level `field`.
    RequireDataField { field: String },
    /// Output text matches the regular expression.
    OutputMatches { pattern: String },
}

fn one() -> usize {
    1
}

/// Ordered rules; always contains [`ValidationRule::NoBoundaryViolations`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ValidationRule>", into = "Vec<ValidationRule>")]
pub struct ValidationRuleSet {
    rules: Vec<ValidationRule>,
}

impl Default for ValidationRuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl From<Vec<ValidationRule>> for ValidationRuleSet {
    fn from(rules: Vec<ValidationRule>) -> Self {
        Self::new(rules)
    }
}

impl From<ValidationRuleSet> for Vec<ValidationRule> {
    fn from(set: ValidationRuleSet) -> Self {
        set.rules
    }
}

impl ValidationRuleSet {
    /// Build a rule set; the boundary rule is prepended if missing.
    pub fn new(rules: Vec<ValidationRule>) -> Self {
        let mut rules = rules;
        if !rules.contains(&ValidationRule::NoBoundaryViolations) {
            rules.insert(0, ValidationRule::NoBoundaryViolations);
        }
        Self { rules }
    }

    /// Boundary enforcement plus no verifier issues.
    pub fn standard() -> Self {
        Self::new(vec![
            ValidationRule::NoBoundaryViolations,
            ValidationRule::NoVerificationIssues,
        ])
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
        self
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    /// Reject rule sets that can never evaluate (bad regular expressions).
    pub fn check(&self) -> Result<(), String> {
        for rule in &self.rules {
            if let ValidationRule::OutputMatches { pattern } = rule {
                Regex::new(pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
            }
        }
        Ok(())
    }

    /// Evaluate every rule. On success the committed data is the output's
    /// committed value.
    pub fn evaluate(&self, output: &StageOutput, invocations: &[InvocationRecord]) -> ValidationResult {
        let violations: Vec<RuleViolation> = self
            .rules
            .iter()
            .filter_map(|rule| check_rule(rule, output, invocations))
            .collect();

        if violations.is_empty() {
            return ValidationResult::pass(
                format!("{} validation rules passed", self.rules.len()),
                output.as_committed(),
            );
        }

        let message = violations
            .iter()
            .map(|v| v.reason.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        ValidationResult::fail(message).with_details(json!({ "violations": violations }))
    }
}

/// A failed rule with its explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule: ValidationRule,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

fn check_rule(
    rule: &ValidationRule,
    output: &StageOutput,
    invocations: &[InvocationRecord],
) -> Option<RuleViolation> {
    let reason = match rule {
        ValidationRule::NoBoundaryViolations => {
            let denied: Vec<&str> = invocations
                .iter()
                .filter(|r| r.is_denied())
                .map(|r| r.capability.as_str())
                .collect();
            if denied.is_empty() {
                return None;
            }
            format!("boundary violation: disallowed capabilities [{}]", denied.join(", "))
        }
        ValidationRule::RequireCapability {
            capability,
            min_calls,
        } => {
            let clean = invocations
                .iter()
                .filter(|r| &r.capability == capability && r.is_clean())
                .count();
            if clean >= *min_calls {
                return None;
            }
            format!("required capability '{capability}' completed {clean} of {min_calls} times")
        }
        ValidationRule::NoFailedInvocations => {
            let failed: Vec<String> = invocations
                .iter()
                .filter(|r| r.allowed && !r.is_ok())
                .map(|r| format!("#{} {}", r.seq, r.capability))
                .collect();
            if failed.is_empty() {
                return None;
            }
            format!("failed invocations: [{}]", failed.join(", "))
        }
        ValidationRule::NoVerificationIssues => {
            let issues: Vec<String> = invocations
                .iter()
                .flat_map(|r| r.issues.iter().map(move |i| format!("{}: {i}", r.capability)))
                .collect();
            if issues.is_empty() {
                return None;
            }
            format!("verification issues: [{}]", issues.join(", "))
        }
        ValidationRule::NonEmptyOutput => {
            if !output.text.trim().is_empty() {
                return None;
            }
            "output is empty".to_string()
        }
        ValidationRule::RequireDataField { field } => match output.data.get(field) {
            Some(v) if !v.is_null() => return None,
            _ => format!("output is missing field '{field}'"),
        },
        ValidationRule::OutputMatches { pattern } => match Regex::new(pattern) {
            Ok(re) if re.is_match(&output.text) => return None,
            Ok(_) => format!("output does not match /{pattern}/"),
            Err(e) => format!("invalid pattern '{pattern}': {e}"),
        },
    };
    Some(RuleViolation {
        rule: rule.clone(),
        reason,
    })
}

/// Convenience for hand-written validators: fail on the first denied
/// invocation.
pub fn boundary_violation(invocations: &[InvocationRecord]) -> Option<ValidationResult> {
    check_rule(&ValidationRule::NoBoundaryViolations, &StageOutput::default(), invocations)
        .map(|v| {
            let details = json!({ "violations": [&v] });
            ValidationResult::fail(v.reason).with_details(details)
        })
}

/// Pass-through used when a stage has no content rules of its own.
pub fn accept(output: &StageOutput, invocations: &[InvocationRecord]) -> ValidationResult {
    boundary_violation(invocations)
        .unwrap_or_else(|| ValidationResult::pass("accepted", output.as_committed()))
}
