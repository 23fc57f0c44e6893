//! Validation System - Denylist Screening
//!
//! Rules produce structured violations.
//! The validator collects every violation before rejecting, so a caller
//! sees the full set of offending tokens at once.
//!
//! Matching is plain substring containment. No parsing happens here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typesetting primitives considered unsafe inside a formula.
///
/// Covers file inclusion, macro definition, I/O redirection, catcode
/// manipulation, interaction-mode switches and expansion control.
pub const DEFAULT_BLACKLIST: &[&str] = &[
    "include",
    "def",
    "command",
    "loop",
    "repeat",
    "open",
    "toks",
    "output",
    "input",
    "catcode",
    "name",
    "\\every",
    "\\errhelp",
    "\\errorstopmode",
    "\\scrollmode",
    "\\nonstopmode",
    "\\batchmode",
    "\\read",
    "\\write",
    "csname",
    "\\newhelp",
    "\\uppercase",
    "\\lowercase",
    "\\relax",
    "\\aftergroup",
    "\\afterassignment",
    "\\expandafter",
    "\\noexpand",
    "\\special",
    "$$",
];

pub fn default_blacklist() -> Vec<String> {
    DEFAULT_BLACKLIST.iter().map(|t| t.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Formula contains denylisted tokens: {}", tokens.join(", "))]
    Denylisted { tokens: Vec<String> },

    #[error("Formula is empty")]
    Empty,
}

impl ValidationError {
    /// Offending tokens, in denylist order.
    pub fn tokens(&self) -> &[String] {
        match self {
            Self::Denylisted { tokens } => tokens,
            Self::Empty => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationViolation {
    pub rule: String,
    pub token: String,
}

/// Validation rule trait - produces violations
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, formula: &str) -> Vec<ValidationViolation>;
}

// --- Concrete Rules ---

pub struct DenylistRule {
    tokens: Vec<String>,
}

impl DenylistRule {
    pub fn new(tokens: Vec<String>) -> Self {
        // Empty tokens would match everything.
        let tokens = tokens.into_iter().filter(|t| !t.is_empty()).collect();
        Self { tokens }
    }
}

impl ValidationRule for DenylistRule {
    fn name(&self) -> &'static str { "denylist" }

    fn check(&self, formula: &str) -> Vec<ValidationViolation> {
        let mut violations: Vec<ValidationViolation> = vec![];
        for token in &self.tokens {
            if violations.iter().any(|v| &v.token == token) {
                continue;
            }
            if formula.contains(token.as_str()) {
                violations.push(ValidationViolation {
                    rule: self.name().to_string(),
                    token: token.clone(),
                });
            }
        }
        violations
    }
}

/// Validator orchestrates rules and rejects on any violation
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new(blacklist: Vec<String>) -> Self {
        Self {
            rules: vec![Box::new(DenylistRule::new(blacklist))],
        }
    }

    /// All violations for a formula, without rejecting.
    pub fn violations(&self, formula: &str) -> Vec<ValidationViolation> {
        let trimmed = formula.trim();
        let mut all_violations = vec![];
        for rule in &self.rules {
            all_violations.extend(rule.check(trimmed));
        }
        all_violations
    }

    /// Return the cleaned formula, or every offending token.
    pub fn validate(&self, formula: &str) -> Result<String, ValidationError> {
        let cleaned = formula.trim();
        if cleaned.is_empty() {
            return Err(ValidationError::Empty);
        }

        let violations = self.violations(cleaned);
        if !violations.is_empty() {
            return Err(ValidationError::Denylisted {
                tokens: violations.into_iter().map(|v| v.token).collect(),
            });
        }

        Ok(cleaned.to_string())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(default_blacklist())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_formula_is_trimmed() {
        let validator = Validator::default();
        assert_eq!(validator.validate("  x^2 \n").unwrap(), "x^2");
    }

    #[test]
    fn test_input_is_rejected() {
        let validator = Validator::default();
        let err = validator.validate("\\input{/etc/passwd}").unwrap_err();
        assert_eq!(err.tokens(), &["input".to_string()]);
    }

    #[test]
    fn test_every_token_is_reported() {
        let validator = Validator::default();
        let err = validator
            .validate("\\def\\x{1} \\write18{ls} \\catcode`\\^=7")
            .unwrap_err();
        let tokens = err.tokens();
        assert!(tokens.contains(&"def".to_string()));
        assert!(tokens.contains(&"\\write".to_string()));
        assert!(tokens.contains(&"catcode".to_string()));
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn test_tokens_reported_once_in_denylist_order() {
        let validator = Validator::new(vec!["b".into(), "a".into(), "b".into()]);
        let err = validator.validate("a b a b").unwrap_err();
        assert_eq!(err.tokens(), &["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_display_math_delimiter_rejected() {
        let validator = Validator::default();
        assert!(validator.validate("$$ x $$").is_err());
    }

    #[test]
    fn test_empty_formula_rejected() {
        let validator = Validator::default();
        assert_eq!(validator.validate("   ").unwrap_err(), ValidationError::Empty);
    }

    #[test]
    fn test_error_message_lists_tokens() {
        let validator = Validator::default();
        let msg = validator.validate("\\openout \\relax").unwrap_err().to_string();
        assert!(msg.contains("open"));
        assert!(msg.contains("\\relax"));
    }

    #[test]
    fn test_empty_denylist_entries_ignored() {
        let validator = Validator::new(vec![String::new()]);
        assert!(validator.validate("x").is_ok());
    }

    #[test]
    fn test_violations_name_their_rule() {
        let validator = Validator::default();
        let violations = validator.violations("  a \\relax");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].token, "\\relax");
        assert_eq!(violations[0].rule, "denylist");
    }
}
