//! Field validation for parsed rows
//!
//! Validating parsers declare [`ValidationRules`] per field. A [`RowValidator`] is
//! built once per parse run and checks every row's field map before the parser
//! sees it; failures become an [`ErrorBag`] keyed by field name.
//!
//! # Rules
//! - `Required` fails on a missing or blank cell
//! - Every other rule is skipped for a missing or blank cell
//! - Lengths count characters, not bytes

use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::ErrorBag;

#[derive(Debug, Clone)]
pub enum FieldRule {
    Required,
    MaxLength(usize),
    MinLength(usize),
    Email,
    Numeric,
    Integer,
    In(Vec<String>),
    Pattern(Regex),
}

/// A failed rule, rendered as the message stored on the parsed row
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleViolation {
    #[error("The {field} field is required.")]
    Required { field: String },

    #[error("The {field} field must not be greater than {max} characters.")]
    TooLong { field: String, max: usize },

    #[error("The {field} field must be at least {min} characters.")]
    TooShort { field: String, min: usize },

    #[error("The {field} field must be a valid email address.")]
    Email { field: String },

    #[error("The {field} field must be a number.")]
    Numeric { field: String },

    #[error("The {field} field must be an integer.")]
    Integer { field: String },

    #[error("The selected {field} is invalid.")]
    NotIn { field: String },

    #[error("The {field} field format is invalid.")]
    Pattern { field: String },
}

impl FieldRule {
    /// Check a present, non-blank value
    fn check(&self, field: &str, value: &str) -> Result<(), RuleViolation> {
        let field = field.to_string();
        match self {
            FieldRule::Required => Ok(()),
            FieldRule::MaxLength(max) if value.chars().count() > *max => {
                Err(RuleViolation::TooLong { field, max: *max })
            },
            FieldRule::MinLength(min) if value.chars().count() < *min => {
                Err(RuleViolation::TooShort { field, min: *min })
            },
            FieldRule::Email if !is_email(value) => Err(RuleViolation::Email { field }),
            FieldRule::Numeric if value.trim().parse::<f64>().is_err() => {
                Err(RuleViolation::Numeric { field })
            },
            FieldRule::Integer if value.trim().parse::<i64>().is_err() => {
                Err(RuleViolation::Integer { field })
            },
            FieldRule::In(allowed) if !allowed.iter().any(|a| a == value) => {
                Err(RuleViolation::NotIn { field })
            },
            FieldRule::Pattern(re) if !re.is_match(value) => Err(RuleViolation::Pattern { field }),
            _ => Ok(()),
        }
    }
}

/// Rules per field, in declaration order
#[derive(Debug, Clone, Default)]
pub struct ValidationRules {
    fields: Vec<(String, Vec<FieldRule>)>,
}

impl ValidationRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, rules: impl IntoIterator<Item = FieldRule>) -> Self {
        self.fields.push((name.into(), rules.into_iter().collect()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Reusable validator built from a parser's rules
#[derive(Debug, Clone)]
pub struct RowValidator {
    rules: ValidationRules,
}

impl RowValidator {
    pub fn new(rules: ValidationRules) -> Self {
        Self { rules }
    }

    /// Validate one row's header-keyed fields
    pub fn validate(&self, fields: &BTreeMap<String, String>) -> Result<(), ErrorBag> {
        let mut errors = ErrorBag::new();

        for (name, rules) in &self.rules.fields {
            let value = fields.get(name).map(String::as_str).unwrap_or("");

            if value.trim().is_empty() {
                if rules.iter().any(|r| matches!(r, FieldRule::Required)) {
                    errors.add(name.clone(), RuleViolation::Required { field: name.clone() }.to_string());
                }
                continue;
            }

            for rule in rules {
                if let Err(violation) = rule.check(name, value) {
                    errors.add(name.clone(), violation.to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Single `@`, non-empty local part, dotted domain, no whitespace
fn is_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }

    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        },
        None => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn user_rules() -> ValidationRules {
        ValidationRules::new()
            .field("name", [FieldRule::Required, FieldRule::MaxLength(5)])
            .field("email", [FieldRule::Required, FieldRule::Email])
            .field("age", [FieldRule::Integer])
    }

    #[test]
    fn test_valid_row_passes() {
        let validator = RowValidator::new(user_rules());
        let row = fields(&[("name", "Ann"), ("email", "ann@example.com"), ("age", "31")]);
        assert!(validator.validate(&row).is_ok());
    }

    #[test]
    fn test_required_reports_once_and_skips_other_rules() {
        let validator = RowValidator::new(user_rules());
        let errors = validator
            .validate(&fields(&[("name", "  "), ("email", "ann@example.com")]))
            .unwrap_err();

        assert_eq!(
            errors.get("name").unwrap(),
            &["The name field is required.".to_string()]
        );
        assert!(errors.get("age").is_none());
    }

    #[test]
    fn test_multiple_failures_are_collected() {
        let validator = RowValidator::new(user_rules());
        let errors = validator
            .validate(&fields(&[
                ("name", "Alexandra"),
                ("email", "not-an-email"),
                ("age", "3.5"),
            ]))
            .unwrap_err();

        assert_eq!(
            errors.get("name").unwrap()[0],
            "The name field must not be greater than 5 characters."
        );
        assert_eq!(
            errors.get("email").unwrap()[0],
            "The email field must be a valid email address."
        );
        assert_eq!(errors.get("age").unwrap()[0], "The age field must be an integer.");
    }

    #[test]
    fn test_in_pattern_numeric_min() {
        let rules = ValidationRules::new()
            .field("status", [FieldRule::In(vec!["active".into(), "closed".into()])])
            .field("code", [FieldRule::Pattern(Regex::new(r"^[A-Z]{3}$").unwrap())])
            .field("price", [FieldRule::Numeric])
            .field("note", [FieldRule::MinLength(3)]);
        let validator = RowValidator::new(rules);

        let errors = validator
            .validate(&fields(&[
                ("status", "open"),
                ("code", "ab1"),
                ("price", "12.5"),
                ("note", "ok"),
            ]))
            .unwrap_err();

        assert_eq!(errors.get("status").unwrap()[0], "The selected status is invalid.");
        assert_eq!(errors.get("code").unwrap()[0], "The code field format is invalid.");
        assert!(errors.get("price").is_none());
        assert_eq!(
            errors.get("note").unwrap()[0],
            "The note field must be at least 3 characters."
        );
    }

    #[test]
    fn test_is_email() {
        assert!(is_email("a@b.co"));
        assert!(!is_email("a@b"));
        assert!(!is_email("@b.co"));
        assert!(!is_email("a@@b.co"));
        assert!(!is_email("a b@c.de"));
    }
}
