//! Error types for compilation and model construction.
//!
//! Evaluation deliberately has no error type: per-event failures (missing
//! fields, type mismatches, cache trouble) are coerced to "predicate false"
//! or "cache miss" inside the evaluator and surface only as log events and
//! metrics counters.

use std::io;
use thiserror::Error;

/// Errors raised while compiling a ruleset into an engine model.
#[derive(Error, Debug)]
pub enum CompileError {
    /// The rule source could not be decoded.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A condition names an operator the engine does not recognize.
    #[error("rule '{rule_code}' condition {condition_index}: unknown operator '{operator}'")]
    InvalidOperator {
        rule_code: String,
        condition_index: usize,
        operator: String,
    },

    /// A condition value does not fit its operator.
    #[error("rule '{rule_code}' condition {condition_index}: {message}")]
    InvalidValue {
        rule_code: String,
        condition_index: usize,
        message: String,
    },

    /// IS_ANY_OF requires a non-empty list value.
    #[error("rule '{rule_code}' condition {condition_index}: IS_ANY_OF value must be a non-empty list")]
    IsAnyOfNotList {
        rule_code: String,
        condition_index: usize,
    },

    /// An enabled rule has no conditions.
    #[error("rule '{rule_code}' has no conditions")]
    EmptyRule { rule_code: String },

    /// I/O error while reading the rule source.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The finalized model failed an internal integrity check.
    #[error("model integrity violation: {0}")]
    Integrity(#[from] ModelIntegrityError),
}

/// Coarse classification of a [`CompileError`], independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileErrorKind {
    ParseError,
    InvalidOperator,
    InvalidValue,
    IsAnyOfNotList,
    EmptyRule,
    Io,
    Integrity,
}

impl CompileError {
    /// The kind of this error.
    pub fn kind(&self) -> CompileErrorKind {
        match self {
            CompileError::Parse { .. } => CompileErrorKind::ParseError,
            CompileError::InvalidOperator { .. } => CompileErrorKind::InvalidOperator,
            CompileError::InvalidValue { .. } => CompileErrorKind::InvalidValue,
            CompileError::IsAnyOfNotList { .. } => CompileErrorKind::IsAnyOfNotList,
            CompileError::EmptyRule { .. } => CompileErrorKind::EmptyRule,
            CompileError::Io(_) => CompileErrorKind::Io,
            CompileError::Integrity(_) => CompileErrorKind::Integrity,
        }
    }

    /// The rule the error is attributed to, when known.
    pub fn rule_code(&self) -> Option<&str> {
        match self {
            CompileError::InvalidOperator { rule_code, .. }
            | CompileError::InvalidValue { rule_code, .. }
            | CompileError::IsAnyOfNotList { rule_code, .. }
            | CompileError::EmptyRule { rule_code } => Some(rule_code),
            _ => None,
        }
    }

    /// The offending condition index inside the rule, when known.
    pub fn condition_index(&self) -> Option<usize> {
        match self {
            CompileError::InvalidOperator {
                condition_index, ..
            }
            | CompileError::InvalidValue {
                condition_index, ..
            }
            | CompileError::IsAnyOfNotList {
                condition_index, ..
            } => Some(*condition_index),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CompileError {
    fn from(e: serde_json::Error) -> Self {
        CompileError::Parse {
            message: e.to_string(),
        }
    }
}

/// Violations of the structural invariants the finalized model must uphold.
///
/// These indicate a compiler bug, not bad input. Builds validate them before
/// an [`crate::EngineModel`] is handed out; hot paths only `debug_assert!`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelIntegrityError {
    /// A combination has an empty or non-strictly-increasing predicate list.
    #[error("combination {combination} has an empty or unsorted predicate list")]
    MalformedCombination { combination: u32 },

    /// A combination carries no rule binding.
    #[error("combination {combination} has no rule binding")]
    MissingRuleBinding { combination: u32 },

    /// A (combination, predicate) pair is missing from the inverted index,
    /// or present where it should not be.
    #[error("inverted index disagrees with combination {combination} on predicate {predicate}")]
    IndexMismatch { combination: u32, predicate: u32 },

    /// Combinations exist but the inverted index is empty.
    #[error("model has combinations but an empty inverted index")]
    EmptyIndex,

    /// Two registered predicates share a canonical key.
    #[error("duplicate canonical key for predicate {predicate}")]
    DuplicatePredicate { predicate: u32 },
}

/// Result alias for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        let err = CompileError::EmptyRule {
            rule_code: "R_1".to_string(),
        };
        assert_eq!(err.kind(), CompileErrorKind::EmptyRule);
        assert_eq!(err.rule_code(), Some("R_1"));
        assert_eq!(err.condition_index(), None);
    }

    #[test]
    fn condition_context_is_preserved() {
        let err = CompileError::InvalidValue {
            rule_code: "R_2".to_string(),
            condition_index: 3,
            message: "BETWEEN bounds must be numeric".to_string(),
        };
        assert_eq!(err.kind(), CompileErrorKind::InvalidValue);
        assert_eq!(err.condition_index(), Some(3));
        assert!(err.to_string().contains("R_2"));
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn json_errors_map_to_parse() {
        let json_err = serde_json::from_str::<Vec<u32>>("not json").unwrap_err();
        let err = CompileError::from(json_err);
        assert_eq!(err.kind(), CompileErrorKind::ParseError);
    }
}
