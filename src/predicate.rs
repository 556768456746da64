//! Atomic conditions and their evaluation semantics.
//!
//! A [`Predicate`] is the compiled form of one condition: `(field_id,
//! operator, value)` plus selectivity metadata. Identity for deduplication is
//! the canonical [`PredicateKey`], which ignores weight and selectivity and
//! projects non-hashable payloads (floats, compiled regexes) onto hashable
//! forms.
//!
//! Evaluation is defensive throughout: a missing attribute, a type mismatch,
//! or a non-string value under CONTAINS/REGEX makes the predicate false,
//! never an error.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dictionary::Dictionary;
use crate::event::EncodedValue;

/// Condition operators accepted in rule files.
///
/// `IS_ANY_OF` exists only in source form; compilation eliminates it by
/// expanding it into `EQUAL_TO` alternatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    EqualTo,
    NotEqualTo,
    GreaterThan,
    LessThan,
    Between,
    IsAnyOf,
    Contains,
    Regex,
    IsNull,
    IsNotNull,
}

impl Operator {
    /// Static operators feed base-condition clustering.
    pub fn is_static(self) -> bool {
        matches!(
            self,
            Operator::EqualTo | Operator::NotEqualTo | Operator::IsNull | Operator::IsNotNull
        )
    }

    /// Operators eligible for batched numeric evaluation.
    pub fn is_numeric_range(self) -> bool {
        matches!(
            self,
            Operator::GreaterThan | Operator::LessThan | Operator::Between
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::EqualTo => "EQUAL_TO",
            Operator::NotEqualTo => "NOT_EQUAL_TO",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::LessThan => "LESS_THAN",
            Operator::Between => "BETWEEN",
            Operator::IsAnyOf => "IS_ANY_OF",
            Operator::Contains => "CONTAINS",
            Operator::Regex => "REGEX",
            Operator::IsNull => "IS_NULL",
            Operator::IsNotNull => "IS_NOT_NULL",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EQUAL_TO" => Ok(Operator::EqualTo),
            "NOT_EQUAL_TO" => Ok(Operator::NotEqualTo),
            "GREATER_THAN" => Ok(Operator::GreaterThan),
            "LESS_THAN" => Ok(Operator::LessThan),
            "BETWEEN" => Ok(Operator::Between),
            "IS_ANY_OF" => Ok(Operator::IsAnyOf),
            "CONTAINS" => Ok(Operator::Contains),
            "REGEX" => Ok(Operator::Regex),
            "IS_NULL" => Ok(Operator::IsNull),
            "IS_NOT_NULL" => Ok(Operator::IsNotNull),
            _ => Err(()),
        }
    }
}

/// Compiled predicate payload. Shape depends on the operator.
#[derive(Debug, Clone)]
pub enum PredicateValue {
    /// IS_NULL / IS_NOT_NULL carry no value.
    None,
    /// Interned string for EQUAL_TO / NOT_EQUAL_TO.
    StrId(u32),
    Bool(bool),
    Int(i64),
    /// Numeric scalar: EQUAL_TO/NOT_EQUAL_TO floats and GT/LT thresholds.
    Float(f64),
    /// Inclusive BETWEEN bounds, `lo <= hi` guaranteed by validation.
    Range(f64, f64),
    /// Raw substring for CONTAINS (never dictionary-encoded).
    Text(String),
    /// Compiled pattern for REGEX.
    Pattern(Arc<Regex>),
}

/// Hashable projection of a predicate value for canonical identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    None,
    StrId(u32),
    Bool(bool),
    Int(i64),
    F64(u64),
    Range(u64, u64),
    Text(String),
    Pattern(String),
}

/// Canonical predicate identity: `(field_id, operator, value)`.
///
/// Weight and selectivity are metadata and deliberately excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PredicateKey {
    pub field_id: u32,
    pub operator: Operator,
    pub value: ValueKey,
}

/// Why a predicate check failed (or `Ok` when it passed). Used by explain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckReason {
    Ok,
    ValueMismatch,
    FieldMissing,
    TypeMismatch,
    RangeViolation,
    RegexNoMatch,
}

impl fmt::Display for CheckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckReason::Ok => "ok",
            CheckReason::ValueMismatch => "value_mismatch",
            CheckReason::FieldMissing => "field_missing",
            CheckReason::TypeMismatch => "type_mismatch",
            CheckReason::RangeViolation => "range_violation",
            CheckReason::RegexNoMatch => "regex_no_match",
        };
        f.write_str(s)
    }
}

/// An immutable compiled condition.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub field_id: u32,
    pub operator: Operator,
    pub value: PredicateValue,
    /// `1 - selectivity`; orders predicates within a field.
    pub weight: f64,
    /// Estimated fraction of events that satisfy this predicate, in `(0, 1]`.
    pub selectivity: f64,
}

impl Predicate {
    /// Canonical key for deduplication.
    pub fn key(&self) -> PredicateKey {
        let value = match &self.value {
            PredicateValue::None => ValueKey::None,
            PredicateValue::StrId(id) => ValueKey::StrId(*id),
            PredicateValue::Bool(b) => ValueKey::Bool(*b),
            PredicateValue::Int(i) => ValueKey::Int(*i),
            PredicateValue::Float(f) => ValueKey::F64(f.to_bits()),
            PredicateValue::Range(lo, hi) => ValueKey::Range(lo.to_bits(), hi.to_bits()),
            PredicateValue::Text(s) => ValueKey::Text(s.clone()),
            PredicateValue::Pattern(re) => ValueKey::Pattern(re.as_str().to_string()),
        };
        PredicateKey {
            field_id: self.field_id,
            operator: self.operator,
            value,
        }
    }

    /// Evaluate against an encoded attribute value (`None` = field missing).
    pub fn evaluate(&self, value: Option<&EncodedValue>, values: &Dictionary) -> bool {
        self.check(value, values) == CheckReason::Ok
    }

    /// Evaluate and classify the outcome for explanations.
    pub fn check(&self, value: Option<&EncodedValue>, values: &Dictionary) -> CheckReason {
        match self.operator {
            Operator::IsNull => match value {
                Some(EncodedValue::Null) => CheckReason::Ok,
                Some(_) => CheckReason::ValueMismatch,
                None => CheckReason::FieldMissing,
            },
            Operator::IsNotNull => match value {
                Some(EncodedValue::Null) => CheckReason::ValueMismatch,
                Some(_) => CheckReason::Ok,
                None => CheckReason::FieldMissing,
            },
            _ => {
                let Some(value) = value else {
                    return CheckReason::FieldMissing;
                };
                self.check_present(value, values)
            }
        }
    }

    fn check_present(&self, value: &EncodedValue, values: &Dictionary) -> CheckReason {
        match self.operator {
            Operator::EqualTo => match self.equals(value, values) {
                Some(true) => CheckReason::Ok,
                Some(false) => CheckReason::ValueMismatch,
                None => CheckReason::TypeMismatch,
            },
            Operator::NotEqualTo => match self.equals(value, values) {
                Some(false) => CheckReason::Ok,
                Some(true) => CheckReason::ValueMismatch,
                None => CheckReason::TypeMismatch,
            },
            Operator::GreaterThan => {
                let (PredicateValue::Float(threshold), Some(v)) = (&self.value, value.as_f64())
                else {
                    return CheckReason::TypeMismatch;
                };
                if v > *threshold {
                    CheckReason::Ok
                } else {
                    CheckReason::ValueMismatch
                }
            }
            Operator::LessThan => {
                let (PredicateValue::Float(threshold), Some(v)) = (&self.value, value.as_f64())
                else {
                    return CheckReason::TypeMismatch;
                };
                if v < *threshold {
                    CheckReason::Ok
                } else {
                    CheckReason::ValueMismatch
                }
            }
            Operator::Between => {
                let (PredicateValue::Range(lo, hi), Some(v)) = (&self.value, value.as_f64()) else {
                    return CheckReason::TypeMismatch;
                };
                if v >= *lo && v <= *hi {
                    CheckReason::Ok
                } else {
                    CheckReason::RangeViolation
                }
            }
            Operator::Contains => {
                let (PredicateValue::Text(needle), Some(haystack)) =
                    (&self.value, value.as_str(values))
                else {
                    return CheckReason::TypeMismatch;
                };
                if haystack.contains(needle.as_str()) {
                    CheckReason::Ok
                } else {
                    CheckReason::ValueMismatch
                }
            }
            Operator::Regex => {
                let (PredicateValue::Pattern(re), Some(text)) = (&self.value, value.as_str(values))
                else {
                    return CheckReason::TypeMismatch;
                };
                if re.is_match(text) {
                    CheckReason::Ok
                } else {
                    CheckReason::RegexNoMatch
                }
            }
            // IS_ANY_OF never survives compilation; IS_NULL/IS_NOT_NULL are
            // handled before the value is unwrapped.
            Operator::IsAnyOf | Operator::IsNull | Operator::IsNotNull => {
                CheckReason::TypeMismatch
            }
        }
    }

    /// Three-valued equality: `None` means the operands are not comparable.
    fn equals(&self, value: &EncodedValue, values: &Dictionary) -> Option<bool> {
        match (&self.value, value) {
            (PredicateValue::StrId(id), EncodedValue::StrId(e)) => Some(id == e),
            // Raw event string: compare through the dictionary. A string the
            // dictionary never saw cannot equal any interned predicate value.
            (PredicateValue::StrId(id), EncodedValue::Str(s)) => {
                Some(values.decode(*id) == Some(s.as_str()))
            }
            (PredicateValue::Bool(b), EncodedValue::Bool(e)) => Some(b == e),
            (PredicateValue::Int(i), EncodedValue::Int(e)) => Some(i == e),
            (PredicateValue::Int(i), EncodedValue::Float(e)) => Some((*i as f64) == *e),
            (PredicateValue::Float(f), EncodedValue::Int(e)) => Some(*f == (*e as f64)),
            (PredicateValue::Float(f), EncodedValue::Float(e)) => Some(f == e),
            _ => None,
        }
    }

    /// Human-readable expected value, used by explanations.
    pub fn expected_repr(&self, values: &Dictionary) -> String {
        match (self.operator, &self.value) {
            (Operator::EqualTo, v) => format!("={}", value_repr(v, values)),
            (Operator::NotEqualTo, v) => format!("!={}", value_repr(v, values)),
            (Operator::GreaterThan, PredicateValue::Float(t)) => format!(">{}", num_repr(*t)),
            (Operator::LessThan, PredicateValue::Float(t)) => format!("<{}", num_repr(*t)),
            (Operator::Between, PredicateValue::Range(lo, hi)) => {
                format!("[{}, {}]", num_repr(*lo), num_repr(*hi))
            }
            (Operator::Contains, PredicateValue::Text(s)) => format!("contains '{s}'"),
            (Operator::Regex, PredicateValue::Pattern(re)) => format!("matches /{}/", re.as_str()),
            (Operator::IsNull, _) => "null".to_string(),
            (Operator::IsNotNull, _) => "not null".to_string(),
            (op, v) => format!("{op} {}", value_repr(v, values)),
        }
    }
}

fn value_repr(value: &PredicateValue, values: &Dictionary) -> String {
    match value {
        PredicateValue::None => "-".to_string(),
        PredicateValue::StrId(id) => values.decode(*id).unwrap_or("?").to_string(),
        PredicateValue::Bool(b) => b.to_string(),
        PredicateValue::Int(i) => i.to_string(),
        PredicateValue::Float(f) => num_repr(*f),
        PredicateValue::Range(lo, hi) => format!("[{}, {}]", num_repr(*lo), num_repr(*hi)),
        PredicateValue::Text(s) => format!("'{s}'"),
        PredicateValue::Pattern(re) => format!("/{}/", re.as_str()),
    }
}

/// Render a float without a trailing `.0` when it is integral.
pub(crate) fn num_repr(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}
