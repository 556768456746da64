//! Parse-adjacent canonicalization: raw rule definitions into the
//! compiler's internal form.
//!
//! Canonicalization resolves operators, uppercases and interns field names,
//! validates every operator/value pairing, deduplicates IS_ANY_OF value
//! sets, and applies strength reduction (a one-element IS_ANY_OF becomes
//! EQUAL_TO). Disabled rules are dropped here.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use regex::Regex;

use crate::definition::{Condition, ConditionValue, RuleDefinition};
use crate::dictionary::Dictionary;
use crate::error::{CompileError, CompileResult};
use crate::predicate::Operator;

/// A scalar condition value. Equality and hashing treat floats by bit
/// pattern, so `1` (int) and `1.0` (float) stay distinct canonical values.
#[derive(Debug, Clone)]
pub(crate) enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::Int(a), Scalar::Int(b)) => a == b,
            (Scalar::Float(a), Scalar::Float(b)) => a.to_bits() == b.to_bits(),
            (Scalar::Str(a), Scalar::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Scalar {}

impl std::hash::Hash for Scalar {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Scalar::Bool(b) => (0u8, b).hash(state),
            Scalar::Int(i) => (1u8, i).hash(state),
            Scalar::Float(f) => (2u8, f.to_bits()).hash(state),
            Scalar::Str(s) => (3u8, s).hash(state),
        }
    }
}

impl Scalar {
    /// Natural comparison where defined: numerics with numerics, strings
    /// with strings, bools with bools.
    pub(crate) fn try_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
            (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Some(x.total_cmp(&y)),
                _ => None,
            },
        }
    }

    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Canonical token, used for signatures and as the stable sort
    /// fallback when elements are not mutually comparable.
    pub(crate) fn token(&self) -> String {
        match self {
            Scalar::Bool(b) => format!("b:{b}"),
            Scalar::Int(i) => format!("i:{i}"),
            Scalar::Float(f) => format!("f:{}", f.to_bits()),
            Scalar::Str(s) => format!("s:{s}"),
        }
    }
}

/// Canonical condition payload.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    None,
    Scalar(Scalar),
    Range(f64, f64),
    Set(Vec<Scalar>),
    Text(String),
    Pattern(Arc<Regex>),
}

impl Payload {
    pub(crate) fn token(&self) -> String {
        match self {
            Payload::None => "-".to_string(),
            Payload::Scalar(s) => s.token(),
            Payload::Range(lo, hi) => format!("r:{}:{}", lo.to_bits(), hi.to_bits()),
            Payload::Set(values) => {
                let mut tokens: Vec<String> = values.iter().map(Scalar::token).collect();
                tokens.sort();
                format!("set:{}", tokens.join(","))
            }
            Payload::Text(s) => format!("t:{s}"),
            Payload::Pattern(re) => format!("p:{}", re.as_str()),
        }
    }
}

/// A canonicalized condition.
///
/// `slot` identifies the authored condition it descends from. Subset
/// factoring may split one IS_ANY_OF into several conditions sharing a
/// slot; DNF expansion treats same-slot conditions as alternatives of one
/// disjunction, which is what keeps the rewrite semantics-preserving.
#[derive(Debug, Clone)]
pub(crate) struct CanonCondition {
    pub slot: u32,
    pub field_id: u32,
    pub operator: Operator,
    pub payload: Payload,
}

impl CanonCondition {
    pub(crate) fn token(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.slot,
            self.field_id,
            self.operator,
            self.payload.token()
        )
    }
}

/// A canonicalized rule.
#[derive(Debug, Clone)]
pub(crate) struct CanonRule {
    pub code: String,
    pub priority: i32,
    pub description: Option<String>,
    pub conditions: Vec<CanonCondition>,
}

impl CanonRule {
    /// Full identity token, used for factoring fixed-point detection.
    pub(crate) fn identity_token(&self) -> String {
        let mut conds: Vec<String> = self.conditions.iter().map(CanonCondition::token).collect();
        conds.sort();
        format!("{}@{}#{}", self.code, self.priority, conds.join(";"))
    }
}

/// Canonicalize one definition. `Ok(None)` means the rule is disabled.
pub(crate) fn canonicalize_rule(
    def: &RuleDefinition,
    field_dict: &mut Dictionary,
) -> CompileResult<Option<CanonRule>> {
    if !def.enabled {
        return Ok(None);
    }
    if def.conditions.is_empty() {
        return Err(CompileError::EmptyRule {
            rule_code: def.rule_code.clone(),
        });
    }

    let mut conditions = Vec::with_capacity(def.conditions.len());
    for (index, condition) in def.conditions.iter().enumerate() {
        conditions.push(canonicalize_condition(
            def,
            index,
            condition,
            field_dict,
        )?);
    }

    Ok(Some(CanonRule {
        code: def.rule_code.clone(),
        priority: def.priority,
        description: def.description.clone(),
        conditions,
    }))
}

fn canonicalize_condition(
    def: &RuleDefinition,
    index: usize,
    condition: &Condition,
    field_dict: &mut Dictionary,
) -> CompileResult<CanonCondition> {
    let invalid = |message: String| CompileError::InvalidValue {
        rule_code: def.rule_code.clone(),
        condition_index: index,
        message,
    };

    let field = condition.field.trim();
    if field.is_empty() {
        return Err(invalid("field name must not be empty".to_string()));
    }
    let field_id = field_dict.encode(&field.to_uppercase());

    let operator: Operator =
        condition
            .operator
            .parse()
            .map_err(|()| CompileError::InvalidOperator {
                rule_code: def.rule_code.clone(),
                condition_index: index,
                operator: condition.operator.clone(),
            })?;

    let (operator, payload) = match operator {
        Operator::EqualTo | Operator::NotEqualTo => {
            let scalar = expect_scalar(condition.value.as_ref())
                .map_err(|m| invalid(format!("{operator}: {m}")))?;
            (operator, Payload::Scalar(scalar))
        }
        Operator::GreaterThan | Operator::LessThan => {
            let scalar = expect_scalar(condition.value.as_ref())
                .map_err(|m| invalid(format!("{operator}: {m}")))?;
            let threshold = scalar
                .as_f64()
                .ok_or_else(|| invalid(format!("{operator} requires a numeric value")))?;
            (operator, Payload::Scalar(Scalar::Float(threshold)))
        }
        Operator::Between => {
            let Some(ConditionValue::List(items)) = condition.value.as_ref() else {
                return Err(invalid(
                    "BETWEEN requires a two-element [lo, hi] list".to_string(),
                ));
            };
            if items.len() != 2 {
                return Err(invalid(format!(
                    "BETWEEN requires exactly two bounds, got {}",
                    items.len()
                )));
            }
            let lo = numeric_item(&items[0])
                .ok_or_else(|| invalid("BETWEEN bounds must be numeric".to_string()))?;
            let hi = numeric_item(&items[1])
                .ok_or_else(|| invalid("BETWEEN bounds must be numeric".to_string()))?;
            if lo > hi {
                return Err(invalid(format!("BETWEEN bounds out of order: {lo} > {hi}")));
            }
            (operator, Payload::Range(lo, hi))
        }
        Operator::IsAnyOf => {
            let Some(ConditionValue::List(items)) = condition.value.as_ref() else {
                return Err(CompileError::IsAnyOfNotList {
                    rule_code: def.rule_code.clone(),
                    condition_index: index,
                });
            };
            if items.is_empty() {
                return Err(CompileError::IsAnyOfNotList {
                    rule_code: def.rule_code.clone(),
                    condition_index: index,
                });
            }
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                let scalar = scalar_item(item).ok_or_else(|| {
                    invalid("IS_ANY_OF elements must be scalars".to_string())
                })?;
                // Set semantics: duplicates collapse, first occurrence wins.
                if !values.contains(&scalar) {
                    values.push(scalar);
                }
            }
            if values.len() == 1 {
                // Strength reduction: one alternative is plain equality.
                let only = values.pop().expect("one element");
                (Operator::EqualTo, Payload::Scalar(only))
            } else {
                (operator, Payload::Set(values))
            }
        }
        Operator::Contains => {
            let scalar = expect_scalar(condition.value.as_ref())
                .map_err(|m| invalid(format!("CONTAINS: {m}")))?;
            let Scalar::Str(text) = scalar else {
                return Err(invalid("CONTAINS requires a string value".to_string()));
            };
            (operator, Payload::Text(text))
        }
        Operator::Regex => {
            let scalar = expect_scalar(condition.value.as_ref())
                .map_err(|m| invalid(format!("REGEX: {m}")))?;
            let Scalar::Str(pattern) = scalar else {
                return Err(invalid("REGEX requires a string pattern".to_string()));
            };
            let compiled = Regex::new(&pattern)
                .map_err(|e| invalid(format!("invalid regex pattern: {e}")))?;
            (operator, Payload::Pattern(Arc::new(compiled)))
        }
        Operator::IsNull | Operator::IsNotNull => {
            if condition.value.is_some() {
                return Err(invalid(format!("{operator} takes no value")));
            }
            (operator, Payload::None)
        }
    };

    Ok(CanonCondition {
        slot: index as u32,
        field_id,
        operator,
        payload,
    })
}

fn expect_scalar(value: Option<&ConditionValue>) -> Result<Scalar, String> {
    match value {
        None => Err("missing value".to_string()),
        Some(v) => scalar_item(v).ok_or_else(|| "value must be a scalar".to_string()),
    }
}

fn scalar_item(value: &ConditionValue) -> Option<Scalar> {
    match value {
        ConditionValue::Bool(b) => Some(Scalar::Bool(*b)),
        ConditionValue::Int(i) => Some(Scalar::Int(*i)),
        ConditionValue::Float(f) => Some(Scalar::Float(*f)),
        ConditionValue::Str(s) => Some(Scalar::Str(s.clone())),
        ConditionValue::List(_) => None,
    }
}

fn numeric_item(value: &ConditionValue) -> Option<f64> {
    match value {
        ConditionValue::Int(i) => Some(*i as f64),
        ConditionValue::Float(f) => Some(*f),
        _ => None,
    }
}

/// Sort a value set: natural order when all elements are mutually
/// comparable, otherwise a stable fallback on canonical tokens.
pub(crate) fn sort_scalars(values: &mut [Scalar]) {
    let comparable = values
        .windows(2)
        .all(|w| w[0].try_cmp(&w[1]).is_some())
        && values
            .first()
            .map_or(true, |first| values.iter().all(|v| first.try_cmp(v).is_some()));
    if comparable {
        values.sort_by(|a, b| a.try_cmp(b).unwrap_or(CmpOrdering::Equal));
    } else {
        values.sort_by_key(Scalar::token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::RuleDefinition;

    fn def(conditions: Vec<Condition>) -> RuleDefinition {
        RuleDefinition {
            rule_code: "R_T".to_string(),
            priority: 1,
            description: None,
            enabled: true,
            conditions,
        }
    }

    fn cond(field: &str, operator: &str, value: Option<ConditionValue>) -> Condition {
        Condition {
            field: field.to_string(),
            operator: operator.to_string(),
            value,
        }
    }

    #[test]
    fn disabled_rules_canonicalize_to_none() {
        let mut rule = def(vec![cond(
            "A",
            "IS_NULL",
            None,
        )]);
        rule.enabled = false;
        let result = canonicalize_rule(&rule, &mut Dictionary::new()).expect("ok");
        assert!(result.is_none());
    }

    #[test]
    fn empty_conditions_are_rejected() {
        let err = canonicalize_rule(&def(vec![]), &mut Dictionary::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::CompileErrorKind::EmptyRule);
    }

    #[test]
    fn fields_are_uppercased_and_interned() {
        let mut dict = Dictionary::new();
        let rule = canonicalize_rule(
            &def(vec![cond("amount", "GREATER_THAN", Some(ConditionValue::Int(5)))]),
            &mut dict,
        )
        .expect("ok")
        .expect("enabled");
        assert_eq!(dict.decode(rule.conditions[0].field_id), Some("AMOUNT"));
        // GT thresholds canonicalize to floats.
        assert!(matches!(
            rule.conditions[0].payload,
            Payload::Scalar(Scalar::Float(_))
        ));
    }

    #[test]
    fn unknown_operator_is_invalid_operator() {
        let err = canonicalize_rule(
            &def(vec![cond("A", "LOOKS_LIKE", None)]),
            &mut Dictionary::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::CompileErrorKind::InvalidOperator);
        assert_eq!(err.condition_index(), Some(0));
    }

    #[test]
    fn between_validation() {
        let bad_order = def(vec![cond(
            "A",
            "BETWEEN",
            Some(ConditionValue::List(vec![
                ConditionValue::Int(10),
                ConditionValue::Int(5),
            ])),
        )]);
        let err = canonicalize_rule(&bad_order, &mut Dictionary::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::CompileErrorKind::InvalidValue);

        let not_list = def(vec![cond("A", "BETWEEN", Some(ConditionValue::Int(10)))]);
        let err = canonicalize_rule(&not_list, &mut Dictionary::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::CompileErrorKind::InvalidValue);
    }

    #[test]
    fn is_any_of_must_be_a_nonempty_list() {
        for value in [None, Some(ConditionValue::Str("US".into())), Some(ConditionValue::List(vec![]))] {
            let err = canonicalize_rule(
                &def(vec![cond("C", "IS_ANY_OF", value)]),
                &mut Dictionary::new(),
            )
            .unwrap_err();
            assert_eq!(err.kind(), crate::error::CompileErrorKind::IsAnyOfNotList);
        }
    }

    #[test]
    fn single_element_any_of_strength_reduces() {
        let rule = canonicalize_rule(
            &def(vec![cond(
                "C",
                "IS_ANY_OF",
                Some(ConditionValue::List(vec![ConditionValue::Str("US".into())])),
            )]),
            &mut Dictionary::new(),
        )
        .expect("ok")
        .expect("enabled");
        assert_eq!(rule.conditions[0].operator, Operator::EqualTo);
    }

    #[test]
    fn any_of_duplicates_collapse() {
        let rule = canonicalize_rule(
            &def(vec![cond(
                "C",
                "IS_ANY_OF",
                Some(ConditionValue::List(vec![
                    ConditionValue::Str("US".into()),
                    ConditionValue::Str("CA".into()),
                    ConditionValue::Str("US".into()),
                ])),
            )]),
            &mut Dictionary::new(),
        )
        .expect("ok")
        .expect("enabled");
        match &rule.conditions[0].payload {
            Payload::Set(values) => assert_eq!(values.len(), 2),
            other => panic!("expected set payload, got {other:?}"),
        }
    }

    #[test]
    fn null_operators_reject_values() {
        let err = canonicalize_rule(
            &def(vec![cond("A", "IS_NULL", Some(ConditionValue::Bool(true)))]),
            &mut Dictionary::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::CompileErrorKind::InvalidValue);
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = canonicalize_rule(
            &def(vec![cond(
                "A",
                "REGEX",
                Some(ConditionValue::Str("[unclosed".into())),
            )]),
            &mut Dictionary::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::CompileErrorKind::InvalidValue);
    }

    #[test]
    fn scalar_sorting_is_natural_then_token_fallback() {
        let mut numeric = vec![Scalar::Int(3), Scalar::Float(1.5), Scalar::Int(2)];
        sort_scalars(&mut numeric);
        assert_eq!(
            numeric,
            vec![Scalar::Float(1.5), Scalar::Int(2), Scalar::Int(3)]
        );

        let mut mixed = vec![Scalar::Str("b".into()), Scalar::Int(1), Scalar::Str("a".into())];
        sort_scalars(&mut mixed);
        // Token fallback is stable and deterministic: ints before strings.
        assert_eq!(
            mixed,
            vec![Scalar::Int(1), Scalar::Str("a".into()), Scalar::Str("b".into())]
        );
    }
}
