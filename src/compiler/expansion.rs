//! DNF expansion: one combination per point in the cartesian product of a
//! rule's disjunctions.
//!
//! Conditions are grouped by slot (the authored condition they descend
//! from). A slot's alternatives are the union of its conditions' leaves: an
//! IS_ANY_OF contributes one EQUAL_TO leaf per value, anything else
//! contributes itself. Expansion walks the product of slots in slot order,
//! alternatives in listed order, so combination registration order is
//! deterministic.

use std::collections::BTreeMap;

use crate::error::{CompileError, CompileResult};
use crate::predicate::Operator;

use super::canon::{CanonRule, Payload};

/// One fully-conjunctive leaf condition.
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    pub field_id: u32,
    pub operator: Operator,
    pub payload: Payload,
}

/// Expand a rule into its conjunctive combinations.
///
/// Fails when the product exceeds `max_expansions` (a rule authored with
/// huge IS_ANY_OF lists on several fields).
pub(crate) fn expand_rule(rule: &CanonRule, max_expansions: usize) -> CompileResult<Vec<Vec<Leaf>>> {
    let mut slots: BTreeMap<u32, Vec<Leaf>> = BTreeMap::new();
    for condition in &rule.conditions {
        let alternatives = slots.entry(condition.slot).or_default();
        match (&condition.payload, condition.operator) {
            (Payload::Set(values), Operator::IsAnyOf) => {
                for value in values {
                    alternatives.push(Leaf {
                        field_id: condition.field_id,
                        operator: Operator::EqualTo,
                        payload: Payload::Scalar(value.clone()),
                    });
                }
            }
            _ => alternatives.push(Leaf {
                field_id: condition.field_id,
                operator: condition.operator,
                payload: condition.payload.clone(),
            }),
        }
    }

    let mut total: usize = 1;
    for (slot, alternatives) in &slots {
        total = total.saturating_mul(alternatives.len());
        if total > max_expansions {
            return Err(CompileError::InvalidValue {
                rule_code: rule.code.clone(),
                condition_index: *slot as usize,
                message: format!(
                    "rule expands to more than {max_expansions} combinations"
                ),
            });
        }
    }

    let mut combinations: Vec<Vec<Leaf>> = vec![Vec::with_capacity(slots.len())];
    for alternatives in slots.values() {
        let mut next = Vec::with_capacity(combinations.len() * alternatives.len());
        for prefix in &combinations {
            for alternative in alternatives {
                let mut combo = prefix.clone();
                combo.push(alternative.clone());
                next.push(combo);
            }
        }
        combinations = next;
    }
    Ok(combinations)
}

/// Expansion count without materializing, for the validation-only path.
pub(crate) fn expansion_count(rule: &CanonRule) -> usize {
    let mut slots: BTreeMap<u32, usize> = BTreeMap::new();
    for condition in &rule.conditions {
        let n = match (&condition.payload, condition.operator) {
            (Payload::Set(values), Operator::IsAnyOf) => values.len(),
            _ => 1,
        };
        *slots.entry(condition.slot).or_default() += n;
    }
    slots.values().fold(1usize, |acc, &n| acc.saturating_mul(n))
}
