//! Subset factoring of IS_ANY_OF value sets.
//!
//! Rules that differ only in their IS_ANY_OF values frequently share a large
//! common subset of those values. Factoring rewrites each such group so the
//! shared subset appears as its own condition: the rewritten alternatives
//! produce identical predicates (and therefore identical combinations)
//! across rules, which combination deduplication then merges into shared
//! entries with multi-rule bindings.
//!
//! The rewrite splits one IS_ANY_OF condition into a shared part and a
//! remainder carrying the same slot; expansion unions same-slot
//! alternatives, so the split never changes which events a rule matches.
//!
//! The pass iterates to a fixed point: it stops when a full pass leaves the
//! rule set unchanged (by canonical identity).

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::predicate::Operator;

use super::canon::{sort_scalars, CanonCondition, CanonRule, Payload, Scalar};

/// Safety valve; factoring converges long before this in practice.
const MAX_PASSES: u32 = 32;

#[derive(Debug)]
pub(crate) struct FactoringOutcome {
    pub rules: Vec<CanonRule>,
    pub passes: u32,
    pub rewrites: u32,
}

/// Run the factoring loop to fixed point.
pub(crate) fn factor_rules(mut rules: Vec<CanonRule>) -> FactoringOutcome {
    let mut passes = 0;
    let mut rewrites = 0;

    while passes < MAX_PASSES {
        let before: BTreeSet<String> = rules.iter().map(CanonRule::identity_token).collect();
        let (next, pass_rewrites) = factor_pass(rules);
        rules = next;
        passes += 1;
        rewrites += pass_rewrites;

        let after: BTreeSet<String> = rules.iter().map(CanonRule::identity_token).collect();
        if before == after {
            break;
        }
    }

    debug!(passes, rewrites, "factoring reached fixed point");
    FactoringOutcome {
        rules,
        passes,
        rewrites,
    }
}

/// One full pass: group by signature, factor each group once.
fn factor_pass(rules: Vec<CanonRule>) -> (Vec<CanonRule>, u32) {
    // Signature: the multiset of non-IS_ANY_OF conditions.
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, rule) in rules.iter().enumerate() {
        groups.entry(signature(rule)).or_default().push(i);
    }

    let mut rules: Vec<CanonRule> = rules;
    let mut rewrites = 0;
    for members in groups.values() {
        if members.len() < 2 {
            continue;
        }
        if let Some((field_id, shared)) = find_shared_subset(&rules, members) {
            for &i in members {
                rewrite_rule(&mut rules[i], field_id, &shared);
            }
            rewrites += 1;
        }
    }
    (rules, rewrites)
}

fn signature(rule: &CanonRule) -> String {
    let mut tokens: Vec<String> = rule
        .conditions
        .iter()
        .filter(|c| c.operator != Operator::IsAnyOf)
        .map(|c| format!("{}|{}|{}", c.field_id, c.operator, c.payload.token()))
        .collect();
    tokens.sort();
    tokens.join(";")
}

/// The single IS_ANY_OF set a rule carries on `field_id`, if exactly one.
///
/// Fields already split by a previous pass carry several same-field
/// conditions and are excluded, which is what lets the loop terminate.
fn single_set_on_field(rule: &CanonRule, field_id: u32) -> Option<&Vec<Scalar>> {
    let mut found = None;
    for condition in &rule.conditions {
        if condition.field_id != field_id {
            continue;
        }
        match (&condition.payload, condition.operator) {
            (Payload::Set(values), Operator::IsAnyOf) => {
                if found.is_some() {
                    return None;
                }
                found = Some(values);
            }
            _ => return None,
        }
    }
    found
}

/// Find a field present as one IS_ANY_OF in every group member whose value
/// intersection has at least two elements. Fields are tried in ascending id
/// order for determinism.
fn find_shared_subset(rules: &[CanonRule], members: &[usize]) -> Option<(u32, Vec<Scalar>)> {
    let first = &rules[members[0]];
    let mut candidate_fields: Vec<u32> = first
        .conditions
        .iter()
        .filter(|c| c.operator == Operator::IsAnyOf)
        .map(|c| c.field_id)
        .collect();
    candidate_fields.sort_unstable();
    candidate_fields.dedup();

    for field_id in candidate_fields {
        let Some(first_set) = single_set_on_field(first, field_id) else {
            continue;
        };
        let mut intersection: Vec<Scalar> = first_set.clone();
        let mut all_have_field = true;
        for &i in &members[1..] {
            match single_set_on_field(&rules[i], field_id) {
                Some(set) => intersection.retain(|v| set.contains(v)),
                None => {
                    all_have_field = false;
                    break;
                }
            }
        }
        if !all_have_field || intersection.len() < 2 {
            continue;
        }
        // A shared set equal to every member's full set is already factored;
        // rewriting would churn without progress.
        let already_factored = members
            .iter()
            .all(|&i| single_set_on_field(&rules[i], field_id).map_or(false, |s| s.len() == intersection.len()));
        if already_factored {
            continue;
        }
        sort_scalars(&mut intersection);
        return Some((field_id, intersection));
    }
    None
}

/// Replace the rule's IS_ANY_OF on `field_id` with the shared set plus the
/// remainder (EQUAL_TO for one leftover value, IS_ANY_OF otherwise), both
/// keeping the original slot.
fn rewrite_rule(rule: &mut CanonRule, field_id: u32, shared: &[Scalar]) {
    let position = rule
        .conditions
        .iter()
        .position(|c| {
            c.field_id == field_id
                && c.operator == Operator::IsAnyOf
                && matches!(c.payload, Payload::Set(_))
        })
        .expect("group membership guarantees the condition");
    let original = rule.conditions.remove(position);
    let slot = original.slot;
    let Payload::Set(values) = original.payload else {
        unreachable!("position() matched a set payload");
    };

    let mut remainder: Vec<Scalar> = values.into_iter().filter(|v| !shared.contains(v)).collect();
    sort_scalars(&mut remainder);

    let mut replacement = vec![CanonCondition {
        slot,
        field_id,
        operator: Operator::IsAnyOf,
        payload: Payload::Set(shared.to_vec()),
    }];
    match remainder.len() {
        0 => {}
        1 => replacement.push(CanonCondition {
            slot,
            field_id,
            operator: Operator::EqualTo,
            payload: Payload::Scalar(remainder.pop().expect("one element")),
        }),
        _ => replacement.push(CanonCondition {
            slot,
            field_id,
            operator: Operator::IsAnyOf,
            payload: Payload::Set(remainder),
        }),
    }

    // Splice in place so slot ordering stays stable.
    for (offset, condition) in replacement.into_iter().enumerate() {
        rule.conditions.insert(position + offset, condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_rule(code: &str, extra_token: f64, values: &[&str]) -> CanonRule {
        CanonRule {
            code: code.to_string(),
            priority: 0,
            description: None,
            conditions: vec![
                CanonCondition {
                    slot: 0,
                    field_id: 0,
                    operator: Operator::GreaterThan,
                    payload: Payload::Scalar(Scalar::Float(extra_token)),
                },
                CanonCondition {
                    slot: 1,
                    field_id: 1,
                    operator: Operator::IsAnyOf,
                    payload: Payload::Set(
                        values.iter().map(|v| Scalar::Str((*v).to_string())).collect(),
                    ),
                },
            ],
        }
    }

    fn sets_on_field(rule: &CanonRule, field_id: u32) -> Vec<Vec<String>> {
        rule.conditions
            .iter()
            .filter(|c| c.field_id == field_id)
            .map(|c| match &c.payload {
                Payload::Set(values) => values
                    .iter()
                    .map(|v| match v {
                        Scalar::Str(s) => s.clone(),
                        other => other.token(),
                    })
                    .collect(),
                Payload::Scalar(Scalar::Str(s)) => vec![s.clone()],
                other => vec![format!("{other:?}")],
            })
            .collect()
    }

    #[test]
    fn shared_subset_is_exposed() {
        let rules = vec![
            set_rule("R4", 10.0, &["US", "CA", "UK"]),
            set_rule("R5", 10.0, &["US", "CA", "MX"]),
        ];
        let outcome = factor_rules(rules);
        assert!(outcome.rewrites >= 1);

        for rule in &outcome.rules {
            let sets = sets_on_field(rule, 1);
            assert_eq!(sets.len(), 2, "split into shared + remainder");
            // Shared intersection, sorted naturally.
            assert_eq!(sets[0], vec!["CA".to_string(), "US".to_string()]);
        }
        let r4 = outcome.rules.iter().find(|r| r.code == "R4").expect("R4");
        assert_eq!(sets_on_field(r4, 1)[1], vec!["UK".to_string()]);
        // Split conditions keep the originating slot.
        assert!(r4.conditions[1..].iter().all(|c| c.slot == 1));
    }

    #[test]
    fn groups_require_matching_signatures() {
        // Different GT thresholds put the rules in different groups.
        let rules = vec![
            set_rule("R1", 10.0, &["US", "CA", "UK"]),
            set_rule("R2", 20.0, &["US", "CA", "MX"]),
        ];
        let outcome = factor_rules(rules);
        assert_eq!(outcome.rewrites, 0);
    }

    #[test]
    fn small_intersections_are_left_alone() {
        let rules = vec![
            set_rule("R1", 10.0, &["US", "FR"]),
            set_rule("R2", 10.0, &["US", "DE"]),
        ];
        let outcome = factor_rules(rules);
        assert_eq!(outcome.rewrites, 0);
    }

    #[test]
    fn identical_sets_reach_fixed_point_without_churn() {
        let rules = vec![
            set_rule("R1", 10.0, &["US", "CA"]),
            set_rule("R2", 10.0, &["US", "CA"]),
        ];
        let outcome = factor_rules(rules);
        assert!(outcome.passes <= 2);
        for rule in &outcome.rules {
            assert_eq!(sets_on_field(rule, 1).len(), 1);
        }
    }

    #[test]
    fn factoring_twice_is_factoring_once() {
        let rules = vec![
            set_rule("R4", 10.0, &["US", "CA", "UK"]),
            set_rule("R5", 10.0, &["US", "CA", "MX"]),
        ];
        let once = factor_rules(rules);
        let once_tokens: BTreeSet<String> =
            once.rules.iter().map(CanonRule::identity_token).collect();
        let twice = factor_rules(once.rules);
        let twice_tokens: BTreeSet<String> =
            twice.rules.iter().map(CanonRule::identity_token).collect();
        assert_eq!(once_tokens, twice_tokens);
    }
}
