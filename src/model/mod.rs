//! The immutable compiled artifact.
//!
//! An [`EngineModel`] is a Structure-of-Arrays view of a compiled ruleset:
//! parallel arrays indexed by combination id, a deduplicated predicate
//! registry, the inverted index, and the derived base-condition and numeric
//! organizations. Models are built once per ruleset version, validated
//! against their structural invariants, and shared immutably between any
//! number of evaluators; hot reload swaps the shared reference atomically
//! while in-flight evaluations finish on the old model.
//!
//! The only interior mutability is the eligible-predicate-set cache, which
//! is content-idempotent: concurrent fills compute identical values.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::base::BaseConditionIndex;
use crate::cache::EligibleSetCache;
use crate::dictionary::Dictionary;
use crate::error::ModelIntegrityError;
use crate::event::EventEncoder;
use crate::index::InvertedIndex;
use crate::numeric::NumericIndex;
use crate::predicate::{Predicate, PredicateKey, PredicateValue};

/// One logical rule bound to a combination, in registration order.
#[derive(Debug, Clone)]
pub struct RuleBinding {
    pub code: Arc<str>,
    pub priority: i32,
    pub description: Option<Arc<str>>,
}

/// Raw compiler output, finalized into an [`EngineModel`].
pub struct ModelParts {
    pub field_dict: Dictionary,
    pub value_dict: Dictionary,
    pub predicates: Vec<Predicate>,
    pub predicate_ids: HashMap<PredicateKey, u32>,
    /// Sorted predicate ids per combination.
    pub combination_predicates: Vec<Vec<u32>>,
    /// Every logical rule that deduplicated to each combination.
    pub combination_rules: Vec<Vec<RuleBinding>>,
    pub eligible_set_capacity: usize,
    pub simd_group_threshold: usize,
}

/// Summary counts for a compiled model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub combinations: usize,
    pub unique_predicates: usize,
    pub fields: usize,
    pub interned_values: usize,
    pub index_postings: u64,
    pub base_condition_sets: usize,
    pub no_base_combinations: u64,
    pub avg_reuse_per_set: f64,
}

/// Immutable compiled ruleset. All accessors are pure and thread-safe.
pub struct EngineModel {
    field_dict: Dictionary,
    value_dict: Dictionary,

    predicates: Vec<Predicate>,
    predicate_ids: HashMap<PredicateKey, u32>,

    // SoA arrays, indexed by combination id.
    predicate_counts: Vec<u32>,
    priorities: Vec<i32>,
    rule_codes: Vec<Arc<str>>,
    combination_predicates: Vec<Vec<u32>>,
    combination_rules: Vec<Vec<RuleBinding>>,

    code_combinations: HashMap<Arc<str>, Vec<u32>>,
    inverted_index: InvertedIndex,

    /// Per field: predicate ids sorted ascending by weight.
    field_to_predicates: HashMap<u32, Vec<u32>>,
    field_min_weight: HashMap<u32, f64>,

    /// Fields carrying equality predicates on interned string values.
    interned_fields: Vec<bool>,

    base: BaseConditionIndex,
    numeric: NumericIndex,
    eligible_cache: EligibleSetCache,
}

impl EngineModel {
    /// Finalize compiler output and validate the structural invariants.
    pub fn from_parts(parts: ModelParts) -> Result<Self, ModelIntegrityError> {
        let ModelParts {
            field_dict,
            value_dict,
            predicates,
            predicate_ids,
            combination_predicates,
            combination_rules,
            eligible_set_capacity,
            simd_group_threshold,
        } = parts;

        let mut inverted_index = InvertedIndex::with_predicates(predicates.len());
        for (c, combo) in combination_predicates.iter().enumerate() {
            for &p in combo {
                inverted_index.insert(p, c as u32);
            }
        }

        let mut field_to_predicates: HashMap<u32, Vec<u32>> = HashMap::new();
        for (id, p) in predicates.iter().enumerate() {
            field_to_predicates
                .entry(p.field_id)
                .or_default()
                .push(id as u32);
        }
        for ids in field_to_predicates.values_mut() {
            ids.sort_by(|&a, &b| {
                predicates[a as usize]
                    .weight
                    .total_cmp(&predicates[b as usize].weight)
                    .then(a.cmp(&b))
            });
        }
        let field_min_weight: HashMap<u32, f64> = field_to_predicates
            .iter()
            .map(|(&f, ids)| {
                let min = ids
                    .iter()
                    .map(|&p| predicates[p as usize].weight)
                    .fold(f64::INFINITY, f64::min);
                (f, min)
            })
            .collect();

        let mut interned_fields = vec![false; field_dict.len()];
        for p in &predicates {
            if matches!(p.operator, crate::predicate::Operator::EqualTo | crate::predicate::Operator::NotEqualTo)
                && matches!(p.value, PredicateValue::StrId(_))
            {
                interned_fields[p.field_id as usize] = true;
            }
        }

        let predicate_counts: Vec<u32> = combination_predicates
            .iter()
            .map(|combo| combo.len() as u32)
            .collect();
        let priorities: Vec<i32> = combination_rules
            .iter()
            .map(|rules| rules.first().map_or(0, |r| r.priority))
            .collect();
        let rule_codes: Vec<Arc<str>> = combination_rules
            .iter()
            .map(|rules| {
                rules
                    .first()
                    .map_or_else(|| Arc::from(""), |r| Arc::clone(&r.code))
            })
            .collect();

        let mut code_combinations: HashMap<Arc<str>, Vec<u32>> = HashMap::new();
        for (c, rules) in combination_rules.iter().enumerate() {
            for binding in rules {
                code_combinations
                    .entry(Arc::clone(&binding.code))
                    .or_default()
                    .push(c as u32);
            }
        }
        for combos in code_combinations.values_mut() {
            combos.sort_unstable();
            combos.dedup();
        }

        let base = BaseConditionIndex::build(&combination_predicates, &predicates);
        let numeric = NumericIndex::build(&predicates, simd_group_threshold);

        let model = EngineModel {
            field_dict,
            value_dict,
            predicates,
            predicate_ids,
            predicate_counts,
            priorities,
            rule_codes,
            combination_predicates,
            combination_rules,
            code_combinations,
            inverted_index,
            field_to_predicates,
            field_min_weight,
            interned_fields,
            base,
            numeric,
            eligible_cache: EligibleSetCache::new(eligible_set_capacity),
        };
        model.validate()?;
        Ok(model)
    }

    /// Structural invariant validation, run once at build.
    fn validate(&self) -> Result<(), ModelIntegrityError> {
        for (c, combo) in self.combination_predicates.iter().enumerate() {
            let c32 = c as u32;
            if combo.is_empty() || combo.windows(2).any(|w| w[0] >= w[1]) {
                return Err(ModelIntegrityError::MalformedCombination { combination: c32 });
            }
            if self.combination_rules[c].is_empty() || self.rule_codes[c].is_empty() {
                return Err(ModelIntegrityError::MissingRuleBinding { combination: c32 });
            }
            for &p in combo {
                if !self.inverted_index.postings(p).contains(c32) {
                    return Err(ModelIntegrityError::IndexMismatch {
                        combination: c32,
                        predicate: p,
                    });
                }
            }
        }

        // Converse direction: a posting implies membership.
        for p in 0..self.predicates.len() as u32 {
            for c in self.inverted_index.postings(p) {
                let combo = &self.combination_predicates[c as usize];
                if combo.binary_search(&p).is_err() {
                    return Err(ModelIntegrityError::IndexMismatch {
                        combination: c,
                        predicate: p,
                    });
                }
            }
        }

        if !self.combination_predicates.is_empty() && self.inverted_index.is_empty() {
            return Err(ModelIntegrityError::EmptyIndex);
        }

        if self.predicate_ids.len() != self.predicates.len() {
            return Err(ModelIntegrityError::DuplicatePredicate {
                predicate: self.predicates.len() as u32,
            });
        }
        for (id, p) in self.predicates.iter().enumerate() {
            if self.predicate_ids.get(&p.key()) != Some(&(id as u32)) {
                return Err(ModelIntegrityError::DuplicatePredicate {
                    predicate: id as u32,
                });
            }
        }
        Ok(())
    }

    pub fn num_combinations(&self) -> usize {
        self.combination_predicates.len()
    }

    pub fn num_predicates(&self) -> usize {
        self.predicates.len()
    }

    pub fn predicate(&self, id: u32) -> &Predicate {
        &self.predicates[id as usize]
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Canonical-key lookup.
    pub fn predicate_id(&self, key: &PredicateKey) -> Option<u32> {
        self.predicate_ids.get(key).copied()
    }

    pub fn combination_predicates(&self, c: u32) -> &[u32] {
        &self.combination_predicates[c as usize]
    }

    pub fn predicate_count(&self, c: u32) -> u32 {
        self.predicate_counts[c as usize]
    }

    /// Canonical (first-registered) priority of a combination.
    pub fn priority(&self, c: u32) -> i32 {
        self.priorities[c as usize]
    }

    /// Canonical (first-registered) rule code of a combination.
    pub fn rule_code(&self, c: u32) -> &Arc<str> {
        &self.rule_codes[c as usize]
    }

    /// Every logical rule bound to a combination, in registration order.
    pub fn rules_for_combination(&self, c: u32) -> &[RuleBinding] {
        &self.combination_rules[c as usize]
    }

    /// Combinations carrying a rule code (ascending ids).
    pub fn combinations_for_code(&self, code: &str) -> &[u32] {
        self.code_combinations
            .get(code)
            .map_or(&[], Vec::as_slice)
    }

    pub fn rule_codes_iter(&self) -> impl Iterator<Item = &Arc<str>> {
        self.code_combinations.keys()
    }

    pub fn inverted_index(&self, p: u32) -> &roaring::RoaringBitmap {
        self.inverted_index.postings(p)
    }

    /// Predicate ids on a field, ascending by weight.
    pub fn field_predicates(&self, field_id: u32) -> &[u32] {
        self.field_to_predicates
            .get(&field_id)
            .map_or(&[], Vec::as_slice)
    }

    pub fn field_min_weight(&self, field_id: u32) -> Option<f64> {
        self.field_min_weight.get(&field_id).copied()
    }

    pub fn field_dict(&self) -> &Dictionary {
        &self.field_dict
    }

    pub fn value_dict(&self) -> &Dictionary {
        &self.value_dict
    }

    pub fn base(&self) -> &BaseConditionIndex {
        &self.base
    }

    pub fn numeric(&self) -> &NumericIndex {
        &self.numeric
    }

    pub fn eligible_cache(&self) -> &EligibleSetCache {
        &self.eligible_cache
    }

    /// Encoder bound to this model's dictionaries.
    pub fn encoder(&self) -> EventEncoder<'_> {
        EventEncoder::new(&self.field_dict, &self.value_dict, &self.interned_fields)
    }

    pub fn stats(&self) -> ModelStats {
        ModelStats {
            combinations: self.num_combinations(),
            unique_predicates: self.num_predicates(),
            fields: self.field_dict.len(),
            interned_values: self.value_dict.len(),
            index_postings: self.inverted_index.cardinality(),
            base_condition_sets: self.base.sets().len(),
            no_base_combinations: self.base.no_base_combinations().len(),
            avg_reuse_per_set: self.base.avg_reuse_per_set(),
        }
    }

    /// Deep structural comparison, used to assert compilation determinism.
    ///
    /// Compares ids, orderings, and payload keys; caches and derived
    /// organizations are functions of these and need no separate check.
    pub fn structurally_equal(&self, other: &EngineModel) -> bool {
        self.combination_predicates == other.combination_predicates
            && self.predicate_counts == other.predicate_counts
            && self.priorities == other.priorities
            && self.rule_codes == other.rule_codes
            && self
                .predicates
                .iter()
                .map(Predicate::key)
                .eq(other.predicates.iter().map(Predicate::key))
            && self.combination_rules.len() == other.combination_rules.len()
            && self
                .combination_rules
                .iter()
                .zip(&other.combination_rules)
                .all(|(a, b)| {
                    a.len() == b.len()
                        && a.iter()
                            .zip(b)
                            .all(|(x, y)| x.code == y.code && x.priority == y.priority)
                })
    }
}

impl std::fmt::Debug for EngineModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineModel")
            .field("combinations", &self.num_combinations())
            .field("predicates", &self.num_predicates())
            .field("base_sets", &self.base.sets().len())
            .finish()
    }
}
