//! Base-condition clustering and per-event eligibility.
//!
//! The static prefix of a conjunction (equality/nullity predicates) is
//! shared across many rules in realistic rulesets. Combinations are grouped
//! by their exact static-predicate set; each group is evaluated once per
//! event and its outcome gates every combination in the group. Outcomes are
//! cached per event shape under a content fingerprint, so repeated traffic
//! skips static predicates entirely.
//!
//! # Architecture
//!
//! ```text
//! BaseConditionIndex                 (built once per model)
//!   |-- sets: Vec<BaseConditionSet>  (sorted by avg selectivity)
//!   `-- no_base: RoaringBitmap      (combinations with no static prefix)
//!
//! BaseConditionEvaluator             (per evaluator)
//!   |-- BaseConditionCache           (fingerprint -> eligibility bitmap)
//!   `-- evaluate(): filter sets -> cache lookup -> evaluate on miss
//! ```

pub(crate) mod fingerprint;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use roaring::RoaringBitmap;
use tracing::trace;

use crate::cache::BaseConditionCache;
use crate::clock::Clock;
use crate::evaluator::context::EvaluationContext;
use crate::event::EncodedEvent;
use crate::model::EngineModel;
use crate::predicate::Predicate;

/// One group of combinations sharing an exact static-predicate set.
#[derive(Debug, Clone)]
pub struct BaseConditionSet {
    pub id: u32,
    /// Sorted, deduplicated static predicate ids.
    pub static_predicate_ids: Vec<u32>,
    /// Distinct fields the static predicates reference, sorted.
    pub fields: Vec<u32>,
    /// Combinations gated by this set.
    pub affected_combinations: RoaringBitmap,
    /// Mean selectivity of the static predicates; drives evaluation order.
    pub avg_selectivity: f64,
}

/// All base-condition sets of a model.
#[derive(Debug, Clone, Default)]
pub struct BaseConditionIndex {
    /// Sorted ascending by `avg_selectivity` (most selective first).
    sets: Vec<BaseConditionSet>,
    /// Combinations with no static predicates: always eligible.
    no_base: RoaringBitmap,
}

impl BaseConditionIndex {
    /// Group combinations by their static-predicate sets.
    ///
    /// Set identity uses a 64-bit FNV-1a hash over the sorted ids. A hash
    /// collision between distinct sets moves the newcomer to a second slot
    /// under an alternate-basis hash; membership is always confirmed by set
    /// equality before reuse.
    pub fn build(combination_predicates: &[Vec<u32>], predicates: &[Predicate]) -> Self {
        let mut by_primary: HashMap<u64, usize> = HashMap::new();
        let mut by_alternate: HashMap<u64, usize> = HashMap::new();
        let mut raw: Vec<(Vec<u32>, RoaringBitmap)> = Vec::new();
        let mut no_base = RoaringBitmap::new();

        for (c, combo) in combination_predicates.iter().enumerate() {
            let c = c as u32;
            let static_ids: Vec<u32> = combo
                .iter()
                .copied()
                .filter(|&p| predicates[p as usize].operator.is_static())
                .collect();
            if static_ids.is_empty() {
                no_base.insert(c);
                continue;
            }

            let primary = fingerprint::set_hash(&static_ids);
            let slot = match by_primary.get(&primary) {
                None => {
                    let idx = raw.len();
                    by_primary.insert(primary, idx);
                    raw.push((static_ids, RoaringBitmap::new()));
                    idx
                }
                Some(&idx) if raw[idx].0 == static_ids => idx,
                Some(_) => {
                    // Primary collision with a different set: alternate slot.
                    let alternate = fingerprint::set_hash_alt(&static_ids);
                    match by_alternate.get(&alternate) {
                        Some(&idx) if raw[idx].0 == static_ids => idx,
                        _ => match raw.iter().position(|(ids, _)| *ids == static_ids) {
                            Some(idx) => idx,
                            None => {
                                let idx = raw.len();
                                by_alternate.entry(alternate).or_insert(idx);
                                raw.push((static_ids, RoaringBitmap::new()));
                                idx
                            }
                        },
                    }
                }
            };
            raw[slot].1.insert(c);
        }

        let mut sets: Vec<BaseConditionSet> = raw
            .into_iter()
            .map(|(static_ids, affected)| {
                let avg_selectivity = static_ids
                    .iter()
                    .map(|&p| predicates[p as usize].selectivity)
                    .sum::<f64>()
                    / static_ids.len() as f64;
                let mut fields: Vec<u32> = static_ids
                    .iter()
                    .map(|&p| predicates[p as usize].field_id)
                    .collect();
                fields.sort_unstable();
                fields.dedup();
                BaseConditionSet {
                    id: 0,
                    static_predicate_ids: static_ids,
                    fields,
                    affected_combinations: affected,
                    avg_selectivity,
                }
            })
            .collect();

        // Most selective first; ties broken by ids for determinism.
        sets.sort_by(|a, b| {
            a.avg_selectivity
                .total_cmp(&b.avg_selectivity)
                .then_with(|| a.static_predicate_ids.cmp(&b.static_predicate_ids))
        });
        for (i, set) in sets.iter_mut().enumerate() {
            set.id = i as u32;
        }

        BaseConditionIndex { sets, no_base }
    }

    pub fn sets(&self) -> &[BaseConditionSet] {
        &self.sets
    }

    pub fn no_base_combinations(&self) -> &RoaringBitmap {
        &self.no_base
    }

    /// Mean number of combinations gated per set.
    pub fn avg_reuse_per_set(&self) -> f64 {
        if self.sets.is_empty() {
            return 0.0;
        }
        let total: u64 = self
            .sets
            .iter()
            .map(|s| s.affected_combinations.len())
            .sum();
        total as f64 / self.sets.len() as f64
    }
}

/// Result of base-condition filtering for one event.
#[derive(Debug, Clone)]
pub struct BaseEvalOutcome {
    /// Combinations that survived static filtering.
    pub eligible: RoaringBitmap,
    pub predicates_evaluated: u32,
    pub from_cache: bool,
    pub eval_nanos: u64,
}

/// Evaluates base-condition sets against events, with outcome caching.
pub struct BaseConditionEvaluator {
    cache: Arc<dyn BaseConditionCache>,
    ttl: Duration,
}

impl BaseConditionEvaluator {
    pub fn new(cache: Arc<dyn BaseConditionCache>, ttl: Duration) -> Self {
        BaseConditionEvaluator { cache, ttl }
    }

    pub fn cache(&self) -> &Arc<dyn BaseConditionCache> {
        &self.cache
    }

    /// Compute the eligible-combination bitmap for one encoded event.
    ///
    /// Sets referencing a field the event lacks are skipped (their
    /// combinations stay ineligible). Cache trouble degrades to a miss.
    pub fn evaluate(
        &self,
        model: &EngineModel,
        encoded: &EncodedEvent,
        ctx: &mut EvaluationContext,
        clock: &dyn Clock,
    ) -> BaseEvalOutcome {
        let start = clock.now_nanos();
        let index = model.base();

        // Applicable = every referenced field present on the event. The set
        // list is pre-sorted by ascending selectivity, so this order is the
        // evaluation order.
        ctx.applicable_sets.clear();
        for set in index.sets() {
            if set.fields.iter().all(|&f| encoded.contains_field(f)) {
                ctx.applicable_sets.push(set.id);
            }
        }

        // Fingerprint: sorted distinct predicate ids plus the event values
        // of the fields they touch.
        ctx.key_predicates.clear();
        for &si in &ctx.applicable_sets {
            ctx.key_predicates
                .extend_from_slice(&index.sets()[si as usize].static_predicate_ids);
        }
        ctx.key_predicates.sort_unstable();
        ctx.key_predicates.dedup();

        let pairs: Vec<(u32, &crate::event::EncodedValue)> = ctx
            .key_predicates
            .iter()
            .filter_map(|&p| {
                let field = model.predicate(p).field_id;
                encoded.get(field).map(|v| (p, v))
            })
            .collect();
        let key = fingerprint::compute_cache_key(&pairs, &mut ctx.key_buffer);

        if let Some(eligible) = self.cache.get(&key) {
            trace!(sets = ctx.applicable_sets.len(), "base outcome from cache");
            return BaseEvalOutcome {
                eligible,
                predicates_evaluated: 0,
                from_cache: true,
                eval_nanos: clock.now_nanos().saturating_sub(start),
            };
        }

        let mut eligible = index.no_base_combinations().clone();
        for &si in &ctx.applicable_sets {
            eligible |= &index.sets()[si as usize].affected_combinations;
        }

        let mut predicates_evaluated = 0u32;
        for &si in &ctx.applicable_sets {
            let set = &index.sets()[si as usize];
            for &p in &set.static_predicate_ids {
                let predicate = model.predicate(p);
                predicates_evaluated += 1;
                let value = encoded.get(predicate.field_id);
                if !predicate.evaluate(value, model.value_dict()) {
                    eligible -= &set.affected_combinations;
                    break;
                }
            }
        }

        self.cache.put(key, eligible.clone(), self.ttl);

        BaseEvalOutcome {
            eligible,
            predicates_evaluated,
            from_cache: false,
            eval_nanos: clock.now_nanos().saturating_sub(start),
        }
    }
}
