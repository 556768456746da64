//! Counter-based rule evaluation.
//!
//! For each event: encode attributes, ask the base-condition evaluator for
//! the eligible combinations, memoize the union of their predicate ids,
//! evaluate those predicates (numeric ones in batches), then walk the
//! inverted index of every true predicate incrementing per-combination
//! counters. A combination whose counter reaches its predicate count
//! matched; the selection strategy decides what the caller sees.
//!
//! Evaluation never returns an error. Internal panics are caught, logged,
//! counted, and answered with an empty result; one bad event cannot poison
//! engine state because all scratch lives in the pooled context.

pub mod context;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::base::BaseConditionEvaluator;
use crate::cache::{BaseConditionCache, InMemoryBaseCache};
use crate::clock::{Clock, MonotonicClock};
use crate::config::EngineConfig;
use crate::event::{EncodedValue, Event};
use crate::metrics::EngineMetrics;
use crate::model::{EngineModel, RuleBinding};
use crate::predicate::{num_repr, CheckReason, Operator};
use context::{ContextPool, EvaluationContext};

/// Policy for choosing which matched entries to surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Every matched `(rule_code, priority)` entry.
    AllMatches,
    /// The single highest-priority entry; ties go to the smaller
    /// combination id, then registration order.
    #[default]
    FirstMatch,
    /// The highest-priority entry per rule code; ties go to the
    /// first-registered entry.
    MaxPriorityPerFamily,
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all_matches" => Ok(SelectionStrategy::AllMatches),
            "first_match" => Ok(SelectionStrategy::FirstMatch),
            "max_priority_per_family" => Ok(SelectionStrategy::MaxPriorityPerFamily),
            other => Err(format!("unknown selection strategy '{other}'")),
        }
    }
}

/// One matched rule entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedRule {
    pub rule_code: String,
    pub priority: i32,
    pub description: Option<String>,
}

impl MatchedRule {
    fn from_binding(binding: &RuleBinding) -> Self {
        MatchedRule {
            rule_code: binding.code.to_string(),
            priority: binding.priority,
            description: binding.description.as_ref().map(|d| d.to_string()),
        }
    }
}

/// Evaluation outcome for one event.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub event_id: String,
    pub matched_rules: Vec<MatchedRule>,
    pub predicates_evaluated: u32,
    pub eval_nanos: u64,
}

impl MatchResult {
    fn empty(event_id: &str) -> Self {
        MatchResult {
            event_id: event_id.to_string(),
            matched_rules: Vec::new(),
            predicates_evaluated: 0,
            eval_nanos: 0,
        }
    }

    pub fn is_match(&self) -> bool {
        !self.matched_rules.is_empty()
    }
}

/// Stage-by-stage record of one evaluation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationTrace {
    pub encode_nanos: u64,
    pub base_nanos: u64,
    pub predicate_nanos: u64,
    pub counter_nanos: u64,
    pub selection_nanos: u64,
    pub eligible_combinations: u64,
    pub eligible_predicates: usize,
    pub true_predicates: Vec<u32>,
    pub touched_combinations: usize,
    pub matched_combinations: Vec<u32>,
    pub base_from_cache: bool,
}

/// One condition's outcome in an explanation.
#[derive(Debug, Clone, Serialize)]
pub struct PredicateCheck {
    pub field: String,
    pub operator: Operator,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
    pub reason: CheckReason,
}

/// Why a rule did or did not match an event.
#[derive(Debug, Clone, Serialize)]
pub struct ExplanationResult {
    pub event_id: String,
    pub rule_code: String,
    /// False when no combination carries the requested code.
    pub rule_found: bool,
    pub matched: bool,
    pub checks: Vec<PredicateCheck>,
}

/// Evaluates events against one immutable model.
pub struct RuleEvaluator {
    model: Arc<EngineModel>,
    base: BaseConditionEvaluator,
    strategy: SelectionStrategy,
    pool: ContextPool,
    metrics: Arc<EngineMetrics>,
    clock: Arc<dyn Clock>,
    batch_pool: Option<rayon::ThreadPool>,
}

impl RuleEvaluator {
    pub fn new(model: Arc<EngineModel>, config: &EngineConfig) -> Self {
        let cache: Arc<dyn BaseConditionCache> =
            Arc::new(InMemoryBaseCache::new(config.cache.base_condition_capacity));
        Self::with_cache(model, config, cache)
    }

    /// Build with an external base-condition cache backend.
    pub fn with_cache(
        model: Arc<EngineModel>,
        config: &EngineConfig,
        cache: Arc<dyn BaseConditionCache>,
    ) -> Self {
        let stats = model.stats();
        let metrics = Arc::new(EngineMetrics::new(
            stats.base_condition_sets,
            stats.avg_reuse_per_set,
            stats.unique_predicates,
        ));
        let ttl = std::time::Duration::from_secs(config.cache.base_condition_ttl_secs);
        let batch_pool = match config.evaluation.batch_parallelism {
            0 => None,
            n => rayon::ThreadPoolBuilder::new().num_threads(n).build().ok(),
        };
        RuleEvaluator {
            pool: ContextPool::new(
                model.num_combinations(),
                config.evaluation.context_pool_capacity,
            ),
            base: BaseConditionEvaluator::new(cache, ttl),
            strategy: config.evaluation.selection_strategy,
            metrics,
            clock: Arc::new(MonotonicClock::new()),
            batch_pool,
            model,
        }
    }

    /// Replace the clock (tests pin time with a manual clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn model(&self) -> &Arc<EngineModel> {
        &self.model
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn base_cache(&self) -> &Arc<dyn BaseConditionCache> {
        self.base.cache()
    }

    /// Evaluate one event. Never fails; internal errors yield an empty
    /// result and a counter increment.
    pub fn evaluate(&self, event: &Event) -> MatchResult {
        let mut ctx = self.pool.acquire();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.evaluate_inner(event, &mut ctx, None)
        }));
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(event_id = %event.event_id, "evaluation recovered from internal error");
                self.metrics.record_error();
                ctx.reset();
                MatchResult::empty(&event.event_id)
            }
        }
    }

    /// Evaluate with a per-stage trace attached.
    pub fn evaluate_with_trace(&self, event: &Event) -> (MatchResult, EvaluationTrace) {
        let mut ctx = self.pool.acquire();
        let mut trace = EvaluationTrace::default();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.evaluate_inner(event, &mut ctx, Some(&mut trace))
        }));
        match outcome {
            Ok(result) => (result, trace),
            Err(_) => {
                warn!(event_id = %event.event_id, "evaluation recovered from internal error");
                self.metrics.record_error();
                ctx.reset();
                (MatchResult::empty(&event.event_id), EvaluationTrace::default())
            }
        }
    }

    /// Evaluate a batch in parallel. Result order follows input order.
    pub fn evaluate_batch(&self, events: &[Event]) -> Vec<MatchResult> {
        let run = || -> Vec<MatchResult> {
            events.par_iter().map(|e| self.evaluate(e)).collect()
        };
        match &self.batch_pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }

    fn evaluate_inner(
        &self,
        event: &Event,
        ctx: &mut EvaluationContext,
        mut trace: Option<&mut EvaluationTrace>,
    ) -> MatchResult {
        let clock = self.clock.as_ref();
        let start = clock.now_nanos();
        let model = self.model.as_ref();

        let encoded = model.encoder().encode(event);
        let after_encode = clock.now_nanos();

        let base = self.base.evaluate(model, &encoded, ctx, clock);
        ctx.predicates_evaluated += base.predicates_evaluated;
        let after_base = clock.now_nanos();

        if let Some(t) = trace.as_deref_mut() {
            t.encode_nanos = after_encode.saturating_sub(start);
            t.base_nanos = base.eval_nanos;
            t.base_from_cache = base.from_cache;
            t.eligible_combinations = base.eligible.len();
        }

        if base.eligible.is_empty() {
            let nanos = clock.now_nanos().saturating_sub(start);
            self.metrics
                .record_evaluation(ctx.predicates_evaluated, 0, nanos, base.from_cache);
            let result = MatchResult {
                event_id: event.event_id.clone(),
                matched_rules: Vec::new(),
                predicates_evaluated: ctx.predicates_evaluated,
                eval_nanos: nanos,
            };
            ctx.reset();
            return result;
        }

        // Union of predicate ids across eligible combinations, memoized on
        // the model per eligible-set content.
        let eligible_predicates = model.eligible_cache().get_or_insert_with(&base.eligible, || {
            let mut ids: Vec<u32> = Vec::new();
            for c in &base.eligible {
                ids.extend_from_slice(model.combination_predicates(c));
            }
            ids.sort_unstable();
            ids.dedup();
            ids
        });

        // Numeric predicates first, one batch per (field, operator) group.
        ctx.numeric_true.clear();
        if !model.numeric().is_empty() {
            for field in model.numeric().fields() {
                let Some(value) = encoded.get(field.field_id).and_then(EncodedValue::as_f64)
                else {
                    continue;
                };
                for group in &field.groups {
                    let evaluated = group.evaluate(
                        value,
                        Some(eligible_predicates.as_slice()),
                        &mut ctx.numeric,
                        &mut ctx.numeric_true,
                    );
                    ctx.predicates_evaluated += evaluated;
                }
            }
            ctx.numeric_true.sort_unstable();
        }

        // Scalar pass over the remaining eligible predicates, in sorted id
        // order for determinism.
        for &p in eligible_predicates.iter() {
            let passed = if model.numeric().is_grouped(p) {
                ctx.numeric_true.binary_search(&p).is_ok()
            } else {
                let predicate = model.predicate(p);
                ctx.predicates_evaluated += 1;
                predicate.evaluate(encoded.get(predicate.field_id), model.value_dict())
            };
            if passed {
                ctx.true_predicates.push(p);
            }
        }
        let after_predicates = clock.now_nanos();

        // Counter loop over the inverted index.
        for &p in &ctx.true_predicates {
            for c in model.inverted_index(p) {
                if base.eligible.contains(c) {
                    let slot = &mut ctx.counters[c as usize];
                    if *slot == 0 {
                        ctx.touched.push(c);
                    }
                    *slot += 1;
                }
            }
        }
        let mut matched: Vec<u32> = ctx
            .touched
            .iter()
            .copied()
            .filter(|&c| ctx.counters[c as usize] == model.predicate_count(c))
            .collect();
        matched.sort_unstable();
        let after_counters = clock.now_nanos();

        let matched_rules = select_matches(model, &matched, self.strategy);
        let nanos = clock.now_nanos().saturating_sub(start);

        if let Some(t) = trace.as_deref_mut() {
            t.predicate_nanos = after_predicates.saturating_sub(after_base);
            t.counter_nanos = after_counters.saturating_sub(after_predicates);
            t.selection_nanos = clock.now_nanos().saturating_sub(after_counters);
            t.eligible_predicates = eligible_predicates.len();
            t.true_predicates = ctx.true_predicates.clone();
            t.touched_combinations = ctx.touched.len();
            t.matched_combinations = matched;
        }

        trace!(
            event_id = %event.event_id,
            matches = matched_rules.len(),
            predicates = ctx.predicates_evaluated,
            "evaluated event"
        );
        self.metrics.record_evaluation(
            ctx.predicates_evaluated,
            matched_rules.len(),
            nanos,
            base.from_cache,
        );

        let result = MatchResult {
            event_id: event.event_id.clone(),
            matched_rules,
            predicates_evaluated: ctx.predicates_evaluated,
            eval_nanos: nanos,
        };
        ctx.reset();
        result
    }

    /// Explain how `rule_code` fares against `event`, predicate by predicate.
    ///
    /// Uses any combination carrying the code (the first, by id).
    pub fn explain(&self, event: &Event, rule_code: &str) -> ExplanationResult {
        let model = self.model.as_ref();
        let combos = model.combinations_for_code(rule_code);
        let Some(&combo) = combos.first() else {
            return ExplanationResult {
                event_id: event.event_id.clone(),
                rule_code: rule_code.to_string(),
                rule_found: false,
                matched: false,
                checks: Vec::new(),
            };
        };

        let encoded = model.encoder().encode(event);
        let mut checks = Vec::new();
        for &p in model.combination_predicates(combo) {
            let predicate = model.predicate(p);
            let value = encoded.get(predicate.field_id);
            let reason = predicate.check(value, model.value_dict());
            checks.push(PredicateCheck {
                field: model
                    .field_dict()
                    .decode(predicate.field_id)
                    .unwrap_or("?")
                    .to_string(),
                operator: predicate.operator,
                expected: predicate.expected_repr(model.value_dict()),
                actual: actual_repr(value, model),
                passed: reason == CheckReason::Ok,
                reason,
            });
        }
        ExplanationResult {
            event_id: event.event_id.clone(),
            rule_code: rule_code.to_string(),
            rule_found: true,
            matched: checks.iter().all(|c| c.passed),
            checks,
        }
    }
}

fn actual_repr(value: Option<&EncodedValue>, model: &EngineModel) -> String {
    match value {
        None => "missing".to_string(),
        Some(EncodedValue::Null) => "null".to_string(),
        Some(EncodedValue::Bool(b)) => b.to_string(),
        Some(EncodedValue::Int(i)) => i.to_string(),
        Some(EncodedValue::Float(f)) => num_repr(*f),
        Some(EncodedValue::StrId(id)) => model.value_dict().decode(*id).unwrap_or("?").to_string(),
        Some(EncodedValue::Str(s)) => s.clone(),
    }
}

/// Apply the selection strategy to matched combinations (ascending ids).
fn select_matches(
    model: &EngineModel,
    matched: &[u32],
    strategy: SelectionStrategy,
) -> Vec<MatchedRule> {
    match strategy {
        SelectionStrategy::FirstMatch => {
            let mut best: Option<MatchedRule> = None;
            let mut best_priority = i32::MIN;
            for &c in matched {
                for binding in model.rules_for_combination(c) {
                    // Strictly greater only: ties keep the smaller
                    // combination id and the first-registered binding.
                    if best.is_none() || binding.priority > best_priority {
                        best_priority = binding.priority;
                        best = Some(MatchedRule::from_binding(binding));
                    }
                }
            }
            best.into_iter().collect()
        }
        SelectionStrategy::AllMatches => {
            let mut seen: std::collections::HashSet<(Arc<str>, i32)> =
                std::collections::HashSet::new();
            let mut entries = Vec::new();
            for &c in matched {
                for binding in model.rules_for_combination(c) {
                    if seen.insert((Arc::clone(&binding.code), binding.priority)) {
                        entries.push(MatchedRule::from_binding(binding));
                    }
                }
            }
            sort_entries(&mut entries);
            entries
        }
        SelectionStrategy::MaxPriorityPerFamily => {
            let mut families: HashMap<Arc<str>, MatchedRule> = HashMap::new();
            for &c in matched {
                for binding in model.rules_for_combination(c) {
                    match families.get(&binding.code) {
                        // First-registered wins ties within a family.
                        Some(existing) if binding.priority <= existing.priority => {}
                        _ => {
                            families.insert(
                                Arc::clone(&binding.code),
                                MatchedRule::from_binding(binding),
                            );
                        }
                    }
                }
            }
            let mut entries: Vec<MatchedRule> = families.into_values().collect();
            sort_entries(&mut entries);
            entries
        }
    }
}

fn sort_entries(entries: &mut [MatchedRule]) {
    entries.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.rule_code.cmp(&b.rule_code))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!(
            "ALL_MATCHES".parse::<SelectionStrategy>(),
            Ok(SelectionStrategy::AllMatches)
        );
        assert_eq!(
            "first_match".parse::<SelectionStrategy>(),
            Ok(SelectionStrategy::FirstMatch)
        );
        assert_eq!(
            "Max_Priority_Per_Family".parse::<SelectionStrategy>(),
            Ok(SelectionStrategy::MaxPriorityPerFamily)
        );
        assert!("best_match".parse::<SelectionStrategy>().is_err());
    }

    #[test]
    fn default_strategy_is_first_match() {
        assert_eq!(SelectionStrategy::default(), SelectionStrategy::FirstMatch);
    }
}
