//! The rule compiler: declarative ruleset in, immutable engine model out.
//!
//! ## Pipeline
//!
//! ```text
//! RuleSource (JSON)
//!     ↓
//! [Parse]        → Vec<RuleDefinition>
//!     ↓
//! [Validate]     → canonical rules (operators resolved, fields interned,
//!                  values checked, IS_ANY_OF reduced/deduplicated)
//!     ↓
//! [Factor]       → shared IS_ANY_OF subsets exposed (fixed point)
//!     ↓
//! [Expand]       → DNF combinations (cartesian product of disjunctions)
//!     ↓
//! [Register]     → predicates deduplicated by canonical key,
//!                  combinations deduplicated by sorted id sequence
//!     ↓
//! [Finalize]     → inverted index, SoA arrays, base-condition sets,
//!                  numeric groups, invariant validation
//!     ↓
//! EngineModel
//! ```
//!
//! Every stage reports to the [`CompileListener`] and runs inside a tracing
//! span. Compilation is deterministic: the same input bytes produce the
//! same model, ids and orderings included.

pub(crate) mod canon;
mod expansion;
mod factorizer;
mod selectivity;
mod validate;

pub use validate::{ValidationError, ValidationReport, ValidationWarning, WarningSeverity};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::definition::{RuleDefinition, RuleSource};
use crate::dictionary::Dictionary;
use crate::error::CompileResult;
use crate::model::{EngineModel, ModelParts, RuleBinding};
use crate::predicate::{Operator, Predicate, PredicateKey, PredicateValue};
use canon::{CanonRule, Payload, Scalar};
use expansion::Leaf;

/// Receives stage boundaries during compilation.
pub trait CompileListener {
    fn stage_start(&mut self, _stage: &str) {}
    fn stage_complete(&mut self, _stage: &str, _duration: Duration, _counters: &[(&str, u64)]) {}
}

/// Listener that discards everything.
#[derive(Debug, Default)]
pub struct NoopListener;

impl CompileListener for NoopListener {}

/// Default listener: forwards stage boundaries to `tracing`.
#[derive(Debug, Default)]
pub struct TracingListener;

impl CompileListener for TracingListener {
    fn stage_start(&mut self, stage: &str) {
        debug!(stage, "compile stage starting");
    }

    fn stage_complete(&mut self, stage: &str, duration: Duration, counters: &[(&str, u64)]) {
        debug!(stage, duration_us = duration.as_micros() as u64, ?counters, "compile stage complete");
    }
}

/// Per-compilation statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompilationMetrics {
    pub rules_parsed: usize,
    pub rules_disabled: usize,
    pub rules_compiled: usize,
    pub factoring_passes: u32,
    pub factoring_rewrites: u32,
    pub expanded_combinations: usize,
    pub unique_combinations: usize,
    pub unique_predicates: usize,
    pub duplicate_rule_codes: Vec<String>,
    pub stage_nanos: Vec<(String, u64)>,
}

/// Compiles rule sources into engine models.
pub struct RuleCompiler {
    config: EngineConfig,
}

impl RuleCompiler {
    pub fn new(config: &EngineConfig) -> Self {
        RuleCompiler {
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compile, reporting stages to `tracing` only.
    pub fn compile(&self, source: &dyn RuleSource) -> CompileResult<Arc<EngineModel>> {
        self.compile_with_listener(source, &mut TracingListener)
            .map(|(model, _)| model)
    }

    /// Compile with an explicit stage listener.
    pub fn compile_with_listener(
        &self,
        source: &dyn RuleSource,
        listener: &mut dyn CompileListener,
    ) -> CompileResult<(Arc<EngineModel>, CompilationMetrics)> {
        let mut metrics = CompilationMetrics::default();

        // Stage 1: parse.
        let (definitions, elapsed) = run_stage(listener, "parse", || source.load())?;
        metrics.rules_parsed = definitions.len();
        finish_stage(listener, &mut metrics, "parse", elapsed, &[(
            "rules",
            definitions.len() as u64,
        )]);

        // Stage 2: validate & canonicalize.
        let mut field_dict = Dictionary::new();
        let ((rules, disabled), elapsed) = run_stage(listener, "validate", || {
            let mut rules = Vec::with_capacity(definitions.len());
            let mut disabled = 0usize;
            for def in &definitions {
                match canon::canonicalize_rule(def, &mut field_dict)? {
                    Some(rule) => rules.push(rule),
                    None => disabled += 1,
                }
            }
            Ok((rules, disabled))
        })?;
        metrics.rules_disabled = disabled;
        metrics.rules_compiled = rules.len();
        metrics.duplicate_rule_codes = duplicate_codes(&rules);
        for code in &metrics.duplicate_rule_codes {
            warn!(rule_code = %code, "duplicate rule code; all occurrences stay active");
        }
        let duplicates = metrics.duplicate_rule_codes.len() as u64;
        finish_stage(listener, &mut metrics, "validate", elapsed, &[
            ("rules", rules.len() as u64),
            ("disabled", disabled as u64),
            ("duplicate_codes", duplicates),
        ]);

        // Stage 3: subset factoring.
        let rules = if self.config.compiler.enable_factoring {
            let (outcome, elapsed) =
                run_stage(listener, "factor", || Ok(factorizer::factor_rules(rules)))?;
            metrics.factoring_passes = outcome.passes;
            metrics.factoring_rewrites = outcome.rewrites;
            finish_stage(listener, &mut metrics, "factor", elapsed, &[
                ("passes", u64::from(outcome.passes)),
                ("rewrites", u64::from(outcome.rewrites)),
            ]);
            outcome.rules
        } else {
            rules
        };

        // Stage 4: DNF expansion.
        let max_expansions = self.config.compiler.max_expansions_per_rule;
        let (expanded, elapsed) = run_stage(listener, "expand", || {
            let mut expanded = Vec::with_capacity(rules.len());
            for rule in &rules {
                let combos = expansion::expand_rule(rule, max_expansions)?;
                expanded.push(combos);
            }
            Ok(expanded)
        })?;
        metrics.expanded_combinations = expanded.iter().map(Vec::len).sum();
        let expanded_count = metrics.expanded_combinations as u64;
        finish_stage(listener, &mut metrics, "expand", elapsed, &[(
            "combinations",
            expanded_count,
        )]);

        // Stage 5: predicate registration & combination deduplication.
        let mut value_dict = Dictionary::new();
        let ((predicates, predicate_ids, combination_predicates, combination_rules), elapsed) =
            run_stage(listener, "register", || {
                let mut registry = Registry::default();
                for (rule, combos) in rules.iter().zip(&expanded) {
                    registry.register_rule(rule, combos, &mut value_dict);
                }
                Ok(registry.into_parts())
            })?;
        metrics.unique_combinations = combination_predicates.len();
        metrics.unique_predicates = predicates.len();
        finish_stage(listener, &mut metrics, "register", elapsed, &[
            ("unique_combinations", combination_predicates.len() as u64),
            ("unique_predicates", predicates.len() as u64),
        ]);

        // Stage 6+7: selectivity is assigned at minting; finalize the SoA
        // model, indices, and derived organizations.
        let (model, elapsed) = run_stage(listener, "finalize", || {
            let parts = ModelParts {
                field_dict,
                value_dict,
                predicates,
                predicate_ids,
                combination_predicates,
                combination_rules,
                eligible_set_capacity: self.config.cache.eligible_set_capacity,
                simd_group_threshold: self.config.numeric.simd_group_threshold,
            };
            Ok(EngineModel::from_parts(parts)?)
        })?;
        let stats = model.stats();
        finish_stage(listener, &mut metrics, "finalize", elapsed, &[
            ("combinations", stats.combinations as u64),
            ("base_condition_sets", stats.base_condition_sets as u64),
            ("index_postings", stats.index_postings),
        ]);

        info!(
            rules = metrics.rules_compiled,
            combinations = stats.combinations,
            predicates = stats.unique_predicates,
            base_sets = stats.base_condition_sets,
            "ruleset compiled"
        );
        Ok((Arc::new(model), metrics))
    }
}

impl Default for RuleCompiler {
    fn default() -> Self {
        RuleCompiler::new(&EngineConfig::default())
    }
}

fn run_stage<T>(
    listener: &mut dyn CompileListener,
    name: &'static str,
    f: impl FnOnce() -> CompileResult<T>,
) -> CompileResult<(T, Duration)> {
    listener.stage_start(name);
    let span = tracing::info_span!("compile_stage", stage = name);
    let _enter = span.enter();
    let start = Instant::now();
    let out = f()?;
    Ok((out, start.elapsed()))
}

fn finish_stage(
    listener: &mut dyn CompileListener,
    metrics: &mut CompilationMetrics,
    name: &str,
    duration: Duration,
    counters: &[(&str, u64)],
) {
    metrics
        .stage_nanos
        .push((name.to_string(), duration.as_nanos() as u64));
    listener.stage_complete(name, duration, counters);
}

fn duplicate_codes(rules: &[CanonRule]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for rule in rules {
        if !seen.insert(rule.code.as_str()) && !duplicates.contains(&rule.code) {
            duplicates.push(rule.code.clone());
        }
    }
    duplicates
}

/// Predicate and combination registries, shared-nothing until `into_parts`.
#[derive(Default)]
struct Registry {
    predicates: Vec<Predicate>,
    predicate_ids: HashMap<PredicateKey, u32>,
    combination_predicates: Vec<Vec<u32>>,
    combination_rules: Vec<Vec<RuleBinding>>,
    combination_ids: HashMap<Vec<u32>, u32>,
}

impl Registry {
    fn register_rule(&mut self, rule: &CanonRule, combos: &[Vec<Leaf>], value_dict: &mut Dictionary) {
        let code: Arc<str> = Arc::from(rule.code.as_str());
        let description: Option<Arc<str>> =
            rule.description.as_deref().map(Arc::from);

        // One binding per combination per logical rule, even when several
        // expansions of this rule collapse onto the same combination.
        let mut bound: HashSet<u32> = HashSet::new();
        for leaves in combos {
            let mut ids: Vec<u32> = leaves
                .iter()
                .map(|leaf| self.register_predicate(leaf, value_dict))
                .collect();
            ids.sort_unstable();
            ids.dedup();

            let combination = self.register_combination(ids);
            if bound.insert(combination) {
                self.combination_rules[combination as usize].push(RuleBinding {
                    code: Arc::clone(&code),
                    priority: rule.priority,
                    description: description.clone(),
                });
            }
        }
    }

    fn register_predicate(&mut self, leaf: &Leaf, value_dict: &mut Dictionary) -> u32 {
        let predicate = mint_predicate(leaf, value_dict);
        let key = predicate.key();
        if let Some(&id) = self.predicate_ids.get(&key) {
            return id;
        }
        let id = self.predicates.len() as u32;
        self.predicates.push(predicate);
        self.predicate_ids.insert(key, id);
        id
    }

    fn register_combination(&mut self, ids: Vec<u32>) -> u32 {
        if let Some(&existing) = self.combination_ids.get(&ids) {
            return existing;
        }
        let id = self.combination_predicates.len() as u32;
        self.combination_ids.insert(ids.clone(), id);
        self.combination_predicates.push(ids);
        self.combination_rules.push(Vec::new());
        id
    }

    #[allow(clippy::type_complexity)]
    fn into_parts(
        self,
    ) -> (
        Vec<Predicate>,
        HashMap<PredicateKey, u32>,
        Vec<Vec<u32>>,
        Vec<Vec<RuleBinding>>,
    ) {
        (
            self.predicates,
            self.predicate_ids,
            self.combination_predicates,
            self.combination_rules,
        )
    }
}

/// Encode one leaf into an immutable predicate with selectivity metadata.
fn mint_predicate(leaf: &Leaf, value_dict: &mut Dictionary) -> Predicate {
    let value = match &leaf.payload {
        Payload::Scalar(Scalar::Str(s))
            if matches!(leaf.operator, Operator::EqualTo | Operator::NotEqualTo) =>
        {
            PredicateValue::StrId(value_dict.encode(s))
        }
        Payload::Scalar(Scalar::Bool(b)) => PredicateValue::Bool(*b),
        Payload::Scalar(Scalar::Int(i)) => PredicateValue::Int(*i),
        Payload::Scalar(Scalar::Float(f)) => PredicateValue::Float(*f),
        Payload::Scalar(Scalar::Str(s)) => {
            // Non-equality string scalars are raw text (CONTAINS handles
            // its own payload below; this arm is defensive).
            PredicateValue::Text(s.clone())
        }
        Payload::Range(lo, hi) => PredicateValue::Range(*lo, *hi),
        Payload::Text(s) => PredicateValue::Text(s.clone()),
        Payload::Pattern(re) => PredicateValue::Pattern(Arc::clone(re)),
        Payload::None => PredicateValue::None,
        Payload::Set(_) => {
            debug_assert!(false, "IS_ANY_OF must be expanded before registration");
            PredicateValue::None
        }
    };
    let selectivity = selectivity::estimate(leaf.operator);
    Predicate {
        field_id: leaf.field_id,
        operator: leaf.operator,
        value,
        weight: selectivity::weight(leaf.operator),
        selectivity,
    }
}
