//! # MatchGrid Rule Engine
//!
//! Compiles a declarative ruleset — each rule a conjunction of attribute
//! predicates, with top-level IS_ANY_OF disjunctions — into an immutable,
//! cache-friendly engine model, and evaluates events against it at
//! sub-millisecond latency.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Rule file (JSON)
//!     ↓
//! [RuleCompiler]            parse → validate → factor → expand →
//!     ↓                     deduplicate → index → finalize
//! EngineModel               immutable SoA + inverted index, shared by Arc
//!     ↓
//! [EventEncoder]            attributes → field_id → value_id | primitive
//!     ↓
//! [BaseConditionEvaluator]  static-prefix clustering + outcome cache
//!     ↓                     → eligible combinations
//! [RuleEvaluator]           counter loop over the inverted index,
//!     ↓                     SIMD-batched numeric predicates
//! MatchResult               filtered by the selection strategy
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use matchgrid::{AttributeValue, Event, JsonRuleSource, RuleEngine};
//!
//! let rules = r#"[
//!   { "rule_code": "R_HIGH", "priority": 100, "conditions": [
//!     { "field": "STATUS", "operator": "EQUAL_TO", "value": "ACTIVE" },
//!     { "field": "AMOUNT", "operator": "GREATER_THAN", "value": 5000 } ] }
//! ]"#;
//!
//! let engine = RuleEngine::with_defaults();
//! engine.load(&JsonRuleSource::new(rules)).expect("valid ruleset");
//!
//! let event = Event::new("evt-1")
//!     .with_attr("status", AttributeValue::Str("ACTIVE".into()))
//!     .with_attr("amount", AttributeValue::Int(8000));
//! let result = engine.evaluate(&event);
//! assert_eq!(result.matched_rules[0].rule_code, "R_HIGH");
//! ```
//!
//! ## Concurrency
//!
//! The compiled [`EngineModel`] is immutable and shared by reference;
//! evaluators draw pooled per-worker scratch contexts, and the only shared
//! mutable structures are content-idempotent caches. Hot reload swaps the
//! evaluator reference atomically — in-flight evaluations finish on the old
//! model.

pub mod base;
pub mod cache;
pub mod clock;
pub mod compiler;
pub mod config;
pub mod conflicts;
pub mod definition;
pub mod dictionary;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod index;
pub mod metrics;
pub mod model;
pub mod numeric;
pub mod predicate;

pub use cache::{BaseConditionCache, CacheKey, CacheMetrics, InMemoryBaseCache};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use compiler::{
    CompilationMetrics, CompileListener, NoopListener, RuleCompiler, TracingListener,
    ValidationError, ValidationReport, ValidationWarning, WarningSeverity,
};
pub use config::EngineConfig;
pub use conflicts::{analyze_conflicts, ConflictReport, DuplicateConflict, ShadowConflict};
pub use definition::{
    Condition, ConditionValue, JsonFileSource, JsonRuleSource, RuleDefinition, RuleSource,
    StaticRuleSource,
};
pub use dictionary::Dictionary;
pub use error::{CompileError, CompileErrorKind, CompileResult, ModelIntegrityError};
pub use evaluator::{
    EvaluationTrace, ExplanationResult, MatchResult, MatchedRule, PredicateCheck, RuleEvaluator,
    SelectionStrategy,
};
pub use event::{AttributeValue, EncodedEvent, EncodedValue, Event, EventEncoder};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use model::{EngineModel, ModelStats, RuleBinding};
pub use predicate::{CheckReason, Operator, Predicate, PredicateKey, PredicateValue};

use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Compile-and-evaluate façade holding the current ruleset version.
///
/// `load` compiles a source and swaps the active evaluator atomically;
/// concurrent `evaluate` calls either finish on the previous model or see
/// the new one, never a mixture. An engine with no loaded ruleset answers
/// every event with an empty result.
pub struct RuleEngine {
    config: EngineConfig,
    compiler: RuleCompiler,
    current: ArcSwapOption<RuleEvaluator>,
}

impl RuleEngine {
    pub fn new(config: EngineConfig) -> Self {
        RuleEngine {
            compiler: RuleCompiler::new(&config),
            config,
            current: ArcSwapOption::const_empty(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compile `source` and make it the active ruleset.
    pub fn load(&self, source: &dyn RuleSource) -> CompileResult<ModelStats> {
        self.load_with_metrics(source).map(|(stats, _)| stats)
    }

    /// Compile `source`, swap it in, and return compilation metrics.
    pub fn load_with_metrics(
        &self,
        source: &dyn RuleSource,
    ) -> CompileResult<(ModelStats, CompilationMetrics)> {
        let (model, metrics) = self
            .compiler
            .compile_with_listener(source, &mut TracingListener)?;
        let stats = model.stats();
        let evaluator = RuleEvaluator::new(model, &self.config);
        self.current.store(Some(Arc::new(evaluator)));
        Ok((stats, metrics))
    }

    /// Validate a source without touching the active ruleset.
    pub fn validate(&self, source: &dyn RuleSource) -> CompileResult<ValidationReport> {
        self.compiler.validate(source)
    }

    /// The active model, if a ruleset is loaded.
    pub fn model(&self) -> Option<Arc<EngineModel>> {
        self.current.load_full().map(|e| Arc::clone(e.model()))
    }

    pub fn evaluate(&self, event: &Event) -> MatchResult {
        match self.current.load_full() {
            Some(evaluator) => evaluator.evaluate(event),
            None => empty_result(event),
        }
    }

    pub fn evaluate_with_trace(&self, event: &Event) -> (MatchResult, EvaluationTrace) {
        match self.current.load_full() {
            Some(evaluator) => evaluator.evaluate_with_trace(event),
            None => (empty_result(event), EvaluationTrace::default()),
        }
    }

    pub fn evaluate_batch(&self, events: &[Event]) -> Vec<MatchResult> {
        match self.current.load_full() {
            Some(evaluator) => evaluator.evaluate_batch(events),
            None => events.iter().map(empty_result).collect(),
        }
    }

    pub fn explain(&self, event: &Event, rule_code: &str) -> ExplanationResult {
        match self.current.load_full() {
            Some(evaluator) => evaluator.explain(event, rule_code),
            None => ExplanationResult {
                event_id: event.event_id.clone(),
                rule_code: rule_code.to_string(),
                rule_found: false,
                matched: false,
                checks: Vec::new(),
            },
        }
    }

    /// Conflict analysis over the active model.
    pub fn conflicts(&self) -> ConflictReport {
        match self.model() {
            Some(model) => analyze_conflicts(&model),
            None => ConflictReport::default(),
        }
    }

    /// Monitoring snapshot of the active evaluator.
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.current.load_full().map(|e| e.metrics().snapshot())
    }
}

fn empty_result(event: &Event) -> MatchResult {
    MatchResult {
        event_id: event.event_id.clone(),
        matched_rules: Vec::new(),
        predicates_evaluated: 0,
        eval_nanos: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_without_ruleset_answers_empty() {
        let engine = RuleEngine::with_defaults();
        let result = engine.evaluate(&Event::new("e1"));
        assert!(!result.is_match());
        assert!(engine.model().is_none());
        assert!(engine.metrics().is_none());
        assert!(engine.conflicts().is_empty());
    }

    #[test]
    fn load_swaps_the_active_ruleset() {
        let engine = RuleEngine::with_defaults();
        let rules = r#"[{"rule_code":"R_1","conditions":[
            {"field":"STATUS","operator":"EQUAL_TO","value":"ACTIVE"}]}]"#;
        let stats = engine.load(&JsonRuleSource::new(rules)).expect("load");
        assert_eq!(stats.combinations, 1);

        let event =
            Event::new("e1").with_attr("STATUS", AttributeValue::Str("ACTIVE".into()));
        assert!(engine.evaluate(&event).is_match());

        // Reload with a different ruleset; the old one is gone.
        let rules2 = r#"[{"rule_code":"R_2","conditions":[
            {"field":"STATUS","operator":"EQUAL_TO","value":"BLOCKED"}]}]"#;
        engine.load(&JsonRuleSource::new(rules2)).expect("reload");
        assert!(!engine.evaluate(&event).is_match());
    }
}
