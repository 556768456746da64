//! Base-condition clustering and cache behavior: static-prefix dedup,
//! hit/miss equivalence, missing-field semantics, and TTL handling.

use std::sync::Arc;

use matchgrid::{
    AttributeValue, BaseConditionCache, EngineConfig, EngineModel, Event, InMemoryBaseCache,
    JsonRuleSource, RuleCompiler, RuleEvaluator, SelectionStrategy,
};

const SHARED_PREFIX_RULES: &str = r#"[
    {"rule_code":"K100","conditions":[
        {"field":"STATUS","operator":"EQUAL_TO","value":"ACTIVE"},
        {"field":"AMT","operator":"GREATER_THAN","value":100}]},
    {"rule_code":"K500","conditions":[
        {"field":"STATUS","operator":"EQUAL_TO","value":"ACTIVE"},
        {"field":"AMT","operator":"GREATER_THAN","value":500}]},
    {"rule_code":"K1000","conditions":[
        {"field":"STATUS","operator":"EQUAL_TO","value":"ACTIVE"},
        {"field":"AMT","operator":"GREATER_THAN","value":1000}]}]"#;

fn model(json: &str) -> Arc<EngineModel> {
    RuleCompiler::new(&EngineConfig::default())
        .compile(&JsonRuleSource::new(json))
        .expect("ruleset compiles")
}

fn all_matches(json: &str) -> RuleEvaluator {
    RuleEvaluator::new(model(json), &EngineConfig::default())
        .with_strategy(SelectionStrategy::AllMatches)
}

#[test]
fn shared_static_prefixes_collapse_to_one_set() {
    let model = model(SHARED_PREFIX_RULES);
    let stats = model.stats();
    assert_eq!(stats.base_condition_sets, 1);
    assert!((stats.avg_reuse_per_set - 3.0).abs() < 1e-9);
    assert_eq!(stats.no_base_combinations, 0);

    let set = &model.base().sets()[0];
    assert_eq!(set.static_predicate_ids.len(), 1);
    assert_eq!(set.affected_combinations.len(), 3);
}

#[test]
fn mid_tier_event_matches_lower_thresholds() {
    let eval = all_matches(SHARED_PREFIX_RULES);
    let event = Event::new("e")
        .with_attr("STATUS", AttributeValue::Str("ACTIVE".into()))
        .with_attr("AMT", AttributeValue::Int(750));
    let mut matched: Vec<String> = eval
        .evaluate(&event)
        .matched_rules
        .into_iter()
        .map(|m| m.rule_code)
        .collect();
    matched.sort();
    assert_eq!(matched, vec!["K100", "K500"]);
}

#[test]
fn failed_static_prefix_disqualifies_the_whole_group() {
    let eval = all_matches(SHARED_PREFIX_RULES);
    let event = Event::new("e")
        .with_attr("STATUS", AttributeValue::Str("CLOSED".into()))
        .with_attr("AMT", AttributeValue::Int(5000));
    let (result, trace) = eval.evaluate_with_trace(&event);
    assert!(!result.is_match());
    assert_eq!(trace.eligible_combinations, 0);
    // Static evaluation stops at the failing prefix; dynamic predicates
    // are never touched.
    assert_eq!(result.predicates_evaluated, 1);
}

#[test]
fn cache_hit_and_miss_produce_identical_eligibility() {
    let eval = all_matches(SHARED_PREFIX_RULES);
    let event = Event::new("e")
        .with_attr("STATUS", AttributeValue::Str("ACTIVE".into()))
        .with_attr("AMT", AttributeValue::Int(750));

    let (cold_result, cold) = eval.evaluate_with_trace(&event);
    let (warm_result, warm) = eval.evaluate_with_trace(&event);
    assert!(!cold.base_from_cache);
    assert!(warm.base_from_cache);
    assert_eq!(cold.eligible_combinations, warm.eligible_combinations);
    assert_eq!(cold.matched_combinations, warm.matched_combinations);
    assert_eq!(cold_result.matched_rules, warm_result.matched_rules);
    // Cached base outcome: no static predicates re-evaluated.
    assert!(warm_result.predicates_evaluated < cold_result.predicates_evaluated);
}

#[test]
fn different_static_values_use_different_cache_entries() {
    let eval = all_matches(SHARED_PREFIX_RULES);
    let active = Event::new("a")
        .with_attr("STATUS", AttributeValue::Str("ACTIVE".into()))
        .with_attr("AMT", AttributeValue::Int(750));
    let closed = Event::new("c")
        .with_attr("STATUS", AttributeValue::Str("CLOSED".into()))
        .with_attr("AMT", AttributeValue::Int(750));

    assert!(eval.evaluate(&active).is_match());
    // Same fields, different value: must not reuse the ACTIVE entry.
    assert!(!eval.evaluate(&closed).is_match());
    assert!(eval.evaluate(&active).is_match());

    let metrics = eval.base_cache().metrics();
    assert_eq!(metrics.misses, 2);
    assert_eq!(metrics.hits, 1);
}

#[test]
fn sets_missing_a_field_are_skipped_not_failed() {
    let eval = all_matches(
        r#"[
        {"rule_code":"NEEDS_STATUS","conditions":[
            {"field":"STATUS","operator":"EQUAL_TO","value":"ACTIVE"},
            {"field":"AMT","operator":"GREATER_THAN","value":10}]},
        {"rule_code":"NO_PREFIX","conditions":[
            {"field":"AMT","operator":"GREATER_THAN","value":10}]}]"#,
    );
    // No STATUS attribute: the STATUS set is skipped, its combination is
    // ineligible, and the prefix-free rule still matches.
    let event = Event::new("e").with_attr("AMT", AttributeValue::Int(50));
    let matched: Vec<String> = eval
        .evaluate(&event)
        .matched_rules
        .into_iter()
        .map(|m| m.rule_code)
        .collect();
    assert_eq!(matched, vec!["NO_PREFIX"]);
}

#[test]
fn explicit_null_satisfies_is_null_prefixes() {
    let eval = all_matches(
        r#"[{"rule_code":"ORPHAN","conditions":[
            {"field":"OWNER","operator":"IS_NULL"},
            {"field":"AMT","operator":"GREATER_THAN","value":0}]}]"#,
    );
    let with_null = Event::new("e1")
        .with_attr("OWNER", AttributeValue::Null)
        .with_attr("AMT", AttributeValue::Int(5));
    assert!(eval.evaluate(&with_null).is_match());

    // A missing attribute is not an explicit null: the set is skipped.
    let without = Event::new("e2").with_attr("AMT", AttributeValue::Int(5));
    assert!(!eval.evaluate(&without).is_match());
}

#[test]
fn zero_ttl_expires_immediately() {
    let mut config = EngineConfig::default();
    config.cache.base_condition_ttl_secs = 0;
    let evaluator = RuleEvaluator::new(model(SHARED_PREFIX_RULES), &config)
        .with_strategy(SelectionStrategy::AllMatches);
    let event = Event::new("e")
        .with_attr("STATUS", AttributeValue::Str("ACTIVE".into()))
        .with_attr("AMT", AttributeValue::Int(750));

    evaluator.evaluate(&event);
    evaluator.evaluate(&event);
    let metrics = evaluator.base_cache().metrics();
    assert_eq!(metrics.hits, 0);
    assert_eq!(metrics.misses, 2);
}

#[test]
fn external_cache_backend_is_honored() {
    let cache = Arc::new(InMemoryBaseCache::new(16));
    let evaluator = RuleEvaluator::with_cache(
        model(SHARED_PREFIX_RULES),
        &EngineConfig::default(),
        cache.clone(),
    );
    let event = Event::new("e")
        .with_attr("STATUS", AttributeValue::Str("ACTIVE".into()))
        .with_attr("AMT", AttributeValue::Int(750));
    evaluator.evaluate(&event);
    evaluator.evaluate(&event);
    assert_eq!(cache.metrics().puts, 1);
    assert_eq!(cache.metrics().hits, 1);

    // Clearing the backend degrades to a miss, never an error.
    cache.clear();
    assert!(evaluator.evaluate(&event).is_match());
    assert_eq!(cache.metrics().puts, 2);
}

#[test]
fn distinct_prefixes_produce_distinct_sets_sorted_by_selectivity() {
    let model = model(
        r#"[
        {"rule_code":"EQ_PREFIX","conditions":[
            {"field":"STATUS","operator":"EQUAL_TO","value":"ACTIVE"},
            {"field":"AMT","operator":"GREATER_THAN","value":10}]},
        {"rule_code":"NEQ_PREFIX","conditions":[
            {"field":"KIND","operator":"NOT_EQUAL_TO","value":"TEST"},
            {"field":"AMT","operator":"GREATER_THAN","value":10}]}]"#,
    );
    let sets = model.base().sets();
    assert_eq!(sets.len(), 2);
    // EQUAL_TO (selectivity 0.05) sorts before NOT_EQUAL_TO (0.95).
    assert!(sets[0].avg_selectivity < sets[1].avg_selectivity);
    assert_eq!(sets[0].id, 0);
    assert_eq!(sets[1].id, 1);
}
