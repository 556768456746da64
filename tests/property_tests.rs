//! Property tests: dictionary round-trips, SIMD/scalar agreement, model
//! invariants over randomized rulesets, and evaluation idempotence.

use proptest::prelude::*;

use matchgrid::numeric::{NumericGroup, NumericScratch};
use matchgrid::{
    AttributeValue, Condition, ConditionValue, Dictionary, EngineConfig, Event, Operator,
    RuleCompiler, RuleDefinition, SelectionStrategy, StaticRuleSource,
};

fn cond(field: &str, operator: &str, value: Option<ConditionValue>) -> Condition {
    Condition {
        field: field.to_string(),
        operator: operator.to_string(),
        value,
    }
}

fn field_name() -> impl Strategy<Value = String> {
    prop_oneof![Just("F0"), Just("F1"), Just("F2"), Just("F3")].prop_map(String::from)
}

fn string_value() -> impl Strategy<Value = String> {
    prop_oneof![Just("RED"), Just("GREEN"), Just("BLUE"), Just("NONE")].prop_map(String::from)
}

fn condition_strategy() -> impl Strategy<Value = Condition> {
    prop_oneof![
        (field_name(), string_value())
            .prop_map(|(f, v)| cond(&f, "EQUAL_TO", Some(ConditionValue::Str(v)))),
        (field_name(), string_value())
            .prop_map(|(f, v)| cond(&f, "NOT_EQUAL_TO", Some(ConditionValue::Str(v)))),
        (field_name(), -50i64..50)
            .prop_map(|(f, v)| cond(&f, "GREATER_THAN", Some(ConditionValue::Int(v)))),
        (field_name(), -50i64..50)
            .prop_map(|(f, v)| cond(&f, "LESS_THAN", Some(ConditionValue::Int(v)))),
        (field_name(), -50i64..50, -50i64..50).prop_map(|(f, a, b)| {
            let (lo, hi) = (a.min(b), a.max(b));
            cond(
                &f,
                "BETWEEN",
                Some(ConditionValue::List(vec![
                    ConditionValue::Int(lo),
                    ConditionValue::Int(hi),
                ])),
            )
        }),
        (
            field_name(),
            proptest::collection::vec(string_value(), 1..4)
        )
            .prop_map(|(f, values)| {
                cond(
                    &f,
                    "IS_ANY_OF",
                    Some(ConditionValue::List(
                        values.into_iter().map(ConditionValue::Str).collect(),
                    )),
                )
            }),
        (field_name(), string_value())
            .prop_map(|(f, v)| cond(&f, "CONTAINS", Some(ConditionValue::Str(v)))),
        field_name().prop_map(|f| cond(&f, "IS_NULL", None)),
        field_name().prop_map(|f| cond(&f, "IS_NOT_NULL", None)),
    ]
}

fn ruleset_strategy() -> impl Strategy<Value = Vec<RuleDefinition>> {
    proptest::collection::vec(
        (
            0u32..1000,
            -10i32..10,
            proptest::collection::vec(condition_strategy(), 1..4),
        )
            .prop_map(|(seq, priority, conditions)| RuleDefinition {
                rule_code: format!("R_{seq}"),
                priority,
                description: None,
                enabled: true,
                conditions,
            }),
        1..6,
    )
}

fn attribute_strategy() -> impl Strategy<Value = AttributeValue> {
    prop_oneof![
        Just(AttributeValue::Null),
        any::<bool>().prop_map(AttributeValue::Bool),
        (-60i64..60).prop_map(AttributeValue::Int),
        (-60.0f64..60.0).prop_map(AttributeValue::Float),
        string_value().prop_map(AttributeValue::Str),
    ]
}

fn event_strategy() -> impl Strategy<Value = Event> {
    proptest::collection::hash_map(field_name(), attribute_strategy(), 0..5).prop_map(|attrs| {
        let mut event = Event::new("prop-evt");
        event.attributes = attrs;
        event
    })
}

proptest! {
    #[test]
    fn dictionary_round_trips(words in proptest::collection::vec(".{0,12}", 0..32)) {
        let mut dict = Dictionary::new();
        let ids: Vec<u32> = words.iter().map(|w| dict.encode(w)).collect();
        for (word, id) in words.iter().zip(ids) {
            prop_assert_eq!(dict.decode(id), Some(word.as_str()));
            prop_assert_eq!(dict.lookup(word), Some(id));
        }
        prop_assert!(dict.len() <= words.len());
    }

    #[test]
    fn simd_matches_scalar_on_random_groups(
        thresholds in proptest::collection::vec(-1e6f64..1e6, 1..64),
        value in -1e6f64..1e6,
    ) {
        let group = NumericGroup {
            operator: Operator::GreaterThan,
            predicate_ids: (0..thresholds.len() as u32).collect(),
            lows: thresholds.clone(),
            highs: Vec::new(),
        };
        let mut out = Vec::new();
        group.evaluate(value, None, &mut NumericScratch::default(), &mut out);
        out.sort_unstable();

        let expected: Vec<u32> = thresholds
            .iter()
            .enumerate()
            .filter(|(_, &t)| value > t)
            .map(|(i, _)| i as u32)
            .collect();
        prop_assert_eq!(out, expected);
    }

    #[test]
    fn between_simd_matches_scalar_on_random_groups(
        bounds in proptest::collection::vec((-1e5f64..1e5, -1e5f64..1e5), 1..48),
        value in -1e5f64..1e5,
    ) {
        let lows: Vec<f64> = bounds.iter().map(|(a, b)| a.min(*b)).collect();
        let highs: Vec<f64> = bounds.iter().map(|(a, b)| a.max(*b)).collect();
        let group = NumericGroup {
            operator: Operator::Between,
            predicate_ids: (0..bounds.len() as u32).collect(),
            lows: lows.clone(),
            highs: highs.clone(),
        };
        let mut out = Vec::new();
        group.evaluate(value, None, &mut NumericScratch::default(), &mut out);
        out.sort_unstable();

        let expected: Vec<u32> = lows
            .iter()
            .zip(&highs)
            .enumerate()
            .filter(|(_, (&lo, &hi))| value >= lo && value <= hi)
            .map(|(i, _)| i as u32)
            .collect();
        prop_assert_eq!(out, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn compiled_models_uphold_their_invariants(rules in ruleset_strategy()) {
        let compiler = RuleCompiler::new(&EngineConfig::default());
        let model = compiler
            .compile(&StaticRuleSource::new(rules))
            .expect("generated rulesets are valid");

        for c in 0..model.num_combinations() as u32 {
            let preds = model.combination_predicates(c);
            prop_assert!(!preds.is_empty());
            prop_assert!(preds.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(preds.len() as u32, model.predicate_count(c));
            for &p in preds {
                prop_assert!(model.inverted_index(p).contains(c));
            }
            prop_assert!(!model.rules_for_combination(c).is_empty());
        }
        for p in 0..model.num_predicates() as u32 {
            for c in model.inverted_index(p) {
                prop_assert!(model.combination_predicates(c).contains(&p));
            }
        }
    }

    #[test]
    fn compilation_is_deterministic_for_random_rulesets(rules in ruleset_strategy()) {
        let compiler = RuleCompiler::new(&EngineConfig::default());
        let a = compiler
            .compile(&StaticRuleSource::new(rules.clone()))
            .expect("compiles");
        let b = compiler
            .compile(&StaticRuleSource::new(rules))
            .expect("compiles");
        prop_assert!(a.structurally_equal(&b));
    }

    #[test]
    fn matched_combinations_have_all_predicates_true(
        rules in ruleset_strategy(),
        event in event_strategy(),
    ) {
        let compiler = RuleCompiler::new(&EngineConfig::default());
        let model = compiler
            .compile(&StaticRuleSource::new(rules))
            .expect("compiles");
        let evaluator = matchgrid::RuleEvaluator::new(model.clone(), &EngineConfig::default())
            .with_strategy(SelectionStrategy::AllMatches);

        let (_, trace) = evaluator.evaluate_with_trace(&event);
        let encoded = model.encoder().encode(&event);
        for &c in &trace.matched_combinations {
            for &p in model.combination_predicates(c) {
                let predicate = model.predicate(p);
                prop_assert!(
                    predicate.evaluate(encoded.get(predicate.field_id), model.value_dict()),
                    "combination {} matched but predicate {} is false",
                    c,
                    p
                );
            }
        }
    }

    #[test]
    fn evaluation_is_idempotent_for_random_inputs(
        rules in ruleset_strategy(),
        event in event_strategy(),
    ) {
        let compiler = RuleCompiler::new(&EngineConfig::default());
        let model = compiler
            .compile(&StaticRuleSource::new(rules))
            .expect("compiles");
        let evaluator = matchgrid::RuleEvaluator::new(model, &EngineConfig::default())
            .with_strategy(SelectionStrategy::AllMatches);

        let first = evaluator.evaluate(&event).matched_rules;
        for _ in 0..3 {
            prop_assert_eq!(&evaluator.evaluate(&event).matched_rules, &first);
        }
    }
}
