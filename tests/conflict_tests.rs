//! Conflict analysis: duplicate rules and shadowing detection.

use matchgrid::{analyze_conflicts, EngineConfig, JsonRuleSource, RuleCompiler};

fn report(json: &str) -> matchgrid::ConflictReport {
    let model = RuleCompiler::new(&EngineConfig::default())
        .compile(&JsonRuleSource::new(json))
        .expect("ruleset compiles");
    analyze_conflicts(&model)
}

#[test]
fn identical_rules_are_reported_as_duplicates() {
    let report = report(
        r#"[
        {"rule_code":"FIRST","conditions":[
            {"field":"STATUS","operator":"EQUAL_TO","value":"ACTIVE"},
            {"field":"AMT","operator":"GREATER_THAN","value":100}]},
        {"rule_code":"SECOND","conditions":[
            {"field":"AMT","operator":"GREATER_THAN","value":100},
            {"field":"STATUS","operator":"EQUAL_TO","value":"ACTIVE"}]}]"#,
    );
    assert_eq!(report.duplicates.len(), 1);
    assert_eq!(
        report.duplicates[0].rule_codes,
        vec!["FIRST".to_string(), "SECOND".to_string()]
    );
    assert!(report.shadows.is_empty());
}

#[test]
fn broader_rules_shadow_narrower_ones() {
    let report = report(
        r#"[
        {"rule_code":"NARROW","conditions":[
            {"field":"STATUS","operator":"EQUAL_TO","value":"ACTIVE"},
            {"field":"AMT","operator":"GREATER_THAN","value":100}]},
        {"rule_code":"BROAD","conditions":[
            {"field":"STATUS","operator":"EQUAL_TO","value":"ACTIVE"}]}]"#,
    );
    assert!(report.duplicates.is_empty());
    assert_eq!(report.shadows.len(), 1);
    let shadow = &report.shadows[0];
    assert_eq!(shadow.broader_rule, "BROAD");
    assert_eq!(shadow.narrower_rule, "NARROW");
}

#[test]
fn expansions_of_one_rule_do_not_self_shadow() {
    let report = report(
        r#"[{"rule_code":"GEO","conditions":[
            {"field":"COUNTRY","operator":"IS_ANY_OF","value":["US","CA"]}]}]"#,
    );
    assert!(report.is_empty());
}

#[test]
fn unrelated_rules_produce_a_clean_report() {
    let report = report(
        r#"[
        {"rule_code":"A","conditions":[
            {"field":"X","operator":"GREATER_THAN","value":5}]},
        {"rule_code":"B","conditions":[
            {"field":"Y","operator":"LESS_THAN","value":9}]}]"#,
    );
    assert!(report.is_empty());
}
