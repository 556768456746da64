//! Operator-class selectivity estimates.
//!
//! Selectivity is the expected fraction of events a predicate matches, in
//! `(0, 1]`. The constants are heuristics; only their ordering matters for
//! evaluation-order quality (equality and nullity checks are cheapest and
//! most selective, substring and regex scans the least). `weight = 1 -
//! selectivity` orders a field's predicates.

use crate::predicate::Operator;

/// Estimated match fraction for one operator class.
pub(crate) fn estimate(operator: Operator) -> f64 {
    match operator {
        Operator::EqualTo | Operator::IsNull => 0.05,
        Operator::Between => 0.30,
        Operator::GreaterThan | Operator::LessThan => 0.40,
        Operator::Contains => 0.60,
        Operator::Regex => 0.70,
        Operator::NotEqualTo | Operator::IsNotNull => 0.95,
        // Eliminated before predicates are minted; the value is never used.
        Operator::IsAnyOf => 0.05,
    }
}

/// Evaluation-order weight derived from selectivity.
pub(crate) fn weight(operator: Operator) -> f64 {
    1.0 - estimate(operator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_operator_classes() {
        // equality/nullity < ranges < substring/regex scans
        assert!(estimate(Operator::EqualTo) < estimate(Operator::Between));
        assert!(estimate(Operator::Between) <= estimate(Operator::GreaterThan));
        assert!(estimate(Operator::GreaterThan) < estimate(Operator::Contains));
        assert!(estimate(Operator::Contains) <= estimate(Operator::Regex));
    }

    #[test]
    fn estimates_stay_in_unit_interval() {
        for op in [
            Operator::EqualTo,
            Operator::NotEqualTo,
            Operator::GreaterThan,
            Operator::LessThan,
            Operator::Between,
            Operator::Contains,
            Operator::Regex,
            Operator::IsNull,
            Operator::IsNotNull,
        ] {
            let s = estimate(op);
            assert!(s > 0.0 && s <= 1.0);
            assert!((weight(op) - (1.0 - s)).abs() < 1e-12);
        }
    }
}
