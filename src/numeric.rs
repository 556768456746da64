//! Batched numeric predicate evaluation.
//!
//! Fields carrying many GT/LT/BETWEEN predicates are organized into dense
//! per-operator arrays of `(predicate_id, threshold)` so one event value can
//! be compared against all thresholds in contiguous SIMD strides. Dispatch
//! goes through `pulp`, which selects the widest instruction set available
//! at runtime: each stride is one vector compare whose mask is materialized
//! into a 0/1 flags buffer, walked afterwards to emit matching ids. The
//! scalar tail and the pure-scalar fallback share exact semantics with the
//! vector path (strict GT/LT, inclusive BETWEEN).

use std::collections::HashMap;

use pulp::{Arch, Simd, WithSimd};

use crate::predicate::{Operator, Predicate, PredicateValue};

/// Below this many thresholds, vector dispatch is not worth its overhead.
const SIMD_MIN_LEN: usize = 4;

/// Dense predicates of one `(field, operator)` pair.
///
/// Arrays are parallel and sorted by ascending predicate id. `highs` is
/// populated for BETWEEN only.
#[derive(Debug, Clone)]
pub struct NumericGroup {
    pub operator: Operator,
    pub predicate_ids: Vec<u32>,
    pub lows: Vec<f64>,
    pub highs: Vec<f64>,
}

/// All numeric groups of one field.
#[derive(Debug, Clone)]
pub struct FieldGroups {
    pub field_id: u32,
    pub groups: Vec<NumericGroup>,
}

/// Per-model numeric organization.
#[derive(Debug, Clone, Default)]
pub struct NumericIndex {
    per_field: HashMap<u32, FieldGroups>,
    /// `grouped[predicate_id]` — predicate is handled by a batch group.
    grouped: Vec<bool>,
}

impl NumericIndex {
    /// Group numeric predicates of every field that carries at least
    /// `group_threshold` of them. Ungrouped numeric predicates stay on the
    /// scalar per-predicate path.
    pub fn build(predicates: &[Predicate], group_threshold: usize) -> Self {
        let mut counts: HashMap<u32, usize> = HashMap::new();
        for p in predicates {
            if p.operator.is_numeric_range() {
                *counts.entry(p.field_id).or_default() += 1;
            }
        }

        let mut per_field: HashMap<u32, FieldGroups> = HashMap::new();
        let mut grouped = vec![false; predicates.len()];
        for (id, p) in predicates.iter().enumerate() {
            if !p.operator.is_numeric_range() {
                continue;
            }
            if counts.get(&p.field_id).copied().unwrap_or(0) < group_threshold.max(1) {
                continue;
            }
            let (lo, hi) = match &p.value {
                PredicateValue::Float(t) => (*t, 0.0),
                PredicateValue::Range(lo, hi) => (*lo, *hi),
                _ => continue,
            };
            let field = per_field.entry(p.field_id).or_insert_with(|| FieldGroups {
                field_id: p.field_id,
                groups: Vec::new(),
            });
            let group = match field.groups.iter_mut().position(|g| g.operator == p.operator) {
                Some(i) => &mut field.groups[i],
                None => {
                    field.groups.push(NumericGroup {
                        operator: p.operator,
                        predicate_ids: Vec::new(),
                        lows: Vec::new(),
                        highs: Vec::new(),
                    });
                    field.groups.last_mut().expect("just pushed")
                }
            };
            group.predicate_ids.push(id as u32);
            group.lows.push(lo);
            if p.operator == Operator::Between {
                group.highs.push(hi);
            }
            grouped[id] = true;
        }

        NumericIndex { per_field, grouped }
    }

    pub fn field_groups(&self, field_id: u32) -> Option<&FieldGroups> {
        self.per_field.get(&field_id)
    }

    pub fn is_grouped(&self, predicate: u32) -> bool {
        self.grouped
            .get(predicate as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldGroups> {
        self.per_field.values()
    }

    pub fn is_empty(&self) -> bool {
        self.per_field.is_empty()
    }
}

/// Reusable densification and mask buffers, owned by the evaluation context.
#[derive(Debug, Clone, Default)]
pub struct NumericScratch {
    pub ids: Vec<u32>,
    pub lows: Vec<f64>,
    pub highs: Vec<f64>,
    /// Per-threshold 0/1 outcome flags filled by the compare kernels.
    pub flags: Vec<f64>,
}

impl NumericScratch {
    pub fn clear(&mut self) {
        self.ids.clear();
        self.lows.clear();
        self.highs.clear();
        self.flags.clear();
    }
}

impl NumericGroup {
    /// Emit the ids of predicates satisfied by `value` into `out`.
    ///
    /// `eligible` (sorted ids) restricts which predicates participate; they
    /// are densified into `scratch` first. Returns the number of predicates
    /// evaluated.
    pub fn evaluate(
        &self,
        value: f64,
        eligible: Option<&[u32]>,
        scratch: &mut NumericScratch,
        out: &mut Vec<u32>,
    ) -> u32 {
        let between = self.operator == Operator::Between;
        match eligible {
            None => {
                scratch.flags.clear();
                scratch.flags.resize(self.predicate_ids.len(), 0.0);
            }
            Some(filter) => {
                scratch.clear();
                for (i, &pid) in self.predicate_ids.iter().enumerate() {
                    if filter.binary_search(&pid).is_ok() {
                        scratch.ids.push(pid);
                        scratch.lows.push(self.lows[i]);
                        if between {
                            scratch.highs.push(self.highs[i]);
                        }
                    }
                }
                scratch.flags.resize(scratch.ids.len(), 0.0);
            }
        }
        let (ids, lows, highs): (&[u32], &[f64], &[f64]) = match eligible {
            None => (&self.predicate_ids, &self.lows, &self.highs),
            Some(_) => (&scratch.ids, &scratch.lows, &scratch.highs),
        };
        let flags = &mut scratch.flags;

        if ids.is_empty() {
            return 0;
        }
        match self.operator {
            Operator::GreaterThan => compare_thresholds(value, lows, flags, false),
            Operator::LessThan => compare_thresholds(value, lows, flags, true),
            Operator::Between => between_bounds(value, lows, highs, flags),
            _ => debug_assert!(false, "non-range operator in numeric group"),
        }
        for (i, &flag) in flags.iter().enumerate() {
            if flag != 0.0 {
                out.push(ids[i]);
            }
        }
        ids.len() as u32
    }
}

/// `flip = false`: flag where `value > threshold`; `flip = true`: where
/// `value < threshold`. Both comparisons are strict.
fn compare_thresholds(value: f64, thresholds: &[f64], flags: &mut [f64], flip: bool) {
    debug_assert_eq!(thresholds.len(), flags.len());
    if thresholds.len() < SIMD_MIN_LEN {
        for (i, &t) in thresholds.iter().enumerate() {
            let hit = if flip { value < t } else { value > t };
            flags[i] = if hit { 1.0 } else { 0.0 };
        }
        return;
    }
    Arch::new().dispatch(CompareKernel {
        value,
        thresholds,
        flags,
        flip,
    });
}

/// Flag where `lo <= value <= hi` (inclusive bounds).
fn between_bounds(value: f64, lows: &[f64], highs: &[f64], flags: &mut [f64]) {
    debug_assert_eq!(lows.len(), flags.len());
    debug_assert_eq!(highs.len(), flags.len());
    if lows.len() < SIMD_MIN_LEN {
        for i in 0..lows.len() {
            flags[i] = if value >= lows[i] && value <= highs[i] {
                1.0
            } else {
                0.0
            };
        }
        return;
    }
    Arch::new().dispatch(BetweenKernel {
        value,
        lows,
        highs,
        flags,
    });
}

struct CompareKernel<'a> {
    value: f64,
    thresholds: &'a [f64],
    flags: &'a mut [f64],
    flip: bool,
}

impl WithSimd for CompareKernel<'_> {
    type Output = ();

    #[inline(always)]
    fn with_simd<S: Simd>(self, simd: S) -> Self::Output {
        let Self {
            value,
            thresholds,
            flags,
            flip,
        } = self;
        let (t_head, t_tail) = S::f64s_as_simd(thresholds);
        let (f_head, f_tail) = S::f64s_as_mut_simd(flags);
        let broadcast = simd.f64s_splat(value);
        let ones = simd.f64s_splat(1.0);
        let zeros = simd.f64s_splat(0.0);

        // One vector compare per stride; the mask selects 0/1 lanes.
        for (t, f) in t_head.iter().zip(f_head) {
            let mask = if flip {
                simd.f64s_less_than(broadcast, *t)
            } else {
                simd.f64s_less_than(*t, broadcast)
            };
            *f = simd.m64s_select_f64s(mask, ones, zeros);
        }
        for (t, f) in t_tail.iter().zip(f_tail) {
            let hit = if flip { value < *t } else { *t < value };
            *f = if hit { 1.0 } else { 0.0 };
        }
    }
}

struct BetweenKernel<'a> {
    value: f64,
    lows: &'a [f64],
    highs: &'a [f64],
    flags: &'a mut [f64],
}

impl WithSimd for BetweenKernel<'_> {
    type Output = ();

    #[inline(always)]
    fn with_simd<S: Simd>(self, simd: S) -> Self::Output {
        let Self {
            value,
            lows,
            highs,
            flags,
        } = self;
        let (lo_head, lo_tail) = S::f64s_as_simd(lows);
        let (hi_head, hi_tail) = S::f64s_as_simd(highs);
        let (f_head, f_tail) = S::f64s_as_mut_simd(flags);
        let broadcast = simd.f64s_splat(value);
        let ones = simd.f64s_splat(1.0);
        let zeros = simd.f64s_splat(0.0);

        // lo <= value AND value <= hi, masks ANDed per stride.
        for ((lo, hi), f) in lo_head.iter().zip(hi_head).zip(f_head) {
            let above = simd.f64s_less_than_or_equal(*lo, broadcast);
            let below = simd.f64s_less_than_or_equal(broadcast, *hi);
            let mask = simd.m64s_and(above, below);
            *f = simd.m64s_select_f64s(mask, ones, zeros);
        }
        for ((lo, hi), f) in lo_tail.iter().zip(hi_tail).zip(f_tail) {
            *f = if value >= *lo && value <= *hi { 1.0 } else { 0.0 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gt_group(thresholds: &[f64]) -> NumericGroup {
        NumericGroup {
            operator: Operator::GreaterThan,
            predicate_ids: (0..thresholds.len() as u32).collect(),
            lows: thresholds.to_vec(),
            highs: Vec::new(),
        }
    }

    fn between_group(bounds: &[(f64, f64)]) -> NumericGroup {
        NumericGroup {
            operator: Operator::Between,
            predicate_ids: (0..bounds.len() as u32).collect(),
            lows: bounds.iter().map(|b| b.0).collect(),
            highs: bounds.iter().map(|b| b.1).collect(),
        }
    }

    fn eval(group: &NumericGroup, value: f64, eligible: Option<&[u32]>) -> Vec<u32> {
        let mut out = Vec::new();
        group.evaluate(value, eligible, &mut NumericScratch::default(), &mut out);
        out.sort_unstable();
        out
    }

    fn scalar_reference(group: &NumericGroup, value: f64) -> Vec<u32> {
        group
            .predicate_ids
            .iter()
            .enumerate()
            .filter(|(i, _)| match group.operator {
                Operator::GreaterThan => value > group.lows[*i],
                Operator::LessThan => value < group.lows[*i],
                Operator::Between => value >= group.lows[*i] && value <= group.highs[*i],
                _ => unreachable!("range operators only"),
            })
            .map(|(_, &id)| id)
            .collect()
    }

    #[test]
    fn greater_than_is_strict() {
        let group = gt_group(&[1000.0, 2000.0, 3000.0, 4000.0, 5000.0, 6000.0, 7000.0, 8000.0]);
        assert_eq!(eval(&group, 5000.0, None), vec![0, 1, 2, 3]);
        assert_eq!(eval(&group, 1000.0, None), Vec::<u32>::new());
        assert_eq!(eval(&group, 8000.5, None), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn less_than_is_strict() {
        let group = NumericGroup {
            operator: Operator::LessThan,
            ..gt_group(&[10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0])
        };
        assert_eq!(eval(&group, 45.0, None), vec![4, 5, 6, 7, 8]);
        assert_eq!(eval(&group, 90.0, None), Vec::<u32>::new());
    }

    #[test]
    fn between_is_inclusive_on_both_ends() {
        let group = between_group(&[
            (0.0, 10.0),
            (10.0, 20.0),
            (20.0, 30.0),
            (5.0, 25.0),
            (10.0, 10.0),
            (30.0, 40.0),
            (-5.0, 15.0),
            (11.0, 12.0),
        ]);
        assert_eq!(eval(&group, 10.0, None), vec![0, 1, 3, 4, 6]);
    }

    #[test]
    fn eligibility_filter_densifies() {
        let group = gt_group(&[10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0]);
        let eligible = vec![0, 2, 4, 6];
        assert_eq!(eval(&group, 55.0, Some(&eligible)), vec![0, 2, 4]);
    }

    #[test]
    fn empty_eligibility_short_circuits() {
        let group = gt_group(&[10.0, 20.0, 30.0, 40.0]);
        let mut out = Vec::new();
        let evaluated = group.evaluate(99.0, Some(&[]), &mut NumericScratch::default(), &mut out);
        assert_eq!(evaluated, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn simd_matches_scalar_across_sizes_and_boundaries() {
        for n in [1usize, 3, 4, 7, 8, 9, 15, 16, 33, 100] {
            let thresholds: Vec<f64> = (0..n).map(|i| i as f64 * 10.0).collect();
            let group = gt_group(&thresholds);
            for value in [-1.0, 0.0, 5.0, 45.0, 45.00001, 990.0, 1e18] {
                let got = eval(&group, value, None);
                assert_eq!(got, scalar_reference(&group, value), "n={n} value={value}");
            }
        }
    }

    #[test]
    fn between_simd_matches_scalar_across_sizes() {
        for n in [1usize, 4, 8, 17, 64] {
            let bounds: Vec<(f64, f64)> =
                (0..n).map(|i| (i as f64, i as f64 + 10.0)).collect();
            let group = between_group(&bounds);
            for value in [-5.0, 0.0, 9.5, 10.0, 31.0, 999.0] {
                let got = eval(&group, value, None);
                assert_eq!(got, scalar_reference(&group, value), "n={n} value={value}");
            }
        }
    }

    #[test]
    fn build_groups_only_dense_fields() {
        let mut predicates = Vec::new();
        // Field 0: eight GT predicates -> grouped.
        for i in 0..8 {
            predicates.push(Predicate {
                field_id: 0,
                operator: Operator::GreaterThan,
                value: PredicateValue::Float(f64::from(i) * 1000.0),
                weight: 0.6,
                selectivity: 0.4,
            });
        }
        // Field 1: a single BETWEEN -> stays scalar.
        predicates.push(Predicate {
            field_id: 1,
            operator: Operator::Between,
            value: PredicateValue::Range(0.0, 1.0),
            weight: 0.7,
            selectivity: 0.3,
        });

        let index = NumericIndex::build(&predicates, 8);
        assert!(index.field_groups(0).is_some());
        assert!(index.field_groups(1).is_none());
        assert!(index.is_grouped(0));
        assert!(!index.is_grouped(8));
    }

    #[test]
    fn mixed_operators_split_into_groups() {
        let mut predicates = Vec::new();
        for i in 0..4 {
            predicates.push(Predicate {
                field_id: 7,
                operator: Operator::GreaterThan,
                value: PredicateValue::Float(f64::from(i)),
                weight: 0.6,
                selectivity: 0.4,
            });
            predicates.push(Predicate {
                field_id: 7,
                operator: Operator::Between,
                value: PredicateValue::Range(f64::from(i), f64::from(i) + 1.0),
                weight: 0.7,
                selectivity: 0.3,
            });
        }
        let index = NumericIndex::build(&predicates, 8);
        let field = index.field_groups(7).expect("field grouped");
        assert_eq!(field.groups.len(), 2);
        let between = field
            .groups
            .iter()
            .find(|g| g.operator == Operator::Between)
            .expect("between group");
        assert_eq!(between.highs.len(), between.lows.len());
    }
}
