//! Ruleset conflict analysis.
//!
//! Two families of conflicts are reported:
//!
//! - **duplicates**: several logical rules deduplicated onto the same
//!   combination, so they always match together;
//! - **shadowing**: one combination's predicate set is a strict subset of
//!   another's, so the broader rule matches whenever the narrower one does.
//!
//! Superset discovery rides the inverted index: intersecting the postings
//! of a combination's predicates yields exactly the combinations containing
//! all of them.

use roaring::RoaringBitmap;
use serde::Serialize;

use crate::model::EngineModel;

/// Rules that share a single combination.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateConflict {
    pub combination: u32,
    pub rule_codes: Vec<String>,
}

/// A broader rule that always matches when a narrower one does.
#[derive(Debug, Clone, Serialize)]
pub struct ShadowConflict {
    pub broader_rule: String,
    pub broader_combination: u32,
    pub narrower_rule: String,
    pub narrower_combination: u32,
}

/// Full conflict analysis output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConflictReport {
    pub duplicates: Vec<DuplicateConflict>,
    pub shadows: Vec<ShadowConflict>,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.duplicates.is_empty() && self.shadows.is_empty()
    }
}

/// Analyze a compiled model for duplicate and shadowing rules.
pub fn analyze_conflicts(model: &EngineModel) -> ConflictReport {
    let mut report = ConflictReport::default();

    for c in 0..model.num_combinations() as u32 {
        let bindings = model.rules_for_combination(c);
        if bindings.len() > 1 {
            report.duplicates.push(DuplicateConflict {
                combination: c,
                rule_codes: bindings.iter().map(|b| b.code.to_string()).collect(),
            });
        }

        // Combinations containing every predicate of `c` are supersets of
        // `c`; `c` (fewer constraints) matches whenever they do.
        let predicates = model.combination_predicates(c);
        let mut supersets: Option<RoaringBitmap> = None;
        for &p in predicates {
            let postings = model.inverted_index(p);
            supersets = Some(match supersets {
                None => postings.clone(),
                Some(acc) => acc & postings,
            });
        }
        let Some(supersets) = supersets else {
            continue;
        };
        for s in supersets {
            if s == c || model.combination_predicates(s).len() == predicates.len() {
                continue;
            }
            let broader = model.rule_code(c);
            let narrower = model.rule_code(s);
            if broader == narrower {
                // Expansions of one logical rule legitimately nest.
                continue;
            }
            report.shadows.push(ShadowConflict {
                broader_rule: broader.to_string(),
                broader_combination: c,
                narrower_rule: narrower.to_string(),
                narrower_combination: s,
            });
        }
    }

    report
}
