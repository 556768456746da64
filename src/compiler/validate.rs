//! Validation-only path: full rule checking without building indices.
//!
//! Runs parsing, canonicalization, and a dry expansion count per rule,
//! collecting every problem instead of failing on the first. Never
//! constructs predicates, combinations, or the inverted index.

use serde::Serialize;

use crate::definition::RuleSource;
use crate::dictionary::Dictionary;
use crate::error::{CompileError, CompileErrorKind, CompileResult};

use super::canon;
use super::expansion;
use super::RuleCompiler;

/// One validation failure, with as much context as the failure allows.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    pub rule_code: Option<String>,
    pub condition_index: Option<usize>,
    pub field: Option<String>,
    pub message: String,
}

/// Warning severity, for consumers that filter reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningSeverity {
    Info,
    Warning,
}

/// A non-fatal observation about the ruleset.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationWarning {
    pub rule_code: String,
    pub message: String,
    pub severity: WarningSeverity,
}

/// Outcome of the validation-only path.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl RuleCompiler {
    /// Validate a source without compiling it.
    ///
    /// I/O failures bubble as errors; everything else (parse errors
    /// included) lands in the report.
    pub fn validate(&self, source: &dyn RuleSource) -> CompileResult<ValidationReport> {
        let definitions = match source.load() {
            Ok(defs) => defs,
            Err(e) if e.kind() == CompileErrorKind::Io => return Err(e),
            Err(e) => {
                return Ok(ValidationReport {
                    is_valid: false,
                    errors: vec![error_entry(&e)],
                    warnings: Vec::new(),
                })
            }
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut seen_codes = std::collections::HashSet::new();
        let mut field_dict = Dictionary::new();
        let max_expansions = self.config().compiler.max_expansions_per_rule;

        for def in &definitions {
            if !def.enabled {
                warnings.push(ValidationWarning {
                    rule_code: def.rule_code.clone(),
                    message: "rule is disabled and will be skipped".to_string(),
                    severity: WarningSeverity::Info,
                });
                continue;
            }
            if !seen_codes.insert(def.rule_code.clone()) {
                warnings.push(ValidationWarning {
                    rule_code: def.rule_code.clone(),
                    message: "duplicate rule code; all occurrences stay active".to_string(),
                    severity: WarningSeverity::Warning,
                });
            }

            match canon::canonicalize_rule(def, &mut field_dict) {
                Err(e) => {
                    let mut entry = error_entry(&e);
                    entry.field = e
                        .condition_index()
                        .and_then(|i| def.conditions.get(i))
                        .map(|c| c.field.clone());
                    errors.push(entry);
                }
                Ok(None) => {}
                Ok(Some(rule)) => {
                    // Dry expansion: detect combinatorial blowups without
                    // materializing anything.
                    let count = expansion::expansion_count(&rule);
                    if count > max_expansions {
                        errors.push(ValidationError {
                            rule_code: Some(def.rule_code.clone()),
                            condition_index: None,
                            field: None,
                            message: format!(
                                "rule expands to {count} combinations (limit {max_expansions})"
                            ),
                        });
                    }
                }
            }
        }

        Ok(ValidationReport {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        })
    }
}

fn error_entry(e: &CompileError) -> ValidationError {
    ValidationError {
        rule_code: e.rule_code().map(str::to_string),
        condition_index: e.condition_index(),
        field: None,
        message: e.to_string(),
    }
}
