//! Rule-file DTOs and the `RuleSource` abstraction.
//!
//! A rule file is a JSON array of rule objects:
//!
//! ```json
//! [
//!   { "rule_code": "R_1", "priority": 100, "description": "high value",
//!     "enabled": true,
//!     "conditions": [
//!       { "field": "STATUS",  "operator": "EQUAL_TO",  "value": "ACTIVE" },
//!       { "field": "AMOUNT",  "operator": "BETWEEN",   "value": [100, 500] },
//!       { "field": "COUNTRY", "operator": "IS_ANY_OF", "value": ["US", "CA"] }
//!     ] }
//! ]
//! ```
//!
//! Operators are kept as raw strings at this layer; the compiler resolves
//! them so an unknown operator reports `InvalidOperator` with rule context
//! rather than a bare JSON error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};

/// One condition as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ConditionValue>,
}

/// A condition value: scalar or list (lists only for IS_ANY_OF / BETWEEN).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ConditionValue>),
}

/// One logical rule as authored: a conjunction of conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub rule_code: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

fn default_enabled() -> bool {
    true
}

/// Yields rule definitions to the compiler.
pub trait RuleSource {
    fn load(&self) -> CompileResult<Vec<RuleDefinition>>;
}

/// In-memory JSON source.
pub struct JsonRuleSource {
    json: String,
}

impl JsonRuleSource {
    pub fn new(json: impl Into<String>) -> Self {
        JsonRuleSource { json: json.into() }
    }
}

impl RuleSource for JsonRuleSource {
    fn load(&self) -> CompileResult<Vec<RuleDefinition>> {
        Ok(serde_json::from_str(&self.json)?)
    }
}

/// JSON rule file on disk.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        JsonFileSource {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl RuleSource for JsonFileSource {
    fn load(&self) -> CompileResult<Vec<RuleDefinition>> {
        let bytes = std::fs::read(&self.path).map_err(CompileError::Io)?;
        let text = String::from_utf8(bytes).map_err(|e| CompileError::Parse {
            message: format!("{}: {e}", self.path.display()),
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Pre-built definitions, used by embedders and tests.
pub struct StaticRuleSource {
    definitions: Vec<RuleDefinition>,
}

impl StaticRuleSource {
    pub fn new(definitions: Vec<RuleDefinition>) -> Self {
        StaticRuleSource { definitions }
    }
}

impl RuleSource for StaticRuleSource {
    fn load(&self) -> CompileResult<Vec<RuleDefinition>> {
        Ok(self.definitions.clone())
    }
}
