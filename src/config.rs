//! Configuration system.
//!
//! Hierarchical configuration loading from:
//! - matchgrid.toml (default configuration)
//! - matchgrid.local.toml (git-ignored local overrides)
//! - Environment variables (MATCHGRID_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # matchgrid.toml
//! [evaluation]
//! selection_strategy = "first_match"
//!
//! [cache]
//! base_condition_ttl_secs = 300
//! eligible_set_capacity = 10000
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! MATCHGRID_EVALUATION__SELECTION_STRATEGY=all_matches
//! MATCHGRID_CACHE__BASE_CONDITION_TTL_SECS=60
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::evaluator::SelectionStrategy;

/// Main configuration struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub numeric: NumericConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Compiler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Hard cap on DNF expansions per rule; exceeding it fails compilation.
    #[serde(default = "default_max_expansions")]
    pub max_expansions_per_rule: usize,

    /// Enable the IS_ANY_OF subset factoring pass.
    #[serde(default = "default_true")]
    pub enable_factoring: bool,
}

/// Evaluation behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Which matches to surface to the caller.
    #[serde(default)]
    pub selection_strategy: SelectionStrategy,

    /// Worker threads for batch evaluation (0 = rayon default).
    #[serde(default)]
    pub batch_parallelism: usize,

    /// Evaluation contexts kept pooled per evaluator.
    #[serde(default = "default_pool_capacity")]
    pub context_pool_capacity: usize,
}

/// Cache sizing and lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for cached base-condition outcomes, in seconds.
    #[serde(default = "default_base_ttl")]
    pub base_condition_ttl_secs: u64,

    /// Bound on cached base-condition outcomes.
    #[serde(default = "default_base_capacity")]
    pub base_condition_capacity: usize,

    /// Bound on memoized eligible-predicate sets.
    #[serde(default = "default_eligible_capacity")]
    pub eligible_set_capacity: usize,
}

/// Numeric batch evaluation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericConfig {
    /// Minimum numeric predicates on a field before it is grouped for
    /// batched evaluation.
    #[serde(default = "default_simd_threshold")]
    pub simd_group_threshold: usize,
}

/// Logging configuration, consumed by the CLI's subscriber setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines instead of text.
    #[serde(default)]
    pub json: bool,
}

fn default_max_expansions() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_pool_capacity() -> usize {
    num_cpus::get().max(1)
}
fn default_base_ttl() -> u64 {
    300
}
fn default_base_capacity() -> usize {
    100_000
}
fn default_eligible_capacity() -> usize {
    10_000
}
fn default_simd_threshold() -> usize {
    8
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            max_expansions_per_rule: default_max_expansions(),
            enable_factoring: true,
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        EvaluationConfig {
            selection_strategy: SelectionStrategy::default(),
            batch_parallelism: 0,
            context_pool_capacity: default_pool_capacity(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            base_condition_ttl_secs: default_base_ttl(),
            base_condition_capacity: default_base_capacity(),
            eligible_set_capacity: default_eligible_capacity(),
        }
    }
}

impl Default for NumericConfig {
    fn default() -> Self {
        NumericConfig {
            simd_group_threshold: default_simd_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from default locations.
    ///
    /// Merges in order:
    /// 1. matchgrid.toml (base configuration)
    /// 2. matchgrid.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (MATCHGRID_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("matchgrid.toml"))
            .merge(Toml::file("matchgrid.local.toml"))
            .merge(Env::prefixed("MATCHGRID_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("MATCHGRID_").split("__"))
            .extract()
    }
}
