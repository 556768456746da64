//! # MatchGrid CLI
//!
//! Validate, compile, and evaluate rulesets from the command line.
//!
//! ```bash
//! matchgrid validate --rules rules.json
//! matchgrid compile  --rules rules.json
//! matchgrid evaluate --rules rules.json --events events.json --strategy all_matches
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use matchgrid::{
    analyze_conflicts, EngineConfig, Event, JsonFileSource, RuleCompiler, RuleEvaluator,
    SelectionStrategy,
};

#[derive(Parser)]
#[command(name = "matchgrid", about = "High-throughput rule matching engine", version)]
struct Cli {
    /// Path to a matchgrid.toml config file (defaults to the standard
    /// lookup: matchgrid.toml, matchgrid.local.toml, MATCHGRID_* env vars).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a rule file and print a validation report.
    Validate {
        #[arg(long)]
        rules: PathBuf,
    },
    /// Compile a rule file and print model statistics.
    Compile {
        #[arg(long)]
        rules: PathBuf,
        /// Also run conflict analysis on the compiled model.
        #[arg(long)]
        conflicts: bool,
    },
    /// Compile a rule file and evaluate a JSON array of events against it.
    Evaluate {
        #[arg(long)]
        rules: PathBuf,
        #[arg(long)]
        events: PathBuf,
        /// all_matches | first_match | max_priority_per_family
        #[arg(long)]
        strategy: Option<SelectionStrategy>,
        /// Explain this rule code against every event instead of matching.
        #[arg(long)]
        explain: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(&path.display().to_string())
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::load().context("loading configuration")?,
    };
    init_logging(&config);

    match cli.command {
        Command::Validate { rules } => validate(&config, &rules),
        Command::Compile { rules, conflicts } => compile(&config, &rules, conflicts),
        Command::Evaluate {
            rules,
            events,
            strategy,
            explain,
        } => evaluate(&config, &rules, &events, strategy, explain.as_deref()),
    }
}

fn init_logging(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn validate(config: &EngineConfig, rules: &PathBuf) -> anyhow::Result<()> {
    let compiler = RuleCompiler::new(config);
    let report = compiler
        .validate(&JsonFileSource::new(rules))
        .with_context(|| format!("validating {}", rules.display()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_valid {
        bail!("{} validation error(s)", report.errors.len());
    }
    Ok(())
}

fn compile(config: &EngineConfig, rules: &PathBuf, conflicts: bool) -> anyhow::Result<()> {
    let compiler = RuleCompiler::new(config);
    let model = compiler
        .compile(&JsonFileSource::new(rules))
        .with_context(|| format!("compiling {}", rules.display()))?;
    println!("{}", serde_json::to_string_pretty(&model.stats())?);
    if conflicts {
        let report = analyze_conflicts(&model);
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

fn evaluate(
    config: &EngineConfig,
    rules: &PathBuf,
    events: &PathBuf,
    strategy: Option<SelectionStrategy>,
    explain: Option<&str>,
) -> anyhow::Result<()> {
    let compiler = RuleCompiler::new(config);
    let model = compiler
        .compile(&JsonFileSource::new(rules))
        .with_context(|| format!("compiling {}", rules.display()))?;

    let text = std::fs::read_to_string(events)
        .with_context(|| format!("reading {}", events.display()))?;
    let events: Vec<Event> =
        serde_json::from_str(&text).context("events file must be a JSON array of events")?;

    let mut evaluator = RuleEvaluator::new(model, config);
    if let Some(strategy) = strategy {
        evaluator = evaluator.with_strategy(strategy);
    }

    match explain {
        Some(rule_code) => {
            for event in &events {
                let explanation = evaluator.explain(event, rule_code);
                println!("{}", serde_json::to_string(&explanation)?);
            }
        }
        None => {
            for result in evaluator.evaluate_batch(&events) {
                println!("{}", serde_json::to_string(&result)?);
            }
            let snapshot = evaluator.metrics().snapshot();
            eprintln!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }
    Ok(())
}
