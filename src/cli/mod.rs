//! Kolosal NAS CLI Module
//!
//! Command-line interface for supernet search, differentiable search and
//! benchmark evaluation.

use clap::{Parser, Subcommand};
use colored::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{NasConfig, SupernetConfig};
use crate::evaluator::{
    JsonBenchmark, MetricType, Nb201Evaluator, RankConsistency, ZeroCostConfig, ZeroCostEvaluator,
};
use crate::models::{Nb201Supernet, SearchableMlp, Supernet};
use crate::nas::{Mutator, MutatorConfig};
use crate::trainer::{BalanceMetric, DartsTrainer, EpochStats, OneShotTrainer, SamplePolicy};

// ─── Output ────────────────────────────────────────────────────────────────────

fn label(s: &str) -> ColoredString {
    s.truecolor(140, 140, 140)
}

fn rule(width: usize) {
    println!("  {}", "─".repeat(width).bright_black());
}

fn heading(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    rule(56);
}

fn kv_line(key: &str, val: impl std::fmt::Display) {
    println!("  {:<16} {}", label(key), val.to_string().white());
}

fn saved(what: &str, path: &Path) {
    println!("  {} {what} → {}", "✓".green(), path.display());
}

/// A long-running step: prints its name on start and the elapsed time on finish
struct Step {
    started: Instant,
}

impl Step {
    fn start(name: &str) -> Self {
        print!("  {} {name}... ", "›".blue());
        let _ = std::io::stdout().flush();
        Self {
            started: Instant::now(),
        }
    }

    fn finish(self, detail: &str) {
        let elapsed = format!("{:.2?}", self.started.elapsed());
        println!("{} {} {}", "done".green(), elapsed.bright_black(), detail.bright_black());
    }
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "kolosal-nas")]
#[command(author = "KolosalAI")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Neural architecture search on weight-sharing supernets")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a one-shot supernet
    Search {
        /// JSON run configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of epochs (overrides the configuration)
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Sampling policy (uniform, pairwise, multi_pairwise, fair, balanced_flops, balanced_params, balanced_zen)
        #[arg(short, long)]
        policy: Option<String>,

        /// Write the epoch history as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Differentiable search over the NAS-Bench-201 space
    Darts {
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short, long)]
        epochs: Option<usize>,

        /// Write the epoch history as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rank consistency of a proxy against a NAS-Bench-201 table
    Rank {
        /// Benchmark table (JSON object keyed by genotype)
        #[arg(short, long)]
        benchmark: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Proxy to rank with (supernet, flops, zen)
        #[arg(long, default_value = "flops")]
        proxy: String,

        /// Metric type queried from the table
        #[arg(long, default_value = "eval_acc1es")]
        metric: String,

        /// Supernet training epochs before ranking with the supernet proxy
        #[arg(long, default_value = "1")]
        epochs: usize,
    },

    /// Evaluate a zero-cost predictor against a benchmark table
    EvaluateZc {
        /// Benchmark table with `val_accuracy` and predictor scores per key
        #[arg(short, long)]
        benchmark: PathBuf,

        /// Predictor name
        #[arg(short, long, default_value = "synflow")]
        method: String,

        #[arg(long, default_value = "100")]
        test_size: usize,

        /// Labeled test set; the table is sampled when omitted
        #[arg(long)]
        test_data: Option<PathBuf>,

        /// Directory receiving scores.json
        #[arg(short, long, default_value = "results")]
        save: PathBuf,

        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Show the supernet layout of a configuration
    Info {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Write the default configuration
    InitConfig {
        #[arg(short, long, default_value = "nas.json")]
        output: PathBuf,
    },
}

// ─── Helpers ───────────────────────────────────────────────────────────────────

pub fn load_config(path: Option<&Path>) -> anyhow::Result<NasConfig> {
    Ok(match path {
        Some(p) => NasConfig::from_file(p)?,
        None => NasConfig::default(),
    })
}

pub fn parse_policy(name: &str) -> anyhow::Result<SamplePolicy> {
    Ok(match name {
        "uniform" => SamplePolicy::Uniform,
        "pairwise" => SamplePolicy::PairwiseRank,
        "multi_pairwise" => SamplePolicy::MultiPairwiseRank { num_pairs: 3 },
        "fair" => SamplePolicy::Fair,
        "balanced_flops" => SamplePolicy::Balanced { metric: BalanceMetric::Flops, n_samples: 5 },
        "balanced_params" => SamplePolicy::Balanced { metric: BalanceMetric::Params, n_samples: 5 },
        "balanced_zen" => SamplePolicy::Balanced { metric: BalanceMetric::Zenscore, n_samples: 5 },
        _ => anyhow::bail!("Invalid sampling policy: {}", name),
    })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn print_history(history: &[EpochStats]) {
    println!();
    println!(
        "  {:<6} {:>10} {:>10} {:>10} {:>10}",
        label("Epoch"), label("LR"), label("Loss"), label("Top-1"), label("Val top-1")
    );
    rule(50);
    for s in history {
        println!(
            "  {:<6} {:>10.5} {:>10.4} {:>10.2} {:>10}",
            s.epoch,
            s.learning_rate,
            s.train_loss,
            s.train_top1,
            s.val_top1.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".to_string())
        );
    }
}

fn print_rank(label: &str, rank: &RankConsistency) {
    println!();
    kv_line("Proxy", label);
    kv_line("Kendall tau", format!("{:.4}", rank.kendalltau));
    kv_line("Pearson", format!("{:.4}", rank.pearson));
    kv_line("Spearman", format!("{:.4}", rank.spearman));
    println!();
}

// ─── Commands ──────────────────────────────────────────────────────────────────

fn search_with<M: Supernet>(
    model: M,
    config: &NasConfig,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let (mut train, mut val) = config.loaders()?;
    let mut trainer = OneShotTrainer::new(model, config.trainer.clone())?;
    kv_line("Groups", trainer.mutator().search_group().len());
    kv_line("Parameters", trainer.model().num_params());

    let step = Step::start(&format!("Training {} epochs", config.epochs));
    let history = trainer.fit(&mut train, Some(&mut val), config.epochs)?;
    step.finish("");

    print_history(&history);
    println!();
    kv_line("Best top-1", format!("{:.2}", trainer.best_top1()));
    println!();

    if let Some(path) = output {
        write_json(path, &history)?;
        saved("history", &path);
    }
    Ok(())
}

pub fn cmd_search(
    config_path: Option<&Path>,
    epochs: Option<usize>,
    policy: Option<&str>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    heading("One-shot search");
    let mut config = load_config(config_path)?;
    if let Some(epochs) = epochs {
        config.epochs = epochs;
    }
    if let Some(policy) = policy {
        config.trainer.policy = parse_policy(policy)?;
    }
    kv_line("Policy", format!("{:?}", config.trainer.policy));

    match config.supernet.clone() {
        SupernetConfig::Nb201(c) => search_with(Nb201Supernet::new(c)?, &config, output),
        SupernetConfig::Mlp(c) => search_with(SearchableMlp::new(c)?, &config, output),
    }
}

pub fn cmd_darts(
    config_path: Option<&Path>,
    epochs: Option<usize>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    heading("Differentiable search");
    let mut config = load_config(config_path)?.for_darts();
    if let Some(epochs) = epochs {
        config.epochs = epochs;
    }
    let model = match config.supernet.clone() {
        SupernetConfig::Nb201(c) => Nb201Supernet::new(c)?,
        SupernetConfig::Mlp(_) => {
            anyhow::bail!("differentiable search needs the nb201 supernet")
        }
    };
    let (mut train, mut val) = config.loaders()?;
    let mut trainer = DartsTrainer::new(model, config.darts.clone())?;

    let step = Step::start(&format!("Searching {} epochs", config.epochs));
    let history = trainer.fit(&mut train, &mut val, config.epochs)?;
    step.finish("");

    println!();
    println!("  {:<6} {:>8} {:>10} {:>10}", label("Epoch"), label("Tau"), label("Loss"), label("Arch loss"));
    rule(40);
    for e in &history {
        println!("  {:<6} {:>8.3} {:>10.4} {:>10.4}", e.epoch, e.tau, e.train_loss, e.arch_loss);
    }
    println!();
    kv_line("Genotype", trainer.genotype_string()?);
    let (_, top1, _) = trainer.validate(&mut val)?;
    kv_line("Val top-1", format!("{top1:.2}"));
    println!();

    if let Some(path) = output {
        write_json(path, &history)?;
        saved("history", &path);
    }
    Ok(())
}

pub fn cmd_rank(
    benchmark: &Path,
    config_path: Option<&Path>,
    proxy: &str,
    metric: &str,
    epochs: usize,
) -> anyhow::Result<()> {
    heading("Rank consistency");
    let mut config = load_config(config_path)?;
    config.nb201_evaluator.metric_type = metric.parse::<MetricType>()?;

    let step = Step::start("Loading benchmark");
    let api = JsonBenchmark::from_file(benchmark)?;
    step.finish(&format!("{} architectures", crate::evaluator::BenchmarkApi::len(&api)));
    let evaluator = Nb201Evaluator::new(api, config.nb201_evaluator.clone())?;

    let model = match config.supernet.clone() {
        SupernetConfig::Nb201(c) => Nb201Supernet::new(c)?,
        SupernetConfig::Mlp(_) => anyhow::bail!("rank consistency needs the nb201 supernet"),
    };

    let rank = match proxy {
        "flops" => {
            let mut mutator = Mutator::new(MutatorConfig::one_shot().with_seed(config.trainer.seed));
            mutator.prepare_from_supernet(&model)?;
            evaluator.compute_rank_by_flops(&mut mutator)?
        }
        "zen" => {
            let mut trainer = OneShotTrainer::new(model, config.trainer.clone())?;
            evaluator.compute_rank_by_zerometric(&mut trainer)?
        }
        "supernet" => {
            let (mut train, mut val) = config.loaders()?;
            let mut trainer = OneShotTrainer::new(model, config.trainer.clone())?;
            let step = Step::start(&format!("Training supernet {epochs} epochs"));
            trainer.fit(&mut train, None, epochs)?;
            step.finish("");
            evaluator.compute_rank_consistency(&mut trainer, &mut val)?
        }
        _ => anyhow::bail!("Invalid proxy: {}", proxy),
    };
    print_rank(proxy, &rank);
    Ok(())
}

pub fn cmd_evaluate_zc(
    benchmark: &Path,
    method: &str,
    test_size: usize,
    test_data: Option<&Path>,
    save: &Path,
    seed: u64,
) -> anyhow::Result<()> {
    heading("Zero-cost predictor");

    let step = Step::start("Loading benchmark");
    let api = JsonBenchmark::from_file(benchmark)?;
    step.finish(&format!("{} architectures", crate::evaluator::BenchmarkApi::len(&api)));

    let mut config = ZeroCostConfig::default()
        .with_method(method)
        .with_test_size(test_size)
        .with_save_dir(save)
        .with_seed(seed);
    if let Some(path) = test_data {
        config = config.with_test_data_file(path);
    }

    let mut evaluator = ZeroCostEvaluator::new(api, config)?;
    let step = Step::start(&format!("Scoring {}", method.cyan()));
    evaluator.evaluate()?;
    step.finish("");

    if let Some(scores) = evaluator.results().last() {
        println!();
        for key in ["kendalltau", "spearman", "pearson", "kt_2dec", "kt_1dec", "mae", "rmse", "query_time"] {
            let value = scores[key].as_f64().map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".to_string());
            kv_line(key, value);
        }
        println!();
    }
    saved("scores", &save.join("scores.json"));
    Ok(())
}

fn describe<M: Supernet>(model: &M) -> anyhow::Result<()> {
    let mut mutator = Mutator::new(MutatorConfig::one_shot());
    mutator.prepare_from_supernet(model)?;

    kv_line("Mutables", model.mutables().len());
    kv_line("Groups", mutator.search_group().len());
    kv_line("Parameters", model.num_params());
    kv_line("FLOPs / sample", model.flops(1));
    println!();

    println!("  {:<6} {:<28} {}", label("Group"), label("Members"), label("Choices"));
    rule(56);
    for (gid, members) in mutator.search_group() {
        println!(
            "  {:<6} {:<28} {}",
            gid,
            members.join(","),
            mutator.group_choices(*gid)?.join(" ").truecolor(140, 140, 140)
        );
    }
    println!();
    Ok(())
}

pub fn cmd_info(config_path: Option<&Path>) -> anyhow::Result<()> {
    heading("Supernet Info");
    let config = load_config(config_path)?;
    match config.supernet {
        SupernetConfig::Nb201(c) => describe(&Nb201Supernet::new(c)?),
        SupernetConfig::Mlp(c) => describe(&SearchableMlp::new(c)?),
    }
}

pub fn cmd_init_config(output: &Path) -> anyhow::Result<()> {
    NasConfig::default().save(output)?;
    saved("default configuration", &output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policy() {
        assert_eq!(parse_policy("fair").unwrap(), SamplePolicy::Fair);
        assert!(matches!(
            parse_policy("balanced_zen").unwrap(),
            SamplePolicy::Balanced { metric: BalanceMetric::Zenscore, .. }
        ));
        assert!(parse_policy("greedy").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["kolosal-nas", "search", "--epochs", "2", "--policy", "fair"]).unwrap();
        assert!(matches!(cli.command, Commands::Search { epochs: Some(2), .. }));

        let cli = Cli::try_parse_from(["kolosal-nas", "evaluate-zc", "--benchmark", "zc.json"]).unwrap();
        match cli.command {
            Commands::EvaluateZc { method, test_size, .. } => {
                assert_eq!(method, "synflow");
                assert_eq!(test_size, 100);
            }
            _ => panic!("expected evaluate-zc"),
        }
    }

    #[test]
    fn test_init_config_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nas.json");
        cmd_init_config(&path).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.epochs, NasConfig::default().epochs);
    }

}
