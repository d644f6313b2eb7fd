//! Rank consistency of supernet proxies against NAS-Bench-201
//!
//! Benchmark records are keyed by genotype string; every record maps a
//! dataset name to the metric sequences of that architecture:
//!
//! ```text
//! {"|nor_conv_3x3~0|+...": {"cifar10-valid": {"eval_acc1es": [..],
//!                                             "cost_info": {"flops": ..}}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use super::benchmark::{json_kind, BenchmarkApi};
use super::rank::RankConsistency;
use crate::error::{NasError, Result};
use crate::models::{genotype, Supernet};
use crate::nas::{strip_placeholders, Mutator, Subnet};
use crate::nn::DataLoader;
use crate::trainer::OneShotTrainer;

/// Metric queried from a benchmark record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    TrainLosses,
    EvalLosses,
    TrainAcc1es,
    EvalAcc1es,
    CostInfo,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::TrainLosses => "train_losses",
            MetricType::EvalLosses => "eval_losses",
            MetricType::TrainAcc1es => "train_acc1es",
            MetricType::EvalAcc1es => "eval_acc1es",
            MetricType::CostInfo => "cost_info",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train_losses" => Ok(MetricType::TrainLosses),
            "eval_losses" => Ok(MetricType::EvalLosses),
            "train_acc1es" => Ok(MetricType::TrainAcc1es),
            "eval_acc1es" => Ok(MetricType::EvalAcc1es),
            "cost_info" => Ok(MetricType::CostInfo),
            other => Err(NasError::unsupported("metric type", other)),
        }
    }
}

/// Benchmark split name of a dataset
pub fn benchmark_dataset(dataset: &str) -> Result<&'static str> {
    match dataset {
        "cifar10" | "cifar10-valid" => Ok("cifar10-valid"),
        "cifar100" => Ok("cifar100"),
        "imagenet16" | "ImageNet16-120" => Ok("ImageNet16-120"),
        other => Err(NasError::unsupported("dataset", other)),
    }
}

/// Benchmark operation names differ from the supernet candidate names
fn benchmark_op(op: &str) -> &str {
    match op {
        "conv_1x1" => "nor_conv_1x1",
        "conv_3x3" => "nor_conv_3x3",
        other => other,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Nb201EvaluatorConfig {
    pub dataset: String,
    pub metric_type: MetricType,
    /// Architectures sampled per rank-consistency run
    pub num_sample: usize,
}

impl Default for Nb201EvaluatorConfig {
    fn default() -> Self {
        Self {
            dataset: "cifar10".to_string(),
            metric_type: MetricType::EvalAcc1es,
            num_sample: 50,
        }
    }
}

#[derive(Debug)]
pub struct Nb201Evaluator<B: BenchmarkApi> {
    api: B,
    config: Nb201EvaluatorConfig,
    dataset: &'static str,
}

impl<B: BenchmarkApi> Nb201Evaluator<B> {
    pub fn new(api: B, config: Nb201EvaluatorConfig) -> Result<Self> {
        let dataset = benchmark_dataset(&config.dataset)?;
        if config.num_sample == 0 {
            return Err(NasError::ConfigError(
                "num_sample must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            api,
            config,
            dataset,
        })
    }

    pub fn config(&self) -> &Nb201EvaluatorConfig {
        &self.config
    }

    pub fn dataset(&self) -> &str {
        self.dataset
    }

    /// Benchmark key of a subnet
    pub fn generate_genotype(&self, subnet: &Subnet, mutator: &Mutator) -> Result<String> {
        let renamed: Subnet = strip_placeholders(subnet)
            .into_iter()
            .map(|(gid, op)| (gid, benchmark_op(&op).to_string()))
            .collect();
        genotype(&renamed, mutator.alias2group_id())
    }

    /// Configured metric of an architecture.
    ///
    /// Sequence metrics yield their last epoch; `cost_info` yields the entry
    /// named `cost_key`.
    pub fn query_result(&self, genotype: &str, cost_key: &str) -> Result<f64> {
        self.query(genotype, self.config.metric_type, cost_key)
    }

    fn query(&self, genotype: &str, metric: MetricType, cost_key: &str) -> Result<f64> {
        let malformed = |reason: String| NasError::BenchmarkRecord {
            key: genotype.to_string(),
            reason,
        };
        let record = self.api.get(genotype)?;
        let entry = record
            .get(self.dataset)
            .and_then(|d| d.get(metric.as_str()))
            .ok_or_else(|| malformed(format!("no `{}` for `{}`", metric, self.dataset)))?;

        let value = match metric {
            MetricType::CostInfo => entry
                .get(cost_key)
                .ok_or_else(|| malformed(format!("no cost entry `{cost_key}`")))?,
            _ => match entry {
                Value::Array(seq) => seq
                    .last()
                    .ok_or_else(|| malformed(format!("empty `{metric}` sequence")))?,
                other => other,
            },
        };
        value
            .as_f64()
            .ok_or_else(|| malformed(format!("expected a number, got {}", json_kind(value))))
    }

    /// Random subnet, its genotype and its benchmarked metric
    fn sample_truth(&self, mutator: &mut Mutator) -> Result<(Subnet, String, f64)> {
        let subnet = strip_placeholders(&mutator.random_subnet()?);
        let geno = self.generate_genotype(&subnet, mutator)?;
        let truth = self.query_result(&geno, "flops")?;
        debug!(genotype = %geno, truth, "sampled architecture");
        Ok((subnet, geno, truth))
    }

    /// Supernet top-1 of random subnets against their benchmarked metric
    pub fn compute_rank_consistency<M: Supernet>(
        &self,
        trainer: &mut OneShotTrainer<M>,
        loader: &mut DataLoader,
    ) -> Result<RankConsistency> {
        info!(num_sample = self.config.num_sample, "computing rank consistency");
        let mut truth = Vec::with_capacity(self.config.num_sample);
        let mut proxy = Vec::with_capacity(self.config.num_sample);
        for _ in 0..self.config.num_sample {
            let (subnet, _, value) = self.sample_truth(trainer.mutator_mut())?;
            let (_, top1, _) = trainer.metric_score(loader, Some(&subnet))?;
            truth.push(value);
            proxy.push(top1);
        }
        self.finish("supernet", &truth, &proxy)
    }

    /// Benchmarked FLOPs of random subnets against their benchmarked metric
    pub fn compute_rank_by_flops(&self, mutator: &mut Mutator) -> Result<RankConsistency> {
        let mut truth = Vec::with_capacity(self.config.num_sample);
        let mut proxy = Vec::with_capacity(self.config.num_sample);
        for _ in 0..self.config.num_sample {
            let (_, geno, value) = self.sample_truth(mutator)?;
            truth.push(value);
            proxy.push(self.query(&geno, MetricType::CostInfo, "flops")?);
        }
        self.finish("flops", &truth, &proxy)
    }

    /// Zen score of random subnets against their benchmarked metric.
    ///
    /// Non-finite scores count as 0.
    pub fn compute_rank_by_zerometric<M: Supernet>(
        &self,
        trainer: &mut OneShotTrainer<M>,
    ) -> Result<RankConsistency> {
        let mut truth = Vec::with_capacity(self.config.num_sample);
        let mut proxy = Vec::with_capacity(self.config.num_sample);
        for _ in 0..self.config.num_sample {
            let (subnet, _, value) = self.sample_truth(trainer.mutator_mut())?;
            let score = trainer.get_subnet_zenscore(&subnet)?;
            truth.push(value);
            proxy.push(if score.is_finite() { score } else { 0.0 });
        }
        self.finish("zenscore", &truth, &proxy)
    }

    fn finish(&self, proxy_name: &str, truth: &[f64], proxy: &[f64]) -> Result<RankConsistency> {
        let rank = RankConsistency::compute(truth, proxy)?;
        info!(
            proxy = proxy_name,
            kendalltau = rank.kendalltau,
            pearson = rank.pearson,
            spearman = rank.spearman,
            "rank consistency"
        );
        Ok(rank)
    }
}
