//! Benchmark-backed evaluation of architecture proxies
//!
//! [`Nb201Evaluator`] measures how well supernet accuracy, FLOPs or a
//! zero-cost metric rank architectures against NAS-Bench-201 ground truth.
//! [`ZeroCostEvaluator`] scores a zero-cost predictor against a table of
//! precomputed predictor outputs.

mod benchmark;
mod nb201;
mod rank;
mod zero_cost;

pub use benchmark::{BenchmarkApi, JsonBenchmark};
pub use nb201::{benchmark_dataset, MetricType, Nb201Evaluator, Nb201EvaluatorConfig};
pub use rank::{compute_scores, kendalltau, pearson, spearman, PredictionScores, RankConsistency};
pub use zero_cost::{clamp_score, TestData, ZeroCostConfig, ZeroCostEvaluator, INF_SENTINEL};
