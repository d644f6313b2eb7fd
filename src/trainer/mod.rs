//! Supernet training loops
//!
//! [`OneShotTrainer`] trains shared weights by sampling one path per step
//! under a [`SamplePolicy`]. [`DartsTrainer`] alternates architecture and
//! weight updates for differentiable search.

mod checkpoint;
mod darts;
mod meters;
mod one_shot;

use serde::{Deserialize, Serialize};

use crate::nas::Subnet;

pub use checkpoint::Checkpoint;
pub use darts::{DartsConfig, DartsEpoch, DartsTrainer};
pub use meters::AverageMeter;
pub use one_shot::{OneShotTrainer, OneShotTrainerConfig, StepOutput};

/// Proxy used by the balanced sampler to rank candidate subnets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMetric {
    Flops,
    Params,
    Zenscore,
}

/// Subnet selection policy of one training step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SamplePolicy {
    /// One uniformly sampled subnet
    Uniform,
    /// Two subnets with a rank loss between them
    PairwiseRank,
    /// `num_pairs` subnets with a rank loss between every pair
    MultiPairwiseRank { num_pairs: usize },
    /// FairNAS rounds: every choice trained once per round
    Fair,
    /// Best of `n_samples` uniform draws under a proxy metric
    Balanced { metric: BalanceMetric, n_samples: usize },
    /// Always the same architecture
    Fixed { subnet: Subnet },
}

impl Default for SamplePolicy {
    fn default() -> Self {
        Self::Uniform
    }
}

/// Metrics of one epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_top1: f64,
    pub train_top5: f64,
    pub val_loss: Option<f64>,
    pub val_top1: Option<f64>,
    pub val_top5: Option<f64>,
}

/// `min(k, classes)` so that top-k stays meaningful on small label sets
pub(crate) fn topk(num_classes: usize) -> [usize; 2] {
    [1, 5.min(num_classes.max(1))]
}
