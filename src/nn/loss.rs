//! Losses and classification metrics

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{NasError, Result};

fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut probs = logits.clone();
    for mut row in probs.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

/// Mean softmax cross-entropy over the batch.
///
/// Returns the loss and its gradient with respect to the logits.
pub fn cross_entropy(logits: &Array2<f64>, labels: &[usize]) -> Result<(f64, Array2<f64>)> {
    let (n, classes) = logits.dim();
    if n != labels.len() {
        return Err(NasError::shape(
            format!("{} labels", n),
            format!("{} labels", labels.len()),
        ));
    }
    if let Some(bad) = labels.iter().find(|&&y| y >= classes) {
        return Err(NasError::ComputationError(format!(
            "label {bad} out of range for {classes} classes"
        )));
    }

    let probs = softmax_rows(logits);
    let loss = labels
        .iter()
        .enumerate()
        .map(|(i, &y)| -(probs[[i, y]].max(1e-12)).ln())
        .sum::<f64>()
        / n as f64;

    let mut grad = probs;
    for (i, &y) in labels.iter().enumerate() {
        grad[[i, y]] -= 1.0;
    }
    grad /= n as f64;
    Ok((loss, grad))
}

/// Top-k accuracy in percent for every `k` in `topk`
pub fn accuracy(logits: &Array2<f64>, labels: &[usize], topk: &[usize]) -> Vec<f64> {
    let n = labels.len().max(1) as f64;
    topk.iter()
        .map(|&k| {
            let hits = logits
                .rows()
                .into_iter()
                .zip(labels.iter())
                .filter(|(row, y)| {
                    let y = **y;
                    let target = row[y];
                    // ties are resolved in favour of lower indices, like a stable sort
                    let better = row
                        .iter()
                        .enumerate()
                        .filter(|&(j, &v)| v > target || (v == target && j < y))
                        .count();
                    better < k
                })
                .count();
            100.0 * hits as f64 / n
        })
        .collect()
}

/// Which of the two compared subnets receives the rank-loss gradient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankTarget {
    First,
    Second,
}

/// Value and gradient of one pairwise rank term
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankLossTerm {
    pub value: f64,
    /// Subnet whose loss the term is differentiated through
    pub target: RankTarget,
    /// d(term)/d(loss of `target`), the other loss is treated as a constant
    pub grad: f64,
}

/// Pairwise ranking loss between two subnets.
///
/// The subnet with the larger prior (FLOPs, params, ...) is expected to reach
/// a loss no higher than the smaller one: `coeff * relu(loss_big - loss_small)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PairwiseRankLoss {
    pub coeff: f64,
}

impl Default for PairwiseRankLoss {
    fn default() -> Self {
        Self { coeff: 1.0 }
    }
}

impl PairwiseRankLoss {
    pub fn new(coeff: f64) -> Self {
        Self { coeff }
    }

    pub fn forward(&self, prior1: f64, prior2: f64, loss1: f64, loss2: f64) -> RankLossTerm {
        let (target, big, small) = if prior1 < prior2 {
            (RankTarget::Second, loss2, loss1)
        } else {
            (RankTarget::First, loss1, loss2)
        };
        let gap = big - small;
        if gap > 0.0 {
            RankLossTerm {
                value: self.coeff * gap,
                target,
                grad: self.coeff,
            }
        } else {
            RankLossTerm {
                value: 0.0,
                target,
                grad: 0.0,
            }
        }
    }
}
