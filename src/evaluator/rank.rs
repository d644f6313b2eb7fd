//! Rank correlation between proxy scores and ground truth
//!
//! Degenerate inputs (fewer than two points, or a constant series) yield a
//! correlation of 0.

use serde::{Deserialize, Serialize};

use crate::error::{NasError, Result};

fn check_lengths(x: &[f64], y: &[f64]) -> Result<()> {
    if x.len() != y.len() {
        return Err(NasError::shape(
            format!("{} values", x.len()),
            format!("{} values", y.len()),
        ));
    }
    Ok(())
}

fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        0.0
    } else {
        x.iter().sum::<f64>() / x.len() as f64
    }
}

/// Pearson linear correlation coefficient
pub fn pearson(x: &[f64], y: &[f64]) -> Result<f64> {
    check_lengths(x, y)?;
    if x.len() < 2 {
        return Ok(0.0);
    }
    let x_mean = mean(x);
    let y_mean = mean(y);

    let mut sum_xy = 0.0;
    let mut sum_x2 = 0.0;
    let mut sum_y2 = 0.0;
    for (&xi, &yi) in x.iter().zip(y) {
        let dx = xi - x_mean;
        let dy = yi - y_mean;
        sum_xy += dx * dy;
        sum_x2 += dx * dx;
        sum_y2 += dy * dy;
    }

    let denom = (sum_x2 * sum_y2).sqrt();
    Ok(if denom == 0.0 { 0.0 } else { sum_xy / denom })
}

/// 1-based ranks, ties share their average rank
fn average_ranks(x: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..x.len()).collect();
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]));

    let mut ranks = vec![0.0; x.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && x[order[j + 1]] == x[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Spearman rank correlation: Pearson over average ranks
pub fn spearman(x: &[f64], y: &[f64]) -> Result<f64> {
    check_lengths(x, y)?;
    pearson(&average_ranks(x), &average_ranks(y))
}

/// Kendall tau-b, accounting for ties in either series
pub fn kendalltau(x: &[f64], y: &[f64]) -> Result<f64> {
    check_lengths(x, y)?;
    let n = x.len();
    if n < 2 {
        return Ok(0.0);
    }

    let (mut concordant, mut discordant) = (0i64, 0i64);
    let (mut ties_x, mut ties_y) = (0i64, 0i64);
    for i in 0..n {
        for j in (i + 1)..n {
            let dx = x[i] - x[j];
            let dy = y[i] - y[j];
            match (dx == 0.0, dy == 0.0) {
                (true, true) => {}
                (true, false) => ties_x += 1,
                (false, true) => ties_y += 1,
                (false, false) => {
                    if (dx > 0.0) == (dy > 0.0) {
                        concordant += 1;
                    } else {
                        discordant += 1;
                    }
                }
            }
        }
    }

    let n_x = (concordant + discordant + ties_x) as f64;
    let n_y = (concordant + discordant + ties_y) as f64;
    let denom = (n_x * n_y).sqrt();
    Ok(if denom == 0.0 {
        0.0
    } else {
        (concordant - discordant) as f64 / denom
    })
}

/// Kendall tau, Pearson and Spearman of one proxy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankConsistency {
    pub kendalltau: f64,
    pub pearson: f64,
    pub spearman: f64,
}

impl RankConsistency {
    pub fn compute(truth: &[f64], proxy: &[f64]) -> Result<Self> {
        Ok(Self {
            kendalltau: kendalltau(truth, proxy)?,
            pearson: pearson(truth, proxy)?,
            spearman: spearman(truth, proxy)?,
        })
    }
}

/// Prediction quality of a zero-cost predictor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionScores {
    pub mae: f64,
    pub rmse: f64,
    pub pearson: f64,
    pub spearman: f64,
    pub kendalltau: f64,
    /// Kendall tau after rounding predictions to two decimals
    pub kt_2dec: f64,
    /// Kendall tau after rounding predictions to one decimal
    pub kt_1dec: f64,
    /// Mean seconds per queried architecture
    pub query_time: f64,
}

fn round_to(x: &[f64], decimals: i32) -> Vec<f64> {
    let scale = 10f64.powi(decimals);
    x.iter().map(|v| (v * scale).round() / scale).collect()
}

/// Error and correlation statistics of `pred` against `truth`
pub fn compute_scores(truth: &[f64], pred: &[f64]) -> Result<PredictionScores> {
    check_lengths(truth, pred)?;
    let n = truth.len().max(1) as f64;
    let mae = truth.iter().zip(pred).map(|(t, p)| (t - p).abs()).sum::<f64>() / n;
    let mse = truth.iter().zip(pred).map(|(t, p)| (t - p).powi(2)).sum::<f64>() / n;

    Ok(PredictionScores {
        mae,
        rmse: mse.sqrt(),
        pearson: pearson(truth, pred)?,
        spearman: spearman(truth, pred)?,
        kendalltau: kendalltau(truth, pred)?,
        kt_2dec: kendalltau(truth, &round_to(pred, 2))?,
        kt_1dec: kendalltau(truth, &round_to(pred, 1))?,
        query_time: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_concordance() {
        let truth = [0.9, 0.5];
        let proxy = [10.0, 1.0];
        assert_eq!(kendalltau(&truth, &proxy).unwrap(), 1.0);
        assert!((pearson(&truth, &proxy).unwrap() - 1.0).abs() < 1e-12);
        assert!((spearman(&truth, &proxy).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_reversed_order() {
        let truth = [1.0, 2.0, 3.0, 4.0];
        let proxy = [8.0, 6.0, 4.0, 2.0];
        assert_eq!(kendalltau(&truth, &proxy).unwrap(), -1.0);
        assert!((spearman(&truth, &proxy).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_kendall_tau_b_with_ties() {
        // one discordant pair and one tie in the proxy
        let truth = [1.0, 2.0, 3.0];
        let proxy = [1.0, 1.0, 0.5];
        // concordant 0, discordant 2, ties_y 1: -2 / sqrt(3 * 2)
        let expected = -2.0 / 6f64.sqrt();
        assert!((kendalltau(&truth, &proxy).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_average_ranks() {
        assert_eq!(average_ranks(&[3.0, 1.0, 3.0, 2.0]), vec![3.5, 1.0, 3.5, 2.0]);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(pearson(&[1.0, 1.0], &[2.0, 3.0]).unwrap(), 0.0);
        assert_eq!(kendalltau(&[1.0], &[2.0]).unwrap(), 0.0);
        assert!(pearson(&[1.0, 2.0], &[1.0]).is_err());
    }

    #[test]
    fn test_compute_scores() {
        let truth = [0.1, 0.2, 0.3];
        let pred = [0.11, 0.19, 0.33];
        let scores = compute_scores(&truth, &pred).unwrap();
        assert!((scores.mae - 0.05 / 3.0).abs() < 1e-12);
        assert_eq!(scores.kendalltau, 1.0);
        // rounding to one decimal keeps the order
        assert_eq!(scores.kt_1dec, 1.0);
    }
}
