//! Minimal differentiable building blocks
//!
//! Activations are `Array2<f64>` tensors of shape `[batch, features]`. Every
//! [`Operation`] caches what it needs during `forward` and accumulates its
//! parameter gradients during `backward`, the same manual backpropagation
//! scheme used by the MLP models in the training module.

mod data;
mod loss;
mod ops;
mod optim;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

pub use data::{synthetic_blobs, Batch, DataLoader, Dataset};
pub use loss::{accuracy, cross_entropy, PairwiseRankLoss, RankLossTerm, RankTarget};
pub use ops::{
    avg_pool_3x3, conv_1x1, conv_3x3, AvgPool1d, Identity, Linear, Relu, Sequential, Zero,
};
pub use optim::{Adam, AdamConfig, LrScheduler, Sgd, SgdConfig};

/// A trainable tensor with its accumulated gradient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub value: Array2<f64>,
    pub grad: Array2<f64>,
}

impl Param {
    pub fn new(value: Array2<f64>) -> Self {
        let grad = Array2::zeros(value.raw_dim());
        Self { value, grad }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Number of scalar entries
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// True when nothing flowed into this parameter since the last `zero_grad`
    pub fn grad_is_zero(&self) -> bool {
        self.grad.iter().all(|g| *g == 0.0)
    }
}

/// A differentiable transform `[batch, in] -> [batch, out]`
pub trait Operation: fmt::Debug + Send {
    /// Compute the output and cache whatever `backward` needs
    fn forward(&mut self, x: &Array2<f64>) -> Result<Array2<f64>>;

    /// Accumulate parameter gradients and return the gradient w.r.t. the input
    fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>>;

    fn parameters(&self) -> Vec<&Param> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        Vec::new()
    }

    fn num_params(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    /// Multiply-accumulate count for a batch of the given size
    fn flops(&self, batch: usize) -> usize;
}

/// Clear the gradients of a parameter list
pub fn zero_grad(params: &mut [&mut Param]) {
    for p in params.iter_mut() {
        p.zero_grad();
    }
}

/// Global L2 norm of the gradients of a parameter list
pub fn grad_norm(params: &[&Param]) -> f64 {
    params
        .iter()
        .map(|p| p.grad.iter().map(|g| g * g).sum::<f64>())
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_param_zero_grad() {
        let mut p = Param::new(array![[1.0, 2.0], [3.0, 4.0]]);
        assert!(p.grad_is_zero());
        p.grad[[0, 1]] = 0.5;
        assert!(!p.grad_is_zero());
        p.zero_grad();
        assert!(p.grad_is_zero());
        assert_eq!(p.len(), 4);
    }

    #[test]
    fn test_grad_norm() {
        let mut a = Param::new(array![[0.0, 0.0]]);
        let mut b = Param::new(array![[0.0]]);
        a.grad = array![[3.0, 0.0]];
        b.grad = array![[4.0]];
        assert!((grad_norm(&[&a, &b]) - 5.0).abs() < 1e-12);
    }
}
