//! The mutable contract
//!
//! A mutable is a supernet layer that owns a set of named candidate
//! operations. Depending on its state a forward pass computes:
//!
//! - the chosen candidate(s), once the mutable has been fixed
//!   ([`Mutable::fix_chosen`], irreversible pruning);
//! - the transiently selected candidate, while a subnet is active
//!   ([`Mutable::select`], reversible and re-applied every pass);
//! - the probability-weighted mixture of all candidates when architecture
//!   parameters are supplied;
//! - the plain sum of all candidates otherwise (cost accounting only).

use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rand_distr::Exp1;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::nn::Param;

/// Input of a mutable forward pass
#[derive(Debug, Clone, Copy)]
pub enum MutableInput<'a> {
    /// One tensor shared by every candidate
    Single(&'a Array2<f64>),
    /// One tensor per candidate edge (choice routes)
    Edges(&'a [Array2<f64>]),
}

impl<'a> From<&'a Array2<f64>> for MutableInput<'a> {
    fn from(x: &'a Array2<f64>) -> Self {
        MutableInput::Single(x)
    }
}

impl<'a> From<&'a [Array2<f64>]> for MutableInput<'a> {
    fn from(x: &'a [Array2<f64>]) -> Self {
        MutableInput::Edges(x)
    }
}

impl<'a> From<&'a Vec<Array2<f64>>> for MutableInput<'a> {
    fn from(x: &'a Vec<Array2<f64>>) -> Self {
        MutableInput::Edges(x.as_slice())
    }
}

/// Gradients produced by [`Mutable::backward`]
#[derive(Debug, Clone)]
pub struct MutableGrad {
    /// One entry per input tensor (a single entry for [`MutableInput::Single`])
    pub inputs: Vec<Array2<f64>>,
    /// Gradient w.r.t. the architecture parameter, when the last forward
    /// was a weighted mixture
    pub arch_param: Option<Array1<f64>>,
}

/// How architecture parameters are turned into per-choice probabilities
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbNormalizer {
    /// Continuous relaxation (DARTS)
    Softmax,
    /// Stochastic relaxation; `hard` yields straight-through one-hot weights
    Gumbel { tau: f64, hard: bool },
}

/// Normalized architecture probabilities
#[derive(Debug, Clone)]
pub struct ArchProbs {
    /// Weights applied to candidate outputs
    pub weights: Array1<f64>,
    /// Differentiable probabilities the gradient flows through
    pub soft: Array1<f64>,
    /// d(logits)/d(arch_param), `1 / tau` for Gumbel
    pub scale: f64,
}

pub(crate) fn softmax(logits: ArrayView1<f64>) -> Array1<f64> {
    let max_val = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp: Array1<f64> = logits.mapv(|x| (x - max_val).exp());
    let sum: f64 = exp.sum();
    if sum > 0.0 && sum.is_finite() {
        exp / sum
    } else {
        Array1::from_elem(logits.len(), 1.0 / logits.len().max(1) as f64)
    }
}

/// Index of the largest entry, first one on ties
pub(crate) fn argmax(values: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

impl ProbNormalizer {
    pub fn compute(&self, arch_param: ArrayView1<f64>, rng: &mut impl Rng) -> ArchProbs {
        match *self {
            ProbNormalizer::Softmax => {
                let soft = softmax(arch_param);
                ArchProbs {
                    weights: soft.clone(),
                    soft,
                    scale: 1.0,
                }
            }
            ProbNormalizer::Gumbel { tau, hard } => {
                let tau = tau.max(1e-6);
                // -ln(E) with E ~ Exp(1) is a standard Gumbel sample
                let logits = arch_param.mapv(|a| (a - rng.sample::<f64, _>(Exp1).ln()) / tau);
                let soft = softmax(logits.view());
                let weights = if hard {
                    let mut one_hot = Array1::zeros(soft.len());
                    one_hot[argmax(soft.view())] = 1.0;
                    one_hot
                } else {
                    soft.clone()
                };
                ArchProbs {
                    weights,
                    soft,
                    scale: 1.0 / tau,
                }
            }
        }
    }
}

/// Capability contract shared by every mutable variant
pub trait Mutable: fmt::Debug + Send {
    /// Unique path of the mutable inside its supernet
    fn name(&self) -> &str;

    /// Group key: mutables sharing an alias share one choice
    fn alias(&self) -> Option<&str>;

    /// Names of the remaining candidates, in construction order
    fn choices(&self) -> Vec<String>;

    fn num_choices(&self) -> usize {
        self.choices().len()
    }

    fn is_fixed(&self) -> bool;

    /// Chosen candidates, set once by [`Mutable::fix_chosen`]
    fn chosen(&self) -> Option<&[String]>;

    /// Permanently keep only `chosen`, pruning every other candidate.
    ///
    /// Fails if the mutable is already fixed.
    fn fix_chosen(&mut self, chosen: &[String]) -> Result<()>;

    /// Route the following passes through `choice` without pruning anything
    fn select(&mut self, choice: &str) -> Result<()>;

    fn clear_selection(&mut self);

    fn selected(&self) -> Option<&str>;

    /// Sum of the chosen candidates' outputs
    fn forward_fixed(&mut self, x: MutableInput<'_>) -> Result<Array2<f64>>;

    /// Sum of every candidate's output
    fn forward_all(&mut self, x: MutableInput<'_>) -> Result<Array2<f64>>;

    /// Output of a single candidate
    fn forward_choice(&mut self, x: MutableInput<'_>, choice: &str) -> Result<Array2<f64>>;

    /// Weighted mixture, or [`Mutable::forward_all`] without parameters
    fn forward_arch_param(
        &mut self,
        x: MutableInput<'_>,
        arch_param: Option<ArrayView1<f64>>,
    ) -> Result<Array2<f64>>;

    fn forward(
        &mut self,
        x: MutableInput<'_>,
        arch_param: Option<ArrayView1<f64>>,
    ) -> Result<Array2<f64>> {
        if self.is_fixed() {
            return self.forward_fixed(x);
        }
        if let Some(choice) = self.selected().map(str::to_string) {
            return self.forward_choice(x, &choice);
        }
        self.forward_arch_param(x, arch_param)
    }

    /// Backpropagate through the last forward pass
    fn backward(&mut self, grad: &Array2<f64>) -> Result<MutableGrad>;

    /// Per-choice probabilities for the given architecture parameter
    fn compute_arch_probs(&mut self, arch_param: ArrayView1<f64>) -> ArchProbs;

    /// Deterministic decode: softmax then arg-max
    fn sample_choice(&self, arch_param: ArrayView1<f64>) -> Result<String>;

    /// Gumbel temperature; a no-op for softmax mutables
    fn set_temperature(&mut self, _tau: f64) {}

    fn parameters(&self) -> Vec<&Param>;

    fn parameters_mut(&mut self) -> Vec<&mut Param>;

    fn choice_flops(&self, choice: &str, batch: usize) -> Result<usize>;

    fn choice_params(&self, choice: &str) -> Result<usize>;
}
