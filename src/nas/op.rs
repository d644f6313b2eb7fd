//! Single-input choice layers: one-shot, differentiable and
//! dynamic-threshold differentiable

use ndarray::{Array1, Array2, ArrayView1};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::candidates::CandidateSet;
use super::mutable::{
    argmax, softmax, ArchProbs, Mutable, MutableGrad, MutableInput, ProbNormalizer,
};
use super::Candidate;
use crate::error::{NasError, Result};
use crate::nn::Param;

/// Behaviour of the weighted branch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpKind {
    /// Discrete path sampling; architecture parameters are ignored
    OneShot,
    /// Softmax mixture
    Diff,
    /// Softmax mixture that freezes on the arg-max once the top-2 gap
    /// reaches `threshold`
    DynaDiff { threshold: f64 },
}

/// A mutable whose candidates all read the same input
#[derive(Debug)]
pub struct ChoiceOp {
    name: String,
    alias: Option<String>,
    kind: OpKind,
    candidates: CandidateSet,
    chosen: Option<Vec<String>>,
    selected: Option<String>,
    rng: Xoshiro256PlusPlus,
}

impl ChoiceOp {
    pub fn new(name: &str, kind: OpKind, candidates: Vec<Candidate>) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            alias: None,
            kind,
            candidates: CandidateSet::new(name, candidates, false)?,
            chosen: None,
            selected: None,
            rng: Xoshiro256PlusPlus::seed_from_u64(0),
        })
    }

    pub fn one_shot(name: &str, candidates: Vec<Candidate>) -> Result<Self> {
        Self::new(name, OpKind::OneShot, candidates)
    }

    pub fn diff(name: &str, candidates: Vec<Candidate>) -> Result<Self> {
        Self::new(name, OpKind::Diff, candidates)
    }

    pub fn dyna_diff(name: &str, candidates: Vec<Candidate>, threshold: f64) -> Result<Self> {
        Self::new(name, OpKind::DynaDiff { threshold }, candidates)
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    fn all_plan(&self) -> Vec<(usize, f64)> {
        (0..self.candidates.len()).map(|i| (i, 1.0)).collect()
    }

    fn check_arch_len(&self, arch_param: ArrayView1<f64>) -> Result<()> {
        if arch_param.len() != self.candidates.len() {
            return Err(NasError::shape(
                format!("{} architecture weights for `{}`", self.candidates.len(), self.name),
                format!("{}", arch_param.len()),
            ));
        }
        Ok(())
    }

    /// Winner of the top-2 probability gap test, if confident enough
    fn confident_choice(probs: &Array1<f64>, threshold: f64) -> Option<usize> {
        if probs.len() < 2 {
            return Some(0);
        }
        let best = argmax(probs.view());
        let runner_up = probs
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != best)
            .map(|(_, p)| *p)
            .fold(f64::NEG_INFINITY, f64::max);
        (probs[best] - runner_up >= threshold).then_some(best)
    }
}

impl Mutable for ChoiceOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    fn choices(&self) -> Vec<String> {
        self.candidates.names().to_vec()
    }

    fn is_fixed(&self) -> bool {
        self.chosen.is_some()
    }

    fn chosen(&self) -> Option<&[String]> {
        self.chosen.as_deref()
    }

    fn fix_chosen(&mut self, chosen: &[String]) -> Result<()> {
        if self.is_fixed() {
            return Err(NasError::MutableFixed(self.name.clone()));
        }
        self.candidates.retain(chosen)?;
        self.chosen = Some(chosen.to_vec());
        self.selected = None;
        Ok(())
    }

    fn select(&mut self, choice: &str) -> Result<()> {
        self.candidates.index_of(choice)?;
        self.selected = Some(choice.to_string());
        Ok(())
    }

    fn clear_selection(&mut self) {
        self.selected = None;
    }

    fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    fn forward_fixed(&mut self, x: MutableInput<'_>) -> Result<Array2<f64>> {
        if self.chosen.is_none() {
            return Err(NasError::NotFixed(self.name.clone()));
        }
        let plan = self.all_plan();
        self.candidates.run(x, &plan, None)
    }

    fn forward_all(&mut self, x: MutableInput<'_>) -> Result<Array2<f64>> {
        let plan = self.all_plan();
        self.candidates.run(x, &plan, None)
    }

    fn forward_choice(&mut self, x: MutableInput<'_>, choice: &str) -> Result<Array2<f64>> {
        let idx = self.candidates.index_of(choice)?;
        self.candidates.run(x, &[(idx, 1.0)], None)
    }

    fn forward_arch_param(
        &mut self,
        x: MutableInput<'_>,
        arch_param: Option<ArrayView1<f64>>,
    ) -> Result<Array2<f64>> {
        let arch_param = match (self.kind, arch_param) {
            (OpKind::OneShot, _) | (_, None) => return self.forward_all(x),
            (_, Some(a)) => a,
        };
        self.check_arch_len(arch_param)?;
        let probs = self.compute_arch_probs(arch_param);

        if let OpKind::DynaDiff { threshold } = self.kind {
            if let Some(best) = Self::confident_choice(&probs.soft, threshold) {
                let choice = self.candidates.names()[best].clone();
                debug!(mutable = %self.name, choice = %choice, "dynamic threshold reached, fixing");
                self.fix_chosen(&[choice])?;
                return self.forward_fixed(x);
            }
        }

        let plan: Vec<(usize, f64)> = probs.weights.iter().cloned().enumerate().collect();
        self.candidates.run(x, &plan, Some(probs))
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<MutableGrad> {
        self.candidates.backward(grad)
    }

    fn compute_arch_probs(&mut self, arch_param: ArrayView1<f64>) -> ArchProbs {
        ProbNormalizer::Softmax.compute(arch_param, &mut self.rng)
    }

    fn sample_choice(&self, arch_param: ArrayView1<f64>) -> Result<String> {
        self.check_arch_len(arch_param)?;
        let probs = softmax(arch_param);
        Ok(self.candidates.names()[argmax(probs.view())].clone())
    }

    fn parameters(&self) -> Vec<&Param> {
        self.candidates.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.candidates.parameters_mut()
    }

    fn choice_flops(&self, choice: &str, batch: usize) -> Result<usize> {
        self.candidates.choice_flops(choice, batch)
    }

    fn choice_params(&self, choice: &str) -> Result<usize> {
        self.candidates.choice_params(choice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::candidate;
    use crate::nn::{Identity, Linear, Operation, Zero};
    use ndarray::array;

    fn scale(k: f64) -> Linear {
        Linear::from_weights(array![[k, 0.0], [0.0, k]], array![[0.0, 0.0]])
    }

    fn three_way(kind: OpKind) -> ChoiceOp {
        ChoiceOp::new(
            "layer",
            kind,
            vec![
                candidate("double", scale(2.0)),
                candidate("skip", Identity),
                candidate("none", Zero::new()),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_forward_all_is_sum_of_candidates() {
        let mut op = three_way(OpKind::OneShot);
        let x = array![[1.0, -2.0]];
        let y = op.forward(MutableInput::Single(&x), None).unwrap();
        assert_eq!(y, array![[3.0, -6.0]]);
    }

    #[test]
    fn test_fix_prunes_and_refuses_second_fix() {
        let mut op = three_way(OpKind::OneShot);
        op.fix_chosen(&["skip".to_string()]).unwrap();
        assert_eq!(op.choices(), vec!["skip".to_string()]);
        assert!(op.is_fixed());
        assert!(matches!(
            op.fix_chosen(&["skip".to_string()]),
            Err(NasError::MutableFixed(_))
        ));
    }

    #[test]
    fn test_fixed_forward_matches_direct_op() {
        let mut op = three_way(OpKind::Diff);
        op.fix_chosen(&["double".to_string()]).unwrap();
        let x = array![[0.5, 1.5], [2.0, -1.0]];
        // arch params are ignored once fixed
        let arch = array![10.0];
        let y = op.forward(MutableInput::Single(&x), Some(arch.view())).unwrap();
        let direct = scale(2.0).forward(&x).unwrap();
        assert_eq!(y, direct);
    }

    #[test]
    fn test_forward_fixed_requires_fix() {
        let mut op = three_way(OpKind::OneShot);
        let x = array![[1.0, 1.0]];
        assert!(matches!(
            op.forward_fixed(MutableInput::Single(&x)),
            Err(NasError::NotFixed(_))
        ));
    }

    #[test]
    fn test_selection_is_transient() {
        let mut op = three_way(OpKind::OneShot);
        let x = array![[1.0, 2.0]];
        op.select("double").unwrap();
        assert_eq!(op.forward(MutableInput::Single(&x), None).unwrap(), array![[2.0, 4.0]]);
        op.clear_selection();
        assert_eq!(op.num_choices(), 3);
        assert!(op.select("conv_9x9").is_err());
    }

    #[test]
    fn test_mixture_weights_by_softmax() {
        let mut op = three_way(OpKind::Diff);
        let x = array![[1.0, 1.0]];
        let arch = array![0.0, 0.0, 0.0];
        let y = op.forward(MutableInput::Single(&x), Some(arch.view())).unwrap();
        // (2 + 1 + 0) / 3
        assert!((y[[0, 0]] - 1.0).abs() < 1e-12);

        let probs = op.compute_arch_probs(arch.view());
        assert!((probs.soft.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_probability_is_skipped() {
        let mut op = three_way(OpKind::Diff);
        let x = array![[1.0, 3.0]];
        let arch = array![0.0, f64::NEG_INFINITY, 0.0];
        let skipped = op.forward(MutableInput::Single(&x), Some(arch.view())).unwrap();

        let mut all = three_way(OpKind::Diff);
        let explicit = all.forward_all(MutableInput::Single(&x)).unwrap();
        let manual = (explicit - &x) * 0.5;
        for (a, b) in skipped.iter().zip(manual.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_arch_grad_matches_numeric() {
        let x = array![[0.3, -0.7]];
        let arch = array![0.2, -0.1, 0.4];
        let mut op = three_way(OpKind::Diff);
        op.forward(MutableInput::Single(&x), Some(arch.view())).unwrap();
        let grad = op.backward(&Array2::ones((1, 2))).unwrap();
        let analytic = grad.arch_param.unwrap();

        let eps = 1e-6;
        for j in 0..3 {
            let mut plus = arch.clone();
            plus[j] += eps;
            let mut minus = arch.clone();
            minus[j] -= eps;
            let f_plus = three_way(OpKind::Diff)
                .forward(MutableInput::Single(&x), Some(plus.view()))
                .unwrap()
                .sum();
            let f_minus = three_way(OpKind::Diff)
                .forward(MutableInput::Single(&x), Some(minus.view()))
                .unwrap()
                .sum();
            let numeric = (f_plus - f_minus) / (2.0 * eps);
            assert!((analytic[j] - numeric).abs() < 1e-5);
        }
    }

    #[test]
    fn test_sample_choice_is_deterministic() {
        let op = three_way(OpKind::Diff);
        let arch = array![0.1, 0.9, 0.3];
        let first = op.sample_choice(arch.view()).unwrap();
        assert_eq!(first, "skip");
        assert_eq!(op.sample_choice(arch.view()).unwrap(), first);
    }

    #[test]
    fn test_dyna_diff_fixes_on_argmax() {
        let mut op = three_way(OpKind::DynaDiff { threshold: 0.3 });
        let x = array![[1.0, 1.0]];

        // gap below threshold: still a mixture
        let arch = array![0.0, 0.1, 0.0];
        op.forward(MutableInput::Single(&x), Some(arch.view())).unwrap();
        assert!(!op.is_fixed());

        // the leader is the third candidate, not index 0 or 1
        let arch = array![0.0, 0.0, 3.0];
        let y = op.forward(MutableInput::Single(&x), Some(arch.view())).unwrap();
        assert!(op.is_fixed());
        assert_eq!(op.chosen().unwrap(), &["none".to_string()]);
        assert_eq!(y, array![[0.0, 0.0]]);
    }

    #[test]
    fn test_arch_param_length_checked() {
        let mut op = three_way(OpKind::Diff);
        let x = array![[1.0, 1.0]];
        let arch = array![0.0, 0.0];
        assert!(matches!(
            op.forward(MutableInput::Single(&x), Some(arch.view())),
            Err(NasError::ShapeError { .. })
        ));
    }

    #[test]
    fn test_choice_cost() {
        let op = three_way(OpKind::OneShot);
        assert_eq!(op.choice_flops("double", 3).unwrap(), 12);
        assert_eq!(op.choice_params("double").unwrap(), 6);
        assert_eq!(op.choice_params("skip").unwrap(), 0);
    }
}
