//! Choice routes: pick or mix among several incoming edges

use ndarray::{Array2, ArrayView1};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use super::candidates::CandidateSet;
use super::mutable::{
    argmax, softmax, ArchProbs, Mutable, MutableGrad, MutableInput, ProbNormalizer,
};
use super::Candidate;
use crate::error::{NasError, Result};
use crate::nn::Param;

/// A mutable with one input per edge.
///
/// Every edge owns an operation applied to its own input. When fixed, the
/// outputs of all chosen edges are summed, which merges several incoming
/// edges into one node. Inputs are always passed for every edge the route
/// was built with, even after pruning.
#[derive(Debug)]
pub struct ChoiceRoute {
    name: String,
    alias: Option<String>,
    edges: CandidateSet,
    normalizer: ProbNormalizer,
    with_arch_param: bool,
    chosen: Option<Vec<String>>,
    selected: Option<String>,
    rng: Xoshiro256PlusPlus,
}

impl ChoiceRoute {
    /// Softmax-weighted route (`DiffChoiceRoute`)
    pub fn diff(name: &str, edges: Vec<Candidate>, with_arch_param: bool) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            alias: None,
            edges: CandidateSet::new(name, edges, true)?,
            normalizer: ProbNormalizer::Softmax,
            with_arch_param,
            chosen: None,
            selected: None,
            rng: Xoshiro256PlusPlus::seed_from_u64(0),
        })
    }

    /// Gumbel-softmax route (`GumbelChoiceRoute`)
    pub fn gumbel(
        name: &str,
        edges: Vec<Candidate>,
        tau: f64,
        hard: bool,
        with_arch_param: bool,
    ) -> Result<Self> {
        let mut route = Self::diff(name, edges, with_arch_param)?;
        route.normalizer = ProbNormalizer::Gumbel { tau, hard };
        Ok(route)
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        self
    }

    pub fn normalizer(&self) -> ProbNormalizer {
        self.normalizer
    }

    fn all_plan(&self) -> Vec<(usize, f64)> {
        (0..self.edges.len()).map(|i| (i, 1.0)).collect()
    }
}

impl Mutable for ChoiceRoute {
    fn name(&self) -> &str {
        &self.name
    }

    fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    fn choices(&self) -> Vec<String> {
        self.edges.names().to_vec()
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
        self.edges.retain(chosen)?;
        self.chosen = Some(chosen.to_vec());
        self.selected = None;
        Ok(())
    }

    fn select(&mut self, choice: &str) -> Result<()> {
        self.edges.index_of(choice)?;
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
        self.edges.run(x, &plan, None)
    }

    fn forward_all(&mut self, x: MutableInput<'_>) -> Result<Array2<f64>> {
        let plan = self.all_plan();
        self.edges.run(x, &plan, None)
    }

    fn forward_choice(&mut self, x: MutableInput<'_>, choice: &str) -> Result<Array2<f64>> {
        let idx = self.edges.index_of(choice)?;
        self.edges.run(x, &[(idx, 1.0)], None)
    }

    fn forward_arch_param(
        &mut self,
        x: MutableInput<'_>,
        arch_param: Option<ArrayView1<f64>>,
    ) -> Result<Array2<f64>> {
        let arch_param = match arch_param {
            Some(a) if self.with_arch_param => a,
            _ => return self.forward_all(x),
        };
        if arch_param.len() != self.edges.len() {
            return Err(NasError::shape(
                format!("{} architecture weights for `{}`", self.edges.len(), self.name),
                format!("{}", arch_param.len()),
            ));
        }
        let probs = self.compute_arch_probs(arch_param);
        let plan: Vec<(usize, f64)> = probs.weights.iter().cloned().enumerate().collect();
        self.edges.run(x, &plan, Some(probs))
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<MutableGrad> {
        self.edges.backward(grad)
    }

    fn compute_arch_probs(&mut self, arch_param: ArrayView1<f64>) -> ArchProbs {
        self.normalizer.compute(arch_param, &mut self.rng)
    }

    fn sample_choice(&self, arch_param: ArrayView1<f64>) -> Result<String> {
        if arch_param.len() != self.edges.len() {
            return Err(NasError::shape(
                format!("{}", self.edges.len()),
                format!("{}", arch_param.len()),
            ));
        }
        let probs = softmax(arch_param);
        Ok(self.edges.names()[argmax(probs.view())].clone())
    }

    fn set_temperature(&mut self, tau: f64) {
        if let ProbNormalizer::Gumbel { hard, .. } = self.normalizer {
            self.normalizer = ProbNormalizer::Gumbel { tau, hard };
        }
    }

    fn parameters(&self) -> Vec<&Param> {
        self.edges.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.edges.parameters_mut()
    }

    fn choice_flops(&self, choice: &str, batch: usize) -> Result<usize> {
        self.edges.choice_flops(choice, batch)
    }

    fn choice_params(&self, choice: &str) -> Result<usize> {
        self.edges.choice_params(choice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::candidate;
    use crate::nn::{Identity, Linear};
    use ndarray::array;

    fn edges() -> Vec<Candidate> {
        vec![
            candidate("first_edge", Identity),
            candidate(
                "second_edge",
                Linear::from_weights(array![[2.0]], array![[0.0]]),
            ),
            candidate("third_edge", Identity),
        ]
    }

    fn inputs() -> Vec<Array2<f64>> {
        vec![array![[1.0]], array![[10.0]], array![[100.0]]]
    }

    #[test]
    fn test_forward_all_sums_edges() {
        let mut route = ChoiceRoute::diff("route", edges(), false).unwrap();
        let x = inputs();
        let y = route.forward(MutableInput::from(&x), None).unwrap();
        assert_eq!(y, array![[121.0]]);
    }

    #[test]
    fn test_without_arch_param_flag_ignores_weights() {
        let mut route = ChoiceRoute::diff("route", edges(), false).unwrap();
        let x = inputs();
        let arch = array![5.0, 0.0, 0.0];
        let y = route.forward(MutableInput::from(&x), Some(arch.view())).unwrap();
        assert_eq!(y, array![[121.0]]);
    }

    #[test]
    fn test_input_count_mismatch() {
        let mut route = ChoiceRoute::diff("route", edges(), true).unwrap();
        let x = vec![array![[1.0]], array![[2.0]]];
        assert!(matches!(
            route.forward_all(MutableInput::from(&x)),
            Err(NasError::ShapeError { .. })
        ));
    }

    #[test]
    fn test_fixed_route_merges_chosen_edges() {
        let mut route = ChoiceRoute::diff("route", edges(), true).unwrap();
        route
            .fix_chosen(&["first_edge".to_string(), "third_edge".to_string()])
            .unwrap();
        let x = inputs();
        let y = route.forward(MutableInput::from(&x), None).unwrap();
        assert_eq!(y, array![[101.0]]);

        let grad = route.backward(&array![[1.0]]).unwrap();
        assert_eq!(grad.inputs.len(), 3);
        assert_eq!(grad.inputs[1], array![[0.0]]);
        assert_eq!(grad.inputs[2], array![[1.0]]);
    }

    #[test]
    fn test_hard_gumbel_routes_one_edge() {
        let mut route = ChoiceRoute::gumbel("route", edges(), 1.0, true, true)
            .unwrap()
            .with_seed(42);
        let x = inputs();
        let arch = array![0.0, 0.0, 0.0];
        let y = route.forward(MutableInput::from(&x), Some(arch.view())).unwrap();
        assert!([1.0, 20.0, 100.0].contains(&y[[0, 0]]));

        let grad = route.backward(&array![[1.0]]).unwrap();
        let da = grad.arch_param.unwrap();
        // softmax Jacobian rows sum to zero
        assert!(da.sum().abs() < 1e-9);
    }

    #[test]
    fn test_set_temperature() {
        let mut route = ChoiceRoute::gumbel("route", edges(), 1.0, false, true).unwrap();
        route.set_temperature(0.25);
        assert_eq!(
            route.normalizer(),
            ProbNormalizer::Gumbel { tau: 0.25, hard: false }
        );

        let mut diff = ChoiceRoute::diff("route", edges(), true).unwrap();
        diff.set_temperature(0.25);
        assert_eq!(diff.normalizer(), ProbNormalizer::Softmax);
    }
}
