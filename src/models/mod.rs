//! Searchable supernets
//!
//! A supernet is an ordinary network whose layers are interleaved with
//! mutables. It exposes its mutables to the mutator and threads the
//! architecture parameters through forward and backward passes.

mod genotype;
mod nb201;
mod spos;

use ndarray::Array2;
use std::fmt;

use crate::error::Result;
use crate::nas::{ArchParams, Mutable};
use crate::nn::Param;

pub use genotype::{genotype, parse_genotype, NB201_EDGES};
pub use nb201::{EdgeKind, Nb201Config, Nb201Preset, Nb201Supernet, RouteKind, NB201_OPS};
pub use spos::{MlpStage, SearchableMlp, SearchableMlpConfig, SPOS_OPS};

/// A network containing mutables
pub trait Supernet: fmt::Debug + Send {
    /// Mutables in traversal order
    fn mutables(&self) -> Vec<&dyn Mutable>;

    /// Apply `f` to every mutable in traversal order, stopping at the first error
    fn visit_mutables(
        &mut self,
        f: &mut dyn FnMut(&mut dyn Mutable) -> Result<()>,
    ) -> Result<()>;

    /// Logits for a batch; `arch` drives the weighted mixture of unfixed,
    /// unselected mutables
    fn forward(&mut self, x: &Array2<f64>, arch: Option<&ArchParams>) -> Result<Array2<f64>>;

    /// Backpropagate the logits gradient. Weight gradients accumulate in the
    /// parameters; architecture gradients accumulate in `arch` when given.
    fn backward(
        &mut self,
        grad: &Array2<f64>,
        arch: Option<&mut ArchParams>,
    ) -> Result<Array2<f64>>;

    fn parameters(&self) -> Vec<&Param>;

    fn parameters_mut(&mut self) -> Vec<&mut Param>;

    fn num_params(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    /// FLOPs of the layers outside any mutable
    fn static_flops(&self, batch: usize) -> usize;

    /// Parameter count of the layers outside any mutable
    fn static_params(&self) -> usize;

    /// FLOPs of the whole supernet, every remaining candidate included
    fn flops(&self, batch: usize) -> usize {
        let mutable_flops: usize = self
            .mutables()
            .iter()
            .map(|m| {
                m.choices()
                    .iter()
                    .filter_map(|c| m.choice_flops(c, batch).ok())
                    .sum::<usize>()
            })
            .sum();
        self.static_flops(batch) + mutable_flops
    }

    fn input_dim(&self) -> usize;

    fn num_classes(&self) -> usize;
}
