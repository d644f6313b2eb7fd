//! Named candidate operations shared by every mutable variant

use ndarray::{Array1, Array2};
use std::collections::HashSet;

use super::mutable::{ArchProbs, MutableGrad, MutableInput};
use crate::error::{NasError, Result};
use crate::nn::{Operation, Param};

/// What the last forward pass computed
#[derive(Debug)]
struct Trace {
    /// (candidate index, output weight)
    computed: Vec<(usize, f64)>,
    /// Raw candidate outputs, kept only for the weighted mixture
    outputs: Vec<Array2<f64>>,
    probs: Option<ArchProbs>,
    input_dims: Vec<(usize, usize)>,
    single_input: bool,
}

/// Ordered, uniquely named candidate operations.
///
/// Each candidate remembers the input slot it reads from: for single-input
/// mutables every slot is 0, for routes it is the position of the incoming
/// edge before any pruning.
#[derive(Debug)]
pub(crate) struct CandidateSet {
    owner: String,
    names: Vec<String>,
    ops: Vec<Box<dyn Operation>>,
    slots: Vec<usize>,
    num_slots: usize,
    trace: Option<Trace>,
}

impl CandidateSet {
    pub fn new<S: Into<String>>(
        owner: &str,
        candidates: Vec<(S, Box<dyn Operation>)>,
        per_slot: bool,
    ) -> Result<Self> {
        if candidates.is_empty() {
            return Err(NasError::ConfigError(format!(
                "mutable `{owner}` needs at least one candidate"
            )));
        }
        let mut names = Vec::with_capacity(candidates.len());
        let mut ops = Vec::with_capacity(candidates.len());
        let mut seen = HashSet::new();
        for (name, op) in candidates {
            let name = name.into();
            if !seen.insert(name.clone()) {
                return Err(NasError::ConfigError(format!(
                    "mutable `{owner}` has duplicate candidate `{name}`"
                )));
            }
            names.push(name);
            ops.push(op);
        }
        let n = names.len();
        let slots = if per_slot { (0..n).collect() } else { vec![0; n] };
        Ok(Self {
            owner: owner.to_string(),
            names,
            ops,
            slots,
            num_slots: if per_slot { n } else { 1 },
            trace: None,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn index_of(&self, choice: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == choice)
            .ok_or_else(|| NasError::UnknownChoice {
                mutable: self.owner.clone(),
                choice: choice.to_string(),
            })
    }

    /// Drop every candidate not listed in `keep`
    pub fn retain(&mut self, keep: &[String]) -> Result<()> {
        if keep.is_empty() {
            return Err(NasError::ConfigError(format!(
                "mutable `{}` cannot be fixed on an empty choice list",
                self.owner
            )));
        }
        for choice in keep {
            self.index_of(choice)?;
        }
        let names = std::mem::take(&mut self.names);
        let ops = std::mem::take(&mut self.ops);
        let slots = std::mem::take(&mut self.slots);
        for ((name, op), slot) in names.into_iter().zip(ops).zip(slots) {
            if keep.contains(&name) {
                self.names.push(name);
                self.ops.push(op);
                self.slots.push(slot);
            }
        }
        self.trace = None;
        Ok(())
    }

    fn inputs<'a>(&self, x: MutableInput<'a>) -> Result<Vec<&'a Array2<f64>>> {
        match x {
            MutableInput::Single(t) if self.num_slots == 1 => Ok(vec![t]),
            MutableInput::Edges(ts) if ts.len() == self.num_slots => Ok(ts.iter().collect()),
            MutableInput::Single(_) => Err(NasError::shape(
                format!("{} input edges", self.num_slots),
                "1 input",
            )),
            MutableInput::Edges(ts) => Err(NasError::shape(
                format!("{} input edges", self.num_slots),
                format!("{} inputs", ts.len()),
            )),
        }
    }

    /// Weighted sum of the listed candidates' outputs.
    ///
    /// Candidates with a zero weight are never run.
    pub fn run(
        &mut self,
        x: MutableInput<'_>,
        plan: &[(usize, f64)],
        probs: Option<ArchProbs>,
    ) -> Result<Array2<f64>> {
        let inputs = self.inputs(x)?;
        let keep_outputs = probs.is_some();
        let mut computed = Vec::with_capacity(plan.len());
        let mut outputs = Vec::new();
        let mut total: Option<Array2<f64>> = None;

        for &(idx, weight) in plan {
            if weight == 0.0 {
                continue;
            }
            let op = self.ops.get_mut(idx).ok_or_else(|| {
                NasError::ComputationError(format!("candidate index {idx} out of range"))
            })?;
            let out = op.forward(inputs[self.slots[idx]])?;
            let scaled = if weight == 1.0 { out.clone() } else { &out * weight };
            total = Some(match total {
                None => scaled,
                Some(acc) if acc.dim() == scaled.dim() => acc + &scaled,
                Some(acc) => {
                    return Err(NasError::shape(
                        format!("{:?}", acc.dim()),
                        format!("{:?}", scaled.dim()),
                    ))
                }
            });
            if keep_outputs {
                outputs.push(out);
            }
            computed.push((idx, weight));
        }

        let output = match total {
            Some(t) => t,
            None => Array2::zeros(inputs[0].raw_dim()),
        };
        self.trace = Some(Trace {
            computed,
            outputs,
            probs,
            input_dims: inputs.iter().map(|t| t.dim()).collect(),
            single_input: matches!(x, MutableInput::Single(_)),
        });
        Ok(output)
    }

    pub fn backward(&mut self, grad: &Array2<f64>) -> Result<MutableGrad> {
        let trace = self.trace.take().ok_or_else(|| {
            NasError::ComputationError(format!(
                "mutable `{}`: backward called before forward",
                self.owner
            ))
        })?;

        let mut input_grads: Vec<Array2<f64>> =
            trace.input_dims.iter().map(|d| Array2::zeros(*d)).collect();
        for &(idx, weight) in &trace.computed {
            let g = if weight == 1.0 { grad.clone() } else { grad * weight };
            let dx = self.ops[idx].backward(&g)?;
            let slot = if trace.single_input { 0 } else { self.slots[idx] };
            input_grads[slot] += &dx;
        }

        let arch_param = trace.probs.as_ref().map(|probs| {
            let mut contrib = Array1::<f64>::zeros(probs.soft.len());
            for (&(idx, _), out) in trace.computed.iter().zip(&trace.outputs) {
                contrib[idx] = (grad * out).sum();
            }
            let expected = probs.soft.dot(&contrib);
            probs
                .soft
                .iter()
                .zip(contrib.iter())
                .map(|(p, g)| probs.scale * p * (g - expected))
                .collect::<Array1<f64>>()
        });

        Ok(MutableGrad {
            inputs: input_grads,
            arch_param,
        })
    }

    pub fn op(&self, idx: usize) -> &dyn Operation {
        self.ops[idx].as_ref()
    }

    pub fn parameters(&self) -> Vec<&Param> {
        self.ops.iter().flat_map(|op| op.parameters()).collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.ops.iter_mut().flat_map(|op| op.parameters_mut()).collect()
    }

    pub fn choice_flops(&self, choice: &str, batch: usize) -> Result<usize> {
        let idx = self.index_of(choice)?;
        Ok(self.ops[idx].flops(batch))
    }

    pub fn choice_params(&self, choice: &str) -> Result<usize> {
        let idx = self.index_of(choice)?;
        Ok(self.ops[idx].num_params())
    }
}
