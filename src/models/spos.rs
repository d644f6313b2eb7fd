//! Single-path one-shot searchable MLP
//!
//! Stages of one-shot choice blocks, every block picking one of four dense
//! variants. The first block of a stage changes the width.

use ndarray::Array2;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use super::Supernet;
use crate::error::{NasError, Result};
use crate::nas::{candidate, ArchParams, Candidate, ChoiceOp, Mutable, MutableInput};
use crate::nn::{AvgPool1d, Linear, Operation, Param, Relu, Sequential};

/// Block candidates, in construction order
pub const SPOS_OPS: [&str; 4] = ["dense_1", "dense_2", "dense_3", "pool_dense"];

/// Output width and number of blocks of one stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MlpStage {
    pub width: usize,
    pub blocks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchableMlpConfig {
    pub input_dim: usize,
    pub stem_dim: usize,
    pub stages: Vec<MlpStage>,
    pub num_classes: usize,
    pub seed: u64,
}

impl Default for SearchableMlpConfig {
    fn default() -> Self {
        Self {
            input_dim: 16,
            stem_dim: 16,
            stages: vec![
                MlpStage { width: 16, blocks: 2 },
                MlpStage { width: 32, blocks: 2 },
                MlpStage { width: 32, blocks: 2 },
            ],
            num_classes: 10,
            seed: 0,
        }
    }
}

fn dense_stack(inp: usize, outp: usize, depth: usize, rng: &mut Xoshiro256PlusPlus) -> Sequential {
    let mut seq = Sequential::new();
    let mut width = inp;
    for _ in 0..depth {
        seq = seq.push(Linear::new(width, outp, rng)).push(Relu::new());
        width = outp;
    }
    seq
}

fn block_candidates(inp: usize, outp: usize, rng: &mut Xoshiro256PlusPlus) -> Vec<Candidate> {
    let pool_dense = Sequential::new()
        .push(AvgPool1d::new(3, inp))
        .push(Linear::new(inp, outp, rng))
        .push(Relu::new());
    vec![
        candidate("dense_1", dense_stack(inp, outp, 1, rng)),
        candidate("dense_2", dense_stack(inp, outp, 2, rng)),
        candidate("dense_3", dense_stack(inp, outp, 3, rng)),
        candidate("pool_dense", pool_dense),
    ]
}

/// Sequential supernet of one-shot blocks, one search group per block
#[derive(Debug)]
pub struct SearchableMlp {
    config: SearchableMlpConfig,
    stem: Sequential,
    blocks: Vec<ChoiceOp>,
    classifier: Linear,
}

impl SearchableMlp {
    pub fn new(config: SearchableMlpConfig) -> Result<Self> {
        if config.stages.iter().all(|s| s.blocks == 0) {
            return Err(NasError::ConfigError(
                "searchable MLP needs at least one block".to_string(),
            ));
        }
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);
        let stem = Sequential::new()
            .push(Linear::new(config.input_dim, config.stem_dim, &mut rng))
            .push(Relu::new());

        let mut blocks = Vec::new();
        let mut width = config.stem_dim;
        for (s, stage) in config.stages.iter().enumerate() {
            for b in 0..stage.blocks {
                let op = ChoiceOp::one_shot(
                    &format!("stage{s}.block{b}"),
                    block_candidates(width, stage.width, &mut rng),
                )?;
                blocks.push(op);
                width = stage.width;
            }
        }
        let classifier = Linear::new(width, config.num_classes, &mut rng);
        Ok(Self {
            config,
            stem,
            blocks,
            classifier,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl Supernet for SearchableMlp {
    fn mutables(&self) -> Vec<&dyn Mutable> {
        self.blocks.iter().map(|b| b as &dyn Mutable).collect()
    }

    fn visit_mutables(
        &mut self,
        f: &mut dyn FnMut(&mut dyn Mutable) -> Result<()>,
    ) -> Result<()> {
        for block in self.blocks.iter_mut() {
            f(block)?;
        }
        Ok(())
    }

    fn forward(&mut self, x: &Array2<f64>, arch: Option<&ArchParams>) -> Result<Array2<f64>> {
        let mut h = self.stem.forward(x)?;
        for block in self.blocks.iter_mut() {
            let weights = arch.and_then(|a| a.get(block.name()));
            h = block.forward(MutableInput::Single(&h), weights)?;
        }
        self.classifier.forward(&h)
    }

    fn backward(
        &mut self,
        grad: &Array2<f64>,
        mut arch: Option<&mut ArchParams>,
    ) -> Result<Array2<f64>> {
        let mut g = self.classifier.backward(grad)?;
        for block in self.blocks.iter_mut().rev() {
            let out = block.backward(&g)?;
            if let (Some(arch), Some(da)) = (arch.as_deref_mut(), out.arch_param) {
                arch.accumulate_grad(block.name(), &da)?;
            }
            g = out
                .inputs
                .into_iter()
                .next()
                .ok_or_else(|| NasError::ComputationError("block without input".to_string()))?;
        }
        self.stem.backward(&g)
    }

    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.stem.parameters();
        params.extend(self.blocks.iter().flat_map(|b| b.parameters()));
        params.extend(self.classifier.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.stem.parameters_mut();
        params.extend(self.blocks.iter_mut().flat_map(|b| b.parameters_mut()));
        params.extend(self.classifier.parameters_mut());
        params
    }

    fn static_flops(&self, batch: usize) -> usize {
        self.stem.flops(batch) + self.classifier.flops(batch)
    }

    fn static_params(&self) -> usize {
        self.stem.num_params() + self.classifier.num_params()
    }

    fn input_dim(&self) -> usize {
        self.config.input_dim
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }
}
