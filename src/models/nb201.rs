//! NAS-Bench-201 cell supernet
//!
//! Every cell is a DAG of four nodes. Node `j` sums the outputs of the edges
//! `edge_i_j` (`i < j`), each edge choosing among the five NB201
//! operations. Edges with the same position share an alias across cells, so
//! the search space has six groups. Nodes 2 and 3 may instead merge their
//! incoming edges through a choice route.

use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::genotype::{edge_alias, NB201_EDGES};
use super::Supernet;
use crate::error::{NasError, Result};
use crate::nas::{
    candidate, ArchParams, Candidate, ChoiceOp, ChoiceRoute, Mutable, MutableInput, OpKind,
    Subnet,
};
use crate::nn::{
    avg_pool_3x3, conv_1x1, conv_3x3, Identity, Linear, Operation, Param, Relu, Sequential,
    Zero,
};

/// Candidate operations on every edge, in construction order
pub const NB201_OPS: [&str; 5] = ["none", "skip_connect", "conv_1x1", "conv_3x3", "avg_pool_3x3"];

/// Mutable variant used on the edges
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeKind {
    OneShot,
    Diff,
    DynaDiff { threshold: f64 },
}

impl From<EdgeKind> for OpKind {
    fn from(kind: EdgeKind) -> Self {
        match kind {
            EdgeKind::OneShot => OpKind::OneShot,
            EdgeKind::Diff => OpKind::Diff,
            EdgeKind::DynaDiff { threshold } => OpKind::DynaDiff { threshold },
        }
    }
}

/// Node input route variant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteKind {
    Diff,
    Gumbel { tau: f64, hard: bool },
}

/// Supernet construction options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Nb201Config {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
    pub num_cells: usize,
    pub edge_kind: EdgeKind,
    /// Route nodes 2 and 3 through a choice route
    pub route: Option<RouteKind>,
    pub seed: u64,
}

impl Default for Nb201Config {
    fn default() -> Self {
        Self {
            input_dim: 16,
            hidden_dim: 16,
            num_classes: 10,
            num_cells: 3,
            edge_kind: EdgeKind::OneShot,
            route: None,
            seed: 0,
        }
    }
}

/// Reference subnets used for fixed-architecture evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nb201Preset {
    Min,
    Mid,
    Max,
}

impl Nb201Preset {
    /// Operations in genotype edge order
    pub fn ops(&self) -> [&'static str; 6] {
        match self {
            Nb201Preset::Min => [
                "conv_3x3",
                "conv_3x3",
                "skip_connect",
                "skip_connect",
                "skip_connect",
                "skip_connect",
            ],
            Nb201Preset::Mid => [
                "conv_3x3",
                "conv_3x3",
                "conv_1x1",
                "conv_1x1",
                "conv_1x1",
                "conv_1x1",
            ],
            Nb201Preset::Max => ["conv_3x3"; 6],
        }
    }

    pub fn subnet(&self, alias2group_id: &BTreeMap<String, usize>) -> Result<Subnet> {
        NB201_EDGES
            .iter()
            .zip(self.ops())
            .map(|((from, to), op)| {
                let alias = edge_alias(*from, *to);
                alias2group_id
                    .get(&alias)
                    .map(|gid| (*gid, op.to_string()))
                    .ok_or_else(|| NasError::MutatorError(format!("no search group for `{alias}`")))
            })
            .collect()
    }
}

#[derive(Debug)]
struct Cell {
    /// In `NB201_EDGES` order
    edges: Vec<ChoiceOp>,
    /// Routes for nodes 2 and 3
    routes: Vec<Option<ChoiceRoute>>,
}

fn edge_candidates(dim: usize, rng: &mut Xoshiro256PlusPlus) -> Vec<Candidate> {
    vec![
        candidate("none", Zero::new()),
        candidate("skip_connect", Identity),
        candidate("conv_1x1", conv_1x1(dim, rng)),
        candidate("conv_3x3", conv_3x3(dim, rng)),
        candidate("avg_pool_3x3", avg_pool_3x3(dim)),
    ]
}

fn accumulate_arch(
    arch: Option<&mut ArchParams>,
    name: &str,
    grad: Option<Array1<f64>>,
) -> Result<()> {
    match (arch, grad) {
        (Some(arch), Some(grad)) => arch.accumulate_grad(name, &grad),
        _ => Ok(()),
    }
}

impl Cell {
    fn new(index: usize, config: &Nb201Config, rng: &mut Xoshiro256PlusPlus) -> Result<Self> {
        let mut edges = Vec::with_capacity(NB201_EDGES.len());
        for (from, to) in NB201_EDGES {
            let alias = edge_alias(from, to);
            let op = ChoiceOp::new(
                &format!("cell{index}.{alias}"),
                config.edge_kind.into(),
                edge_candidates(config.hidden_dim, rng),
            )?
            .with_alias(alias);
            edges.push(op);
        }

        let mut routes = Vec::with_capacity(2);
        for node in 2..=3 {
            let route = match config.route {
                None => None,
                Some(kind) => {
                    let name = format!("cell{index}.route_{node}");
                    let inputs: Vec<Candidate> = (0..node)
                        .map(|from| candidate(edge_alias(from, node), Identity))
                        .collect();
                    let route = match kind {
                        RouteKind::Diff => ChoiceRoute::diff(&name, inputs, true)?,
                        RouteKind::Gumbel { tau, hard } => {
                            ChoiceRoute::gumbel(&name, inputs, tau, hard, true)?
                                .with_seed(config.seed.wrapping_add((index * 2 + node) as u64))
                        }
                    };
                    Some(route.with_alias(format!("route_{node}")))
                }
            };
            routes.push(route);
        }
        Ok(Self { edges, routes })
    }

    fn edge_index(from: usize, to: usize) -> usize {
        NB201_EDGES
            .iter()
            .position(|e| *e == (from, to))
            .unwrap_or(0)
    }

    fn route_mut(&mut self, node: usize) -> Option<&mut ChoiceRoute> {
        if node >= 2 {
            self.routes[node - 2].as_mut()
        } else {
            None
        }
    }

    fn forward(&mut self, x: &Array2<f64>, arch: Option<&ArchParams>) -> Result<Array2<f64>> {
        let mut nodes: Vec<Array2<f64>> = vec![x.clone()];
        for to in 1..=3 {
            let mut incoming = Vec::with_capacity(to);
            for from in 0..to {
                let edge = &mut self.edges[Self::edge_index(from, to)];
                let weights = arch.and_then(|a| a.get(edge.name()));
                incoming.push(edge.forward(MutableInput::Single(&nodes[from]), weights)?);
            }
            let node = match self.route_mut(to) {
                Some(route) => {
                    let weights = arch.and_then(|a| a.get(route.name()));
                    route.forward(MutableInput::Edges(&incoming), weights)?
                }
                None => incoming
                    .into_iter()
                    .reduce(|acc, t| acc + &t)
                    .ok_or_else(|| NasError::ComputationError("node without inputs".to_string()))?,
            };
            nodes.push(node);
        }
        nodes
            .pop()
            .ok_or_else(|| NasError::ComputationError("empty cell".to_string()))
    }

    fn backward(
        &mut self,
        grad: &Array2<f64>,
        mut arch: Option<&mut ArchParams>,
    ) -> Result<Array2<f64>> {
        let mut node_grads: Vec<Array2<f64>> = vec![Array2::zeros(grad.raw_dim()); 4];
        node_grads[3] = grad.clone();

        for to in (1..=3).rev() {
            let node_grad = node_grads[to].clone();
            let edge_grads: Vec<Array2<f64>> = match self.route_mut(to) {
                Some(route) => {
                    let g = route.backward(&node_grad)?;
                    let name = route.name().to_string();
                    accumulate_arch(arch.as_deref_mut(), &name, g.arch_param)?;
                    g.inputs
                }
                None => vec![node_grad; to],
            };
            for from in (0..to).rev() {
                let edge = &mut self.edges[Self::edge_index(from, to)];
                let g = edge.backward(&edge_grads[from])?;
                accumulate_arch(arch.as_deref_mut(), edge.name(), g.arch_param)?;
                for input in g.inputs {
                    node_grads[from] += &input;
                }
            }
        }
        Ok(node_grads.swap_remove(0))
    }

    fn mutables(&self) -> Vec<&dyn Mutable> {
        let mut out: Vec<&dyn Mutable> = self.edges.iter().map(|e| e as &dyn Mutable).collect();
        out.extend(self.routes.iter().flatten().map(|r| r as &dyn Mutable));
        out
    }

    fn visit(&mut self, f: &mut dyn FnMut(&mut dyn Mutable) -> Result<()>) -> Result<()> {
        for edge in self.edges.iter_mut() {
            f(edge)?;
        }
        for route in self.routes.iter_mut().flatten() {
            f(route)?;
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<&Param> {
        let mut params: Vec<&Param> = self.edges.iter().flat_map(|e| e.parameters()).collect();
        params.extend(self.routes.iter().flatten().flat_map(|r| r.parameters()));
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params: Vec<&mut Param> =
            self.edges.iter_mut().flat_map(|e| e.parameters_mut()).collect();
        params.extend(self.routes.iter_mut().flatten().flat_map(|r| r.parameters_mut()));
        params
    }
}

/// Stem, a stack of searchable cells and a linear classifier
#[derive(Debug)]
pub struct Nb201Supernet {
    config: Nb201Config,
    stem: Sequential,
    cells: Vec<Cell>,
    classifier: Linear,
}

impl Nb201Supernet {
    pub fn new(config: Nb201Config) -> Result<Self> {
        if config.num_cells == 0 || config.hidden_dim == 0 || config.num_classes == 0 {
            return Err(NasError::ConfigError(
                "NB201 supernet needs at least one cell, a hidden width and a class".to_string(),
            ));
        }
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);
        let stem = Sequential::new()
            .push(Linear::new(config.input_dim, config.hidden_dim, &mut rng))
            .push(Relu::new());
        let cells = (0..config.num_cells)
            .map(|i| Cell::new(i, &config, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        let classifier = Linear::new(config.hidden_dim, config.num_classes, &mut rng);
        Ok(Self {
            config,
            stem,
            cells,
            classifier,
        })
    }

    pub fn config(&self) -> &Nb201Config {
        &self.config
    }
}

impl Supernet for Nb201Supernet {
    fn mutables(&self) -> Vec<&dyn Mutable> {
        self.cells.iter().flat_map(|c| c.mutables()).collect()
    }

    fn visit_mutables(
        &mut self,
        f: &mut dyn FnMut(&mut dyn Mutable) -> Result<()>,
    ) -> Result<()> {
        for cell in self.cells.iter_mut() {
            cell.visit(f)?;
        }
        Ok(())
    }

    fn forward(&mut self, x: &Array2<f64>, arch: Option<&ArchParams>) -> Result<Array2<f64>> {
        let mut h = self.stem.forward(x)?;
        for cell in self.cells.iter_mut() {
            h = cell.forward(&h, arch)?;
        }
        self.classifier.forward(&h)
    }

    fn backward(
        &mut self,
        grad: &Array2<f64>,
        mut arch: Option<&mut ArchParams>,
    ) -> Result<Array2<f64>> {
        let mut g = self.classifier.backward(grad)?;
        for cell in self.cells.iter_mut().rev() {
            g = cell.backward(&g, arch.as_deref_mut())?;
        }
        self.stem.backward(&g)
    }

    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.stem.parameters();
        params.extend(self.cells.iter().flat_map(|c| c.parameters()));
        params.extend(self.classifier.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.stem.parameters_mut();
        params.extend(self.cells.iter_mut().flat_map(|c| c.parameters_mut()));
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
