//! Optimizers and learning-rate schedules

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use super::Param;

/// SGD configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Momentum
    pub momentum: f64,
    /// L2 weight decay
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.025,
            momentum: 0.9,
            weight_decay: 5e-4,
        }
    }
}

/// Stochastic gradient descent with momentum and decoupled weight decay.
///
/// Parameters whose gradient is exactly zero are skipped: in a one-shot
/// supernet those belong to candidates that were not on the sampled path.
#[derive(Debug, Clone)]
pub struct Sgd {
    config: SgdConfig,
    lr: f64,
    velocities: Vec<Array2<f64>>,
}

impl Sgd {
    pub fn new(config: SgdConfig) -> Self {
        let lr = config.learning_rate;
        Self {
            config,
            lr,
            velocities: Vec::new(),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn base_learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Apply one update. `params` must be passed in the same order every step.
    pub fn step(&mut self, params: &mut [&mut Param]) {
        if self.velocities.len() != params.len() {
            self.velocities = params
                .iter()
                .map(|p| Array2::zeros(p.value.raw_dim()))
                .collect();
        }

        for (p, v) in params.iter_mut().zip(self.velocities.iter_mut()) {
            if p.grad_is_zero() {
                continue;
            }
            *v = &*v * self.config.momentum - &p.grad * self.lr;
            p.value += &*v;
            if self.config.weight_decay > 0.0 {
                p.value *= 1.0 - self.config.weight_decay * self.lr;
            }
        }
    }
}

/// Adam configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    /// DARTS architecture optimizer defaults
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-3,
        }
    }
}

/// Adam, used for architecture parameters
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    t: i32,
    m: Vec<Array2<f64>>,
    v: Vec<Array2<f64>>,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn step(&mut self, params: &mut [&mut Param]) {
        if self.m.len() != params.len() {
            self.m = params.iter().map(|p| Array2::zeros(p.value.raw_dim())).collect();
            self.v = self.m.clone();
            self.t = 0;
        }
        self.t += 1;
        let c = &self.config;
        let bias1 = 1.0 - c.beta1.powi(self.t);
        let bias2 = 1.0 - c.beta2.powi(self.t);

        for ((p, m), v) in params.iter_mut().zip(self.m.iter_mut()).zip(self.v.iter_mut()) {
            // frozen or unused parameters keep their value and moments
            if p.grad_is_zero() {
                continue;
            }
            let g = &p.grad + &(&p.value * c.weight_decay);
            *m = &*m * c.beta1 + &g * (1.0 - c.beta1);
            *v = &*v * c.beta2 + &(&g * &g) * (1.0 - c.beta2);
            let update = (&*m / bias1) / (v.mapv(|x| (x / bias2).sqrt()) + c.eps);
            p.value -= &(update * c.learning_rate);
        }
    }
}

/// Epoch-level learning-rate schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrScheduler {
    Constant,
    Cosine { t_max: usize, eta_min: f64 },
    Step { step_size: usize, gamma: f64 },
}

impl Default for LrScheduler {
    fn default() -> Self {
        Self::Constant
    }
}

impl LrScheduler {
    /// Learning rate to use during `epoch` (0-based)
    pub fn lr_at(&self, base_lr: f64, epoch: usize) -> f64 {
        match *self {
            Self::Constant => base_lr,
            Self::Cosine { t_max, eta_min } => {
                let t_max = t_max.max(1);
                let t = epoch.min(t_max) as f64;
                eta_min + (base_lr - eta_min) * (1.0 + (PI * t / t_max as f64).cos()) / 2.0
            }
            Self::Step { step_size, gamma } => {
                base_lr * gamma.powi((epoch / step_size.max(1)) as i32)
            }
        }
    }
}
