//! One-shot supernet trainer
//!
//! Every step activates one (or a few) subnets through transient selection,
//! backpropagates their losses into the shared weights and takes one SGD
//! step. Weights outside the sampled paths keep a zero gradient and are left
//! untouched by the optimizer.

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::checkpoint::Checkpoint;
use super::meters::AverageMeter;
use super::{topk, BalanceMetric, EpochStats, SamplePolicy};
use crate::error::{NasError, Result};
use crate::models::Supernet;
use crate::nas::{argmax, softmax, strip_placeholders, Mutator, MutatorConfig, Subnet};
use crate::nn::{
    accuracy, cross_entropy, grad_norm, Batch, DataLoader, LrScheduler,
    PairwiseRankLoss, RankTarget, Sgd, SgdConfig,
};

/// One-shot trainer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OneShotTrainerConfig {
    pub policy: SamplePolicy,
    /// Weight of the pairwise rank loss
    pub rank_lambda: f64,
    pub sgd: SgdConfig,
    pub scheduler: LrScheduler,
    /// Validate every `val_interval` epochs
    pub val_interval: usize,
    /// Checkpoint every `save_interval` epochs into `save_dir`
    pub save_interval: Option<usize>,
    pub save_dir: Option<PathBuf>,
    pub print_freq: usize,
    /// Batch size used for FLOPs accounting
    pub cost_batch: usize,
    /// Perturbation scale of the Zen score
    pub zen_alpha: f64,
    pub zen_batch: usize,
    pub seed: u64,
}

impl Default for OneShotTrainerConfig {
    fn default() -> Self {
        Self {
            policy: SamplePolicy::Uniform,
            rank_lambda: 1.0,
            sgd: SgdConfig::default(),
            scheduler: LrScheduler::Constant,
            val_interval: 1,
            save_interval: None,
            save_dir: None,
            print_freq: 50,
            cost_batch: 1,
            zen_alpha: 0.01,
            zen_batch: 16,
            seed: 0,
        }
    }
}

/// Result of one training step
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Total objective, rank terms included
    pub loss: f64,
    /// Logits of the last subnet run
    pub logits: Array2<f64>,
    pub subnet: Subnet,
}

/// Trainer for weight-sharing supernets
#[derive(Debug)]
pub struct OneShotTrainer<M: Supernet> {
    model: M,
    mutator: Mutator,
    optimizer: Sgd,
    rank_loss: PairwiseRankLoss,
    config: OneShotTrainerConfig,
    rng: Xoshiro256PlusPlus,
    current_epoch: usize,
    best_top1: f64,
    history: Vec<EpochStats>,
}

impl<M: Supernet> OneShotTrainer<M> {
    /// Build a trainer with an aliased one-shot mutator
    pub fn new(model: M, config: OneShotTrainerConfig) -> Result<Self> {
        let mutator = Mutator::new(MutatorConfig::one_shot().with_seed(config.seed));
        Self::with_mutator(model, mutator, config)
    }

    /// Build a trainer around an existing mutator, preparing it if needed
    pub fn with_mutator(model: M, mut mutator: Mutator, config: OneShotTrainerConfig) -> Result<Self> {
        if !mutator.is_prepared() {
            mutator.prepare_from_supernet(&model)?;
        }
        if config.val_interval == 0 {
            return Err(NasError::ConfigError(
                "val_interval must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            optimizer: Sgd::new(config.sgd.clone()),
            rng: Xoshiro256PlusPlus::seed_from_u64(config.seed),
            model,
            mutator,
            rank_loss: PairwiseRankLoss::default(),
            config,
            current_epoch: 0,
            best_top1: 0.0,
            history: Vec::new(),
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn mutator(&self) -> &Mutator {
        &self.mutator
    }

    pub fn mutator_mut(&mut self) -> &mut Mutator {
        &mut self.mutator
    }

    pub fn config(&self) -> &OneShotTrainerConfig {
        &self.config
    }

    pub fn history(&self) -> &[EpochStats] {
        &self.history
    }

    pub fn best_top1(&self) -> f64 {
        self.best_top1
    }

    fn zero_grad(&mut self) {
        for p in self.model.parameters_mut() {
            p.zero_grad();
        }
    }

    fn sample_uniform(&mut self) -> Result<Subnet> {
        Ok(strip_placeholders(&self.mutator.random_subnet()?))
    }

    /// Select `subnet` and run the batch: (loss, logits, d loss / d logits)
    fn forward_subnet(
        &mut self,
        batch: &Batch,
        subnet: &Subnet,
    ) -> Result<(f64, Array2<f64>, Array2<f64>)> {
        self.mutator
            .set_subnet(&mut self.model, &strip_placeholders(subnet))?;
        let logits = self.model.forward(&batch.inputs, None)?;
        let (loss, grad) = cross_entropy(&logits, &batch.labels)?;
        if !loss.is_finite() {
            return Err(NasError::TrainingError(format!(
                "non-finite loss at epoch {}",
                self.current_epoch
            )));
        }
        Ok((loss, logits, grad))
    }

    fn single_path(&mut self, batch: &Batch, subnet: Subnet) -> Result<StepOutput> {
        let (loss, logits, grad) = self.forward_subnet(batch, &subnet)?;
        self.model.backward(&grad, None)?;
        Ok(StepOutput {
            loss,
            logits,
            subnet,
        })
    }

    fn pairwise_rank(&mut self, batch: &Batch) -> Result<StepOutput> {
        let first = self.sample_uniform()?;
        let (loss1, _, grad1) = self.forward_subnet(batch, &first)?;
        self.model.backward(&grad1, None)?;
        let flops1 = self.get_subnet_flops(&first)? as f64;

        let second = self.sample_uniform()?;
        let (loss2, logits, grad2) = self.forward_subnet(batch, &second)?;
        let flops2 = self.get_subnet_flops(&second)? as f64;

        let term = self.rank_loss.forward(flops1, flops2, loss1, loss2);
        let weight = self.config.rank_lambda * term.grad;
        match term.target {
            RankTarget::Second => {
                self.model.backward(&(grad2 * (1.0 + weight)), None)?;
            }
            RankTarget::First => {
                self.model.backward(&grad2, None)?;
                if weight > 0.0 {
                    // caches now hold the second path, so rerun the first one
                    let (_, _, grad1) = self.forward_subnet(batch, &first)?;
                    self.model.backward(&(grad1 * weight), None)?;
                }
            }
        }

        Ok(StepOutput {
            loss: loss2 + self.config.rank_lambda * term.value,
            logits,
            subnet: second,
        })
    }

    fn multi_pairwise_rank(&mut self, batch: &Batch, num_pairs: usize) -> Result<StepOutput> {
        let n = num_pairs.max(2);
        let mut subnets = Vec::with_capacity(n);
        let mut losses = Vec::with_capacity(n);
        let mut flops = Vec::with_capacity(n);
        for _ in 0..n {
            let subnet = self.sample_uniform()?;
            let (loss, _, _) = self.forward_subnet(batch, &subnet)?;
            flops.push(self.get_subnet_flops(&subnet)? as f64);
            losses.push(loss);
            subnets.push(subnet);
        }

        let mut coeffs = vec![1.0; n];
        let mut rank_total = 0.0;
        for i in 1..n {
            for j in 0..i {
                let term = self.rank_loss.forward(flops[i], flops[j], losses[i], losses[j]);
                rank_total += term.value;
                let target = match term.target {
                    RankTarget::First => i,
                    RankTarget::Second => j,
                };
                coeffs[target] += self.config.rank_lambda * term.grad;
            }
        }

        let mut last = None;
        for (subnet, coeff) in subnets.into_iter().zip(coeffs) {
            let (_, logits, grad) = self.forward_subnet(batch, &subnet)?;
            self.model.backward(&(grad * coeff), None)?;
            last = Some((logits, subnet));
        }
        let (logits, subnet) =
            last.ok_or_else(|| NasError::TrainingError("no subnet sampled".to_string()))?;
        Ok(StepOutput {
            loss: losses.iter().sum::<f64>() + self.config.rank_lambda * rank_total,
            logits,
            subnet,
        })
    }

    fn fair(&mut self, batch: &Batch) -> Result<StepOutput> {
        let rounds = self.mutator.fair_lists()?;
        let mut total = 0.0;
        let mut last = None;
        for subnet in rounds {
            let (loss, logits, grad) = self.forward_subnet(batch, &subnet)?;
            self.model.backward(&grad, None)?;
            total += loss;
            last = Some((logits, subnet));
        }
        let (logits, subnet) =
            last.ok_or_else(|| NasError::TrainingError("empty fair round".to_string()))?;
        Ok(StepOutput {
            loss: total,
            logits,
            subnet,
        })
    }

    /// Best of `n_samples` uniform draws: min-max scaled metric, softmax, arg-max
    pub fn policy_sampler(&mut self, metric: BalanceMetric, n_samples: usize) -> Result<Subnet> {
        let candidates = (0..n_samples.max(1))
            .map(|_| self.sample_uniform())
            .collect::<Result<Vec<_>>>()?;
        let mut scores = Vec::with_capacity(candidates.len());
        for subnet in &candidates {
            let score = match metric {
                BalanceMetric::Flops => self.get_subnet_flops(subnet)? as f64,
                BalanceMetric::Params => self.get_subnet_params(subnet)? as f64,
                BalanceMetric::Zenscore => self.get_subnet_zenscore(subnet)?,
            };
            scores.push(if score.is_finite() { score } else { 0.0 });
        }

        let lo = scores.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let scaled: ndarray::Array1<f64> = scores
            .iter()
            .map(|s| if hi > lo { (s - lo) / (hi - lo) } else { 0.0 })
            .collect();
        let probs = softmax(scaled.view());
        let best = argmax(probs.view());
        debug!(?metric, best, score = scores[best], "balanced sampler");
        Ok(candidates[best].clone())
    }

    /// Run one optimization step under the configured policy
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        self.zero_grad();
        let out = match self.config.policy.clone() {
            SamplePolicy::Uniform => {
                let subnet = self.sample_uniform()?;
                self.single_path(batch, subnet)?
            }
            SamplePolicy::PairwiseRank => self.pairwise_rank(batch)?,
            SamplePolicy::MultiPairwiseRank { num_pairs } => {
                self.multi_pairwise_rank(batch, num_pairs)?
            }
            SamplePolicy::Fair => self.fair(batch)?,
            SamplePolicy::Balanced { metric, n_samples } => {
                let subnet = self.policy_sampler(metric, n_samples)?;
                self.single_path(batch, subnet)?
            }
            SamplePolicy::Fixed { subnet } => self.single_path(batch, subnet)?,
        };
        self.optimizer.step(&mut self.model.parameters_mut());
        Ok(out)
    }

    /// One pass over the training loader: (loss, top1, top5)
    pub fn train_epoch(&mut self, loader: &mut DataLoader) -> Result<(f64, f64, f64)> {
        let mut loss_meter = AverageMeter::new();
        let mut top1 = AverageMeter::new();
        let mut top5 = AverageMeter::new();
        let ks = topk(self.model.num_classes());

        for (step, batch) in loader.batches().iter().enumerate() {
            let out = self.train_step(batch)?;
            let acc = accuracy(&out.logits, &batch.labels, &ks);
            loss_meter.update(out.loss, batch.len());
            top1.update(acc[0], batch.len());
            top5.update(acc[1], batch.len());

            if self.config.print_freq > 0 && step % self.config.print_freq == 0 {
                info!(
                    epoch = self.current_epoch + 1,
                    step,
                    loss = %format!("{:.4}", out.loss),
                    top1 = %format!("{:.3}", top1.avg()),
                    top5 = %format!("{:.3}", top5.avg()),
                    "train"
                );
            }
        }
        Ok((loss_meter.avg(), top1.avg(), top5.avg()))
    }

    /// Loss and top-1/top-5 accuracy over a loader.
    ///
    /// Without `subnet` every batch runs a fresh uniform sample.
    pub fn metric_score(
        &mut self,
        loader: &mut DataLoader,
        subnet: Option<&Subnet>,
    ) -> Result<(f64, f64, f64)> {
        let mut loss_meter = AverageMeter::new();
        let mut top1 = AverageMeter::new();
        let mut top5 = AverageMeter::new();
        let ks = topk(self.model.num_classes());

        for batch in loader.batches() {
            let active = match subnet {
                Some(s) => s.clone(),
                None => self.sample_uniform()?,
            };
            let (loss, logits, _) = self.forward_subnet(&batch, &active)?;
            let acc = accuracy(&logits, &batch.labels, &ks);
            loss_meter.update(loss, batch.len());
            top1.update(acc[0], batch.len());
            top5.update(acc[1], batch.len());
        }
        Ok((loss_meter.avg(), top1.avg(), top5.avg()))
    }

    pub fn validate(&mut self, loader: &mut DataLoader) -> Result<(f64, f64, f64)> {
        let fixed = match &self.config.policy {
            SamplePolicy::Fixed { subnet } => Some(subnet.clone()),
            _ => None,
        };
        let (loss, top1, top5) = self.metric_score(loader, fixed.as_ref())?;
        info!(
            epoch = self.current_epoch + 1,
            loss = %format!("{:.4}", loss),
            top1 = %format!("{:.3}", top1),
            top5 = %format!("{:.3}", top5),
            "validation"
        );
        Ok((loss, top1, top5))
    }

    /// Epoch loop: train, periodic validation and checkpoint, LR schedule
    pub fn fit(
        &mut self,
        train_loader: &mut DataLoader,
        mut val_loader: Option<&mut DataLoader>,
        epochs: usize,
    ) -> Result<Vec<EpochStats>> {
        let base_lr = self.optimizer.base_learning_rate();
        let start = self.current_epoch;
        let first_new = self.history.len();
        for epoch in start..start + epochs {
            self.current_epoch = epoch;
            let lr = self.config.scheduler.lr_at(base_lr, epoch);
            self.optimizer.set_learning_rate(lr);

            let (train_loss, train_top1, train_top5) = self.train_epoch(train_loader)?;

            let val = match val_loader.as_deref_mut() {
                Some(loader) if (epoch + 1) % self.config.val_interval == 0 => {
                    Some(self.validate(loader)?)
                }
                _ => None,
            };
            if let Some((_, top1, _)) = val {
                self.best_top1 = self.best_top1.max(top1);
            }

            let stats = EpochStats {
                epoch: epoch + 1,
                learning_rate: lr,
                train_loss,
                train_top1,
                train_top5,
                val_loss: val.map(|v| v.0),
                val_top1: val.map(|v| v.1),
                val_top5: val.map(|v| v.2),
            };
            info!(
                epoch = epoch + 1,
                lr,
                train_loss = %format!("{:.4}", train_loss),
                train_top1 = %format!("{:.3}", train_top1),
                best_top1 = %format!("{:.3}", self.best_top1),
                "epoch finished"
            );
            self.history.push(stats);

            if let (Some(interval), Some(dir)) = (self.config.save_interval, self.config.save_dir.clone()) {
                if interval > 0 && (epoch + 1) % interval == 0 {
                    self.save_checkpoint(dir.join(format!("checkpoint_epoch_{}.json", epoch + 1)))?;
                }
            }
        }
        self.current_epoch = start + epochs;
        Ok(self.history[first_new..].to_vec())
    }

    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let ckpt = Checkpoint::capture(&self.model, None, self.current_epoch + 1, self.best_top1);
        ckpt.save(&path)?;
        info!(path = %path.as_ref().display(), "checkpoint saved");
        Ok(())
    }

    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let ckpt = Checkpoint::load(path)?;
        ckpt.restore(&mut self.model)?;
        self.current_epoch = ckpt.epoch;
        self.best_top1 = ckpt.best_top1;
        Ok(())
    }

    pub fn get_subnet_flops(&self, subnet: &Subnet) -> Result<usize> {
        Ok(self
            .mutator
            .subnet_cost(&self.model, subnet, self.config.cost_batch)?
            .0)
    }

    pub fn get_subnet_params(&self, subnet: &Subnet) -> Result<usize> {
        Ok(self
            .mutator
            .subnet_cost(&self.model, subnet, self.config.cost_batch)?
            .1)
    }

    /// Zen score: log of the mean output change under a small Gaussian
    /// input perturbation, divided by the perturbation scale
    pub fn get_subnet_zenscore(&mut self, subnet: &Subnet) -> Result<f64> {
        self.mutator
            .set_subnet(&mut self.model, &strip_placeholders(subnet))?;
        let shape = (self.config.zen_batch.max(1), self.model.input_dim());
        let alpha = self.config.zen_alpha;
        let x = Array2::from_shape_fn(shape, |_| self.rng.sample::<f64, _>(StandardNormal));
        let noise = Array2::from_shape_fn(shape, |_| self.rng.sample::<f64, _>(StandardNormal));

        let clean = self.model.forward(&x, None)?;
        let perturbed = self.model.forward(&(&x + &(noise * alpha)), None)?;
        let delta = (clean - perturbed).mapv(f64::abs).mean().unwrap_or(0.0);
        Ok((delta / alpha).ln())
    }

    /// Global gradient norm of the shared weights for one batch
    pub fn get_subnet_grad_norm(&mut self, subnet: &Subnet, batch: &Batch) -> Result<f64> {
        self.zero_grad();
        let (_, _, grad) = self.forward_subnet(batch, subnet)?;
        self.model.backward(&grad, None)?;
        let norm = grad_norm(&self.model.parameters());
        self.zero_grad();
        Ok(norm)
    }
}
