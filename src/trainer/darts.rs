//! First-order differentiable search

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::meters::AverageMeter;
use super::topk;
use crate::error::{NasError, Result};
use crate::models::{genotype, Supernet};
use crate::nas::{Mutator, MutatorConfig, Subnet};
use crate::nn::{accuracy, cross_entropy, Adam, AdamConfig, Batch, DataLoader, LrScheduler, Sgd, SgdConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DartsConfig {
    pub sgd: SgdConfig,
    /// Optimizer of the architecture parameters
    pub adam: AdamConfig,
    pub scheduler: LrScheduler,
    /// Gumbel temperature at the first epoch
    pub tau_max: f64,
    /// Gumbel temperature at the last epoch
    pub tau_min: f64,
    pub print_freq: usize,
    pub seed: u64,
}

impl Default for DartsConfig {
    fn default() -> Self {
        Self {
            sgd: SgdConfig::default(),
            adam: AdamConfig::default(),
            scheduler: LrScheduler::Constant,
            tau_max: 10.0,
            tau_min: 0.1,
            print_freq: 50,
            seed: 0,
        }
    }
}

/// Metrics of one search epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DartsEpoch {
    pub epoch: usize,
    pub tau: f64,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_top1: f64,
    pub arch_loss: f64,
    /// Arg-max architecture after the epoch
    pub genotype: Subnet,
}

#[derive(Debug)]
pub struct DartsTrainer<M: Supernet> {
    model: M,
    mutator: Mutator,
    w_optim: Sgd,
    a_optim: Adam,
    config: DartsConfig,
    current_epoch: usize,
    history: Vec<DartsEpoch>,
}

impl<M: Supernet> DartsTrainer<M> {
    pub fn new(model: M, config: DartsConfig) -> Result<Self> {
        if config.tau_min <= 0.0 || config.tau_max < config.tau_min {
            return Err(NasError::ConfigError(format!(
                "temperature range [{}, {}] is invalid",
                config.tau_min, config.tau_max
            )));
        }
        let mut mutator = Mutator::new(MutatorConfig::differentiable().with_seed(config.seed));
        mutator.prepare_from_supernet(&model)?;
        Ok(Self {
            w_optim: Sgd::new(config.sgd.clone()),
            a_optim: Adam::new(config.adam.clone()),
            model,
            mutator,
            config,
            current_epoch: 0,
            history: Vec::new(),
        })
    }

    pub fn model(&self) -> &M {
        &self.model
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

    pub fn history(&self) -> &[DartsEpoch] {
        &self.history
    }

    /// Linear annealing from `tau_max` to `tau_min` over `epochs`
    pub fn temperature_at(&self, epoch: usize, epochs: usize) -> f64 {
        if epochs <= 1 {
            return self.config.tau_max;
        }
        let progress = epoch.min(epochs - 1) as f64 / (epochs - 1) as f64;
        self.config.tau_max - (self.config.tau_max - self.config.tau_min) * progress
    }

    fn mixture_loss(&mut self, batch: &Batch) -> Result<(f64, Array2<f64>, Array2<f64>)> {
        let arch = self.mutator.arch_params()?;
        let logits = self.model.forward(&batch.inputs, Some(arch))?;
        let (loss, grad) = cross_entropy(&logits, &batch.labels)?;
        if !loss.is_finite() {
            return Err(NasError::TrainingError(format!(
                "non-finite loss at epoch {}",
                self.current_epoch
            )));
        }
        Ok((loss, logits, grad))
    }

    /// Architecture step on `val_batch`, then weight step on `train_batch`.
    ///
    /// Returns (train loss, arch loss, train logits).
    pub fn search_step(
        &mut self,
        train_batch: &Batch,
        val_batch: &Batch,
    ) -> Result<(f64, f64, Array2<f64>)> {
        self.mutator.zero_arch_grad();
        let (arch_loss, _, grad) = self.mixture_loss(val_batch)?;
        self.model
            .backward(&grad, Some(self.mutator.arch_params_mut()?))?;
        self.a_optim
            .step(&mut self.mutator.arch_params_mut()?.params_mut());

        for p in self.model.parameters_mut() {
            p.zero_grad();
        }
        let (loss, logits, grad) = self.mixture_loss(train_batch)?;
        self.model.backward(&grad, None)?;
        self.w_optim.step(&mut self.model.parameters_mut());
        Ok((loss, arch_loss, logits))
    }

    pub fn train_epoch(
        &mut self,
        train_loader: &mut DataLoader,
        val_loader: &mut DataLoader,
    ) -> Result<(f64, f64, f64)> {
        let mut loss_meter = AverageMeter::new();
        let mut arch_meter = AverageMeter::new();
        let mut top1 = AverageMeter::new();
        let ks = topk(self.model.num_classes());

        let val_batches = val_loader.batches();
        if val_batches.is_empty() {
            return Err(NasError::TrainingError(
                "architecture search needs validation data".to_string(),
            ));
        }
        for (step, batch) in train_loader.batches().iter().enumerate() {
            let val_batch = &val_batches[step % val_batches.len()];
            let (loss, arch_loss, logits) = self.search_step(batch, val_batch)?;
            loss_meter.update(loss, batch.len());
            arch_meter.update(arch_loss, val_batch.len());
            top1.update(accuracy(&logits, &batch.labels, &ks)[0], batch.len());

            if self.config.print_freq > 0 && step % self.config.print_freq == 0 {
                debug!(epoch = self.current_epoch + 1, step, loss, arch_loss, "search step");
            }
        }
        Ok((loss_meter.avg(), top1.avg(), arch_meter.avg()))
    }

    pub fn fit(
        &mut self,
        train_loader: &mut DataLoader,
        val_loader: &mut DataLoader,
        epochs: usize,
    ) -> Result<Vec<DartsEpoch>> {
        let base_lr = self.w_optim.base_learning_rate();
        let first_new = self.history.len();
        for epoch in 0..epochs {
            self.current_epoch = epoch;
            let tau = self.temperature_at(epoch, epochs);
            self.mutator.set_temperature(&mut self.model, tau)?;
            let lr = self.config.scheduler.lr_at(base_lr, epoch);
            self.w_optim.set_learning_rate(lr);

            let (train_loss, train_top1, arch_loss) = self.train_epoch(train_loader, val_loader)?;
            let genotype = self.genotype()?;
            info!(
                epoch = epoch + 1,
                tau,
                train_loss = %format!("{:.4}", train_loss),
                train_top1 = %format!("{:.3}", train_top1),
                arch_loss = %format!("{:.4}", arch_loss),
                genotype = ?genotype,
                "search epoch finished"
            );
            self.history.push(DartsEpoch {
                epoch: epoch + 1,
                tau,
                learning_rate: lr,
                train_loss,
                train_top1,
                arch_loss,
                genotype,
            });
        }
        Ok(self.history[first_new..].to_vec())
    }

    /// Architecture found so far: edges fixed during search keep their
    /// choice, the rest take the arg-max of the current parameters
    pub fn genotype(&self) -> Result<Subnet> {
        self.mutator.decode_subnet(&self.model)
    }

    /// NAS-Bench-201 string of [`DartsTrainer::genotype`]
    pub fn genotype_string(&self) -> Result<String> {
        genotype(&self.genotype()?, self.mutator.alias2group_id())
    }

    /// Accuracy of the arg-max architecture on a loader: (loss, top1, top5)
    pub fn validate(&mut self, loader: &mut DataLoader) -> Result<(f64, f64, f64)> {
        let subnet = self.genotype()?;
        self.mutator.set_subnet(&mut self.model, &subnet)?;
        let mut loss_meter = AverageMeter::new();
        let mut top1 = AverageMeter::new();
        let mut top5 = AverageMeter::new();
        let ks = topk(self.model.num_classes());
        for batch in loader.batches() {
            let logits = self.model.forward(&batch.inputs, None)?;
            let (loss, _) = cross_entropy(&logits, &batch.labels)?;
            let acc = accuracy(&logits, &batch.labels, &ks);
            loss_meter.update(loss, batch.len());
            top1.update(acc[0], batch.len());
            top5.update(acc[1], batch.len());
        }
        self.mutator.clear_subnet(&mut self.model)?;
        Ok((loss_meter.avg(), top1.avg(), top5.avg()))
    }

    /// Prune every mutable to [`DartsTrainer::genotype`]
    pub fn finalize(&mut self) -> Result<Subnet> {
        let subnet = self.genotype()?;
        self.mutator.fix_subnet(&mut self.model, &subnet)?;
        info!(genotype = ?subnet, "architecture fixed");
        Ok(subnet)
    }
}
