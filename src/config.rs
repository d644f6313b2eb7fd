//! Run configuration
//!
//! A [`NasConfig`] bundles everything one search run needs. Every section
//! has defaults, so a JSON file only has to name what it changes:
//!
//! ```json
//! {"epochs": 20, "supernet": {"type": "nb201", "num_cells": 2}}
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{NasError, Result};
use crate::evaluator::{Nb201EvaluatorConfig, ZeroCostConfig};
use crate::models::{EdgeKind, Nb201Config, SearchableMlpConfig};
use crate::nn::{synthetic_blobs, DataLoader};
use crate::trainer::{DartsConfig, OneShotTrainerConfig};

/// Which supernet to build
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupernetConfig {
    Nb201(Nb201Config),
    Mlp(SearchableMlpConfig),
}

impl Default for SupernetConfig {
    fn default() -> Self {
        SupernetConfig::Nb201(Nb201Config::default())
    }
}

impl SupernetConfig {
    pub fn input_dim(&self) -> usize {
        match self {
            SupernetConfig::Nb201(c) => c.input_dim,
            SupernetConfig::Mlp(c) => c.input_dim,
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            SupernetConfig::Nb201(c) => c.num_classes,
            SupernetConfig::Mlp(c) => c.num_classes,
        }
    }
}

/// Synthetic classification data used by the CLI runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub n_samples: usize,
    /// Share of samples used for training, the rest validates
    pub train_fraction: f64,
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            n_samples: 512,
            train_fraction: 0.8,
            batch_size: 32,
            shuffle: true,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NasConfig {
    pub epochs: usize,
    pub data: DataConfig,
    pub supernet: SupernetConfig,
    pub trainer: OneShotTrainerConfig,
    pub darts: DartsConfig,
    pub nb201_evaluator: Nb201EvaluatorConfig,
    pub zero_cost: ZeroCostConfig,
}

impl NasConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: NasConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_supernet(mut self, supernet: SupernetConfig) -> Self {
        self.supernet = supernet;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.data.seed = seed;
        self.trainer.seed = seed;
        self.darts.seed = seed;
        self
    }

    /// The same run with differentiable edges, as the DARTS trainer needs
    pub fn for_darts(&self) -> Self {
        let mut config = self.clone();
        if let SupernetConfig::Nb201(c) = &mut config.supernet {
            if c.edge_kind == EdgeKind::OneShot {
                c.edge_kind = EdgeKind::Diff;
            }
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.data.batch_size == 0 {
            return Err(NasError::ConfigError("batch_size must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.data.train_fraction) || self.data.train_fraction == 0.0 {
            return Err(NasError::ConfigError(format!(
                "train_fraction must lie in (0, 1), got {}",
                self.data.train_fraction
            )));
        }
        if self.data.n_samples < 2 {
            return Err(NasError::ConfigError("n_samples must be at least 2".to_string()));
        }
        Ok(())
    }

    /// Train and validation loaders over synthetic blobs matching the supernet
    pub fn loaders(&self) -> Result<(DataLoader, DataLoader)> {
        self.validate()?;
        let data = synthetic_blobs(
            self.data.n_samples,
            self.supernet.input_dim(),
            self.supernet.num_classes(),
            self.data.seed,
        )?;
        let (train, val) = data.split(self.data.train_fraction);
        Ok((
            DataLoader::new(train, self.data.batch_size, self.data.shuffle, Some(self.data.seed)),
            DataLoader::new(val, self.data.batch_size, false, None),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NasConfig = serde_json::from_str(
            r#"{"epochs": 3, "supernet": {"type": "mlp", "num_classes": 4}, "trainer": {"policy": {"type": "fair"}}}"#,
        )
        .unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.supernet.num_classes(), 4);
        assert_eq!(config.supernet.input_dim(), 16);
        assert_eq!(config.data.batch_size, 32);
        assert_eq!(config.trainer.policy, crate::trainer::SamplePolicy::Fair);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nas.json");
        let config = NasConfig::default().with_epochs(7).with_seed(3);
        config.save(&path).unwrap();
        let loaded = NasConfig::from_file(&path).unwrap();
        assert_eq!(loaded.epochs, 7);
        assert_eq!(loaded.trainer.seed, 3);
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        let mut config = NasConfig::default();
        config.data.train_fraction = 1.0;
        assert!(config.validate().is_err());
        assert!(config.loaders().is_err());
    }

    #[test]
    fn test_loaders_and_darts_variant() {
        let config = NasConfig::default();
        let (train, val) = config.loaders().unwrap();
        assert_eq!(train.dataset().len() + val.dataset().len(), 512);
        assert_eq!(train.dataset().num_features(), 16);

        match config.for_darts().supernet {
            SupernetConfig::Nb201(c) => assert_eq!(c.edge_kind, EdgeKind::Diff),
            other => panic!("unexpected supernet {other:?}"),
        }
    }
}
