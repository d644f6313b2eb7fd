//! In-memory datasets and mini-batch loading

use ndarray::{Array2, Axis};
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::error::{NasError, Result};

/// Feature matrix with integer class labels
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: Array2<f64>,
    pub labels: Vec<usize>,
    pub num_classes: usize,
}

impl Dataset {
    pub fn new(features: Array2<f64>, labels: Vec<usize>) -> Result<Self> {
        if features.nrows() != labels.len() {
            return Err(NasError::shape(
                format!("{} labels", features.nrows()),
                format!("{} labels", labels.len()),
            ));
        }
        let num_classes = labels.iter().max().map(|m| m + 1).unwrap_or(0);
        Ok(Self {
            features,
            labels,
            num_classes,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    /// Split into two datasets, the first holding `fraction` of the rows
    pub fn split(&self, fraction: f64) -> (Dataset, Dataset) {
        let cut = ((self.len() as f64) * fraction.clamp(0.0, 1.0)).round() as usize;
        let head: Vec<usize> = (0..cut).collect();
        let tail: Vec<usize> = (cut..self.len()).collect();
        (self.subset(&head), self.subset(&tail))
    }

    fn subset(&self, indices: &[usize]) -> Dataset {
        Dataset {
            features: self.features.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            num_classes: self.num_classes,
        }
    }
}

/// One mini-batch
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Array2<f64>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Mini-batch loader with a seeded shuffle per epoch
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    shuffle: bool,
    rng: Xoshiro256PlusPlus,
}

impl DataLoader {
    pub fn new(dataset: Dataset, batch_size: usize, shuffle: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => Xoshiro256PlusPlus::seed_from_u64(s),
            None => Xoshiro256PlusPlus::from_entropy(),
        };
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            rng,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per epoch
    pub fn len(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Batches for one epoch, reshuffled when shuffling is enabled
    pub fn batches(&mut self) -> Vec<Batch> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            indices.shuffle(&mut self.rng);
        }
        indices
            .chunks(self.batch_size)
            .map(|chunk| Batch {
                inputs: self.dataset.features.select(Axis(0), chunk),
                labels: chunk.iter().map(|&i| self.dataset.labels[i]).collect(),
            })
            .collect()
    }
}

/// Gaussian blobs: one cluster per class, useful for smoke tests and demos
pub fn synthetic_blobs(
    n_samples: usize,
    n_features: usize,
    n_classes: usize,
    seed: u64,
) -> Result<Dataset> {
    if n_classes == 0 || n_features == 0 {
        return Err(NasError::ConfigError(
            "synthetic data needs at least one class and one feature".to_string(),
        ));
    }
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let centers = Array2::from_shape_fn((n_classes, n_features), |_| {
        rng.gen::<f64>() * 6.0 - 3.0
    });

    let mut features = Array2::zeros((n_samples, n_features));
    let mut labels = Vec::with_capacity(n_samples);
    for i in 0..n_samples {
        let class = i % n_classes;
        for j in 0..n_features {
            features[[i, j]] = centers[[class, j]] + rng.sample::<f64, _>(StandardNormal);
        }
        labels.push(class);
    }
    let mut dataset = Dataset::new(features, labels)?;
    dataset.num_classes = n_classes;
    Ok(dataset)
}
