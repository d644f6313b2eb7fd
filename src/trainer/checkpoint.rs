//! JSON checkpoints of supernet weights

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{NasError, Result};
use crate::models::Supernet;
use crate::nas::ArchParams;
use crate::nn::Param;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub best_top1: f64,
    pub saved_at: DateTime<Utc>,
    pub parameters: Vec<Param>,
    pub arch_params: Option<ArchParams>,
}

impl Checkpoint {
    pub fn capture(
        model: &dyn Supernet,
        arch_params: Option<&ArchParams>,
        epoch: usize,
        best_top1: f64,
    ) -> Self {
        Self {
            epoch,
            best_top1,
            saved_at: Utc::now(),
            parameters: model.parameters().into_iter().cloned().collect(),
            arch_params: arch_params.cloned(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Copy the stored weights into a supernet of the same layout
    pub fn restore(&self, model: &mut dyn Supernet) -> Result<()> {
        let mut params = model.parameters_mut();
        if params.len() != self.parameters.len() {
            return Err(NasError::shape(
                format!("{} parameter tensors", params.len()),
                format!("{} in checkpoint", self.parameters.len()),
            ));
        }
        for (dst, src) in params.iter_mut().zip(&self.parameters) {
            if dst.value.dim() != src.value.dim() {
                return Err(NasError::shape(
                    format!("{:?}", dst.value.dim()),
                    format!("{:?}", src.value.dim()),
                ));
            }
            dst.value.assign(&src.value);
            dst.zero_grad();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SearchableMlp, SearchableMlpConfig};

    #[test]
    fn test_save_load_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt").join("epoch_1.json");

        let source = SearchableMlp::new(SearchableMlpConfig {
            seed: 1,
            ..Default::default()
        })
        .unwrap();
        let ckpt = Checkpoint::capture(&source, None, 1, 42.0);
        ckpt.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.epoch, 1);
        assert_eq!(loaded.parameters.len(), source.parameters().len());

        let mut target = SearchableMlp::new(SearchableMlpConfig {
            seed: 2,
            ..Default::default()
        })
        .unwrap();
        loaded.restore(&mut target).unwrap();
        for (a, b) in source.parameters().iter().zip(target.parameters()) {
            for (x, y) in a.value.iter().zip(b.value.iter()) {
                assert!((x - y).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_restore_rejects_other_layout() {
        let small = SearchableMlp::new(SearchableMlpConfig {
            stages: vec![crate::models::MlpStage { width: 4, blocks: 1 }],
            ..Default::default()
        })
        .unwrap();
        let ckpt = Checkpoint::capture(&small, None, 0, 0.0);
        let mut large = SearchableMlp::new(SearchableMlpConfig::default()).unwrap();
        assert!(ckpt.restore(&mut large).is_err());
    }
}
