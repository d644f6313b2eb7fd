//! Zero-cost predictor evaluation against a benchmark table

use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use super::benchmark::{json_kind, BenchmarkApi};
use super::rank::{compute_scores, PredictionScores};
use crate::error::{NasError, Result};

/// Sentinel replacing infinite predictor scores
pub const INF_SENTINEL: f64 = 1e9;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZeroCostConfig {
    pub dataset: String,
    pub search_space: String,
    /// Predictor name, also the record field holding its score
    pub method_type: String,
    pub test_size: usize,
    /// Labeled `[{"arch": .., "accuracy": ..}]` file; sample the table when unset
    pub test_data_file: Option<PathBuf>,
    /// Directory receiving `scores.json`
    pub save: PathBuf,
    pub seed: u64,
}

impl Default for ZeroCostConfig {
    fn default() -> Self {
        Self {
            dataset: "cifar10".to_string(),
            search_space: "nasbench201".to_string(),
            method_type: "synflow".to_string(),
            test_size: 100,
            test_data_file: None,
            save: PathBuf::from("results"),
            seed: 0,
        }
    }
}

impl ZeroCostConfig {
    pub fn with_method(mut self, method_type: impl Into<String>) -> Self {
        self.method_type = method_type.into();
        self
    }

    pub fn with_test_size(mut self, test_size: usize) -> Self {
        self.test_size = test_size;
        self
    }

    pub fn with_test_data_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.test_data_file = Some(path.into());
        self
    }

    pub fn with_save_dir(mut self, save: impl Into<PathBuf>) -> Self {
        self.save = save.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Architectures and their ground-truth accuracy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestData {
    pub archs: Vec<String>,
    pub accuracies: Vec<f64>,
}

impl TestData {
    pub fn len(&self) -> usize {
        self.archs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archs.is_empty()
    }
}

/// Map a raw score to a finite value: ±inf to ±1e9, NaN to 0
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else if score == f64::INFINITY {
        INF_SENTINEL
    } else if score == f64::NEG_INFINITY {
        -INF_SENTINEL
    } else {
        score
    }
}

fn as_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        // large or non-finite scores are sometimes stored as strings
        Value::String(s) => match s.as_str() {
            "inf" | "Infinity" => Some(f64::INFINITY),
            "-inf" | "-Infinity" => Some(f64::NEG_INFINITY),
            "nan" | "NaN" => Some(f64::NAN),
            other => other.parse().ok(),
        },
        Value::Null => Some(f64::NAN),
        _ => None,
    }
}

#[derive(Debug)]
pub struct ZeroCostEvaluator<B: BenchmarkApi> {
    api: B,
    config: ZeroCostConfig,
    log_results: bool,
    results: Vec<Value>,
    rng: Xoshiro256PlusPlus,
}

impl<B: BenchmarkApi> ZeroCostEvaluator<B> {
    pub fn new(api: B, config: ZeroCostConfig) -> Result<Self> {
        if config.test_size == 0 {
            return Err(NasError::ConfigError(
                "test_size must be at least 1".to_string(),
            ));
        }
        if config.method_type.is_empty() {
            return Err(NasError::ConfigError(
                "method_type must name a predictor".to_string(),
            ));
        }
        Ok(Self {
            rng: Xoshiro256PlusPlus::seed_from_u64(config.seed),
            results: vec![serde_json::to_value(&config)?],
            api,
            config,
            log_results: true,
        })
    }

    /// Keep results in memory only
    pub fn without_logging(mut self) -> Self {
        self.log_results = false;
        self
    }

    pub fn config(&self) -> &ZeroCostConfig {
        &self.config
    }

    /// Config first, then one score record per evaluation
    pub fn results(&self) -> &[Value] {
        &self.results
    }

    /// First `size` entries of a labeled file
    pub fn load_dataset_from_file(path: impl AsRef<Path>, size: usize) -> Result<TestData> {
        let content = fs::read_to_string(path.as_ref())?;
        let entries: Vec<Value> = serde_json::from_str(&content)?;
        let mut data = TestData::default();
        for (i, entry) in entries.into_iter().take(size).enumerate() {
            let arch = match entry.get("arch") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    return Err(NasError::ConfigError(format!(
                        "test entry {i} has no `arch`"
                    )))
                }
            };
            let accuracy = entry
                .get("accuracy")
                .and_then(Value::as_f64)
                .ok_or_else(|| {
                    NasError::ConfigError(format!("test entry {i} has no numeric `accuracy`"))
                })?;
            data.archs.push(arch);
            data.accuracies.push(accuracy);
        }
        Ok(data)
    }

    /// `size` random table keys with their `val_accuracy`
    pub fn load_dataset(&mut self, size: usize) -> Result<TestData> {
        let keys: Vec<String> = self.api.keys().into_iter().map(str::to_string).collect();
        if keys.is_empty() {
            return Err(NasError::ConfigError("benchmark table is empty".to_string()));
        }
        let mut data = TestData::default();
        while data.len() < size {
            let key = &keys[self.rng.gen_range(0..keys.len())];
            let record = self.api.get(key)?;
            let accuracy = record
                .get("val_accuracy")
                .and_then(Value::as_f64)
                .ok_or_else(|| NasError::BenchmarkRecord {
                    key: key.clone(),
                    reason: "no numeric `val_accuracy`".to_string(),
                })?;
            data.archs.push(key.clone());
            data.accuracies.push(accuracy);
        }
        Ok(data)
    }

    pub fn load_test_data(&mut self) -> Result<TestData> {
        match self.config.test_data_file.clone() {
            Some(path) => {
                info!(path = %path.display(), "loading the test set from file");
                Self::load_dataset_from_file(path, self.config.test_size)
            }
            None => {
                info!(size = self.config.test_size, "sampling from the benchmark table");
                self.load_dataset(self.config.test_size)
            }
        }
    }

    /// Predictor score of one architecture; ensembles are mean-aggregated
    pub fn query_score(&self, arch: &str) -> Result<f64> {
        let malformed = |reason: String| NasError::BenchmarkRecord {
            key: arch.to_string(),
            reason,
        };
        let record = self.api.get(arch)?;
        let score = record
            .get(&self.config.method_type)
            .and_then(|m| m.get("score"))
            .ok_or_else(|| malformed(format!("no score for `{}`", self.config.method_type)))?;

        let raw = match score {
            Value::Array(members) => {
                if members.is_empty() {
                    return Err(malformed("empty ensemble score".to_string()));
                }
                let mut sum = 0.0;
                for member in members {
                    let v = as_score(member).ok_or_else(|| {
                        malformed(format!("ensemble member is a {}", json_kind(member)))
                    })?;
                    sum += clamp_score(v);
                }
                sum / members.len() as f64
            }
            other => as_score(other)
                .ok_or_else(|| malformed(format!("score is a {}", json_kind(other))))?,
        };
        Ok(clamp_score(raw))
    }

    /// Score every test architecture and compare against its accuracy
    pub fn single_evaluate(&mut self, test_data: &TestData) -> Result<PredictionScores> {
        if test_data.is_empty() {
            return Err(NasError::ConfigError("no test architectures".to_string()));
        }
        info!(method = %self.config.method_type, "querying the predictor");
        let start = Instant::now();
        let preds = test_data
            .archs
            .iter()
            .map(|arch| self.query_score(arch))
            .collect::<Result<Vec<_>>>()?;
        let elapsed = start.elapsed().as_secs_f64();

        let mut scores = compute_scores(&test_data.accuracies, &preds)?;
        scores.query_time = elapsed / test_data.len() as f64;
        info!(
            dataset = %self.config.dataset,
            method = %self.config.method_type,
            kendalltau = %format!("{:.4}", scores.kendalltau),
            spearman = %format!("{:.4}", scores.spearman),
            pearson = %format!("{:.4}", scores.pearson),
            "predictor evaluated"
        );
        self.results.push(serde_json::to_value(&scores)?);
        Ok(scores)
    }

    /// Load data, score it and persist the accumulated results
    pub fn evaluate(&mut self) -> Result<&[Value]> {
        let test_data = self.load_test_data()?;
        self.single_evaluate(&test_data)?;
        if self.log_results {
            self.save()?;
        }
        Ok(&self.results)
    }

    /// Write all results as one JSON array to `<save>/scores.json`
    pub fn save(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.save)?;
        let path = self.config.save.join("scores.json");
        fs::write(&path, serde_json::to_string(&self.results)?)?;
        info!(path = %path.display(), at = %Utc::now().to_rfc3339(), "scores saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::JsonBenchmark;
    use serde_json::json;

    fn table() -> JsonBenchmark {
        JsonBenchmark::from_value(json!({
            "a": {"val_accuracy": 90.0, "synflow": {"score": 10.0}, "ens": {"score": [1.0, 3.0]}},
            "b": {"val_accuracy": 50.0, "synflow": {"score": 1.0}, "ens": {"score": [0.0, 0.0]}},
            "c": {"val_accuracy": 70.0, "synflow": {"score": "inf"}, "ens": {"score": [1.0, 1.0]}}
        }))
        .unwrap()
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(f64::INFINITY), 1e9);
        assert_eq!(clamp_score(f64::NEG_INFINITY), -1e9);
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(2.5), 2.5);
    }

    #[test]
    fn test_query_score_and_ensemble_mean() {
        let eval = ZeroCostEvaluator::new(table(), ZeroCostConfig::default()).unwrap();
        assert_eq!(eval.query_score("a").unwrap(), 10.0);
        assert_eq!(eval.query_score("c").unwrap(), 1e9);

        let ens = ZeroCostEvaluator::new(table(), ZeroCostConfig::default().with_method("ens")).unwrap();
        assert_eq!(ens.query_score("a").unwrap(), 2.0);
        assert!(matches!(ens.query_score("z"), Err(NasError::BenchmarkKey(_))));
    }

    #[test]
    fn test_perfect_concordance() {
        let mut eval = ZeroCostEvaluator::new(table(), ZeroCostConfig::default())
            .unwrap()
            .without_logging();
        let data = TestData {
            archs: vec!["a".into(), "b".into()],
            accuracies: vec![0.9, 0.5],
        };
        let scores = eval.single_evaluate(&data).unwrap();
        assert_eq!(scores.kendalltau, 1.0);
        assert!(scores.query_time >= 0.0);
        assert_eq!(eval.results().len(), 2);
    }

    #[test]
    fn test_infinite_score_keeps_statistics_finite() {
        let mut eval = ZeroCostEvaluator::new(table(), ZeroCostConfig::default())
            .unwrap()
            .without_logging();
        let data = TestData {
            archs: vec!["a".into(), "b".into(), "c".into()],
            accuracies: vec![90.0, 50.0, 70.0],
        };
        let scores = eval.single_evaluate(&data).unwrap();
        assert!(scores.pearson.is_finite());
        assert!(scores.mae.is_finite());
    }

    #[test]
    fn test_load_from_file_respects_test_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.json");
        fs::write(
            &path,
            r#"[{"arch": "a", "accuracy": 90.0}, {"arch": [1, 2], "accuracy": 50.0}, {"arch": "c", "accuracy": 70.0}]"#,
        )
        .unwrap();
        let data = ZeroCostEvaluator::<JsonBenchmark>::load_dataset_from_file(&path, 2).unwrap();
        assert_eq!(data.archs, vec!["a".to_string(), "[1,2]".to_string()]);
        assert_eq!(data.accuracies, vec![90.0, 50.0]);
    }

    #[test]
    fn test_sampling_is_seeded() {
        let config = ZeroCostConfig::default().with_test_size(5).with_seed(9);
        let mut first = ZeroCostEvaluator::new(table(), config.clone()).unwrap();
        let mut second = ZeroCostEvaluator::new(table(), config).unwrap();
        let a = first.load_test_data().unwrap();
        assert_eq!(a.len(), 5);
        assert_eq!(a, second.load_test_data().unwrap());
    }

    #[test]
    fn test_evaluate_writes_scores_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = ZeroCostConfig::default()
            .with_test_size(6)
            .with_save_dir(dir.path().join("out"));
        let mut eval = ZeroCostEvaluator::new(table(), config).unwrap();
        let results = eval.evaluate().unwrap().to_vec();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["method_type"], json!("synflow"));

        let written: Vec<Value> =
            serde_json::from_str(&fs::read_to_string(dir.path().join("out/scores.json")).unwrap())
                .unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0]["test_size"], json!(6));
        assert!(written[1]["kendalltau"].is_number());
    }
}
