//! Read-only benchmark tables

use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{NasError, Result};

/// Key-value store of benchmarked architectures.
///
/// Keys are genotype strings or architecture hashes; values are nested
/// mappings of metric name to scalar or per-epoch sequence.
pub trait BenchmarkApi {
    fn get(&self, key: &str) -> Result<&Value>;

    fn keys(&self) -> Vec<&str>;

    fn len(&self) -> usize {
        self.keys().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Benchmark table held in memory as a JSON object
#[derive(Debug, Clone, Default)]
pub struct JsonBenchmark {
    table: Map<String, Value>,
}

impl JsonBenchmark {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(table) => Ok(Self { table }),
            other => Err(NasError::ConfigError(format!(
                "benchmark table must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let bench = Self::from_value(serde_json::from_str(&content)?)?;
        info!(path = %path.display(), records = bench.table.len(), "benchmark loaded");
        Ok(bench)
    }
}

impl BenchmarkApi for JsonBenchmark {
    fn get(&self, key: &str) -> Result<&Value> {
        self.table
            .get(key)
            .ok_or_else(|| NasError::BenchmarkKey(key.to_string()))
    }

    fn keys(&self) -> Vec<&str> {
        self.table.keys().map(String::as_str).collect()
    }

    fn len(&self) -> usize {
        self.table.len()
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
