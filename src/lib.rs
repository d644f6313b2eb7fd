//! Kolosal NAS - neural architecture search on weight-sharing supernets
//!
//! This crate provides searchable layers, the mutator that coordinates them,
//! supernet training loops and benchmark-backed evaluation:
//!
//! # Modules
//!
//! ## Search core
//! - [`nas`] - Mutables (`ChoiceOp`, `ChoiceRoute`) and the `Mutator`
//! - [`models`] - The `Supernet` contract, NAS-Bench-201 and SPOS-style supernets
//!
//! ## Training
//! - [`nn`] - Dense layers with hand-written backward passes, losses, optimizers, data
//! - [`trainer`] - One-shot trainer with sampling policies and a DARTS trainer
//!
//! ## Evaluation
//! - [`evaluator`] - Rank consistency against NAS-Bench-201 and zero-cost predictor scoring
//!
//! ## Services
//! - [`config`] - JSON run configuration
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;

// Search core
pub mod models;
pub mod nas;

// Training
pub mod nn;
pub mod trainer;

// Evaluation
pub mod evaluator;

// Services
pub mod cli;
pub mod config;

pub use error::{NasError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{NasError, Result};

    // Search core
    pub use crate::nas::{
        candidate, ChoiceOp, ChoiceRoute, Mutable, Mutator, MutatorConfig, OpKind,
        ProbNormalizer, Subnet,
    };
    pub use crate::models::{
        genotype, parse_genotype, EdgeKind, Nb201Config, Nb201Preset, Nb201Supernet, RouteKind,
        SearchableMlp, SearchableMlpConfig, Supernet,
    };

    // Training
    pub use crate::nn::{synthetic_blobs, DataLoader, Dataset, Operation};
    pub use crate::trainer::{
        BalanceMetric, DartsConfig, DartsTrainer, OneShotTrainer, OneShotTrainerConfig,
        SamplePolicy,
    };

    // Evaluation
    pub use crate::evaluator::{
        BenchmarkApi, JsonBenchmark, Nb201Evaluator, Nb201EvaluatorConfig, ZeroCostConfig,
        ZeroCostEvaluator,
    };

    // Configuration
    pub use crate::config::{NasConfig, SupernetConfig};
}
