//! Mutables and the mutator
//!
//! Searchable layers ([`ChoiceOp`], [`ChoiceRoute`]) implement the
//! [`Mutable`] contract. The [`Mutator`] inventories them inside a supernet,
//! groups them by alias and drives subnet sampling, transient selection and
//! permanent fixing.

mod candidates;
mod mutable;
mod mutator;
mod op;
mod route;

use std::collections::BTreeMap;

use crate::nn::Operation;

pub(crate) use mutable::{argmax, softmax};
pub use mutable::{ArchProbs, Mutable, MutableGrad, MutableInput, ProbNormalizer};
pub use mutator::{strip_placeholders, ArchParams, Mutator, MutatorConfig, PLACEHOLDER_SUFFIX};
pub use op::{ChoiceOp, OpKind};
pub use route::ChoiceRoute;

/// One concrete architecture: group id -> choice name
pub type Subnet = BTreeMap<usize, String>;

/// Named candidate operation
pub type Candidate = (String, Box<dyn Operation>);

/// Build a [`Candidate`] entry
pub fn candidate(name: impl Into<String>, op: impl Operation + 'static) -> Candidate {
    (name.into(), Box::new(op))
}
