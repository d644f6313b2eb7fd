//! Subnet-wide sampling, selection and fixing
//!
//! The mutator inventories every mutable of a supernet once, groups them by
//! alias and owns one architecture parameter per group. Mutables only know
//! their own name and alias; the mutator resolves names into group ids.

use ndarray::{Array1, Array2, ArrayView1};
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::mutable::{argmax, softmax, Mutable};
use super::Subnet;
use crate::error::{NasError, Result};
use crate::models::Supernet;
use crate::nn::Param;

/// Marker appended to a choice that is structurally absent
pub const PLACEHOLDER_SUFFIX: char = '_';

/// Remove the placeholder marker from every choice of a subnet
pub fn strip_placeholders(subnet: &Subnet) -> Subnet {
    subnet
        .iter()
        .map(|(gid, choice)| (*gid, choice.trim_end_matches(PLACEHOLDER_SUFFIX).to_string()))
        .collect()
}

/// Mutator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutatorConfig {
    /// Group mutables sharing an alias into one search group
    pub with_alias: bool,
    /// Create one architecture parameter per group
    pub differentiable: bool,
    /// Standard deviation of the architecture parameter initialization
    pub init_std: f64,
    pub seed: Option<u64>,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            with_alias: true,
            differentiable: false,
            init_std: 1e-3,
            seed: None,
        }
    }
}

impl MutatorConfig {
    pub fn one_shot() -> Self {
        Self::default()
    }

    pub fn differentiable() -> Self {
        Self {
            differentiable: true,
            ..Self::default()
        }
    }

    pub fn with_alias(mut self, with_alias: bool) -> Self {
        self.with_alias = with_alias;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Architecture parameters, one `[1, num_choices]` row per search group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchParams {
    groups: BTreeMap<usize, Param>,
    mutable2group: BTreeMap<String, usize>,
}

impl ArchParams {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_id(&self, mutable: &str) -> Option<usize> {
        self.mutable2group.get(mutable).copied()
    }

    pub fn group(&self, group_id: usize) -> Option<&Param> {
        self.groups.get(&group_id)
    }

    /// Architecture parameter of the group a mutable belongs to
    pub fn get(&self, mutable: &str) -> Option<ArrayView1<'_, f64>> {
        let gid = self.group_id(mutable)?;
        self.groups.get(&gid).map(|p| p.value.row(0))
    }

    /// Add a mutable's gradient into its group's buffer
    pub fn accumulate_grad(&mut self, mutable: &str, grad: &Array1<f64>) -> Result<()> {
        let gid = self.group_id(mutable).ok_or_else(|| {
            NasError::MutatorError(format!("mutable `{mutable}` has no architecture parameter"))
        })?;
        let param = self
            .groups
            .get_mut(&gid)
            .ok_or_else(|| NasError::MutatorError(format!("unknown group {gid}")))?;
        if param.grad.ncols() != grad.len() {
            return Err(NasError::shape(
                format!("{}", param.grad.ncols()),
                format!("{}", grad.len()),
            ));
        }
        let mut row = param.grad.row_mut(0);
        row += grad;
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        for p in self.groups.values_mut() {
            p.zero_grad();
        }
    }

    pub fn params(&self) -> Vec<&Param> {
        self.groups.values().collect()
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        self.groups.values_mut().collect()
    }
}

/// Groups mutables and drives subnet-wide operations
#[derive(Debug, Clone)]
pub struct Mutator {
    config: MutatorConfig,
    prepared: bool,
    alias2group_id: BTreeMap<String, usize>,
    search_group: BTreeMap<usize, Vec<String>>,
    group_choices: BTreeMap<usize, Vec<String>>,
    absent: BTreeMap<usize, BTreeSet<String>>,
    arch_params: Option<ArchParams>,
    rng: Xoshiro256PlusPlus,
}

impl Mutator {
    pub fn new(config: MutatorConfig) -> Self {
        let rng = match config.seed {
            Some(s) => Xoshiro256PlusPlus::seed_from_u64(s),
            None => Xoshiro256PlusPlus::from_entropy(),
        };
        Self {
            config,
            prepared: false,
            alias2group_id: BTreeMap::new(),
            search_group: BTreeMap::new(),
            group_choices: BTreeMap::new(),
            absent: BTreeMap::new(),
            arch_params: None,
            rng,
        }
    }

    pub fn config(&self) -> &MutatorConfig {
        &self.config
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    fn ensure_prepared(&self) -> Result<()> {
        if self.prepared {
            Ok(())
        } else {
            Err(NasError::MutatorError(
                "call `prepare_from_supernet` before using the mutator".to_string(),
            ))
        }
    }

    /// Inventory the supernet's mutables and build the search groups.
    ///
    /// Group ids follow traversal order. Must be called exactly once.
    pub fn prepare_from_supernet(&mut self, model: &dyn Supernet) -> Result<()> {
        if self.prepared {
            return Err(NasError::MutatorError(
                "mutator is already prepared".to_string(),
            ));
        }

        let mut mutable2group = BTreeMap::new();
        for mutable in model.mutables() {
            let gid = match mutable.alias() {
                Some(alias) if self.config.with_alias => {
                    let next = self.search_group.len();
                    *self.alias2group_id.entry(alias.to_string()).or_insert(next)
                }
                _ => self.search_group.len(),
            };

            let choices = mutable.choices();
            match self.group_choices.get(&gid) {
                Some(existing) if *existing != choices => {
                    return Err(NasError::ConfigError(format!(
                        "mutable `{}` does not share the candidates of group {gid}",
                        mutable.name()
                    )));
                }
                Some(_) => {}
                None => {
                    self.group_choices.insert(gid, choices);
                }
            }
            self.search_group
                .entry(gid)
                .or_default()
                .push(mutable.name().to_string());
            mutable2group.insert(mutable.name().to_string(), gid);
        }

        if self.search_group.is_empty() {
            return Err(NasError::ConfigError(
                "supernet has no mutable to search".to_string(),
            ));
        }

        if self.config.differentiable {
            let mut groups = BTreeMap::new();
            for (gid, choices) in &self.group_choices {
                let init_std = self.config.init_std;
                let rng = &mut self.rng;
                let value = Array2::from_shape_fn((1, choices.len()), |_| {
                    rng.sample::<f64, _>(StandardNormal) * init_std
                });
                groups.insert(*gid, Param::new(value));
            }
            self.arch_params = Some(ArchParams {
                groups,
                mutable2group,
            });
        }

        self.prepared = true;
        info!(
            groups = self.search_group.len(),
            mutables = self.search_group.values().map(Vec::len).sum::<usize>(),
            differentiable = self.config.differentiable,
            "mutator prepared"
        );
        Ok(())
    }

    /// Group id -> names of the mutables in that group
    pub fn search_group(&self) -> &BTreeMap<usize, Vec<String>> {
        &self.search_group
    }

    pub fn alias2group_id(&self) -> &BTreeMap<String, usize> {
        &self.alias2group_id
    }

    pub fn group_of(&self, mutable: &str) -> Option<usize> {
        self.search_group
            .iter()
            .find(|(_, names)| names.iter().any(|n| n == mutable))
            .map(|(gid, _)| *gid)
    }

    /// Candidate names shared by every mutable of a group
    pub fn group_choices(&self, group_id: usize) -> Result<&[String]> {
        self.group_choices
            .get(&group_id)
            .map(Vec::as_slice)
            .ok_or_else(|| NasError::MutatorError(format!("unknown search group {group_id}")))
    }

    /// Mark a choice as structurally absent in a group.
    ///
    /// `random_subnet` keeps drawing it, but with [`PLACEHOLDER_SUFFIX`]
    /// appended.
    pub fn mark_absent(&mut self, group_id: usize, choice: &str) -> Result<()> {
        let choices = self.group_choices(group_id)?;
        if !choices.iter().any(|c| c == choice) {
            return Err(NasError::UnknownChoice {
                mutable: format!("group {group_id}"),
                choice: choice.to_string(),
            });
        }
        self.absent
            .entry(group_id)
            .or_default()
            .insert(choice.to_string());
        Ok(())
    }

    /// Sampling pool of a group, absent choices carrying the placeholder marker
    pub fn choice_pool(&self, group_id: usize) -> Result<Vec<String>> {
        let absent = self.absent.get(&group_id);
        Ok(self
            .group_choices(group_id)?
            .iter()
            .map(|c| match absent {
                Some(set) if set.contains(c) => format!("{c}{PLACEHOLDER_SUFFIX}"),
                _ => c.clone(),
            })
            .collect())
    }

    /// One uniformly drawn choice per search group
    pub fn random_subnet(&mut self) -> Result<Subnet> {
        self.ensure_prepared()?;
        let mut subnet = Subnet::new();
        for gid in self.search_group.keys().copied().collect::<Vec<_>>() {
            let pool = self.choice_pool(gid)?;
            let choice = pool.choose(&mut self.rng).cloned().ok_or_else(|| {
                NasError::MutatorError(format!("search group {gid} has no candidate"))
            })?;
            subnet.insert(gid, choice);
        }
        Ok(subnet)
    }

    fn check_subnet(&self, subnet: &Subnet) -> Result<()> {
        self.ensure_prepared()?;
        for gid in subnet.keys() {
            if !self.search_group.contains_key(gid) {
                return Err(NasError::MutatorError(format!(
                    "subnet refers to unknown search group {gid}"
                )));
            }
        }
        Ok(())
    }

    /// Route every mutable of the listed groups through the subnet's choice.
    ///
    /// The selection is transient: it holds until [`Mutator::clear_subnet`]
    /// or the next `set_subnet`, and nothing is pruned.
    pub fn set_subnet(&self, model: &mut dyn Supernet, subnet: &Subnet) -> Result<()> {
        self.check_subnet(subnet)?;
        model.visit_mutables(&mut |m: &mut dyn Mutable| {
            match self.group_of(m.name()).and_then(|gid| subnet.get(&gid)) {
                Some(choice) => m.select(choice),
                None => Ok(()),
            }
        })
    }

    pub fn clear_subnet(&self, model: &mut dyn Supernet) -> Result<()> {
        model.visit_mutables(&mut |m: &mut dyn Mutable| {
            m.clear_selection();
            Ok(())
        })
    }

    /// Permanently prune every mutable of the listed groups to the subnet's choice.
    ///
    /// Mutables already fixed on that choice are left alone; a mutable fixed
    /// on another choice is an error.
    pub fn fix_subnet(&self, model: &mut dyn Supernet, subnet: &Subnet) -> Result<()> {
        self.check_subnet(subnet)?;
        model.visit_mutables(&mut |m: &mut dyn Mutable| {
            let choice = match self.group_of(m.name()).and_then(|gid| subnet.get(&gid)) {
                Some(choice) => choice,
                None => return Ok(()),
            };
            if matches!(m.chosen(), Some([only]) if only == choice) {
                return Ok(());
            }
            m.fix_chosen(&[choice.clone()])
        })?;
        info!(groups = subnet.len(), "subnet fixed");
        Ok(())
    }

    /// FLOPs and parameter count of one subnet.
    ///
    /// Mutables outside the subnet contribute all their remaining candidates.
    pub fn subnet_cost(
        &self,
        model: &dyn Supernet,
        subnet: &Subnet,
        batch: usize,
    ) -> Result<(usize, usize)> {
        self.check_subnet(subnet)?;
        let subnet = strip_placeholders(subnet);
        let mut flops = model.static_flops(batch);
        let mut params = model.static_params();
        for m in model.mutables() {
            let picked: Vec<String> = match self.group_of(m.name()).and_then(|g| subnet.get(&g)) {
                Some(choice) if !m.is_fixed() => vec![choice.clone()],
                _ => m.choices(),
            };
            for choice in &picked {
                flops += m.choice_flops(choice, batch)?;
                params += m.choice_params(choice)?;
            }
        }
        Ok((flops, params))
    }

    pub fn arch_params(&self) -> Result<&ArchParams> {
        self.arch_params.as_ref().ok_or_else(|| {
            NasError::MutatorError("mutator holds no architecture parameters".to_string())
        })
    }

    pub fn arch_params_mut(&mut self) -> Result<&mut ArchParams> {
        self.arch_params.as_mut().ok_or_else(|| {
            NasError::MutatorError("mutator holds no architecture parameters".to_string())
        })
    }

    /// Softmax probabilities of a group's architecture parameter
    pub fn arch_probs(&self, group_id: usize) -> Result<Array1<f64>> {
        let param = self
            .arch_params()?
            .group(group_id)
            .ok_or_else(|| NasError::MutatorError(format!("unknown search group {group_id}")))?;
        Ok(softmax(param.value.row(0)))
    }

    /// Choices of the groups whose mutables are all fixed on one candidate
    pub fn frozen_choices(&self, model: &dyn Supernet) -> Result<Subnet> {
        self.ensure_prepared()?;
        let mut groups: BTreeMap<usize, Option<String>> = BTreeMap::new();
        for m in model.mutables() {
            let gid = match self.group_of(m.name()) {
                Some(gid) => gid,
                None => continue,
            };
            let choice = match m.chosen() {
                Some([only]) => Some(only.clone()),
                _ => None,
            };
            let merged = match (groups.get(&gid), choice) {
                (None, choice) => choice,
                (Some(Some(prev)), Some(choice)) if *prev != choice => {
                    return Err(NasError::MutatorError(format!(
                        "group {gid} is fixed on both `{prev}` and `{choice}`"
                    )));
                }
                (Some(Some(_)), Some(choice)) => Some(choice),
                _ => None,
            };
            groups.insert(gid, merged);
        }
        Ok(groups
            .into_iter()
            .filter_map(|(gid, choice)| choice.map(|c| (gid, c)))
            .collect())
    }

    /// Architecture found so far: frozen groups keep their fixed choice,
    /// the others take the arg-max of their architecture parameter
    pub fn decode_subnet(&self, model: &dyn Supernet) -> Result<Subnet> {
        let mut subnet = self.sample_subnet()?;
        subnet.extend(self.frozen_choices(model)?);
        Ok(subnet)
    }

    /// Arg-max decode of every group's architecture parameter
    pub fn sample_subnet(&self) -> Result<Subnet> {
        self.ensure_prepared()?;
        let mut subnet = Subnet::new();
        for (gid, choices) in &self.group_choices {
            let probs = self.arch_probs(*gid)?;
            subnet.insert(*gid, choices[argmax(probs.view())].clone());
        }
        Ok(subnet)
    }

    pub fn zero_arch_grad(&mut self) {
        if let Some(arch) = self.arch_params.as_mut() {
            arch.zero_grad();
        }
    }

    /// Propagate a Gumbel temperature to every mutable
    pub fn set_temperature(&self, model: &mut dyn Supernet, tau: f64) -> Result<()> {
        debug!(tau, "setting temperature");
        model.visit_mutables(&mut |m: &mut dyn Mutable| {
            m.set_temperature(tau);
            Ok(())
        })
    }

    /// FairNAS rounds: every choice of every group appears exactly once.
    ///
    /// Requires all groups to have the same number of choices.
    pub fn fair_lists(&mut self) -> Result<Vec<Subnet>> {
        self.ensure_prepared()?;
        let mut shuffled = BTreeMap::new();
        let mut num_choices = None;
        for gid in self.search_group.keys().copied().collect::<Vec<_>>() {
            let mut pool = self.choice_pool(gid)?;
            match num_choices {
                None => num_choices = Some(pool.len()),
                Some(n) if n != pool.len() => {
                    return Err(NasError::ConfigError(
                        "fair sampling needs the same number of choices in every group"
                            .to_string(),
                    ))
                }
                Some(_) => {}
            }
            pool.shuffle(&mut self.rng);
            shuffled.insert(gid, pool);
        }

        let rounds = num_choices.unwrap_or(0);
        Ok((0..rounds)
            .map(|i| {
                shuffled
                    .iter()
                    .map(|(gid, pool)| (*gid, pool[i].clone()))
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Nb201Config, Nb201Supernet, EdgeKind};

    fn supernet(kind: EdgeKind) -> Nb201Supernet {
        Nb201Supernet::new(Nb201Config {
            input_dim: 4,
            hidden_dim: 4,
            num_classes: 3,
            num_cells: 2,
            edge_kind: kind,
            seed: 1,
            ..Default::default()
        })
        .unwrap()
    }

    fn prepared(config: MutatorConfig, model: &Nb201Supernet) -> Mutator {
        let mut mutator = Mutator::new(config.with_seed(5));
        mutator.prepare_from_supernet(model).unwrap();
        mutator
    }

    #[test]
    fn test_alias_groups_edges_across_cells() {
        let model = supernet(EdgeKind::OneShot);
        let mutator = prepared(MutatorConfig::one_shot(), &model);
        assert_eq!(mutator.search_group().len(), 6);
        assert_eq!(mutator.alias2group_id().len(), 6);
        for names in mutator.search_group().values() {
            assert_eq!(names.len(), 2);
        }
    }

    #[test]
    fn test_without_alias_every_mutable_is_a_group() {
        let model = supernet(EdgeKind::OneShot);
        let mutator = prepared(MutatorConfig::one_shot().with_alias(false), &model);
        assert_eq!(mutator.search_group().len(), 12);
        assert!(mutator.alias2group_id().is_empty());
    }

    #[test]
    fn test_prepare_twice_fails() {
        let model = supernet(EdgeKind::OneShot);
        let mut mutator = prepared(MutatorConfig::one_shot(), &model);
        assert!(mutator.prepare_from_supernet(&model).is_err());
    }

    #[test]
    fn test_sampling_before_prepare_fails() {
        let mut mutator = Mutator::new(MutatorConfig::one_shot());
        assert!(matches!(
            mutator.random_subnet(),
            Err(NasError::MutatorError(_))
        ));
    }

    #[test]
    fn test_random_subnet_covers_every_group() {
        let model = supernet(EdgeKind::OneShot);
        let mut mutator = prepared(MutatorConfig::one_shot(), &model);
        for _ in 0..20 {
            let subnet = mutator.random_subnet().unwrap();
            assert_eq!(subnet.len(), mutator.search_group().len());
            for (gid, choice) in &subnet {
                assert!(mutator.group_choices(*gid).unwrap().contains(choice));
            }
        }
    }

    #[test]
    fn test_placeholders_are_marked_and_stripped() {
        let model = supernet(EdgeKind::OneShot);
        let mut mutator = prepared(MutatorConfig::one_shot(), &model);
        for choice in ["none", "skip_connect", "conv_1x1", "conv_3x3", "avg_pool_3x3"] {
            mutator.mark_absent(0, choice).unwrap();
        }
        let subnet = mutator.random_subnet().unwrap();
        assert!(subnet[&0].ends_with(PLACEHOLDER_SUFFIX));
        let stripped = strip_placeholders(&subnet);
        assert!(mutator.group_choices(0).unwrap().contains(&stripped[&0]));
        assert!(mutator.mark_absent(0, "conv_5x5").is_err());
    }

    #[test]
    fn test_set_subnet_is_transient() {
        let mut model = supernet(EdgeKind::OneShot);
        let mutator = prepared(MutatorConfig::one_shot(), &model);
        let subnet: Subnet = (0..6).map(|g| (g, "skip_connect".to_string())).collect();
        mutator.set_subnet(&mut model, &subnet).unwrap();
        assert!(model
            .mutables()
            .iter()
            .all(|m| m.selected() == Some("skip_connect") && !m.is_fixed()));

        mutator.clear_subnet(&mut model).unwrap();
        assert!(model.mutables().iter().all(|m| m.selected().is_none()));
    }

    #[test]
    fn test_fix_subnet_prunes() {
        let mut model = supernet(EdgeKind::OneShot);
        let mutator = prepared(MutatorConfig::one_shot(), &model);
        let subnet: Subnet = (0..6).map(|g| (g, "conv_1x1".to_string())).collect();
        mutator.fix_subnet(&mut model, &subnet).unwrap();
        for m in model.mutables() {
            assert_eq!(m.choices(), vec!["conv_1x1".to_string()]);
        }
        // fixing again on the same choices is a no-op, a different choice is not
        mutator.fix_subnet(&mut model, &subnet).unwrap();
        let other: Subnet = (0..6).map(|g| (g, "conv_3x3".to_string())).collect();
        assert!(matches!(
            mutator.fix_subnet(&mut model, &other),
            Err(NasError::MutableFixed(_))
        ));
    }

    #[test]
    fn test_frozen_choices_override_arg_max() {
        let mut model = supernet(EdgeKind::Diff);
        let mut mutator = prepared(MutatorConfig::differentiable(), &model);
        mutator.arch_params_mut().unwrap().params_mut()[0].value[[0, 3]] = 5.0;
        assert!(mutator.frozen_choices(&model).unwrap().is_empty());

        let partial: Subnet = [(0, "skip_connect".to_string())].into_iter().collect();
        mutator.fix_subnet(&mut model, &partial).unwrap();
        assert_eq!(mutator.frozen_choices(&model).unwrap(), partial);

        let decoded = mutator.decode_subnet(&model).unwrap();
        assert_eq!(decoded.len(), 6);
        assert_eq!(decoded[&0], "skip_connect");
        assert_eq!(mutator.sample_subnet().unwrap()[&0], "conv_3x3");
    }

    #[test]
    fn test_unknown_group_rejected() {
        let mut model = supernet(EdgeKind::OneShot);
        let mutator = prepared(MutatorConfig::one_shot(), &model);
        let subnet: Subnet = [(42, "conv_1x1".to_string())].into_iter().collect();
        assert!(mutator.set_subnet(&mut model, &subnet).is_err());
    }

    #[test]
    fn test_subnet_cost_orders_by_size() {
        let model = supernet(EdgeKind::OneShot);
        let mutator = prepared(MutatorConfig::one_shot(), &model);
        let small: Subnet = (0..6).map(|g| (g, "skip_connect".to_string())).collect();
        let large: Subnet = (0..6).map(|g| (g, "conv_3x3".to_string())).collect();
        let (f_small, p_small) = mutator.subnet_cost(&model, &small, 8).unwrap();
        let (f_large, p_large) = mutator.subnet_cost(&model, &large, 8).unwrap();
        assert!(f_large > f_small);
        assert!(p_large > p_small);
    }

    #[test]
    fn test_arch_params_per_group() {
        let model = supernet(EdgeKind::Diff);
        let mut mutator = prepared(MutatorConfig::differentiable(), &model);
        let arch = mutator.arch_params().unwrap();
        assert_eq!(arch.len(), 6);
        for p in arch.params() {
            assert_eq!(p.value.dim(), (1, 5));
            assert!(p.value.iter().all(|v| v.abs() < 0.1));
        }

        let probs = mutator.arch_probs(0).unwrap();
        assert!((probs.sum() - 1.0).abs() < 1e-12);

        let first = mutator.sample_subnet().unwrap();
        assert_eq!(first, mutator.sample_subnet().unwrap());
        assert_eq!(first.len(), 6);

        mutator.arch_params_mut().unwrap().params_mut()[0].value[[0, 3]] = 5.0;
        assert_eq!(mutator.sample_subnet().unwrap()[&0], "conv_3x3");
    }

    #[test]
    fn test_one_shot_mutator_has_no_arch_params() {
        let model = supernet(EdgeKind::OneShot);
        let mutator = prepared(MutatorConfig::one_shot(), &model);
        assert!(mutator.arch_params().is_err());
    }

    #[test]
    fn test_fair_lists_use_every_choice_once() {
        let model = supernet(EdgeKind::OneShot);
        let mut mutator = prepared(MutatorConfig::one_shot(), &model);
        let lists = mutator.fair_lists().unwrap();
        assert_eq!(lists.len(), 5);
        for gid in 0..6 {
            let mut seen: Vec<&String> = lists.iter().map(|s| &s[&gid]).collect();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), 5);
        }
    }
}
