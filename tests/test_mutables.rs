//! Integration tests for mutables and the mutator: mixture semantics,
//! fixing, transient selection and alias grouping

use kolosal_nas::models::{EdgeKind, Nb201Config, Nb201Preset, Nb201Supernet, Supernet};
use kolosal_nas::nas::{
    candidate, ChoiceOp, ChoiceRoute, Mutable, Mutator, MutatorConfig, Subnet,
};
use kolosal_nas::nn::{AvgPool1d, Identity, Linear, Operation, Zero};
use kolosal_nas::NasError;
use ndarray::{array, Array2};

fn scaled(factor: f64) -> Linear {
    Linear::from_weights(Array2::eye(3) * factor, Array2::zeros((1, 3)))
}

fn three_way() -> Vec<(String, Box<dyn Operation>)> {
    vec![
        candidate("double", scaled(2.0)),
        candidate("skip", Identity),
        candidate("pool", AvgPool1d::new(3, 3)),
    ]
}

fn input() -> Array2<f64> {
    array![[1.0, 2.0, 3.0], [-1.0, 0.5, 4.0]]
}

// ============================================================================
// Mutable semantics
// ============================================================================

#[test]
fn test_forward_all_is_sum_of_candidates_for_every_variant() {
    let x = input();
    let mut expected: Array2<f64> = Array2::zeros((2, 3));
    for (_, mut op) in three_way() {
        expected = expected + op.forward(&x).unwrap();
    }

    let mut variants: Vec<Box<dyn Mutable>> = vec![
        Box::new(ChoiceOp::one_shot("a", three_way()).unwrap()),
        Box::new(ChoiceOp::diff("b", three_way()).unwrap()),
        Box::new(ChoiceOp::dyna_diff("c", three_way(), 0.3).unwrap()),
    ];
    for m in variants.iter_mut() {
        let out = m.forward_all((&x).into()).unwrap();
        for (a, b) in out.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12, "{}", m.name());
        }
    }

    // a route sums the edges it reads
    let edges = vec![x.clone(), x.clone() * 2.0, x.clone() * -1.0];
    let mut route = ChoiceRoute::diff(
        "route",
        vec![
            candidate("e0", Identity),
            candidate("e1", Identity),
            candidate("e2", Identity),
        ],
        true,
    )
    .unwrap();
    let out = route.forward_all((&edges).into()).unwrap();
    for (a, b) in out.iter().zip((x.clone() * 2.0).iter()) {
        assert!((a - b).abs() < 1e-12);
    }
}

#[test]
fn test_fixed_forward_equals_the_single_candidate() {
    let x = input();
    let mut op = ChoiceOp::diff("op", three_way()).unwrap();
    op.fix_chosen(&["double".to_string()]).unwrap();
    assert_eq!(op.choices(), vec!["double".to_string()]);

    let arch = array![5.0, -1.0, 0.0];
    let out = op.forward((&x).into(), Some(arch.view())).unwrap();
    let direct = scaled(2.0).forward(&x).unwrap();
    assert_eq!(out, direct);
}

#[test]
fn test_fix_twice_and_unfixed_forward_fail() {
    let mut op = ChoiceOp::one_shot("op", three_way()).unwrap();
    assert!(matches!(
        op.forward_fixed((&input()).into()),
        Err(NasError::NotFixed(_))
    ));
    op.fix_chosen(&["skip".to_string()]).unwrap();
    assert!(matches!(
        op.fix_chosen(&["skip".to_string()]),
        Err(NasError::MutableFixed(_))
    ));
}

#[test]
fn test_empty_candidates_rejected() {
    assert!(matches!(
        ChoiceOp::one_shot("empty", Vec::new()),
        Err(NasError::ConfigError(_))
    ));
}

#[test]
fn test_select_is_transient() {
    let x = input();
    let mut op = ChoiceOp::one_shot("op", three_way()).unwrap();
    op.select("double").unwrap();
    let out = op.forward((&x).into(), None).unwrap();
    assert_eq!(out, &x * 2.0);

    op.clear_selection();
    assert!(!op.is_fixed());
    assert_eq!(op.num_choices(), 3);
    assert!(op.select("missing").is_err());
}

#[test]
fn test_sample_choice_decodes_argmax() {
    let op = ChoiceOp::diff("op", three_way()).unwrap();
    let arch = array![0.1, 2.0, 0.3];
    assert_eq!(op.sample_choice(arch.view()).unwrap(), "skip");
}

#[test]
fn test_zero_candidate_contributes_nothing() {
    let x = input();
    let mut op = ChoiceOp::one_shot(
        "op",
        vec![candidate("none", Zero::new()), candidate("skip", Identity)],
    )
    .unwrap();
    assert_eq!(op.forward_all((&x).into()).unwrap(), x);
}

// ============================================================================
// Mutator over a supernet
// ============================================================================

fn supernet() -> Nb201Supernet {
    Nb201Supernet::new(Nb201Config {
        input_dim: 6,
        hidden_dim: 6,
        num_classes: 4,
        num_cells: 3,
        edge_kind: EdgeKind::Diff,
        seed: 21,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn test_aliases_share_groups_and_arch_params() {
    let model = supernet();
    let mut mutator = Mutator::new(MutatorConfig::differentiable().with_seed(1));
    mutator.prepare_from_supernet(&model).unwrap();

    assert_eq!(model.mutables().len(), 18);
    assert_eq!(mutator.search_group().len(), 6);
    let arch = mutator.arch_params().unwrap();
    assert_eq!(arch.len(), 6);
    let g0 = mutator.group_of("cell0.edge_0_1").unwrap();
    assert_eq!(mutator.group_of("cell2.edge_0_1"), Some(g0));
}

#[test]
fn test_without_alias_every_mutable_is_its_own_group() {
    let model = supernet();
    let mut mutator = Mutator::new(MutatorConfig::one_shot().with_alias(false));
    mutator.prepare_from_supernet(&model).unwrap();
    assert_eq!(mutator.search_group().len(), 18);
}

#[test]
fn test_fix_subnet_prunes_every_mutable() {
    let mut model = supernet();
    let mut mutator = Mutator::new(MutatorConfig::one_shot());
    mutator.prepare_from_supernet(&model).unwrap();
    let subnet = Nb201Preset::Mid.subnet(mutator.alias2group_id()).unwrap();

    let before = model.flops(1);
    mutator.fix_subnet(&mut model, &subnet).unwrap();
    assert!(model.mutables().iter().all(|m| m.is_fixed() && m.num_choices() == 1));
    assert!(model.flops(1) < before);

    let out = model.forward(&Array2::ones((2, 6)), None).unwrap();
    assert_eq!(out.dim(), (2, 4));

    // re-fixing the same architecture is accepted, a different one is not
    mutator.fix_subnet(&mut model, &subnet).unwrap();
    let conflicting: Subnet = subnet
        .iter()
        .map(|(gid, choice)| {
            let other = if choice == "none" { "skip_connect" } else { "none" };
            (*gid, other.to_string())
        })
        .collect();
    assert!(matches!(
        mutator.fix_subnet(&mut model, &conflicting),
        Err(NasError::MutableFixed(_))
    ));
}

#[test]
fn test_random_subnets_are_valid() {
    let model = supernet();
    let mut mutator = Mutator::new(MutatorConfig::one_shot().with_seed(8));
    mutator.prepare_from_supernet(&model).unwrap();
    for _ in 0..20 {
        let subnet = mutator.random_subnet().unwrap();
        assert_eq!(subnet.len(), 6);
        for (gid, choice) in &subnet {
            let choices = mutator.group_choices(*gid).unwrap();
            assert!(choices.iter().any(|c| c == choice.trim_end_matches('_')));
        }
    }
}
