mod utils;

use std::collections::HashSet;
use utils::*;
use vmattack::{
    error::EngineError,
    formula::Formula,
    ir::{BlockKey, Location},
    path_exploration::{enumerate_paths, ExplorationOptions, LoopPolicy, PathEnumerator},
    state::SymbolicState,
};

#[test]
fn diamond_has_two_paths_through_both_arms() {
    init();

    let cfg = diamond();
    let paths: Vec<_> = enumerate_paths(&cfg, BlockKey(0), &Vec::new())
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(paths.len(), 2);
    assert_eq!(keys(&paths[0].path), vec![0x0, 0x10, 0x30]);
    assert_eq!(keys(&paths[1].path), vec![0x0, 0x20, 0x30]);

    let outputs: Vec<Formula> = paths
        .iter()
        .map(|p| p.state.read(&Location::register("out", 64)))
        .collect();
    assert_eq!(outputs[0], Formula::add(reg("x"), reg("y")));
    assert_eq!(outputs[1], Formula::sub(reg("x"), reg("y")));
}

#[test]
fn sibling_paths_do_not_share_writes() {
    init();

    // both arms write the same memory cell; each path must only see its own
    let cfg = graph(
        vec![
            (0x0, vec![set("p", reg("base"), 0x0)]),
            (
                0x10,
                vec![store(reg("p"), constant(1), 0x10), jump(0x30, 0x14)],
            ),
            (
                0x20,
                vec![store(reg("p"), constant(2), 0x20), jump(0x30, 0x24)],
            ),
            (0x30, vec![set("v", Formula::mem(reg("base"), 64), 0x30)]),
        ],
        &[(0x0, 0x10), (0x0, 0x20), (0x10, 0x30), (0x20, 0x30)],
    );

    let values: Vec<Option<u64>> = enumerate_paths(&cfg, BlockKey(0), &Vec::new())
        .map(|p| p.unwrap().state.read(&Location::register("v", 64)).as_const())
        .collect();

    assert_eq!(values, vec![Some(1), Some(2)]);
}

#[test]
fn no_path_is_enumerated_twice() {
    init();

    // two diamonds in a row give four distinct paths
    let cfg = graph(
        vec![
            (0x0, vec![]),
            (0x10, vec![set("a", constant(1), 0x10)]),
            (0x20, vec![set("a", constant(2), 0x20)]),
            (0x30, vec![]),
            (0x40, vec![set("b", constant(1), 0x40)]),
            (0x50, vec![set("b", constant(2), 0x50)]),
            (0x60, vec![]),
        ],
        &[
            (0x0, 0x10),
            (0x0, 0x20),
            (0x10, 0x30),
            (0x20, 0x30),
            (0x30, 0x40),
            (0x30, 0x50),
            (0x40, 0x60),
            (0x50, 0x60),
        ],
    );

    let paths: Vec<Vec<u64>> = enumerate_paths(&cfg, BlockKey(0), &Vec::new())
        .map(|p| keys(&p.unwrap().path))
        .collect();
    let distinct: HashSet<&Vec<u64>> = paths.iter().collect();

    assert_eq!(paths.len(), 4);
    assert_eq!(distinct.len(), 4);
    assert!(paths.iter().all(|p| p.first() == Some(&0x0) && p.last() == Some(&0x60)));
}

#[test]
fn concrete_branch_condition_narrows_to_one_successor() {
    init();

    let cfg = diamond();
    let bindings = vec![(Location::register("c", 64), constant(0))];

    let paths: Vec<Vec<u64>> = enumerate_paths(&cfg, BlockKey(0), &bindings)
        .map(|p| keys(&p.unwrap().path))
        .collect();

    assert_eq!(paths, vec![vec![0x0, 0x10, 0x30]]);
}

#[test]
fn back_edges_follow_the_loop_policy() {
    init();

    let looping = || {
        graph(
            vec![
                (0x0, vec![set("i", constant(0), 0x0)]),
                (
                    0x10,
                    vec![set("i", Formula::add(reg("i"), constant(1)), 0x10)],
                ),
                (0x20, vec![]),
            ],
            &[(0x0, 0x10), (0x10, 0x10), (0x10, 0x20)],
        )
    };

    let cfg = looping();
    let mut pruning = PathEnumerator::new(
        &cfg,
        BlockKey(0),
        SymbolicState::new(),
        vmattack::executor::Unobserved,
        ExplorationOptions {
            timeout: None,
            loop_policy: LoopPolicy::Prune,
        },
    );
    let paths: Vec<Vec<u64>> = pruning.by_ref().map(|p| keys(&p.unwrap().path)).collect();
    assert_eq!(paths, vec![vec![0x0, 0x10, 0x20]]);
    assert_eq!(pruning.pruned_edges(), 1);
    assert!(!pruning.timed_out());

    let cfg = looping();
    let rejecting = PathEnumerator::new(
        &cfg,
        BlockKey(0),
        SymbolicState::new(),
        vmattack::executor::Unobserved,
        ExplorationOptions {
            timeout: None,
            loop_policy: LoopPolicy::Reject,
        },
    );
    let results: Vec<_> = rejecting.collect();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(EngineError::AssertionViolation(_))));
}

#[test]
fn missing_blocks_fail_enumeration() {
    init();

    let mut cfg = diamond();
    cfg.add_edge(BlockKey(0x30), BlockKey(0x40));

    let results: Vec<_> = enumerate_paths(&cfg, BlockKey(0), &Vec::new()).collect();
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(EngineError::LiftingFailure { .. }))));
}
