mod utils;

use std::collections::{BTreeSet, HashMap};
use utils::{encode::*, *};
use vmattack::{
    emulate::{EmulatorOptions, TaintEmulator},
    executor::OutputTracker,
    formula::Formula,
    handler::{Attacker, HandlerContext, Operand, ReferenceOp},
    ir::{ControlFlowGraph, IrProvider},
    lift::RiscuProvider,
    path_exploration::{ExplorationOptions, ExploredPath, PathEnumerator},
    slicing::{BackwardSlicer, SliceTarget},
    state::SymbolicState,
    taint::{taint_bits, InstructionTaint, RegisterMap, TaintSource},
};

const ENTRY: u64 = 0x1000;
const CONTEXT: u64 = 0x2000;
const BYTECODE: u64 = 0x3000;

const PROLOGUE_END: u64 = ENTRY + 4 * handlers::PROLOGUE_LENGTH;

fn adding_handler() -> RiscuProvider {
    RiscuProvider::new(ENTRY, code(&handlers::adding(CONTEXT, BYTECODE)))
}

fn keyed_handler() -> RiscuProvider {
    RiscuProvider::new(ENTRY, code(&handlers::keyed(CONTEXT, BYTECODE)))
}

fn explore(
    cfg: &ControlFlowGraph,
    context: &HandlerContext,
    attacker: Attacker,
    key: Option<u64>,
) -> Vec<ExploredPath<OutputTracker>> {
    let state = SymbolicState::with_bindings(&context.attacker_bindings(attacker, key));
    PathEnumerator::new(
        cfg,
        cfg.entry().unwrap(),
        state,
        context.output_tracker(),
        ExplorationOptions::default(),
    )
    .collect::<Result<_, _>>()
    .unwrap()
}

#[test]
fn straight_handler_reveals_its_semantics() {
    init();

    let context = HandlerContext::new(CONTEXT, BYTECODE);
    let cfg = adding_handler().lift(ENTRY).unwrap();
    let paths = explore(&cfg, &context, Attacker::Static, None);

    assert_eq!(paths.len(), 1);
    assert_eq!(context.output(&paths[0].state), ReferenceOp::Add.formula());
    assert_eq!(paths[0].observer.output_offset(), Some(PROLOGUE_END + 4));
    assert_eq!(paths[0].observer.input_offset("x"), Some(ENTRY + 0x1c));
    assert_eq!(paths[0].observer.input_offset("y"), Some(ENTRY + 0x2c));
}

#[test]
fn static_attacker_sees_both_arms_of_a_key_branch() {
    init();

    let context = HandlerContext::new(CONTEXT, BYTECODE);
    let cfg = keyed_handler().lift(ENTRY).unwrap();
    assert_eq!(cfg.len(), 4);
    assert_eq!(cfg.native_offsets().len(), 22);

    let outputs: Vec<Formula> = explore(&cfg, &context, Attacker::Static, None)
        .iter()
        .map(|p| context.output(&p.state))
        .collect();

    assert_eq!(
        outputs,
        vec![ReferenceOp::Add.formula(), ReferenceOp::Sub.formula()]
    );
}

#[test]
fn dynamic_attacker_follows_the_key() {
    init();

    let context = HandlerContext::new(CONTEXT, BYTECODE);
    let cfg = keyed_handler().lift(ENTRY).unwrap();

    for (key, expected) in [(0, ReferenceOp::Add), (5, ReferenceOp::Sub)] {
        let paths = explore(&cfg, &context, Attacker::Dynamic, Some(key));

        assert_eq!(paths.len(), 1);
        assert_eq!(context.output(&paths[0].state), expected.formula());
    }

    // without a known key the dynamic attacker is a static one
    assert_eq!(explore(&cfg, &context, Attacker::Dynamic, None).len(), 2);
}

#[test]
fn output_slice_covers_the_operand_loads() {
    init();

    let context = HandlerContext::new(CONTEXT, BYTECODE);
    let cfg = adding_handler().lift(ENTRY).unwrap();
    let initial = SymbolicState::with_bindings(&context.bindings(&HashMap::new()));
    let explored = explore(&cfg, &context, Attacker::Static, None).remove(0);

    let offset = explored.observer.output_offset().unwrap();
    let result = BackwardSlicer::new(&cfg, &explored.path, initial)
        .unwrap()
        .slice(&SliceTarget::Instruction(offset))
        .unwrap();

    let expected: BTreeSet<u64> = (0..17).map(|i| ENTRY + 4 * i).collect();
    assert_eq!(result.offsets, expected);
    // operands and the virtual instruction pointer are never written on the path
    assert!(!result.is_complete());
}

#[test]
fn both_taint_granularities_agree_on_a_handler() {
    init();

    let context = HandlerContext::new(CONTEXT, BYTECODE);
    let provider = adding_handler();
    let cfg = provider.lift(ENTRY).unwrap();
    let initial = SymbolicState::with_bindings(&context.bindings(&HashMap::new()));
    let sources: Vec<TaintSource> = [Operand::X, Operand::Y, Operand::C, Operand::Key]
        .iter()
        .map(|&o| TaintSource::Immediate(initial.resolve(&context.location(o))))
        .collect();
    let path = explore(&cfg, &context, Attacker::Static, None).remove(0).path;

    let bits = taint_bits(&cfg, &path, initial, &sources).unwrap();

    let mut emulator = TaintEmulator::new(provider, &EmulatorOptions::default());
    let registers = RegisterMap::new(&emulator);
    let instructions = InstructionTaint::new(&mut emulator, &registers)
        .taint_path(&cfg, &path, &sources)
        .unwrap();

    let expected = BTreeSet::from([ENTRY + 0x1c, ENTRY + 0x2c, PROLOGUE_END, PROLOGUE_END + 4]);
    assert_eq!(bits.tainted, expected);
    assert_eq!(instructions.tainted, expected);
    assert_eq!(bits.visited, instructions.visited);
}
