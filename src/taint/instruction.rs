use super::{TaintReport, TaintSource};
use crate::{
    error::{EngineError, Result},
    executor::Observer,
    formula::{Formula, Node},
    ir::{Assignment, BlockKey, ControlFlowGraph, Location},
    path_exploration::execute_path,
    state::SymbolicState,
};
use log::{debug, trace};
use std::collections::HashMap;

/// Concrete emulator replaying native instructions with register taint.
pub trait NativeEmulator {
    /// Register names, indexed by register id.
    fn register_names(&self) -> Vec<String>;

    fn taint_register(&mut self, register: usize) -> Result<()>;

    /// Executes the instruction at `address`. Returns whether the
    /// instruction read or wrote tainted data.
    fn step(&mut self, address: u64) -> Result<bool>;
}

/// Lookup from IR register names to emulator register ids, built once per
/// emulator.
#[derive(Clone, Debug, Default)]
pub struct RegisterMap {
    ids: HashMap<String, usize>,
}

impl RegisterMap {
    pub fn new<E: NativeEmulator + ?Sized>(emulator: &E) -> Self {
        let ids = emulator
            .register_names()
            .into_iter()
            .enumerate()
            .map(|(id, name)| (name.to_lowercase(), id))
            .collect();

        Self { ids }
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.ids.get(&name.to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Register that receives a taint source at a native instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Injection {
    pub register: String,
    pub offset: u64,
}

/// Observer finding the registers taint sources are loaded into.
#[derive(Clone, Debug, Default)]
struct Localizer {
    sources: Vec<TaintSource>,
    active: Vec<Location>,
    offset: u64,
    injections: Vec<Injection>,
}

impl Localizer {
    fn matches(&self, value: &Formula) -> bool {
        self.active.iter().any(|source| match source {
            Location::Register { name, .. } => value.any(|f| f.as_id() == Some(name.as_str())),
            Location::Memory { address, width } => value.any(|f| match f.node() {
                Node::Mem {
                    address: read,
                    width: read_width,
                } => read == address && read_width.is_power_of_two() && (8..=*width).contains(read_width),
                _ => false,
            }),
        })
    }
}

impl Observer for Localizer {
    fn enter_instruction(&mut self, offset: u64, state: &mut SymbolicState) -> Result<()> {
        self.offset = offset;
        self.active = self
            .sources
            .iter()
            .filter(|s| s.applies_at(offset))
            .map(|s| match s {
                TaintSource::Immediate(location) => location.clone(),
                TaintSource::Deferred { location, .. } => state.resolve(location),
            })
            .collect();
        Ok(())
    }

    fn on_assignment(
        &mut self,
        _assignment: &Assignment,
        destination: &Location,
        value: &Formula,
    ) -> Result<()> {
        if let Location::Register { name, width } = destination {
            if *width >= 8 && !destination.is_flow() && self.matches(value) {
                let injection = Injection {
                    register: name.clone(),
                    offset: self.offset,
                };
                if !self.injections.contains(&injection) {
                    trace!("taint source loaded into {} at {:#x}", name, self.offset);
                    self.injections.push(injection);
                }
            }
        }
        Ok(())
    }
}

/// Replays `path` symbolically from an empty state and returns where taint
/// sources land in registers.
pub fn localize(
    cfg: &ControlFlowGraph,
    path: &[BlockKey],
    sources: &[TaintSource],
) -> Result<Vec<Injection>> {
    let mut localizer = Localizer {
        sources: sources.to_vec(),
        ..Default::default()
    };
    let mut state = SymbolicState::new();

    execute_path(cfg, path, &mut state, &mut localizer)?;

    debug!("localized {} taint injections", localizer.injections.len());

    Ok(localizer.injections)
}

/// Instruction-level taint engine driving a native emulator.
pub struct InstructionTaint<'a, E: NativeEmulator> {
    emulator: &'a mut E,
    registers: &'a RegisterMap,
}

impl<'a, E: NativeEmulator> InstructionTaint<'a, E> {
    pub fn new(emulator: &'a mut E, registers: &'a RegisterMap) -> Self {
        Self {
            emulator,
            registers,
        }
    }

    /// Localizes the sources on `path`, then replays its native
    /// instructions in the emulator, injecting taint right after each
    /// localized instruction.
    pub fn taint_path(
        &mut self,
        cfg: &ControlFlowGraph,
        path: &[BlockKey],
        sources: &[TaintSource],
    ) -> Result<TaintReport> {
        let injections = localize(cfg, path, sources)?;

        let mut pending: HashMap<u64, Vec<usize>> = HashMap::new();
        for injection in &injections {
            let id = self.registers.get(&injection.register).ok_or_else(|| {
                EngineError::UnsupportedExpression(format!(
                    "register {} has no native counterpart",
                    injection.register
                ))
            })?;
            pending.entry(injection.offset).or_default().push(id);
        }

        let trace = cfg.address_path(path)?;
        let mut report = TaintReport {
            visited: trace.iter().copied().collect(),
            ..Default::default()
        };

        for &address in &trace {
            let tainted = self.emulator.step(address)?;

            if let Some(ids) = pending.get(&address) {
                for id in ids {
                    self.emulator.taint_register(*id)?;
                }
                report.tainted.insert(address);
            }
            if tainted {
                report.tainted.insert(address);
            }
        }

        debug!(
            "{} of {} native instructions tainted",
            report.tainted.len(),
            trace.len()
        );
        report.trace = trace;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BasicBlock;
    use std::collections::BTreeSet;

    /// Emulator over `dst = f(srcs)` instructions, indexed by address.
    struct TableEmulator {
        names: Vec<String>,
        program: HashMap<u64, (usize, Vec<usize>)>,
        tainted: Vec<bool>,
    }

    impl TableEmulator {
        fn new(names: &[&str], program: Vec<(u64, usize, Vec<usize>)>) -> Self {
            Self {
                names: names.iter().map(|n| n.to_uppercase()).collect(),
                program: program.into_iter().map(|(a, d, s)| (a, (d, s))).collect(),
                tainted: vec![false; names.len()],
            }
        }
    }

    impl NativeEmulator for TableEmulator {
        fn register_names(&self) -> Vec<String> {
            self.names.clone()
        }

        fn taint_register(&mut self, register: usize) -> Result<()> {
            self.tainted[register] = true;
            Ok(())
        }

        fn step(&mut self, address: u64) -> Result<bool> {
            let (dst, srcs) = self
                .program
                .get(&address)
                .cloned()
                .ok_or_else(|| EngineError::UnsupportedExpression(format!("{:#x}", address)))?;
            let tainted = srcs.iter().any(|s| self.tainted[*s]);
            self.tainted[dst] = tainted;
            Ok(tainted)
        }
    }

    fn operand() -> Formula {
        Formula::add(
            Formula::mem(Formula::constant(0x1008, 64), 64),
            Formula::constant(0x2002, 64),
        )
    }

    fn load(register: &str, offset: u64) -> Assignment {
        Assignment::new(
            Location::register(register, 64),
            Formula::mem(operand(), 64),
            offset,
        )
    }

    fn cfg(assignments: Vec<Assignment>) -> ControlFlowGraph {
        let mut cfg = ControlFlowGraph::new(BlockKey(0x10));
        cfg.add_block(BasicBlock::new(BlockKey(0x10), 0x10, assignments));
        cfg
    }

    #[test]
    fn deferred_source_localizes_to_its_own_instruction() {
        let cfg = cfg(vec![load("t0", 0x10), load("t1", 0x14), load("t2", 0x18)]);
        let deferred = TaintSource::Deferred {
            location: Location::memory(operand(), 64),
            offset: 0x14,
        };

        let injections = localize(&cfg, &[BlockKey(0x10)], &[deferred]).unwrap();
        assert_eq!(
            injections,
            vec![Injection {
                register: "t1".to_string(),
                offset: 0x14
            }]
        );

        let immediate = TaintSource::Immediate(Location::memory(operand(), 64));
        let injections = localize(&cfg, &[BlockKey(0x10)], &[immediate]).unwrap();
        assert_eq!(injections.len(), 3);
    }

    #[test]
    fn narrower_loads_of_a_source_are_localized() {
        let cfg = cfg(vec![
            Assignment::new(
                Location::register("t0", 64),
                Formula::zero_extend(Formula::mem(operand(), 16), 64),
                0x10,
            ),
            Assignment::new(
                Location::register("t1", 64),
                Formula::mem(Formula::add(operand(), Formula::constant(8, 64)), 64),
                0x14,
            ),
        ]);
        let source = TaintSource::Immediate(Location::memory(operand(), 64));

        let injections = localize(&cfg, &[BlockKey(0x10)], &[source]).unwrap();
        assert_eq!(injections.len(), 1);
        assert_eq!(injections[0].register, "t0");
    }

    #[test]
    fn native_replay_propagates_from_injection_points() {
        // 0x10: t0 = source; 0x14: t1 = t2; 0x18: t2 = t0
        let cfg = cfg(vec![
            load("t0", 0x10),
            Assignment::new(Location::register("t1", 64), Formula::id("t2", 64), 0x14),
            Assignment::new(Location::register("t2", 64), Formula::id("t0", 64), 0x18),
        ]);
        let mut emulator = TableEmulator::new(
            &["t0", "t1", "t2"],
            vec![(0x10, 0, vec![]), (0x14, 1, vec![2]), (0x18, 2, vec![0])],
        );
        let registers = RegisterMap::new(&emulator);
        assert_eq!(registers.get("T2"), Some(2));

        let source = TaintSource::Immediate(Location::memory(operand(), 64));
        let report = InstructionTaint::new(&mut emulator, &registers)
            .taint_path(&cfg, &[BlockKey(0x10)], &[source])
            .unwrap();

        assert_eq!(report.tainted, BTreeSet::from([0x10, 0x18]));
        assert_eq!(report.trace, vec![0x10, 0x14, 0x18]);
    }

    #[test]
    fn injection_into_unknown_register_is_unsupported() {
        let cfg = cfg(vec![load("flags", 0x10)]);
        let mut emulator = TableEmulator::new(&["t0"], vec![(0x10, 0, vec![])]);
        let registers = RegisterMap::new(&emulator);

        let source = TaintSource::Immediate(Location::memory(operand(), 64));
        let result = InstructionTaint::new(&mut emulator, &registers)
            .taint_path(&cfg, &[BlockKey(0x10)], &[source]);
        assert!(matches!(result, Err(EngineError::UnsupportedExpression(_))));
    }
}
