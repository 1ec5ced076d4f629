use crate::{
    error::Result,
    executor::Observer,
    formula::{Formula, Node, Width},
    ir::{Assignment, BlockKey, ControlFlowGraph, Location},
    path_exploration::execute_path,
    state::SymbolicState,
};
use log::trace;
use std::collections::HashMap;

/// Index of a native instruction along a path.
pub type Position = usize;

/// Register definition in single-assignment form.
#[derive(Clone, Debug)]
pub struct Definition {
    pub source: Formula,
    pub offset: u64,
    pub position: Position,
}

#[derive(Clone, Debug)]
pub struct MemoryWrite {
    /// Address as evaluated in the state before the write.
    pub address: Formula,
    /// Address in single-assignment form.
    pub target: Formula,
    pub width: Width,
    pub value: Formula,
    pub offset: u64,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Register(String),
    Memory(usize),
}

#[derive(Clone, Debug)]
pub struct SsaInstruction {
    pub offset: u64,
    pub destinations: Vec<Destination>,
}

/// One path in single-assignment form.
///
/// Every register destination gets a fresh name `name.N`; registers read
/// before their first definition keep their plain name and are inputs.
/// Memory is not renamed: each write is recorded with its evaluated address,
/// and each read with the evaluated address it had at its position, so that
/// reads can be matched against earlier writes byte by byte.
#[derive(Clone, Debug, Default)]
pub struct SsaPath {
    pub definitions: HashMap<String, Definition>,
    pub writes: Vec<MemoryWrite>,
    pub instructions: Vec<SsaInstruction>,
    reads: HashMap<(Formula, Position), Formula>,
    versions: HashMap<String, u32>,
    final_state: SymbolicState,
}

impl SsaPath {
    pub fn new(cfg: &ControlFlowGraph, path: &[BlockKey], initial: SymbolicState) -> Result<Self> {
        let mut builder = SsaBuilder::default();
        let mut state = initial;

        execute_path(cfg, path, &mut state, &mut builder)?;

        let mut ssa = builder.ssa;
        ssa.final_state = state;

        trace!(
            "path in ssa form: {} definitions, {} memory writes",
            ssa.definitions.len(),
            ssa.writes.len()
        );

        Ok(ssa)
    }

    /// Position after the last instruction.
    pub fn end(&self) -> Position {
        self.instructions.len()
    }

    pub fn position_of(&self, offset: u64) -> Option<Position> {
        self.instructions.iter().position(|i| i.offset == offset)
    }

    /// Current name of a register, if it was defined on the path.
    pub fn current_name(&self, register: &str) -> Option<String> {
        self.versions
            .get(register)
            .map(|v| versioned(register, *v))
    }

    /// Evaluated address of the memory read `read` (in single-assignment
    /// form) at `position`.
    pub fn read_address(&self, read: &Formula, position: Position) -> Option<&Formula> {
        self.reads.get(&(read.clone(), position))
    }

    /// Brings a formula over the registers and memory at the end of the path
    /// into single-assignment form.
    pub fn rename_final(&mut self, formula: &Formula) -> Formula {
        let end = self.end();
        let renamed = rename(formula, &self.versions);

        for read in formula.memory_reads() {
            if let Some((address, _)) = read.as_mem() {
                let evaluated = self.final_state.evaluate(address);
                self.reads
                    .insert((rename(&read, &self.versions), end), evaluated);
            }
        }

        renamed
    }

    pub fn final_state(&self) -> &SymbolicState {
        &self.final_state
    }
}

fn versioned(name: &str, version: u32) -> String {
    format!("{}.{}", name, version)
}

fn rename(formula: &Formula, versions: &HashMap<String, u32>) -> Formula {
    formula.transform(&mut |node| match node.node() {
        Node::Id { name, width } => match versions.get(name) {
            Some(v) => Formula::id(versioned(name, *v), *width),
            None => node,
        },
        _ => node,
    })
}

struct PendingDefinition {
    destination: Location,
    source: Formula,
    target: Option<Formula>,
}

/// Observer converting an executed path into single-assignment form.
#[derive(Default)]
struct SsaBuilder {
    ssa: SsaPath,
    pre_state: SymbolicState,
    offset: u64,
    pending: Vec<PendingDefinition>,
}

impl SsaBuilder {
    fn record_reads(&mut self, formula: &Formula) {
        let position = self.ssa.instructions.len();

        for read in formula.memory_reads() {
            if let Some((address, _)) = read.as_mem() {
                let evaluated = self.pre_state.evaluate(address);
                self.ssa
                    .reads
                    .insert((rename(&read, &self.ssa.versions), position), evaluated);
            }
        }
    }
}

impl Observer for SsaBuilder {
    fn enter_instruction(&mut self, offset: u64, state: &mut SymbolicState) -> Result<()> {
        self.pre_state = state.clone();
        self.offset = offset;
        self.pending.clear();
        Ok(())
    }

    fn on_assignment(
        &mut self,
        assignment: &Assignment,
        destination: &Location,
        _value: &Formula,
    ) -> Result<()> {
        self.record_reads(&assignment.source);

        let target = match &assignment.destination {
            Location::Memory { address, .. } => {
                self.record_reads(address);
                Some(rename(address, &self.ssa.versions))
            }
            Location::Register { .. } => None,
        };

        // renamed against the versions before this instruction, since all
        // assignments of one instruction read the same state
        self.pending.push(PendingDefinition {
            destination: destination.clone(),
            source: rename(&assignment.source, &self.ssa.versions),
            target,
        });

        Ok(())
    }

    fn leave_instruction(&mut self, offset: u64, _state: &SymbolicState) -> Result<()> {
        let position = self.ssa.instructions.len();
        let mut destinations = Vec::with_capacity(self.pending.len());

        for pending in self.pending.drain(..) {
            match pending.destination {
                Location::Register { name, .. } => {
                    let version = self.ssa.versions.entry(name.clone()).or_insert(0);
                    *version += 1;
                    let ssa_name = versioned(&name, *version);

                    self.ssa.definitions.insert(
                        ssa_name.clone(),
                        Definition {
                            source: pending.source,
                            offset,
                            position,
                        },
                    );
                    destinations.push(Destination::Register(ssa_name));
                }
                Location::Memory { address, width } => {
                    self.ssa.writes.push(MemoryWrite {
                        target: pending.target.unwrap_or_else(|| address.clone()),
                        address,
                        width,
                        value: pending.source,
                        offset,
                        position,
                    });
                    destinations.push(Destination::Memory(self.ssa.writes.len() - 1));
                }
            }
        }

        self.ssa.instructions.push(SsaInstruction {
            offset: self.offset,
            destinations,
        });

        Ok(())
    }
}
