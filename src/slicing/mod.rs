//! Backward slicing along one concrete path.

mod ssa;

pub use self::ssa::*;

use crate::{
    error::{EngineError, Result},
    formula::{Formula, Width},
    ir::{BlockKey, ControlFlowGraph, Location},
    state::{split_address, SymbolicState},
};
use log::{debug, trace};
use std::collections::{BTreeSet, HashSet};

/// What to compute the slice of.
#[derive(Clone, Debug)]
pub enum SliceTarget {
    /// Value of a location at the end of the path. Memory addresses are
    /// taken as evaluated addresses.
    Location(Location),
    /// Formula over the registers and memory at the end of the path.
    Formula(Formula),
    /// Everything the native instruction at this offset writes, including
    /// the addresses it writes to.
    Instruction(u64),
}

#[derive(Clone, Debug, Default)]
pub struct SliceResult {
    pub offsets: BTreeSet<u64>,
    /// `MissingMemoryDependency` for every read not fully covered by
    /// earlier writes.
    pub missing: Vec<EngineError>,
}

impl SliceResult {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// The offsets, or the first missing dependency.
    pub fn ensure_complete(self) -> Result<BTreeSet<u64>> {
        match self.missing.into_iter().next() {
            Some(missing) => Err(missing),
            None => Ok(self.offsets),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Item {
    Definition(String),
    Write(usize),
    Formula(Formula, Position),
}

pub struct BackwardSlicer {
    ssa: SsaPath,
}

impl BackwardSlicer {
    pub fn new(cfg: &ControlFlowGraph, path: &[BlockKey], initial: SymbolicState) -> Result<Self> {
        let ssa = time_debug!("ssa conversion", { SsaPath::new(cfg, path, initial)? });
        Ok(Self { ssa })
    }

    pub fn ssa(&self) -> &SsaPath {
        &self.ssa
    }

    /// Offsets of all native instructions the target depends on.
    pub fn slice(&mut self, target: &SliceTarget) -> Result<SliceResult> {
        let mut closure = Closure::default();
        let end = self.ssa.end();

        match target {
            SliceTarget::Location(Location::Register { name, .. }) => {
                if let Some(name) = self.ssa.current_name(name) {
                    closure.push(Item::Definition(name));
                }
            }
            SliceTarget::Location(Location::Memory { address, width }) => {
                let label = Formula::mem(address.clone(), *width).to_string();
                closure.resolve(&self.ssa, label, address, *width, end);
            }
            SliceTarget::Formula(formula) => {
                let renamed = self.ssa.rename_final(formula);
                closure.push(Item::Formula(renamed, end));
            }
            SliceTarget::Instruction(offset) => {
                let position = self.ssa.position_of(*offset).ok_or_else(|| {
                    EngineError::AssertionViolation(format!(
                        "instruction {:#x} is not on the path",
                        offset
                    ))
                })?;
                closure.offsets.insert(*offset);
                for destination in &self.ssa.instructions[position].destinations {
                    closure.push(match destination {
                        Destination::Register(name) => Item::Definition(name.clone()),
                        Destination::Memory(index) => Item::Write(*index),
                    });
                }
            }
        }

        closure.run(&self.ssa);

        debug!(
            "sliced {} instructions, {} unresolved memory reads",
            closure.offsets.len(),
            closure.missing.len()
        );

        Ok(SliceResult {
            offsets: closure.offsets,
            missing: closure.missing,
        })
    }
}

/// Slices one path for one target.
pub fn slice(
    cfg: &ControlFlowGraph,
    path: &[BlockKey],
    initial: SymbolicState,
    target: &SliceTarget,
) -> Result<SliceResult> {
    BackwardSlicer::new(cfg, path, initial)?.slice(target)
}

#[derive(Default)]
struct Closure {
    worklist: Vec<Item>,
    visited: HashSet<Item>,
    offsets: BTreeSet<u64>,
    missing: Vec<EngineError>,
}

impl Closure {
    fn push(&mut self, item: Item) {
        if self.visited.insert(item.clone()) {
            self.worklist.push(item);
        }
    }

    fn run(&mut self, ssa: &SsaPath) {
        while let Some(item) = self.worklist.pop() {
            match item {
                Item::Definition(name) => {
                    if let Some(definition) = ssa.definitions.get(&name) {
                        trace!("{} defined at {:#x}", name, definition.offset);
                        self.offsets.insert(definition.offset);
                        self.push(Item::Formula(
                            definition.source.clone(),
                            definition.position,
                        ));
                    }
                }
                Item::Write(index) => {
                    let write = &ssa.writes[index];
                    trace!("@{}[{}] written at {:#x}", write.width, write.address, write.offset);
                    self.offsets.insert(write.offset);
                    self.push(Item::Formula(write.value.clone(), write.position));
                    self.push(Item::Formula(write.target.clone(), write.position));
                }
                Item::Formula(formula, position) => self.uses(ssa, &formula, position),
            }
        }
    }

    fn uses(&mut self, ssa: &SsaPath, formula: &Formula, position: Position) {
        for name in formula.identifiers() {
            if ssa.definitions.contains_key(&name) {
                self.push(Item::Definition(name));
            }
        }

        for read in formula.memory_reads() {
            if let Some((address, width)) = read.as_mem() {
                // nested reads and registers of the address are found above
                match ssa.read_address(&read, position) {
                    Some(evaluated) => {
                        let evaluated = evaluated.clone();
                        self.resolve(ssa, read.to_string(), &evaluated, width, position)
                    }
                    None => self.missing.push(EngineError::MissingMemoryDependency {
                        read: format!("{} ({})", read, address),
                        uncovered: width,
                    }),
                }
            }
        }
    }

    /// Walks the writes before `position` from the closest one backwards
    /// until every byte of the read is covered.
    fn resolve(
        &mut self,
        ssa: &SsaPath,
        label: String,
        address: &Formula,
        width: Width,
        position: Position,
    ) {
        let (base, displacement) = split_address(address);
        let bytes = u64::from((width / 8).max(1));
        let mut uncovered: BTreeSet<u64> = (0..bytes).map(|i| displacement.wrapping_add(i)).collect();

        for (index, write) in ssa.writes.iter().enumerate().rev() {
            if uncovered.is_empty() {
                break;
            }
            if write.position >= position {
                continue;
            }

            let (write_base, write_displacement) = split_address(&write.address);
            if write_base != base {
                continue;
            }

            let written = u64::from(write.width / 8);
            let before = uncovered.len();
            uncovered.retain(|byte| byte.wrapping_sub(write_displacement) >= written);

            if uncovered.len() < before {
                trace!("{} covered by write at {:#x}", label, write.offset);
                self.push(Item::Write(index));
            }
        }

        if !uncovered.is_empty() {
            let missing = EngineError::MissingMemoryDependency {
                read: label,
                uncovered: uncovered.len() as u32 * 8,
            };
            debug!("{}", missing);
            self.missing.push(missing);
        }
    }
}
