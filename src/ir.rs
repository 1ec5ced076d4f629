//! Control-flow graphs of semantic micro-assignments, as handed over by an
//! IR provider.

use crate::{
    error::{EngineError, Result},
    formula::{Formula, Width},
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

/// Location holding the successor address of a block.
pub const FLOW: &str = "flow";

pub const ADDRESS_WIDTH: Width = 64;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    Register { name: String, width: Width },
    Memory { address: Formula, width: Width },
}

impl Location {
    pub fn register(name: impl Into<String>, width: Width) -> Self {
        Location::Register {
            name: name.into(),
            width,
        }
    }

    pub fn memory(address: Formula, width: Width) -> Self {
        Location::Memory { address, width }
    }

    pub fn flow() -> Self {
        Location::register(FLOW, ADDRESS_WIDTH)
    }

    pub fn width(&self) -> Width {
        match self {
            Location::Register { width, .. } | Location::Memory { width, .. } => *width,
        }
    }

    pub fn is_flow(&self) -> bool {
        matches!(self, Location::Register { name, .. } if name == FLOW)
    }

    pub fn as_formula(&self) -> Formula {
        match self {
            Location::Register { name, width } => Formula::id(name.clone(), *width),
            Location::Memory { address, width } => Formula::mem(address.clone(), *width),
        }
    }

}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_formula())
    }
}

/// `destination = source`, originating from the native instruction at
/// `offset`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub destination: Location,
    pub source: Formula,
    pub offset: u64,
}

impl Assignment {
    pub fn new(destination: Location, source: Formula, offset: u64) -> Self {
        debug_assert_eq!(
            destination.width(),
            source.width(),
            "{} = {} at {:#x}",
            destination,
            source,
            offset
        );
        Self {
            destination,
            source,
            offset,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey(pub u64);

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loc_{:x}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub key: BlockKey,
    pub address: u64,
    pub assignments: Vec<Assignment>,
}

impl BasicBlock {
    pub fn new(key: BlockKey, address: u64, assignments: Vec<Assignment>) -> Self {
        Self {
            key,
            address,
            assignments,
        }
    }

    /// Runs of consecutive assignments with the same native offset. Each
    /// run is one native instruction and executes in parallel.
    pub fn instructions(&self) -> Vec<&[Assignment]> {
        let mut groups = Vec::new();
        let mut start = 0;

        for i in 1..=self.assignments.len() {
            if i == self.assignments.len()
                || self.assignments[i].offset != self.assignments[start].offset
            {
                if i > start {
                    groups.push(&self.assignments[start..i]);
                }
                start = i;
            }
        }

        groups
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.instructions().iter().map(|g| g[0].offset).collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ControlFlowGraph {
    entry: Option<BlockKey>,
    blocks: BTreeMap<BlockKey, BasicBlock>,
    successors: BTreeMap<BlockKey, Vec<BlockKey>>,
    addresses: HashMap<u64, BlockKey>,
}

impl ControlFlowGraph {
    pub fn new(entry: BlockKey) -> Self {
        Self {
            entry: Some(entry),
            ..Default::default()
        }
    }

    pub fn add_block(&mut self, block: BasicBlock) {
        self.addresses.entry(block.address).or_insert(block.key);
        self.successors.entry(block.key).or_default();
        if self.entry.is_none() {
            self.entry = Some(block.key);
        }
        self.blocks.insert(block.key, block);
    }

    /// Edges keep the insertion order, which is the order successors are
    /// explored in.
    pub fn add_edge(&mut self, from: BlockKey, to: BlockKey) {
        let successors = self.successors.entry(from).or_default();
        if !successors.contains(&to) {
            successors.push(to);
        }
    }

    pub fn entry(&self) -> Result<BlockKey> {
        self.entry
            .ok_or_else(|| EngineError::AssertionViolation("control-flow graph is empty".into()))
    }

    pub fn block(&self, key: BlockKey) -> Result<&BasicBlock> {
        self.blocks
            .get(&key)
            .ok_or_else(|| EngineError::lifting(key.0, format!("block {} is not materialized", key)))
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    pub fn successors(&self, key: BlockKey) -> &[BlockKey] {
        self.successors.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_leaf(&self, key: BlockKey) -> bool {
        self.successors(key).is_empty()
    }

    /// Block starting at a native address.
    pub fn resolve(&self, address: u64) -> Option<BlockKey> {
        self.addresses.get(&address).copied()
    }

    /// Distinct native instructions covered by the graph.
    pub fn native_offsets(&self) -> BTreeSet<u64> {
        self.blocks
            .values()
            .flat_map(|b| b.assignments.iter().map(|a| a.offset))
            .collect()
    }

    /// Native instruction addresses along `path`, one per instruction.
    pub fn address_path(&self, path: &[BlockKey]) -> Result<Vec<u64>> {
        let mut addresses = Vec::new();
        for key in path {
            addresses.extend(self.block(*key)?.offsets());
        }
        Ok(addresses)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Source of control-flow graphs, e.g. a lifter for some instruction set.
pub trait IrProvider {
    fn name(&self) -> &'static str;

    /// Control-flow graph of the function starting at `entry`.
    fn lift(&self, entry: u64) -> Result<ControlFlowGraph>;
}
