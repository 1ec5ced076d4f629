use crate::{
    formula::{Formula, Node, Operator, Width},
    ir::Location,
};
use log::trace;
use std::collections::{BTreeMap, HashMap};

/// Width of the free variable standing for an unwritten register.
pub const REGISTER_WIDTH: Width = 64;

/// Initial contents of a symbolic state, e.g. operands of a handler bound
/// to free variables or concrete values.
pub type Bindings = Vec<(Location, Formula)>;

/// Mapping of registers and memory cells to formulas.
///
/// Memory is byte granular. An address is split into a symbolic base and a
/// constant displacement; cells with different bases never alias. Cloning a
/// state produces an independent snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SymbolicState {
    registers: BTreeMap<String, Formula>,
    memory: HashMap<Formula, BTreeMap<u64, Formula>>,
}

impl SymbolicState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh state where each bound location holds its bound value. Bound
    /// addresses are taken as written, not evaluated.
    pub fn with_bindings(bindings: &[(Location, Formula)]) -> Self {
        let mut state = Self::new();
        for (location, value) in bindings {
            state.write(location, value.clone());
        }
        state
    }

    pub fn read(&self, location: &Location) -> Formula {
        match location {
            Location::Register { name, width } => self.read_register(name, *width),
            Location::Memory { address, width } => self.read_memory(address, *width),
        }
    }

    pub fn write(&mut self, location: &Location, value: Formula) {
        match location {
            Location::Register { name, .. } => self.write_register(name, value),
            Location::Memory { address, .. } => self.write_memory(address, value),
        }
    }

    pub fn register(&self, name: &str) -> Option<&Formula> {
        self.registers.get(name)
    }

    /// Value of a register; registers never written are free. Narrow reads
    /// of a free register are slices of one full width variable.
    pub fn read_register(&self, name: &str, width: Width) -> Formula {
        match self.registers.get(name) {
            None if width < REGISTER_WIDTH => {
                Formula::slice(Formula::id(name, REGISTER_WIDTH), 0, width)
            }
            None => Formula::id(name, width),
            Some(value) if value.width() > width => Formula::slice(value.clone(), 0, width),
            Some(value) if value.width() < width => Formula::zero_extend(value.clone(), width),
            Some(value) => value.clone(),
        }
    }

    pub fn write_register(&mut self, name: &str, value: Formula) {
        trace!("{} = {}", name, value);
        self.registers.insert(name.to_string(), value);
    }

    pub fn read_memory(&self, address: &Formula, width: Width) -> Formula {
        let (base, displacement) = split_address(address);
        let bytes = u64::from(width / 8);

        let cells = match self.memory.get(&base) {
            Some(cells) => cells,
            None => return Formula::mem(address.clone(), width),
        };
        // addresses wrap around at the end of the address space
        let byte_addresses: Vec<u64> = (0..bytes).map(|i| displacement.wrapping_add(i)).collect();
        if !byte_addresses.iter().any(|d| cells.contains_key(d)) {
            return Formula::mem(address.clone(), width);
        }

        let parts = byte_addresses
            .into_iter()
            .map(|d| match cells.get(&d) {
                Some(byte) => byte.clone(),
                None => Formula::mem(join_address(&base, d), 8),
            })
            .collect();

        Formula::compose(parts)
    }

    pub fn write_memory(&mut self, address: &Formula, value: Formula) {
        trace!("@{}[{}] = {}", value.width(), address, value);
        let (base, displacement) = split_address(address);
        let cells = self.memory.entry(base).or_default();

        for i in 0..value.width() / 8 {
            cells.insert(
                displacement.wrapping_add(u64::from(i)),
                Formula::slice(value.clone(), i * 8, i * 8 + 8),
            );
        }
    }

    /// Replaces registers and memory reads in `formula` by their current
    /// values.
    pub fn evaluate(&self, formula: &Formula) -> Formula {
        formula.transform(&mut |node| match node.node() {
            Node::Id { name, width } => self.read_register(name, *width),
            Node::Mem { address, width } => self.read_memory(address, *width),
            _ => node,
        })
    }

    /// Location with its address evaluated in this state.
    pub fn resolve(&self, location: &Location) -> Location {
        match location {
            Location::Register { .. } => location.clone(),
            Location::Memory { address, width } => Location::memory(self.evaluate(address), *width),
        }
    }

    pub fn registers(&self) -> impl Iterator<Item = (&str, &Formula)> {
        self.registers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Written memory cells as `(address, byte)` pairs.
    pub fn memory(&self) -> Vec<(Formula, Formula)> {
        let mut cells: Vec<_> = self
            .memory
            .iter()
            .flat_map(|(base, cells)| {
                cells
                    .iter()
                    .map(move |(d, byte)| (join_address(base, *d), byte.clone()))
            })
            .collect();
        cells.sort();
        cells
    }
}

/// Symbolic base and constant displacement of an address.
pub(crate) fn split_address(address: &Formula) -> (Formula, u64) {
    match address.node() {
        Node::Const { value, .. } => (Formula::constant(0, address.width()), *value),
        Node::Op {
            op: Operator::Add,
            args,
            width,
        } => match args.last().and_then(Formula::as_const) {
            Some(displacement) => {
                let rest = args[..args.len() - 1].to_vec();
                let base = if rest.len() == 1 {
                    rest[0].clone()
                } else {
                    Formula::operation(Operator::Add, rest, *width)
                };
                (base, displacement)
            }
            None => (address.clone(), 0),
        },
        _ => (address.clone(), 0),
    }
}

fn join_address(base: &Formula, displacement: u64) -> Formula {
    Formula::add(base.clone(), Formula::constant(displacement, base.width()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_plus(offset: u64) -> Formula {
        Formula::add(Formula::id("ctx", 64), Formula::constant(offset, 64))
    }

    #[test]
    fn unwritten_memory_reads_stay_symbolic() {
        let state = SymbolicState::new();
        let read = state.read_memory(&ctx_plus(8), 64);
        assert_eq!(read, Formula::mem(ctx_plus(8), 64));
    }

    #[test]
    fn narrow_reads_see_wider_writes() {
        let mut state = SymbolicState::new();
        let x = Formula::id("x", 64);
        state.write_memory(&ctx_plus(8), x.clone());

        assert_eq!(state.read_memory(&ctx_plus(8), 64), x);
        assert_eq!(
            state.read_memory(&ctx_plus(10), 16),
            Formula::slice(x, 16, 32)
        );
    }

    #[test]
    fn partially_written_reads_compose_fresh_bytes() {
        let mut state = SymbolicState::new();
        let b = Formula::id("b", 8);
        state.write_memory(&ctx_plus(0), b.clone());

        let read = state.read_memory(&ctx_plus(0), 16);
        assert_eq!(read.width(), 16);
        assert_eq!(Formula::slice(read.clone(), 0, 8), b);
        assert_eq!(Formula::slice(read, 8, 16), Formula::mem(ctx_plus(1), 8));
    }

    #[test]
    fn narrow_reads_of_free_registers_share_one_variable() {
        let state = SymbolicState::new();
        let full = Formula::id("a0", 64);

        assert_eq!(state.read_register("a0", 64), full);
        assert_eq!(state.read_register("a0", 32), Formula::slice(full.clone(), 0, 32));
        assert_eq!(
            state.read_register("a0", 8).identifiers(),
            state.read_register("a0", 16).identifiers()
        );
    }

    #[test]
    fn accesses_wrap_around_the_address_space() {
        let mut state = SymbolicState::new();
        let top = Formula::constant(u64::MAX - 1, 64);
        state.write_memory(&top, Formula::constant(0x4433_2211, 32));

        assert_eq!(state.read_memory(&top, 32).as_const(), Some(0x4433_2211));
        assert_eq!(
            state.read_memory(&Formula::constant(1, 64), 8).as_const(),
            Some(0x44)
        );
    }

    #[test]
    fn clones_are_independent_snapshots() {
        let mut state = SymbolicState::new();
        state.write_register("a", Formula::constant(1, 64));
        let snapshot = state.clone();
        state.write_register("a", Formula::constant(2, 64));
        state.write_memory(&ctx_plus(0), Formula::constant(3, 64));

        assert_eq!(snapshot.read_register("a", 64).as_const(), Some(1));
        assert!(snapshot.memory().is_empty());
    }

    #[test]
    fn evaluation_substitutes_registers_and_memory() {
        let mut state = SymbolicState::new();
        state.write_register("rsi", ctx_plus(0));
        state.write_memory(&ctx_plus(16), Formula::id("x", 64));

        let source = Formula::mem(
            Formula::add(Formula::id("rsi", 64), Formula::constant(16, 64)),
            64,
        );
        assert_eq!(state.evaluate(&source), Formula::id("x", 64));
    }
}
