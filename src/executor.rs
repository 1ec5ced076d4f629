//! Symbolic execution of IR blocks with pluggable observers.

use crate::{
    error::Result,
    formula::{Formula, Node, Width},
    ir::{Assignment, BasicBlock, Location},
    state::SymbolicState,
};
use log::trace;
use std::collections::HashMap;

/// Hooks into the execution of assignments.
///
/// All hooks default to doing nothing, so an observer only implements what
/// it is interested in. Hooks are called in this order for every native
/// instruction: `enter_instruction`, then `on_memory_read` while sources are
/// evaluated, `on_assignment` once per assignment, `on_memory_write` while
/// results are committed, and finally `leave_instruction`.
pub trait Observer {
    /// Called before the instruction at `offset` executes. The state may be
    /// modified, e.g. to inject values that only become addressable now.
    fn enter_instruction(&mut self, _offset: u64, _state: &mut SymbolicState) -> Result<()> {
        Ok(())
    }

    /// `destination` has its address evaluated, `value` is the evaluated
    /// source. Both refer to the state before the instruction.
    fn on_assignment(
        &mut self,
        _assignment: &Assignment,
        _destination: &Location,
        _value: &Formula,
    ) -> Result<()> {
        Ok(())
    }

    fn on_memory_read(&mut self, _address: &Formula, _width: Width, _value: &Formula) {}

    fn on_memory_write(&mut self, _address: &Formula, _value: &Formula) {}

    fn leave_instruction(&mut self, _offset: u64, _state: &SymbolicState) -> Result<()> {
        Ok(())
    }
}

/// Observer of a plain execution.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unobserved;

impl Observer for Unobserved {}

impl<O: Observer + ?Sized> Observer for &mut O {
    fn enter_instruction(&mut self, offset: u64, state: &mut SymbolicState) -> Result<()> {
        (**self).enter_instruction(offset, state)
    }

    fn on_assignment(
        &mut self,
        assignment: &Assignment,
        destination: &Location,
        value: &Formula,
    ) -> Result<()> {
        (**self).on_assignment(assignment, destination, value)
    }

    fn on_memory_read(&mut self, address: &Formula, width: Width, value: &Formula) {
        (**self).on_memory_read(address, width, value)
    }

    fn on_memory_write(&mut self, address: &Formula, value: &Formula) {
        (**self).on_memory_write(address, value)
    }

    fn leave_instruction(&mut self, offset: u64, state: &SymbolicState) -> Result<()> {
        (**self).leave_instruction(offset, state)
    }
}

/// Single concrete executor; everything variant-specific lives in the
/// observer.
pub struct Executor<'o, O: Observer + ?Sized> {
    observer: &'o mut O,
}

impl<'o, O: Observer + ?Sized> Executor<'o, O> {
    pub fn new(observer: &'o mut O) -> Self {
        Self { observer }
    }

    /// Executes all instructions of `block` and returns the value of the
    /// flow location afterwards, or `None` if the block did not assign it.
    pub fn execute_block(
        &mut self,
        block: &BasicBlock,
        state: &mut SymbolicState,
    ) -> Result<Option<Formula>> {
        trace!("executing block {}", block.key);

        for instruction in block.instructions() {
            self.execute_instruction(instruction, state)?;
        }

        let assigns_flow = block.assignments.iter().any(|a| a.destination.is_flow());
        Ok(assigns_flow.then(|| state.read(&Location::flow())))
    }

    /// Assignments sharing one native offset read the state before any of
    /// them writes.
    pub fn execute_instruction(
        &mut self,
        assignments: &[Assignment],
        state: &mut SymbolicState,
    ) -> Result<()> {
        let offset = match assignments.first() {
            Some(first) => first.offset,
            None => return Ok(()),
        };

        self.observer.enter_instruction(offset, state)?;

        let mut updates = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let value = self.evaluate(&assignment.source, state);
            let destination = match &assignment.destination {
                Location::Memory { address, width } => {
                    Location::memory(self.evaluate(address, state), *width)
                }
                register => register.clone(),
            };

            self.observer.on_assignment(assignment, &destination, &value)?;
            updates.push((destination, value));
        }

        for (destination, value) in updates {
            if let Location::Memory { address, .. } = &destination {
                self.observer.on_memory_write(address, &value);
            }
            state.write(&destination, value);
        }

        self.observer.leave_instruction(offset, state)
    }

    /// Value of `formula` in `state`, reporting every memory read.
    pub fn evaluate(&mut self, formula: &Formula, state: &SymbolicState) -> Formula {
        let observer = &mut *self.observer;
        formula.transform(&mut |node| match node.node() {
            Node::Id { name, width } => state.read_register(name, *width),
            Node::Mem { address, width } => {
                let value = state.read_memory(address, *width);
                observer.on_memory_read(address, *width, &value);
                value
            }
            _ => node,
        })
    }
}

/// Native offsets of the first instruction writing, and the first ones
/// reading, watched memory locations.
#[derive(Clone, Debug, Default)]
pub struct OutputTracker {
    output: Option<Formula>,
    inputs: HashMap<Formula, String>,
    offset: u64,
    write_offset: Option<u64>,
    read_offsets: HashMap<String, u64>,
}

impl OutputTracker {
    /// `output` and the addresses in `inputs` are evaluated addresses, i.e.
    /// as they appear in the state.
    pub fn new(output: Formula, inputs: Vec<(String, Formula)>) -> Self {
        Self {
            output: Some(output),
            inputs: inputs.into_iter().map(|(name, a)| (a, name)).collect(),
            ..Default::default()
        }
    }

    pub fn output_offset(&self) -> Option<u64> {
        self.write_offset
    }

    pub fn input_offset(&self, name: &str) -> Option<u64> {
        self.read_offsets.get(name).copied()
    }
}

impl Observer for OutputTracker {
    fn enter_instruction(&mut self, offset: u64, _state: &mut SymbolicState) -> Result<()> {
        self.offset = offset;
        Ok(())
    }

    fn on_memory_read(&mut self, address: &Formula, _width: Width, _value: &Formula) {
        if let Some(name) = self.inputs.get(address) {
            self.read_offsets.entry(name.clone()).or_insert(self.offset);
        }
    }

    fn on_memory_write(&mut self, address: &Formula, _value: &Formula) {
        if self.write_offset.is_none() && self.output.as_ref() == Some(address) {
            self.write_offset = Some(self.offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BlockKey;

    fn reg(name: &str) -> Formula {
        Formula::id(name, 64)
    }

    #[test]
    fn instruction_group_reads_pre_state() {
        // swap a and b in one native instruction
        let block = BasicBlock::new(
            BlockKey(0),
            0,
            vec![
                Assignment::new(Location::register("a", 64), reg("b"), 0),
                Assignment::new(Location::register("b", 64), reg("a"), 0),
            ],
        );
        let mut state = SymbolicState::new();
        state.write_register("a", Formula::constant(1, 64));
        state.write_register("b", Formula::constant(2, 64));

        let mut observer = Unobserved;
        Executor::new(&mut observer)
            .execute_block(&block, &mut state)
            .unwrap();

        assert_eq!(state.read_register("a", 64).as_const(), Some(2));
        assert_eq!(state.read_register("b", 64).as_const(), Some(1));
    }

    #[test]
    fn flow_of_earlier_blocks_is_not_reported() {
        let jumping = BasicBlock::new(
            BlockKey(0),
            0,
            vec![Assignment::new(Location::flow(), Formula::constant(0x10, 64), 0)],
        );
        let falling = BasicBlock::new(
            BlockKey(0x10),
            0x10,
            vec![Assignment::new(Location::register("a", 64), reg("b"), 0x10)],
        );
        let mut state = SymbolicState::new();
        let mut observer = Unobserved;
        let mut executor = Executor::new(&mut observer);

        let flow = executor.execute_block(&jumping, &mut state).unwrap();
        assert_eq!(flow.and_then(|f| f.as_const()), Some(0x10));
        assert_eq!(executor.execute_block(&falling, &mut state).unwrap(), None);
    }

    #[test]
    fn output_tracker_records_first_writer() {
        let out = Formula::add(reg("ctx"), Formula::constant(0x10, 64));
        let x = Formula::add(reg("ctx"), Formula::constant(0x18, 64));
        let block = BasicBlock::new(
            BlockKey(0),
            0,
            vec![
                Assignment::new(Location::register("t", 64), Formula::mem(x.clone(), 64), 4),
                Assignment::new(Location::memory(out.clone(), 64), reg("t"), 8),
                Assignment::new(Location::memory(out.clone(), 64), reg("t"), 12),
            ],
        );
        let mut state = SymbolicState::new();
        let mut tracker = OutputTracker::new(out, vec![("x".to_string(), x)]);
        Executor::new(&mut tracker)
            .execute_block(&block, &mut state)
            .unwrap();

        assert_eq!(tracker.output_offset(), Some(8));
        assert_eq!(tracker.input_offset("x"), Some(4));
        assert_eq!(tracker.input_offset("y"), None);
    }
}
