use super::{TaintReport, TaintSource};
use crate::{
    error::Result,
    executor::Observer,
    formula::Formula,
    ir::{Assignment, BlockKey, ControlFlowGraph, Location},
    path_exploration::execute_path,
    state::SymbolicState,
};
use log::{debug, trace};

/// Observer replacing taint sources by one fresh marker per bit.
///
/// An instruction is tainted if any value it assigns contains a marker.
#[derive(Clone, Debug)]
pub struct BitTaint {
    sources: Vec<TaintSource>,
    next_marker: u64,
    started: bool,
    current: bool,
    report: TaintReport,
}

impl BitTaint {
    pub fn new(sources: Vec<TaintSource>) -> Self {
        Self {
            sources,
            next_marker: 0,
            started: false,
            current: false,
            report: TaintReport::default(),
        }
    }

    pub fn report(&self) -> &TaintReport {
        &self.report
    }

    pub fn into_report(self) -> TaintReport {
        self.report
    }

    fn markers(&mut self, width: u32) -> Formula {
        let bits = (0..width)
            .map(|_| {
                self.next_marker += 1;
                Formula::marker(self.next_marker)
            })
            .collect();

        Formula::compose(bits)
    }

    fn inject(&mut self, location: &Location, state: &mut SymbolicState) {
        let markers = self.markers(location.width());
        trace!("tainting {} with {}", location, markers);
        state.write(location, markers);
    }
}

impl Observer for BitTaint {
    fn enter_instruction(&mut self, offset: u64, state: &mut SymbolicState) -> Result<()> {
        if !self.started {
            self.started = true;
            let immediate: Vec<_> = self
                .sources
                .iter()
                .filter_map(|s| match s {
                    TaintSource::Immediate(location) => Some(location.clone()),
                    _ => None,
                })
                .collect();
            for location in immediate {
                self.inject(&location, state);
            }
        }

        let deferred: Vec<_> = self
            .sources
            .iter()
            .filter_map(|s| match s {
                TaintSource::Deferred { location, offset: at } if *at == offset => {
                    Some(state.resolve(location))
                }
                _ => None,
            })
            .collect();
        for location in deferred {
            self.inject(&location, state);
        }

        self.current = false;
        self.report.visited.insert(offset);
        self.report.trace.push(offset);

        Ok(())
    }

    fn on_assignment(
        &mut self,
        _assignment: &Assignment,
        _destination: &Location,
        value: &Formula,
    ) -> Result<()> {
        self.current |= value.has_marker();
        Ok(())
    }

    fn leave_instruction(&mut self, offset: u64, _state: &SymbolicState) -> Result<()> {
        if self.current {
            self.report.tainted.insert(offset);
        }
        Ok(())
    }
}

/// Bit-level taint of one path, starting from `initial`.
pub fn taint_bits(
    cfg: &ControlFlowGraph,
    path: &[BlockKey],
    initial: SymbolicState,
    sources: &[TaintSource],
) -> Result<TaintReport> {
    let mut state = initial;
    let mut taint = BitTaint::new(sources.to_vec());

    execute_path(cfg, path, &mut state, &mut taint)?;

    debug!(
        "{} of {} instructions tainted",
        taint.report.tainted.len(),
        taint.report.visited.len()
    );

    Ok(taint.into_report())
}
