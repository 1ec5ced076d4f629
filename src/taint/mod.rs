//! Forward taint propagation along one path, either on single bits of the
//! symbolic state or on whole registers of a native emulator.

mod bit;
mod instruction;

pub use self::{bit::*, instruction::*};

use crate::ir::Location;
use std::collections::BTreeSet;
use strum::{EnumString, EnumVariantNames, IntoStaticStr};

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumVariantNames, IntoStaticStr)]
#[strum(serialize_all = "kebab_case")]
pub enum Granularity {
    Bit,
    Instruction,
}

/// Externally influenced storage location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaintSource {
    /// Tainted from the start of the path. Memory addresses are evaluated
    /// addresses.
    Immediate(Location),
    /// Tainted once the instruction at `offset` executes. A memory address
    /// is evaluated in the state right before that instruction.
    Deferred { location: Location, offset: u64 },
}

impl TaintSource {
    pub fn location(&self) -> &Location {
        match self {
            TaintSource::Immediate(location) | TaintSource::Deferred { location, .. } => location,
        }
    }

    /// Whether the source is active for the instruction at `offset`.
    fn applies_at(&self, offset: u64) -> bool {
        match self {
            TaintSource::Immediate(_) => true,
            TaintSource::Deferred { offset: at, .. } => *at == offset,
        }
    }
}

/// Result of tainting one path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaintReport {
    pub tainted: BTreeSet<u64>,
    pub visited: BTreeSet<u64>,
    /// Instruction addresses in execution order.
    pub trace: Vec<u64>,
}

impl TaintReport {
    pub fn merge(&mut self, other: &TaintReport) {
        self.tainted.extend(other.tainted.iter().copied());
        self.visited.extend(other.visited.iter().copied());
    }
}
