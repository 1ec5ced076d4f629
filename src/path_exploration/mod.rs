mod enumerator;

pub use self::enumerator::*;

use crate::{
    error::{EngineError, Result},
    executor::{Executor, Observer},
    ir::{BlockKey, ControlFlowGraph},
    state::SymbolicState,
};
use std::time::Duration;
use strum::{EnumString, EnumVariantNames, IntoStaticStr};

pub mod defaults {
    use super::*;

    pub const TIMEOUT: Duration = Duration::from_secs(60 * 60);
    pub const LOOP_POLICY: LoopPolicy = LoopPolicy::Prune;
}

/// Ordered block keys from the entry block to a leaf.
pub type Path = Vec<BlockKey>;

/// What to do when a successor is already on the current path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumVariantNames, IntoStaticStr)]
#[strum(serialize_all = "kebab_case")]
pub enum LoopPolicy {
    /// Do not follow the back edge; paths through it are not enumerated.
    Prune,
    /// Fail the unit with an assertion violation.
    Reject,
}

#[derive(Clone, Debug)]
pub struct ExplorationOptions {
    /// Soft cutoff, checked once per yielded path.
    pub timeout: Option<Duration>,
    pub loop_policy: LoopPolicy,
}

impl Default for ExplorationOptions {
    fn default() -> Self {
        Self {
            timeout: Some(defaults::TIMEOUT),
            loop_policy: defaults::LOOP_POLICY,
        }
    }
}

/// One enumerated path with its final state and the observer that
/// followed it.
#[derive(Clone, Debug)]
pub struct ExploredPath<O = crate::executor::Unobserved> {
    pub path: Path,
    pub state: SymbolicState,
    pub observer: O,
}

/// Symbolically executes the blocks of `path` in order, starting from
/// `state`.
pub fn execute_path<O: Observer + ?Sized>(
    cfg: &ControlFlowGraph,
    path: &[BlockKey],
    state: &mut SymbolicState,
    observer: &mut O,
) -> Result<()> {
    let mut executor = Executor::new(observer);

    for (i, key) in path.iter().enumerate() {
        if i > 0 && !cfg.successors(path[i - 1]).contains(key) {
            return Err(EngineError::AssertionViolation(format!(
                "{} is not a successor of {}",
                key,
                path[i - 1]
            )));
        }
        executor.execute_block(cfg.block(*key)?, state)?;
    }

    Ok(())
}
