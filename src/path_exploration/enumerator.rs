use super::{ExplorationOptions, ExploredPath, LoopPolicy, Path};
use crate::{
    error::{EngineError, Result},
    executor::{Executor, Observer, Unobserved},
    formula::Formula,
    ir::{BlockKey, ControlFlowGraph},
    state::{Bindings, SymbolicState},
    util::Deadline,
};
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};

/// Snapshot taken after executing a branching block.
#[derive(Clone, Debug)]
struct Checkpoint<O> {
    state: SymbolicState,
    observer: O,
    remaining: VecDeque<BlockKey>,
    path: Path,
}

/// Block to execute next, with the state it starts from.
struct Pending<O> {
    key: BlockKey,
    state: SymbolicState,
    observer: O,
    path: Path,
}

/// Depth-first enumeration of all paths from the entry block to a leaf.
///
/// Backtracking uses a map of checkpoints indexed by block key and the
/// stack of block keys owning them, not recursion. Each checkpoint owns its
/// state, so sibling paths never observe each other's writes. The observer
/// is cloned along with the state and handed out with every path.
pub struct PathEnumerator<'a, O = Unobserved> {
    cfg: &'a ControlFlowGraph,
    options: ExplorationOptions,
    deadline: Deadline,
    checkpoints: HashMap<BlockKey, Checkpoint<O>>,
    stack: Vec<BlockKey>,
    pending: Option<Pending<O>>,
    yielded: usize,
    pruned: usize,
    timed_out: bool,
    finished: bool,
}

/// Enumerates paths from `entry` with default options and no observer.
pub fn enumerate_paths<'a>(
    cfg: &'a ControlFlowGraph,
    entry: BlockKey,
    bindings: &Bindings,
) -> PathEnumerator<'a> {
    PathEnumerator::new(
        cfg,
        entry,
        SymbolicState::with_bindings(bindings),
        Unobserved,
        ExplorationOptions::default(),
    )
}

impl<'a, O: Observer + Clone> PathEnumerator<'a, O> {
    pub fn new(
        cfg: &'a ControlFlowGraph,
        entry: BlockKey,
        state: SymbolicState,
        observer: O,
        options: ExplorationOptions,
    ) -> Self {
        Self {
            cfg,
            deadline: Deadline::new(options.timeout),
            options,
            checkpoints: HashMap::new(),
            stack: Vec::new(),
            pending: Some(Pending {
                key: entry,
                state,
                observer,
                path: Vec::new(),
            }),
            yielded: 0,
            pruned: 0,
            timed_out: false,
            finished: false,
        }
    }

    /// Number of back edges not followed.
    pub fn pruned_edges(&self) -> usize {
        self.pruned
    }

    /// Whether enumeration stopped because the cutoff expired.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    fn step(&mut self, pending: Pending<O>) -> Result<Option<ExploredPath<O>>> {
        let Pending {
            key,
            mut state,
            mut observer,
            mut path,
        } = pending;

        let block = self.cfg.block(key)?;
        path.push(key);

        let flow = Executor::new(&mut observer).execute_block(block, &mut state)?;

        if self.cfg.is_leaf(key) {
            debug!("reached leaf {} after {} blocks", key, path.len());
            return Ok(Some(ExploredPath {
                path,
                state,
                observer,
            }));
        }

        let remaining = self.successors(key, flow.as_ref(), &path)?;
        if remaining.is_empty() {
            trace!("all successors of {} pruned", key);
            return Ok(None);
        }

        self.checkpoints.insert(
            key,
            Checkpoint {
                state,
                observer,
                remaining,
                path,
            },
        );
        self.stack.push(key);

        Ok(None)
    }

    /// Successors to explore after `key`, narrowed to one when the block
    /// assigned a known block address to the flow location.
    fn successors(
        &mut self,
        key: BlockKey,
        flow: Option<&Formula>,
        path: &[BlockKey],
    ) -> Result<VecDeque<BlockKey>> {
        let all = self.cfg.successors(key);

        let narrowed = flow
            .and_then(Formula::as_const)
            .and_then(|address| self.cfg.resolve(address))
            .filter(|target| all.contains(target));

        let candidates: Vec<BlockKey> = match narrowed {
            Some(target) => {
                trace!("narrowed {} to {}", key, target);
                vec![target]
            }
            None => all.to_vec(),
        };

        let mut successors = VecDeque::with_capacity(candidates.len());
        for successor in candidates {
            if path.contains(&successor) {
                match self.options.loop_policy {
                    LoopPolicy::Prune => {
                        warn!("not following back edge {} -> {}", key, successor);
                        self.pruned += 1;
                        continue;
                    }
                    LoopPolicy::Reject => {
                        return Err(EngineError::AssertionViolation(format!(
                            "loop through back edge {} -> {}",
                            key, successor
                        )))
                    }
                }
            }
            successors.push_back(successor);
        }

        Ok(successors)
    }

    /// Schedules the next unexplored successor of the deepest checkpoint,
    /// dropping exhausted checkpoints on the way up.
    fn backtrack(&mut self) -> bool {
        while let Some(&top) = self.stack.last() {
            if let Some(checkpoint) = self.checkpoints.get_mut(&top) {
                if let Some(next) = checkpoint.remaining.pop_front() {
                    trace!("resuming at {} towards {}", top, next);
                    self.pending = Some(Pending {
                        key: next,
                        state: checkpoint.state.clone(),
                        observer: checkpoint.observer.clone(),
                        path: checkpoint.path.clone(),
                    });
                    return true;
                }
            }
            self.checkpoints.remove(&top);
            self.stack.pop();
        }
        false
    }
}

impl<'a, O: Observer + Clone> Iterator for PathEnumerator<'a, O> {
    type Item = Result<ExploredPath<O>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if self.yielded > 0 && self.deadline.expired() {
            warn!(
                "path enumeration cut off after {} paths ({:?})",
                self.yielded,
                self.deadline.elapsed()
            );
            self.timed_out = true;
            self.finished = true;
            return None;
        }

        loop {
            let pending = match self.pending.take() {
                Some(pending) => pending,
                None if self.backtrack() => continue,
                None => {
                    debug!("enumerated {} paths", self.yielded);
                    self.finished = true;
                    return None;
                }
            };

            match self.step(pending) {
                Ok(Some(explored)) => {
                    self.yielded += 1;
                    return Some(Ok(explored));
                }
                Ok(None) => {}
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
