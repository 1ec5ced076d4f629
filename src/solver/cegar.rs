//! Counter-example guided recovery of a handler key.

use super::{OracleError, SmtOracle};
use crate::{formula::Formula, handler::Operand};
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

pub mod defaults {
    use std::time::Duration;

    pub const TIMEOUT: Duration = Duration::from_secs(60 * 60);
    pub const SANITY_MASK: u64 = 0xffff_ffff;
    pub const EXCLUDED_KEY: u64 = 1;
}

#[derive(Clone, Debug)]
pub struct CegarOptions {
    /// Budget shared by all oracle queries of one recovery.
    pub timeout: Duration,
    /// Keys whose masked value equals `excluded_key` are never proposed.
    pub sanity_mask: u64,
    pub excluded_key: u64,
}

impl Default for CegarOptions {
    fn default() -> Self {
        Self {
            timeout: defaults::TIMEOUT,
            sanity_mask: defaults::SANITY_MASK,
            excluded_key: defaults::EXCLUDED_KEY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyRecovery {
    Solved { key: u64, elapsed: Duration },
    NotSolved { elapsed: Duration },
}

impl KeyRecovery {
    pub fn is_solved(&self) -> bool {
        matches!(self, KeyRecovery::Solved { .. })
    }

    pub fn key(&self) -> Option<u64> {
        match self {
            KeyRecovery::Solved { key, .. } => Some(*key),
            KeyRecovery::NotSolved { .. } => None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            KeyRecovery::Solved { elapsed, .. } | KeyRecovery::NotSolved { elapsed } => *elapsed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CegarState {
    Searching,
    Verifying(u64),
    Solved(u64),
    Failed,
}

fn not_equal(a: Formula, b: Formula) -> Formula {
    Formula::not(Formula::eq(a, b))
}

fn zero() -> Formula {
    Formula::constant(0, 64)
}

/// Alternates between searching a key that makes `candidate` agree with
/// `reference` on some input, and searching an input on which they
/// disagree for that key.
///
/// `candidate` ranges over `x`, `y` and `key`, `reference` over `x` and `y`.
pub struct Cegar<'o, O: SmtOracle> {
    oracle: &'o mut O,
    options: CegarOptions,
}

impl<'o, O: SmtOracle> Cegar<'o, O> {
    pub fn new(oracle: &'o mut O, options: CegarOptions) -> Self {
        Self { oracle, options }
    }

    fn search_constraints(&self, candidate: &Formula, reference: &Formula, refuted: &[u64]) -> Vec<Formula> {
        let key = Operand::Key.variable();

        let mut constraints = vec![
            Formula::eq(candidate.clone(), reference.clone()),
            not_equal(Operand::X.variable(), zero()),
            not_equal(Operand::Y.variable(), zero()),
            not_equal(candidate.clone(), zero()),
            not_equal(
                Formula::and(key.clone(), Formula::constant(self.options.sanity_mask, 64)),
                Formula::constant(self.options.excluded_key, 64),
            ),
        ];
        constraints.extend(
            refuted
                .iter()
                .map(|k| not_equal(key.clone(), Formula::constant(*k, 64))),
        );

        constraints
    }

    fn verify_constraints(&self, candidate: &Formula, reference: &Formula, key: u64) -> Vec<Formula> {
        let bound = HashMap::from([(Operand::Key.variable(), Formula::constant(key, 64))]);

        vec![not_equal(candidate.substitute(&bound), reference.clone())]
    }

    pub fn recover_key(&mut self, candidate: &Formula, reference: &Formula) -> KeyRecovery {
        let start = Instant::now();
        let mut refuted = Vec::new();
        let mut state = CegarState::Searching;
        let mut iteration = 0;

        loop {
            let remaining = self.options.timeout.saturating_sub(start.elapsed());
            let elapsed = start.elapsed();

            state = match state {
                CegarState::Solved(key) => {
                    info!("recovered key {:#x} after {} iterations ({:?})", key, iteration, elapsed);
                    return KeyRecovery::Solved { key, elapsed };
                }
                CegarState::Failed => {
                    info!("no key found after {} iterations ({:?})", iteration, elapsed);
                    return KeyRecovery::NotSolved { elapsed };
                }
                _ if remaining.is_zero() => {
                    warn!("key recovery budget of {:?} exhausted", self.options.timeout);
                    CegarState::Failed
                }
                CegarState::Searching => {
                    iteration += 1;
                    debug!("iteration {}: searching key, {} refuted", iteration, refuted.len());

                    let constraints = self.search_constraints(candidate, reference, &refuted);
                    match self.oracle.check(&constraints, remaining) {
                        Ok(Some(model)) => match model.get(Operand::Key.name()) {
                            Some(key) => CegarState::Verifying(*key),
                            // key does not occur in any constraint
                            None => CegarState::Verifying(0),
                        },
                        Ok(None) => CegarState::Failed,
                        Err(e) => self.failure(e),
                    }
                }
                CegarState::Verifying(key) => {
                    debug!("iteration {}: verifying key {:#x}", iteration, key);

                    let constraints = self.verify_constraints(candidate, reference, key);
                    match self.oracle.check(&constraints, remaining) {
                        Ok(None) => CegarState::Solved(key),
                        Ok(Some(counterexample)) => {
                            debug!("key {:#x} refuted by {:?}", key, counterexample);
                            refuted.push(key);
                            CegarState::Searching
                        }
                        Err(e) => self.failure(e),
                    }
                }
            };
        }
    }

    fn failure(&self, error: OracleError) -> CegarState {
        warn!("oracle failed: {}", error);
        CegarState::Failed
    }
}

/// Recovers a key with which `candidate` is equivalent to `reference` for
/// all `x` and `y`.
pub fn recover_key<O: SmtOracle>(
    oracle: &mut O,
    candidate: &Formula,
    reference: &Formula,
    options: CegarOptions,
) -> KeyRecovery {
    Cegar::new(oracle, options).recover_key(candidate, reference)
}
