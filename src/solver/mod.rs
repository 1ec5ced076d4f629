pub mod cegar;
#[cfg(feature = "z3")]
pub mod z3;

pub use self::cegar::*;
#[cfg(feature = "z3")]
pub use self::z3::*;

use crate::formula::Formula;
use log::debug;
use std::{collections::HashMap, time::Duration};
use strum::{EnumString, EnumVariantNames, IntoStaticStr};
use thiserror::Error;

/// Values of the free variables of a satisfied query, by name.
pub type Model = HashMap<String, u64>;

pub trait SmtOracle {
    fn name() -> &'static str;

    /// Checks whether all `assertions` (one bit formulas) can hold at the
    /// same time. Returns a model if they can, `None` if they cannot.
    fn check(
        &mut self,
        assertions: &[Formula],
        timeout: Duration,
    ) -> Result<Option<Model>, OracleError> {
        debug!(
            "query {} oracle with {} assertions (timeout {:?})",
            Self::name(),
            assertions.len(),
            timeout
        );

        time_debug!("finished oracle query", {
            self.check_impl(assertions, timeout)
        })
    }

    fn check_impl(
        &mut self,
        assertions: &[Formula],
        timeout: Duration,
    ) -> Result<Option<Model>, OracleError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("failed to compute satisfiability within the given limits")]
    SatUnknown,

    #[error("could not decide the query before timing out")]
    Timeout,

    #[error("query not supported by the oracle: {0}")]
    Unsupported(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumVariantNames, IntoStaticStr)]
#[strum(serialize_all = "kebab_case")]
pub enum OracleType {
    None,
    #[cfg(feature = "z3")]
    Z3,
}

/// Oracle used when no SMT solver is compiled in; every query fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOracle;

impl SmtOracle for NoOracle {
    fn name() -> &'static str {
        "none"
    }

    fn check_impl(
        &mut self,
        _assertions: &[Formula],
        _timeout: Duration,
    ) -> Result<Option<Model>, OracleError> {
        Err(OracleError::Unsupported(
            "no SMT solver available, build with feature \"z3\"".to_string(),
        ))
    }
}
