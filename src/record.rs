//! Semicolon separated result lines, one per analyzed handler.

use crate::formula::Formula;
use anyhow::{Context, Result};
use std::{
    fmt,
    fs::OpenOptions,
    io::Write,
    path::Path,
    time::Duration,
};

pub const SEPARATOR: char = ';';

fn seconds(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64()
}

/// `instance;#asm_instructions;#sliced_instructions;#paths;time_seconds`
#[derive(Clone, Debug, PartialEq)]
pub struct SliceRecord {
    pub instance: String,
    pub asm_instructions: usize,
    pub sliced_instructions: usize,
    pub paths: usize,
    pub elapsed: Duration,
}

impl fmt::Display for SliceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{};{}",
            self.instance,
            self.asm_instructions,
            self.sliced_instructions,
            self.paths,
            seconds(self.elapsed)
        )
    }
}

/// `instance;#asm_instructions;#visited_instructions;#tainted_instructions;#ir_paths;time_seconds`
#[derive(Clone, Debug, PartialEq)]
pub struct TaintRecord {
    pub instance: String,
    pub asm_instructions: usize,
    pub visited_instructions: usize,
    pub tainted_instructions: usize,
    pub paths: usize,
    pub elapsed: Duration,
}

impl fmt::Display for TaintRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{};{};{}",
            self.instance,
            self.asm_instructions,
            self.visited_instructions,
            self.tainted_instructions,
            self.paths,
            seconds(self.elapsed)
        )
    }
}

/// `instance;solved|not solved;time_seconds`
#[derive(Clone, Debug, PartialEq)]
pub struct SmtRecord {
    pub instance: String,
    pub solved: bool,
    pub elapsed: Duration,
}

impl fmt::Display for SmtRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = if self.solved { "solved" } else { "not solved" };
        write!(f, "{};{};{}", self.instance, outcome, seconds(self.elapsed))
    }
}

/// `instance;simplified|not simplified;#paths;#distinct_semantics;time_seconds;formula`
///
/// The formula is the one matching the reference semantics, or `None`.
#[derive(Clone, Debug, PartialEq)]
pub struct SimplifyRecord {
    pub instance: String,
    pub paths: usize,
    pub distinct_semantics: usize,
    pub elapsed: Duration,
    pub formula: Option<Formula>,
}

impl fmt::Display for SimplifyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = if self.formula.is_some() {
            "simplified"
        } else {
            "not simplified"
        };
        write!(
            f,
            "{};{};{};{};{};",
            self.instance,
            outcome,
            self.paths,
            self.distinct_semantics,
            seconds(self.elapsed)
        )?;
        match &self.formula {
            Some(formula) => write!(f, "{}", formula),
            None => write!(f, "None"),
        }
    }
}

/// Appends `record` as one line to the file at `path`, creating it if
/// needed.
pub fn append<P: AsRef<Path>, R: fmt::Display>(path: P, record: &R) -> Result<()> {
    let path = path.as_ref();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open record file {}", path.display()))?;

    writeln!(file, "{}", record)
        .with_context(|| format!("failed to write record to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_keep_their_order() {
        let slice = SliceRecord {
            instance: "add_0".into(),
            asm_instructions: 40,
            sliced_instructions: 12,
            paths: 3,
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(slice.to_string(), "add_0;40;12;3;1.5");

        let taint = TaintRecord {
            instance: "add_0".into(),
            asm_instructions: 40,
            visited_instructions: 30,
            tainted_instructions: 9,
            paths: 2,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(taint.to_string(), "add_0;40;30;9;2;2");
        assert_eq!(taint.to_string().split(SEPARATOR).count(), 6);
    }

    #[test]
    fn outcomes_are_spelled_out() {
        let smt = SmtRecord {
            instance: "xor_1".into(),
            solved: false,
            elapsed: Duration::from_millis(250),
        };
        assert_eq!(smt.to_string(), "xor_1;not solved;0.25");

        let simplify = SimplifyRecord {
            instance: "xor_1".into(),
            paths: 2,
            distinct_semantics: 1,
            elapsed: Duration::ZERO,
            formula: None,
        };
        assert_eq!(simplify.to_string(), "xor_1;not simplified;2;1;0;None");
    }
}
