use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use log::{debug, info, warn};
use riscu::Program;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt::Display,
    path::PathBuf,
    time::{Duration, Instant},
};
use vmattack::{
    cli::{args, expect_arg, LOGGING_LEVELS},
    emulate::{EmulatorOptions, TaintEmulator},
    error::EngineError,
    executor::{OutputTracker, Unobserved},
    handler::{handler_address, read_key, Attacker, HandlerContext, Operand, ReferenceOp},
    ir::{ControlFlowGraph, IrProvider},
    lift::{load_program, RiscuProvider},
    path_exploration::{execute_path, ExplorationOptions, LoopPolicy, PathEnumerator},
    record::{append, SimplifyRecord, SliceRecord, SmtRecord, TaintRecord},
    slicing::{BackwardSlicer, SliceTarget},
    solver::{recover_key, CegarOptions, KeyRecovery, NoOracle, OracleType},
    state::{Bindings, SymbolicState},
    taint::{taint_bits, Granularity, InstructionTaint, RegisterMap, TaintReport, TaintSource},
};

fn main() -> Result<()> {
    let matches = args().get_matches();

    let level = expect_arg::<String>(&matches, "verbose")?;
    debug_assert!(LOGGING_LEVELS.contains(&level.as_str()));
    env_logger::Builder::new().parse_filters(level).init();

    match matches.subcommand() {
        Some(("paths", args)) => paths(args),
        Some(("simplify", args)) => simplify(args),
        Some(("slice", args)) => slice(args),
        Some(("taint", args)) => taint(args),
        Some(("smt", args)) => smt(args),
        _ => unreachable!(),
    }
}

/// Everything one analyzed handler needs.
struct Unit {
    instance: String,
    program: Program,
    cfg: ControlFlowGraph,
    context: HandlerContext,
    values: HashMap<Operand, u64>,
    key: Option<u64>,
    attacker: Attacker,
    options: ExplorationOptions,
}

impl Unit {
    fn from_args(args: &ArgMatches, reference: Option<ReferenceOp>) -> Result<Self> {
        let input = expect_arg::<PathBuf>(args, "input-file")?;

        let instance = match args.get_one::<String>("instance") {
            Some(name) => name.clone(),
            None => input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        // without an address the handler is found by index, by default the
        // one implementing the reference semantics
        let handler_index = args
            .get_one::<usize>("handler-index")
            .copied()
            .or_else(|| reference.map(ReferenceOp::handler_index));
        let address = match (args.get_one::<u64>("address"), handler_index) {
            (Some(address), _) => *address,
            (None, Some(index)) => handler_address(input, index)?,
            (None, None) => bail!("pass the handler with --address or --handler-index"),
        };

        let program = load_program(input)?;
        let cfg = RiscuProvider::from_program(&program)
            .lift(address)
            .with_context(|| format!("failed to lift handler at {:#x}", address))?;
        info!("lifted {} blocks from {:#x}", cfg.len(), address);

        let values: HashMap<Operand, u64> = args
            .get_many::<(Operand, u64)>("bind")
            .map(|bindings| bindings.copied().collect())
            .unwrap_or_default();

        let key_index = args
            .get_one::<usize>("key-index")
            .copied()
            .or_else(|| reference.map(ReferenceOp::key_index));
        let key = match (values.get(&Operand::Key), args.get_one::<PathBuf>("bytecode-file"), key_index) {
            (Some(key), _, _) => Some(*key),
            (None, Some(file), Some(index)) => Some(read_key(file, index)?),
            _ => None,
        };

        Ok(Self {
            instance,
            program,
            cfg,
            context: HandlerContext::new(
                *expect_arg::<u64>(args, "context")?,
                *expect_arg::<u64>(args, "bytecode")?,
            ),
            values,
            key,
            attacker: expect_arg::<String>(args, "attacker")?.parse()?,
            options: ExplorationOptions {
                timeout: Some(Duration::from_secs(*expect_arg::<u64>(args, "timeout")?)),
                loop_policy: expect_arg::<String>(args, "loop-policy")?.parse::<LoopPolicy>()?,
            },
        })
    }

    /// Bindings of the configured attacker. A key given with `--bind` is
    /// bound for both attackers.
    fn bindings(&self, attacker: Attacker) -> Result<Bindings> {
        let mut values = self.values.clone();
        if attacker == Attacker::Dynamic {
            match self.key {
                Some(key) => {
                    values.insert(Operand::Key, key);
                }
                None => bail!("a dynamic attacker needs a key, pass --bind key=.. or --bytecode-file"),
            }
        }
        Ok(self.context.bindings(&values))
    }

    fn paths(
        &self,
        attacker: Attacker,
    ) -> Result<PathEnumerator<'_, OutputTracker>> {
        let entry = self.cfg.entry()?;
        let state = SymbolicState::with_bindings(&self.bindings(attacker)?);

        Ok(PathEnumerator::new(
            &self.cfg,
            entry,
            state,
            self.context.output_tracker(),
            self.options.clone(),
        ))
    }

    /// Records are still emitted after the cutoff, over the paths seen so far.
    fn warn_cutoff(&self, paths: &PathEnumerator<'_, OutputTracker>) {
        if let (true, Some(budget)) = (paths.timed_out(), self.options.timeout) {
            warn!("{}, record covers only the enumerated paths", EngineError::Timeout(budget));
        }
    }
}

/// Prints `record` and appends it to the `--output` file, if any.
fn emit<R: Display>(args: &ArgMatches, record: &R) -> Result<()> {
    println!("{}", record);
    match args.get_one::<PathBuf>("output") {
        Some(path) => append(path, record),
        None => Ok(()),
    }
}

fn paths(args: &ArgMatches) -> Result<()> {
    let unit = Unit::from_args(args, None)?;

    for (i, explored) in unit.paths(unit.attacker)?.enumerate() {
        let explored = explored?;
        let blocks: Vec<String> = explored.path.iter().map(|k| k.to_string()).collect();
        let offset = explored
            .observer
            .output_offset()
            .map_or_else(|| String::from("None"), |o| format!("{:#x}", o));

        println!(
            "{};{};{};{};{}",
            unit.instance,
            i,
            blocks.join(","),
            offset,
            unit.context.output(&explored.state)
        );
    }

    Ok(())
}

fn simplify(args: &ArgMatches) -> Result<()> {
    let reference = expect_arg::<String>(args, "reference")?.parse::<ReferenceOp>()?;
    let unit = Unit::from_args(args, Some(reference))?;
    let start = Instant::now();

    let mut paths = 0;
    let mut semantics = HashSet::new();
    let mut enumerator = unit.paths(unit.attacker)?;
    for explored in enumerator.by_ref() {
        let explored = explored?;
        paths += 1;
        semantics.insert(unit.context.output(&explored.state));
    }
    unit.warn_cutoff(&enumerator);

    let expected = reference.formula();
    let record = SimplifyRecord {
        instance: unit.instance.clone(),
        paths,
        distinct_semantics: semantics.len(),
        elapsed: start.elapsed(),
        formula: semantics.into_iter().find(|f| *f == expected),
    };
    emit(args, &record)
}

fn slice(args: &ArgMatches) -> Result<()> {
    let unit = Unit::from_args(args, None)?;
    let start = Instant::now();
    let initial = SymbolicState::with_bindings(&unit.bindings(unit.attacker)?);

    let mut paths = 0;
    let mut sliced = BTreeSet::new();
    let mut enumerator = unit.paths(unit.attacker)?;
    for explored in enumerator.by_ref() {
        let explored = explored?;
        paths += 1;

        let offset = match explored.observer.output_offset() {
            Some(offset) => offset,
            None => {
                warn!("output is not written on path {}", paths - 1);
                continue;
            }
        };

        let result = BackwardSlicer::new(&unit.cfg, &explored.path, initial.clone())?
            .slice(&SliceTarget::Instruction(offset))?;
        for missing in &result.missing {
            warn!("{}", missing);
        }
        sliced.extend(result.offsets);
    }
    unit.warn_cutoff(&enumerator);

    let record = SliceRecord {
        instance: unit.instance.clone(),
        asm_instructions: unit.cfg.native_offsets().len(),
        sliced_instructions: sliced.len(),
        paths,
        elapsed: start.elapsed(),
    };
    debug!("sliced instructions: {:x?}", sliced);
    emit(args, &record)
}

fn taint(args: &ArgMatches) -> Result<()> {
    let granularity = expect_arg::<String>(args, "granularity")?.parse::<Granularity>()?;
    let unit = Unit::from_args(args, None)?;
    let start = Instant::now();
    let initial = SymbolicState::with_bindings(&unit.bindings(unit.attacker)?);

    let sources: Vec<TaintSource> = [Operand::X, Operand::Y, Operand::C, Operand::Key]
        .iter()
        .map(|&operand| TaintSource::Immediate(initial.resolve(&unit.context.location(operand))))
        .collect();

    // every path is replayed on a fresh copy of the loaded program
    let loaded = TaintEmulator::from_program(&unit.program, &EmulatorOptions::default());
    let registers = RegisterMap::new(&loaded);

    let mut paths = 0;
    let mut merged = TaintReport::default();
    let mut enumerator = unit.paths(unit.attacker)?;
    for explored in enumerator.by_ref() {
        let explored = explored?;
        paths += 1;

        let report = match granularity {
            Granularity::Bit => taint_bits(&unit.cfg, &explored.path, initial.clone(), &sources),
            Granularity::Instruction => {
                let mut emulator = loaded.clone();
                InstructionTaint::new(&mut emulator, &registers).taint_path(&unit.cfg, &explored.path, &sources)
            }
        };

        match report {
            Ok(report) => merged.merge(&report),
            Err(e) if !e.is_fatal() => warn!("skipping path {}: {}", paths - 1, e),
            Err(e) => return Err(e.into()),
        }
    }
    unit.warn_cutoff(&enumerator);

    let record = TaintRecord {
        instance: unit.instance.clone(),
        asm_instructions: unit.cfg.native_offsets().len(),
        visited_instructions: merged.visited.len(),
        tainted_instructions: merged.tainted.len(),
        paths,
        elapsed: start.elapsed(),
    };
    emit(args, &record)
}

fn smt(args: &ArgMatches) -> Result<()> {
    let reference = expect_arg::<String>(args, "reference")?.parse::<ReferenceOp>()?;
    let index = *expect_arg::<usize>(args, "path-index")?;
    let oracle = expect_arg::<String>(args, "solver")?.parse::<OracleType>()?;
    let options = CegarOptions {
        timeout: Duration::from_millis(*expect_arg::<u64>(args, "timeout-ms")?),
        ..Default::default()
    };
    let unit = Unit::from_args(args, Some(reference))?;

    // find a path the handler takes for its actual key, then analyze that
    // path with the key left free
    let attacker = if unit.key.is_some() {
        Attacker::Dynamic
    } else {
        Attacker::Static
    };
    let explored = match unit.paths(attacker)?.nth(index) {
        Some(explored) => explored?,
        None => bail!("handler has no path with index {}", index),
    };

    let mut values = unit.values.clone();
    values.remove(&Operand::Key);
    let mut state = SymbolicState::with_bindings(&unit.context.bindings(&values));
    execute_path(&unit.cfg, &explored.path, &mut state, &mut Unobserved)?;
    let candidate = unit.context.output(&state);
    info!("candidate semantics: {}", candidate);

    let recovery = match oracle {
        OracleType::None => recover_key(&mut NoOracle, &candidate, &reference.formula(), options),
        #[cfg(feature = "z3")]
        OracleType::Z3 => recover_key(
            &mut vmattack::solver::Z3Oracle::new(),
            &candidate,
            &reference.formula(),
            options,
        ),
    };
    if let KeyRecovery::Solved { key, .. } = recovery {
        info!("recovered key {:#x}", key);
    }

    let record = SmtRecord {
        instance: unit.instance.clone(),
        solved: recovery.is_solved(),
        elapsed: recovery.elapsed(),
    };
    emit(args, &record)
}
