use crate::{
    handler::{Attacker, Operand, ReferenceOp},
    path_exploration::LoopPolicy,
    solver::OracleType,
    taint::Granularity,
};
use anyhow::{anyhow, Result};
use clap::{command, value_parser, Arg, ArgAction, ArgMatches, Command};
use regex::Regex;
use std::path::PathBuf;
use strum::VariantNames;

pub const LOGGING_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn expect_arg<'a, T: Clone + Send + Sync + 'static>(m: &'a ArgMatches, arg: &str) -> Result<&'a T> {
    m.get_one::<T>(arg)
        .ok_or_else(|| anyhow!("argument \"{}\" has to be set in CLI at all times", arg))
}

pub fn parse_hex(v: &str) -> Result<u64, String> {
    let digits = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")).unwrap_or(v);
    u64::from_str_radix(digits, 16).map_err(|e| format!("\"{}\" is not a hex address: {}", v, e))
}

/// Parses `name=value`, where name is a handler operand and value a
/// decimal or `0x` prefixed hex number.
pub fn parse_binding(v: &str) -> Result<(Operand, u64), String> {
    let pattern = Regex::new(r"^(output|x|y|c|key)=(0[xX][0-9a-fA-F]+|[0-9]+)$")
        .map_err(|e| e.to_string())?;
    let captures = pattern
        .captures(v)
        .ok_or_else(|| format!("\"{}\" is not of the form <operand>=<value>", v))?;

    let operand = captures[1].parse::<Operand>().map_err(|e| e.to_string())?;
    let value = match captures[2].strip_prefix("0x").or_else(|| captures[2].strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => captures[2].parse::<u64>(),
    }
    .map_err(|e| e.to_string())?;

    Ok((operand, value))
}

fn is_positive(v: &str) -> Result<usize, String> {
    match v.parse::<usize>() {
        Ok(0) => Err(String::from("counting starts at 1")),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn handler_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("input-file")
                .help("Binary containing the handler")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("address")
                .help("Entry address of the handler")
                .short('a')
                .long("address")
                .value_name("HEX")
                .value_parser(parse_hex),
        )
        .arg(
            Arg::new("handler-index")
                .help("Handler to analyze, resolved through the symbol table of the binary")
                .long("handler-index")
                .value_name("NUMBER")
                .value_parser(is_positive)
                .conflicts_with("address"),
        )
        .arg(
            Arg::new("context")
                .help("Address of the virtual machine context")
                .long("context")
                .value_name("HEX")
                .value_parser(parse_hex)
                .required(true),
        )
        .arg(
            Arg::new("bytecode")
                .help("Address of the bytecode")
                .long("bytecode")
                .value_name("HEX")
                .value_parser(parse_hex)
                .required(true),
        )
        .arg(
            Arg::new("instance")
                .help("Name of the instance in the emitted record [default: file name of the binary]")
                .short('i')
                .long("instance")
                .value_name("NAME"),
        )
        .arg(
            Arg::new("attacker")
                .help("A dynamic attacker knows the key of the instance")
                .long("attacker")
                .value_name("ATTACKER")
                .value_parser(Attacker::VARIANTS.to_vec())
                .default_value("static"),
        )
        .arg(
            Arg::new("bytecode-file")
                .help("Bytecode the keys are read from")
                .long("bytecode-file")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("key-index")
                .help("Bytecode instruction (1-based) holding the key")
                .long("key-index")
                .value_name("NUMBER")
                .value_parser(is_positive),
        )
        .arg(
            Arg::new("bind")
                .help("Bind an operand to a concrete value")
                .short('b')
                .long("bind")
                .value_name("OPERAND=VALUE")
                .value_parser(parse_binding)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("timeout")
                .help("Cutoff for path enumeration in seconds")
                .short('t')
                .long("timeout")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64))
                .default_value("3600"),
        )
        .arg(
            Arg::new("output")
                .help("Append the record to this file as well")
                .short('o')
                .long("output")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("loop-policy")
                .help("Handling of back edges during path enumeration")
                .long("loop-policy")
                .value_name("POLICY")
                .value_parser(LoopPolicy::VARIANTS.to_vec())
                .default_value("prune"),
        )
}

fn reference_arg() -> Arg {
    Arg::new("reference")
        .help("Core semantics the handler is expected to implement")
        .short('r')
        .long("reference")
        .value_name("OPERATION")
        .value_parser(ReferenceOp::VARIANTS.to_vec())
        .default_value("add")
}

pub fn args() -> Command {
    command!()
        .arg(
            Arg::new("verbose")
                .help("configure logging level to use")
                .short('v')
                .long("verbose")
                .value_name("LEVEL")
                .value_parser(LOGGING_LEVELS)
                .default_value(LOGGING_LEVELS[2])
                .global(true),
        )
        .subcommand(handler_args(
            Command::new("paths")
                .about("Enumerate the paths of a handler and print their output semantics"),
        ))
        .subcommand(
            handler_args(
                Command::new("simplify")
                    .about("Check whether symbolic execution reveals the core semantics of a handler"),
            )
            .arg(reference_arg()),
        )
        .subcommand(handler_args(
            Command::new("slice")
                .about("Slice every path backwards from the instruction writing the output"),
        ))
        .subcommand(
            handler_args(
                Command::new("taint").about("Taint the operands of a handler along every path"),
            )
            .arg(
                Arg::new("granularity")
                    .help("Track taint on single bits or on whole registers of a native emulator")
                    .short('g')
                    .long("granularity")
                    .value_name("GRANULARITY")
                    .value_parser(Granularity::VARIANTS.to_vec())
                    .default_value("bit"),
            ),
        )
        .subcommand(
            handler_args(
                Command::new("smt").about("Recover the key of a handler with counter-example guided search"),
            )
            .arg(reference_arg())
            .arg(
                Arg::new("path-index")
                    .help("Path (0-based, in enumeration order) whose semantics is analyzed")
                    .long("path-index")
                    .value_name("NUMBER")
                    .value_parser(value_parser!(usize))
                    .default_value("0"),
            )
            .arg(
                Arg::new("timeout-ms")
                    .help("Budget for all solver queries in milliseconds")
                    .long("timeout-ms")
                    .value_name("MILLISECONDS")
                    .value_parser(value_parser!(u64))
                    .default_value("3600000"),
            )
            .arg(
                Arg::new("solver")
                    .help("SMT solver")
                    .short('s')
                    .long("solver")
                    .value_name("SOLVER")
                    .value_parser(OracleType::VARIANTS.to_vec())
                    .default_value(OracleType::VARIANTS[OracleType::VARIANTS.len() - 1]),
            ),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
}
