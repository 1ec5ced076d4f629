//! Operands of a virtual-machine handler and the semantics handlers are
//! expected to implement.

use crate::{
    executor::OutputTracker,
    formula::Formula,
    ir::Location,
    state::{Bindings, SymbolicState},
};
use anyhow::{anyhow, ensure, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use goblin::elf::Elf;
use log::debug;
use std::{collections::HashMap, fs, path::Path};
use strum::{EnumString, EnumVariantNames, IntoStaticStr};

/// Size of one bytecode instruction in bytes.
pub const BYTECODE_RECORD_SIZE: usize = 24;

const KEY_OFFSET: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Operand {
    Output,
    X,
    Y,
    C,
    Key,
}

impl Operand {
    pub const ALL: [Operand; 5] = [
        Operand::Output,
        Operand::X,
        Operand::Y,
        Operand::C,
        Operand::Key,
    ];

    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Free variable standing for the operand.
    pub fn variable(self) -> Formula {
        Formula::id(self.name(), 64)
    }
}

/// Whether the attacker knows the key of the analyzed instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumVariantNames, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Attacker {
    Static,
    Dynamic,
}

/// Where a handler finds its operands.
///
/// The virtual instruction pointer is stored at `context + 8` and holds an
/// offset into the bytecode. Register operands are 16 bit indices into the
/// context at bytecode offsets 0 (output), 2 (x) and 4 (y), scaled by 8;
/// `c` and the key are 64 bit immediates at offsets 6 and 14.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerContext {
    pub context_address: u64,
    pub bytecode_address: u64,
}

impl HandlerContext {
    pub fn new(context_address: u64, bytecode_address: u64) -> Self {
        Self {
            context_address,
            bytecode_address,
        }
    }

    fn context(&self) -> Formula {
        Formula::constant(self.context_address, 64)
    }

    fn vip(&self) -> Formula {
        Formula::mem(
            Formula::add(self.context(), Formula::constant(8, 64)),
            64,
        )
    }

    fn bytecode_operand(&self, displacement: u64) -> Formula {
        Formula::add(
            self.vip(),
            Formula::constant(self.bytecode_address.wrapping_add(displacement), 64),
        )
    }

    fn register_operand(&self, displacement: u64) -> Formula {
        let index = Formula::zero_extend(Formula::mem(self.bytecode_operand(displacement), 16), 64);
        Formula::add(
            Formula::mul(index, Formula::constant(8, 64)),
            self.context(),
        )
    }

    pub fn address(&self, operand: Operand) -> Formula {
        match operand {
            Operand::Output => self.register_operand(0),
            Operand::X => self.register_operand(2),
            Operand::Y => self.register_operand(4),
            Operand::C => self.bytecode_operand(6),
            Operand::Key => self.bytecode_operand(14),
        }
    }

    pub fn location(&self, operand: Operand) -> Location {
        Location::memory(self.address(operand), 64)
    }

    /// Every operand bound to its free variable, or to a concrete value if
    /// one is given.
    pub fn bindings(&self, values: &HashMap<Operand, u64>) -> Bindings {
        Operand::ALL
            .iter()
            .map(|&operand| {
                let value = match values.get(&operand) {
                    Some(v) => Formula::constant(*v, 64),
                    None => operand.variable(),
                };
                (self.location(operand), value)
            })
            .collect()
    }

    /// Bindings for the given attacker: a dynamic attacker knows the key.
    pub fn attacker_bindings(&self, attacker: Attacker, key: Option<u64>) -> Bindings {
        let mut values = HashMap::new();
        if let (Attacker::Dynamic, Some(key)) = (attacker, key) {
            values.insert(Operand::Key, key);
        }
        self.bindings(&values)
    }

    /// Formula stored in the output operand.
    pub fn output(&self, state: &SymbolicState) -> Formula {
        state.read(&self.location(Operand::Output))
    }

    pub fn output_tracker(&self) -> OutputTracker {
        OutputTracker::new(
            self.address(Operand::Output),
            vec![
                (Operand::X.name().to_string(), self.address(Operand::X)),
                (Operand::Y.name().to_string(), self.address(Operand::Y)),
            ],
        )
    }
}

/// Key of the `index`-th (1-based) bytecode instruction: the little-endian
/// last 8 bytes of its 24 byte record.
pub fn key_from_bytecode(bytecode: &[u8], index: usize) -> Result<u64> {
    ensure!(index > 0, "bytecode instructions are counted from 1");

    let start = BYTECODE_RECORD_SIZE * (index - 1) + KEY_OFFSET;
    let end = BYTECODE_RECORD_SIZE * index;
    ensure!(
        end <= bytecode.len(),
        "bytecode of {} bytes has no instruction {}",
        bytecode.len(),
        index
    );

    Ok(LittleEndian::read_u64(&bytecode[start..end]))
}

pub fn read_key<P: AsRef<Path>>(path: P, index: usize) -> Result<u64> {
    let bytecode = fs::read(path.as_ref())
        .with_context(|| format!("could not read bytecode {}", path.as_ref().display()))?;

    key_from_bytecode(&bytecode, index)
}

/// Symbol of the `index`-th handler. Only the first handler of a generated
/// virtual machine is not generated itself.
pub fn handler_symbol(index: usize) -> String {
    match index {
        1 => String::from("vm_alu1_rrr"),
        i => format!("vm_alu{}_rrr_generated", i),
    }
}

/// Address of the `index`-th handler, looked up in the symbol table of the
/// binary.
pub fn handler_address<P: AsRef<Path>>(path: P, index: usize) -> Result<u64> {
    let path = path.as_ref();
    let image = fs::read(path).with_context(|| format!("could not read binary {}", path.display()))?;
    let elf = Elf::parse(&image).with_context(|| format!("{} is not an ELF file", path.display()))?;

    let symbol = handler_symbol(index);
    let address = elf
        .syms
        .iter()
        .find(|sym| elf.strtab.get_at(sym.st_name) == Some(symbol.as_str()))
        .map(|sym| sym.st_value)
        .ok_or_else(|| anyhow!("{} has no symbol {}", path.display(), symbol))?;

    debug!("{} at {:#x}", symbol, address);
    Ok(address)
}

/// Core semantics a handler may implement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumVariantNames, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ReferenceOp {
    Add,
    Sub,
    Xor,
    Or,
    And,
    Mul,
    Shl,
}

impl ReferenceOp {
    pub const ALL: [ReferenceOp; 7] = [
        ReferenceOp::Add,
        ReferenceOp::Sub,
        ReferenceOp::Xor,
        ReferenceOp::Or,
        ReferenceOp::And,
        ReferenceOp::Mul,
        ReferenceOp::Shl,
    ];

    /// The operation over the free variables `x` and `y`.
    pub fn formula(self) -> Formula {
        let x = Operand::X.variable();
        let y = Operand::Y.variable();

        match self {
            ReferenceOp::Add => Formula::add(x, y),
            ReferenceOp::Sub => Formula::sub(x, y),
            ReferenceOp::Xor => Formula::xor(x, y),
            ReferenceOp::Or => Formula::or(x, y),
            ReferenceOp::And => Formula::and(x, y),
            ReferenceOp::Mul => Formula::mul(x, y),
            ReferenceOp::Shl => {
                let amount = Formula::zero_extend(Formula::slice(y, 0, 8), 64);
                Formula::shl(x, Formula::and(amount, Formula::constant(0x3f, 64)))
            }
        }
    }

    /// Position of the handler implementing the operation in the handler
    /// table of the generated virtual machines.
    pub fn handler_index(self) -> usize {
        match self {
            ReferenceOp::Add => 2,
            ReferenceOp::Sub => 3,
            ReferenceOp::Xor => 4,
            ReferenceOp::Or => 5,
            ReferenceOp::And => 6,
            ReferenceOp::Mul => 7,
            ReferenceOp::Shl => 8,
        }
    }

    /// Bytecode instruction whose key belongs to the operation's handler.
    pub fn key_index(self) -> usize {
        match self {
            ReferenceOp::Add => 4,
            ReferenceOp::Sub => 8,
            ReferenceOp::Xor => 12,
            ReferenceOp::Or => 16,
            ReferenceOp::And => 23,
            ReferenceOp::Mul => 29,
            ReferenceOp::Shl => 35,
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}
