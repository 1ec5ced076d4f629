//! Concrete RISC-U emulator propagating register and byte taint, used to
//! replay native instructions for instruction-level taint analysis.

use crate::{
    error::{EngineError, Result},
    lift::{register_name, RiscuProvider},
    taint::NativeEmulator,
};
use byteorder::{ByteOrder, LittleEndian};
use bytesize::ByteSize;
use log::{debug, trace};
use riscu::{types::*, Instruction, Program, Register};
use std::collections::{HashMap, HashSet};

pub type EmulatorValue = u64;

pub const NUMBER_OF_REGISTERS: usize = 32;

pub mod defaults {
    use super::*;

    pub const MEMORY_SIZE: ByteSize = ByteSize::gib(4);
}

#[derive(Clone, Debug)]
pub struct EmulatorOptions {
    /// Accesses at or above this address are rejected.
    pub memory_size: ByteSize,
}

impl Default for EmulatorOptions {
    fn default() -> Self {
        Self {
            memory_size: defaults::MEMORY_SIZE,
        }
    }
}

/// Emulator state with one taint bit per register and per memory byte.
///
/// Memory is sparse and reads of unwritten bytes yield zero. Instructions
/// are executed at the address they are asked for, the program counter
/// only matters for pc-relative semantics.
#[derive(Clone, Debug)]
pub struct TaintEmulator {
    code: RiscuProvider,
    memory_size: u64,
    registers: Vec<EmulatorValue>,
    register_taint: Vec<bool>,
    memory: HashMap<u64, u8>,
    memory_taint: HashSet<u64>,
    program_counter: EmulatorValue,
    observed: bool,
}

impl TaintEmulator {
    pub fn new(code: RiscuProvider, options: &EmulatorOptions) -> Self {
        let memory_size = options.memory_size.as_u64();
        let mut emulator = Self {
            code,
            memory_size,
            registers: vec![0; NUMBER_OF_REGISTERS],
            register_taint: vec![false; NUMBER_OF_REGISTERS],
            memory: HashMap::new(),
            memory_taint: HashSet::new(),
            program_counter: 0,
            observed: false,
        };
        emulator.registers[Register::Sp as usize] = memory_size;

        emulator
    }

    /// Emulator over the code segment of `program`, with its data segment
    /// loaded into memory.
    pub fn from_program(program: &Program, options: &EmulatorOptions) -> Self {
        let mut emulator = Self::new(RiscuProvider::from_program(program), options);
        emulator.copy_mem(program.data.address, &program.data.content);
        emulator
    }

    pub fn copy_mem(&mut self, address: u64, content: &[u8]) {
        for (i, byte) in content.iter().enumerate() {
            self.memory.insert(address.wrapping_add(i as u64), *byte);
        }
        debug!("copied {} bytes to {:#x}", content.len(), address);
    }

    pub fn get_reg(&self, reg: Register) -> EmulatorValue {
        self.registers[reg as usize]
    }

    pub fn set_reg(&mut self, reg: Register, value: EmulatorValue) {
        self.set_reg_tainted(reg, value, false);
    }

    pub fn is_tainted(&self, reg: Register) -> bool {
        self.register_taint[reg as usize]
    }

    pub fn is_mem_tainted(&self, address: u64) -> bool {
        self.memory_taint.contains(&address)
    }

    fn set_reg_tainted(&mut self, reg: Register, value: EmulatorValue, tainted: bool) {
        if reg != Register::Zero {
            self.registers[reg as usize] = value;
            self.register_taint[reg as usize] = tainted;
        }
    }

    /// Reads a register for an instruction, noting whether it was tainted.
    fn operand(&mut self, reg: Register) -> (EmulatorValue, bool) {
        let tainted = self.register_taint[reg as usize];
        self.observed |= tainted;
        (self.registers[reg as usize], tainted)
    }

    fn check_address(&self, address: u64, size: usize) -> Result<()> {
        if address.checked_add(size as u64).map_or(true, |end| end > self.memory_size) {
            return Err(EngineError::UnsupportedExpression(format!(
                "access of {} bytes at {:#x} outside of {} emulated memory",
                size,
                address,
                ByteSize(self.memory_size)
            )));
        }
        Ok(())
    }

    fn get_mem(&mut self, address: u64, size: usize) -> Result<(EmulatorValue, bool)> {
        self.check_address(address, size)?;
        let mut bytes = [0_u8; 8];
        let mut tainted = false;
        for i in 0..size {
            let a = address + i as u64;
            bytes[i] = self.memory.get(&a).copied().unwrap_or(0);
            tainted |= self.memory_taint.contains(&a);
        }
        self.observed |= tainted;
        Ok((LittleEndian::read_uint(&bytes, size), tainted))
    }

    fn set_mem(&mut self, address: u64, size: usize, value: EmulatorValue, tainted: bool) -> Result<()> {
        self.check_address(address, size)?;
        let mut bytes = [0_u8; 8];
        LittleEndian::write_uint(&mut bytes, value & crate::util::mask(size as u32 * 8), size);
        for (i, byte) in bytes[..size].iter().enumerate() {
            let a = address + i as u64;
            self.memory.insert(a, *byte);
            if tainted {
                self.memory_taint.insert(a);
            } else {
                self.memory_taint.remove(&a);
            }
        }
        Ok(())
    }

    fn fetch(&self, address: u64) -> Result<Instruction> {
        self.code.fetch(address).map_err(|e| match e {
            EngineError::LiftingFailure { reason, .. } => EngineError::UnsupportedExpression(
                format!("cannot replay instruction at {:#x}: {}", address, reason),
            ),
            e => e,
        })
    }
}

impl NativeEmulator for TaintEmulator {
    fn register_names(&self) -> Vec<String> {
        (0..NUMBER_OF_REGISTERS as u32)
            .map(|r| register_name(Register::from(r)))
            .collect()
    }

    fn taint_register(&mut self, register: usize) -> Result<()> {
        if register >= NUMBER_OF_REGISTERS {
            return Err(EngineError::UnsupportedExpression(format!(
                "no register with id {}",
                register
            )));
        }
        if register != Register::Zero as usize {
            trace!("tainting {:?}", Register::from(register as u32));
            self.register_taint[register] = true;
        }
        Ok(())
    }

    fn step(&mut self, address: u64) -> Result<bool> {
        let instruction = self.fetch(address)?;
        self.program_counter = address;
        self.observed = false;

        execute(self, instruction)?;

        Ok(self.observed)
    }
}

fn execute(state: &mut TaintEmulator, instruction: Instruction) -> Result<()> {
    match instruction {
        // rd = imm << 12
        Instruction::Lui(utype) => exec_lui(state, utype),
        // rd = pc + (imm << 12)
        Instruction::Auipc(utype) => exec_auipc(state, utype),
        // rd = pc + 4
        Instruction::Jal(jtype) => exec_jal(state, jtype),
        // rd = pc + 4, reads rs1
        Instruction::Jalr(itype) => exec_jalr(state, itype),
        Instruction::Beq(btype) => exec_branch(state, "beq", btype, |a, b| a == b),
        Instruction::Bne(btype) => exec_branch(state, "bne", btype, |a, b| a != b),
        Instruction::Blt(btype) => exec_branch(state, "blt", btype, |a, b| (a as i64) < (b as i64)),
        Instruction::Bge(btype) => exec_branch(state, "bge", btype, |a, b| (a as i64) >= (b as i64)),
        Instruction::Bltu(btype) => exec_branch(state, "bltu", btype, |a, b| a < b),
        Instruction::Bgeu(btype) => exec_branch(state, "bgeu", btype, |a, b| a >= b),
        // rd = s64(mem[rs1 + s64(imm{12})]) or z64(..) for the unsigned loads
        Instruction::Lb(itype) => return exec_load(state, "lb", itype, 1, true),
        Instruction::Lh(itype) => return exec_load(state, "lh", itype, 2, true),
        Instruction::Lw(itype) => return exec_load(state, "lw", itype, 4, true),
        Instruction::Ld(itype) => return exec_load(state, "ld", itype, 8, false),
        Instruction::Lbu(itype) => return exec_load(state, "lbu", itype, 1, false),
        Instruction::Lhu(itype) => return exec_load(state, "lhu", itype, 2, false),
        // mem[rs1 + s64(imm{12})] = rs2
        Instruction::Sb(stype) => return exec_store(state, "sb", stype, 1),
        Instruction::Sh(stype) => return exec_store(state, "sh", stype, 2),
        Instruction::Sw(stype) => return exec_store(state, "sw", stype, 4),
        Instruction::Sd(stype) => return exec_store(state, "sd", stype, 8),
        // rd = rs1 op s64(imm{12})
        Instruction::Addi(itype) => exec_itype(state, "addi", itype, u64::wrapping_add),
        Instruction::Sltiu(itype) => exec_itype(state, "sltiu", itype, |a, b| (a < b) as u64),
        Instruction::Xori(itype) => exec_itype(state, "xori", itype, |a, b| a ^ b),
        Instruction::Ori(itype) => exec_itype(state, "ori", itype, |a, b| a | b),
        Instruction::Andi(itype) => exec_itype(state, "andi", itype, |a, b| a & b),
        Instruction::Slli(itype) => exec_itype(state, "slli", itype, |a, b| a.wrapping_shl(b as u32)),
        Instruction::Srli(itype) => exec_itype(state, "srli", itype, |a, b| a.wrapping_shr(b as u32)),
        Instruction::Srai(itype) => {
            exec_itype(state, "srai", itype, |a, b| (a as i64).wrapping_shr(b as u32) as u64)
        }
        // rd = s64(rs1{32} op imm)
        Instruction::Addiw(itype) => {
            exec_itype(state, "addiw", itype, |a, b| (a as i32).wrapping_add(b as i32) as u64)
        }
        Instruction::Slliw(itype) => {
            exec_itype(state, "slliw", itype, |a, b| (a as i32).wrapping_shl(b as u32) as u64)
        }
        Instruction::Srliw(itype) => exec_itype(state, "srliw", itype, |a, b| {
            (a as u32).wrapping_shr(b as u32) as i32 as u64
        }),
        Instruction::Sraiw(itype) => {
            exec_itype(state, "sraiw", itype, |a, b| (a as i32).wrapping_shr(b as u32) as u64)
        }
        // rd = rs1 op rs2
        Instruction::Add(rtype) => exec_rtype(state, "add", rtype, u64::wrapping_add),
        Instruction::Sub(rtype) => exec_rtype(state, "sub", rtype, u64::wrapping_sub),
        Instruction::Sll(rtype) => exec_rtype(state, "sll", rtype, |a, b| a.wrapping_shl(b as u32)),
        Instruction::Slt(rtype) => exec_rtype(state, "slt", rtype, |a, b| ((a as i64) < (b as i64)) as u64),
        Instruction::Sltu(rtype) => exec_rtype(state, "sltu", rtype, |a, b| (a < b) as u64),
        Instruction::Srl(rtype) => exec_rtype(state, "srl", rtype, |a, b| a.wrapping_shr(b as u32)),
        Instruction::Sra(rtype) => {
            exec_rtype(state, "sra", rtype, |a, b| (a as i64).wrapping_shr(b as u32) as u64)
        }
        Instruction::Or(rtype) => exec_rtype(state, "or", rtype, |a, b| a | b),
        Instruction::And(rtype) => exec_rtype(state, "and", rtype, |a, b| a & b),
        Instruction::Mul(rtype) => exec_rtype(state, "mul", rtype, u64::wrapping_mul),
        // division by zero follows the ISA: all ones for quotients, the
        // dividend for remainders
        Instruction::Div(rtype) => exec_rtype(state, "div", rtype, |a, b| {
            (a as i64).checked_div(b as i64).map_or(u64::MAX, |q| q as u64)
        }),
        Instruction::Divu(rtype) => {
            exec_rtype(state, "divu", rtype, |a, b| a.checked_div(b).unwrap_or(u64::MAX))
        }
        Instruction::Rem(rtype) => exec_rtype(state, "rem", rtype, |a, b| {
            (a as i64).checked_rem(b as i64).map_or(a, |r| r as u64)
        }),
        Instruction::Remu(rtype) => exec_rtype(state, "remu", rtype, |a, b| a.checked_rem(b).unwrap_or(a)),
        // rd = s64(rs1{32} op rs2{32})
        Instruction::Addw(rtype) => {
            exec_rtype(state, "addw", rtype, |a, b| (a as i32).wrapping_add(b as i32) as u64)
        }
        Instruction::Subw(rtype) => {
            exec_rtype(state, "subw", rtype, |a, b| (a as i32).wrapping_sub(b as i32) as u64)
        }
        Instruction::Sllw(rtype) => {
            exec_rtype(state, "sllw", rtype, |a, b| (a as i32).wrapping_shl(b as u32) as u64)
        }
        Instruction::Mulw(rtype) => {
            exec_rtype(state, "mulw", rtype, |a, b| (a as i32).wrapping_mul(b as i32) as u64)
        }
        Instruction::Divw(rtype) => exec_rtype(state, "divw", rtype, |a, b| {
            (a as i32).checked_div(b as i32).map_or(u64::MAX, |q| q as u64)
        }),
        Instruction::Remw(rtype) => exec_rtype(state, "remw", rtype, |a, b| {
            (a as i32).checked_rem(b as i32).map_or(a as i32 as u64, |r| r as u64)
        }),
        // system calls are not replayed
        Instruction::Ecall(_) => trace!("pc={:#x}: ecall", state.program_counter),
    }

    Ok(())
}

fn exec_lui(state: &mut TaintEmulator, utype: UType) {
    let rd_value = ((utype.imm() as i32) << 12) as u64;
    trace_utype(state, "lui", utype, rd_value);
    state.set_reg(utype.rd(), rd_value);
}

fn exec_auipc(state: &mut TaintEmulator, utype: UType) {
    let rd_value = (((utype.imm() as i32) << 12) as u64).wrapping_add(state.program_counter);
    trace_utype(state, "auipc", utype, rd_value);
    state.set_reg(utype.rd(), rd_value);
}

fn exec_jal(state: &mut TaintEmulator, jtype: JType) {
    let rd_value = state.program_counter + riscu::INSTRUCTION_SIZE as u64;
    trace_jtype(state, "jal", jtype, rd_value);
    state.set_reg(jtype.rd(), rd_value);
}

fn exec_jalr(state: &mut TaintEmulator, itype: IType) {
    state.operand(itype.rs1());
    let rd_value = state.program_counter + riscu::INSTRUCTION_SIZE as u64;
    trace_itype(state, "jalr", itype, rd_value);
    state.set_reg(itype.rd(), rd_value);
}

fn exec_branch(state: &mut TaintEmulator, mne: &str, btype: BType, f: fn(u64, u64) -> bool) {
    let (rs1_value, _) = state.operand(btype.rs1());
    let (rs2_value, _) = state.operand(btype.rs2());
    trace_btype(state, mne, btype, f(rs1_value, rs2_value));
}

fn exec_load(state: &mut TaintEmulator, mne: &str, itype: IType, size: usize, signed: bool) -> Result<()> {
    let (rs1_value, _) = state.operand(itype.rs1());
    let address = rs1_value.wrapping_add(itype.imm() as u64);
    let (value, tainted) = state.get_mem(address, size)?;
    let rd_value = if signed {
        crate::util::sign_extend(value, size as u32 * 8)
    } else {
        value
    };
    trace_itype(state, mne, itype, rd_value);
    state.set_reg_tainted(itype.rd(), rd_value, tainted);
    Ok(())
}

fn exec_store(state: &mut TaintEmulator, mne: &str, stype: SType, size: usize) -> Result<()> {
    let (rs1_value, _) = state.operand(stype.rs1());
    let (rs2_value, tainted) = state.operand(stype.rs2());
    let address = rs1_value.wrapping_add(stype.imm() as u64);
    trace_stype(state, mne, stype, address);
    state.set_mem(address, size, rs2_value, tainted)
}

fn exec_itype(state: &mut TaintEmulator, mne: &str, itype: IType, f: fn(u64, u64) -> u64) {
    let (rs1_value, tainted) = state.operand(itype.rs1());
    let rd_value = f(rs1_value, itype.imm() as u64);
    trace_itype(state, mne, itype, rd_value);
    state.set_reg_tainted(itype.rd(), rd_value, tainted);
}

fn exec_rtype(state: &mut TaintEmulator, mne: &str, rtype: RType, f: fn(u64, u64) -> u64) {
    let (rs1_value, rs1_tainted) = state.operand(rtype.rs1());
    let (rs2_value, rs2_tainted) = state.operand(rtype.rs2());
    let rd_value = f(rs1_value, rs2_value);
    trace_rtype(state, mne, rtype, rd_value);
    state.set_reg_tainted(rtype.rd(), rd_value, rs1_tainted || rs2_tainted);
}

fn trace_btype(state: &TaintEmulator, mne: &str, btype: BType, condition: bool) {
    trace!(
        "pc={:#x}: {} {:?},{:?},{}: {:?}={:#x}, {:?}={:#x} |- {}",
        state.program_counter,
        mne,
        btype.rs1(),
        btype.rs2(),
        btype.imm(),
        btype.rs1(),
        state.get_reg(btype.rs1()),
        btype.rs2(),
        state.get_reg(btype.rs2()),
        condition
    );
}

fn trace_itype(state: &TaintEmulator, mne: &str, itype: IType, rd_value: EmulatorValue) {
    trace!(
        "pc={:#x}: {} {:?},{:?},{}: {:?}={:#x} |- {:?}={:#x} -> {:?}={:#x}",
        state.program_counter,
        mne,
        itype.rd(),
        itype.rs1(),
        itype.imm(),
        itype.rs1(),
        state.get_reg(itype.rs1()),
        itype.rd(),
        state.get_reg(itype.rd()),
        itype.rd(),
        rd_value
    );
}

fn trace_jtype(state: &TaintEmulator, mne: &str, jtype: JType, rd_value: EmulatorValue) {
    trace!(
        "pc={:#x}: {} {:?},{}: |- {:?}={:#x} -> {:?}={:#x}",
        state.program_counter,
        mne,
        jtype.rd(),
        jtype.imm(),
        jtype.rd(),
        state.get_reg(jtype.rd()),
        jtype.rd(),
        rd_value
    );
}

fn trace_rtype(state: &TaintEmulator, mne: &str, rtype: RType, rd_value: EmulatorValue) {
    trace!(
        "pc={:#x}: {} {:?},{:?},{:?}: {:?}={:#x}, {:?}={:#x} |- {:?}={:#x} -> {:?}={:#x}",
        state.program_counter,
        mne,
        rtype.rd(),
        rtype.rs1(),
        rtype.rs2(),
        rtype.rs1(),
        state.get_reg(rtype.rs1()),
        rtype.rs2(),
        state.get_reg(rtype.rs2()),
        rtype.rd(),
        state.get_reg(rtype.rd()),
        rtype.rd(),
        rd_value
    );
}

fn trace_stype(state: &TaintEmulator, mne: &str, stype: SType, address: EmulatorValue) {
    trace!(
        "pc={:#x}: {} {:?},{}({:?}): {:?}={:#x}, {:?}={:#x} |- mem[{:#x}]",
        state.program_counter,
        mne,
        stype.rs2(),
        stype.imm(),
        stype.rs1(),
        stype.rs1(),
        state.get_reg(stype.rs1()),
        stype.rs2(),
        state.get_reg(stype.rs2()),
        address,
    );
}

fn trace_utype(state: &TaintEmulator, mne: &str, utype: UType, rd_value: EmulatorValue) {
    trace!(
        "pc={:#x}: {} {:?},{:#x}: |- {:?}={:#x} -> {:?}={:#x}",
        state.program_counter,
        mne,
        utype.rd(),
        utype.imm(),
        utype.rd(),
        state.get_reg(utype.rd()),
        utype.rd(),
        rd_value
    );
}
