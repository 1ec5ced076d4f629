//! Lifts RISC-U machine code into control-flow graphs of
//! micro-assignments.

use crate::{
    error::{EngineError, Result},
    formula::Formula,
    ir::{Assignment, BasicBlock, BlockKey, ControlFlowGraph, IrProvider, Location},
};
use anyhow::Context;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use riscu::{decode, load_object_file, types::*, Instruction, Program, Register, INSTRUCTION_SIZE};
use std::{
    collections::{BTreeSet, VecDeque},
    path::Path,
};

const WIDTH: u32 = 64;

/// Loads code and data segment of a RISC-U object file.
pub fn load_program<P: AsRef<Path>>(path: P) -> anyhow::Result<Program> {
    time_info!("loaded object file", { load_object_file(path.as_ref()) })
        .with_context(|| format!("failed to load object file {}", path.as_ref().display()))
}

pub fn register_name(register: Register) -> String {
    format!("{:?}", register).to_lowercase()
}

/// How control leaves one native instruction.
#[derive(Clone, Debug)]
enum Exit {
    Next,
    Branch { condition: Formula, target: u64 },
    Jump(u64),
    Indirect(Formula),
    Halt,
}

/// IR provider over the code segment of a RISC-U program.
///
/// Reachable code is discovered from the entry address. Blocks end at
/// branches, jumps, system calls and before branch targets. Every block
/// assigns the `flow` location in its last native instruction.
#[derive(Clone, Debug)]
pub struct RiscuProvider {
    code_address: u64,
    code: Vec<u8>,
}

impl RiscuProvider {
    pub fn new(code_address: u64, code: Vec<u8>) -> Self {
        Self { code_address, code }
    }

    pub fn from_program(program: &Program) -> Self {
        Self::new(program.code.address, program.code.content.clone())
    }

    fn contains(&self, address: u64) -> bool {
        address >= self.code_address
            && address + INSTRUCTION_SIZE as u64 <= self.code_address + self.code.len() as u64
    }

    pub fn fetch(&self, address: u64) -> Result<Instruction> {
        if !self.contains(address) || address % INSTRUCTION_SIZE as u64 != 0 {
            return Err(EngineError::lifting(address, "address outside of the code segment"));
        }
        let start = (address - self.code_address) as usize;
        let raw = LittleEndian::read_u32(&self.code[start..start + INSTRUCTION_SIZE]);

        decode(raw).map_err(|e| EngineError::lifting(address, format!("{:?}", e)))
    }

    /// Addresses of all instructions reachable from `entry`, plus the set of
    /// block leaders among them.
    fn discover(&self, entry: u64) -> Result<(BTreeSet<u64>, BTreeSet<u64>)> {
        let mut reachable = BTreeSet::new();
        let mut leaders = BTreeSet::from([entry]);
        let mut worklist = VecDeque::from([entry]);

        while let Some(pc) = worklist.pop_front() {
            if !reachable.insert(pc) {
                continue;
            }
            let (_, exit) = semantics(pc, self.fetch(pc)?);
            let next = pc + INSTRUCTION_SIZE as u64;

            match exit {
                Exit::Next => worklist.push_back(next),
                Exit::Branch { target, .. } => {
                    leaders.extend([target, next]);
                    worklist.extend([target, next]);
                }
                Exit::Jump(target) => {
                    leaders.insert(target);
                    worklist.push_back(target);
                }
                Exit::Indirect(_) | Exit::Halt => {}
            }
        }

        Ok((reachable, leaders))
    }
}

impl IrProvider for RiscuProvider {
    fn name(&self) -> &'static str {
        "riscu"
    }

    fn lift(&self, entry: u64) -> Result<ControlFlowGraph> {
        let (reachable, leaders) = time_debug!("discovered reachable code", {
            self.discover(entry)?
        });

        let mut cfg = ControlFlowGraph::new(BlockKey(entry));
        let mut edges = Vec::new();

        for &leader in &leaders {
            let key = BlockKey(leader);
            let mut assignments = Vec::new();
            let mut pc = leader;

            loop {
                let (mut effects, exit) = semantics(pc, self.fetch(pc)?);
                let next = pc + INSTRUCTION_SIZE as u64;

                let flow = match exit {
                    Exit::Next if leaders.contains(&next) => {
                        edges.push((key, next));
                        Some(Formula::constant(next, WIDTH))
                    }
                    Exit::Next => None,
                    Exit::Branch { condition, target } => {
                        edges.extend([(key, target), (key, next)]);
                        Some(Formula::cond(
                            condition,
                            Formula::constant(target, WIDTH),
                            Formula::constant(next, WIDTH),
                        ))
                    }
                    Exit::Jump(target) => {
                        edges.push((key, target));
                        Some(Formula::constant(target, WIDTH))
                    }
                    Exit::Indirect(target) => Some(target),
                    // no successors, the block ends the path
                    Exit::Halt => Some(Formula::constant(next, WIDTH)),
                };

                let last = flow.is_some();
                if let Some(flow) = flow {
                    effects.push((Location::flow(), flow));
                }
                assignments.extend(effects.into_iter().map(|(l, f)| Assignment::new(l, f, pc)));

                if last {
                    break;
                }
                pc = next;
            }

            trace!("lifted {} with {} assignments", key, assignments.len());
            cfg.add_block(BasicBlock::new(key, leader, assignments));
        }

        for (from, to) in edges {
            if !reachable.contains(&to) {
                return Err(EngineError::lifting(to, "jump target is not decodable code"));
            }
            cfg.add_edge(from, BlockKey(to));
        }

        debug!(
            "lifted {} blocks, {} instructions from {:#x}",
            cfg.len(),
            reachable.len(),
            entry
        );

        Ok(cfg)
    }
}

fn reg(register: Register) -> Formula {
    match register {
        Register::Zero => Formula::constant(0, WIDTH),
        r => Formula::id(register_name(r), WIDTH),
    }
}

fn imm(value: i32) -> Formula {
    Formula::constant(value as i64 as u64, WIDTH)
}

fn bool_to_word(condition: Formula) -> Formula {
    Formula::zero_extend(condition, WIDTH)
}

/// Sign extended result of a 32 bit operation on the low words.
fn word(f: fn(Formula, Formula) -> Formula, a: Formula, b: Formula) -> Formula {
    Formula::sign_extend(
        f(Formula::slice(a, 0, 32), Formula::slice(b, 0, 32)),
        WIDTH,
    )
}

fn shamt(amount: Formula, bits: u64, width: u32) -> Formula {
    Formula::and(Formula::slice(amount, 0, width), Formula::constant(bits, width))
}

fn address(base: Register, offset: i32) -> Formula {
    Formula::add(reg(base), imm(offset))
}

fn load(itype: IType, width: u32, signed: bool) -> Formula {
    let value = Formula::mem(address(itype.rs1(), itype.imm()), width);
    if width == WIDTH {
        value
    } else if signed {
        Formula::sign_extend(value, WIDTH)
    } else {
        Formula::zero_extend(value, WIDTH)
    }
}

fn store(stype: SType, width: u32) -> (Location, Formula) {
    (
        Location::memory(address(stype.rs1(), stype.imm()), width),
        Formula::slice(reg(stype.rs2()), 0, width),
    )
}

fn branch(pc: u64, btype: BType, condition: Formula) -> Exit {
    Exit::Branch {
        condition,
        target: pc.wrapping_add(btype.imm() as i64 as u64),
    }
}

/// RISC-V signed division by zero yields all ones.
fn signed_division(f: fn(Formula, Formula) -> Formula, a: Formula, b: Formula) -> Formula {
    let width = a.width();
    Formula::cond(
        Formula::eq(b.clone(), Formula::constant(0, width)),
        Formula::constant(crate::util::mask(width), width),
        f(a, b),
    )
}

/// Micro-assignments of the instruction at `pc`. Writes to the zero
/// register are kept under the name `zero` so that every instruction
/// occurs in the graph; reads of it are always constant.
#[rustfmt::skip]
fn semantics(pc: u64, instruction: Instruction) -> (Vec<(Location, Formula)>, Exit) {
    let rd = |r: Register, value: Formula| (Location::register(register_name(r), WIDTH), value);
    let next = pc + INSTRUCTION_SIZE as u64;

    let (effect, exit) = match instruction {
        // rd = imm << 12
        Instruction::Lui(u) => (rd(u.rd(), imm((u.imm() as i32) << 12)), Exit::Next),
        // rd = pc + (imm << 12)
        Instruction::Auipc(u) => (
            rd(u.rd(), Formula::constant(pc.wrapping_add((((u.imm() as i32) << 12) as i64) as u64), WIDTH)),
            Exit::Next,
        ),
        // rd = pc + 4; pc = pc + imm
        Instruction::Jal(j) => (
            rd(j.rd(), Formula::constant(next, WIDTH)),
            Exit::Jump(pc.wrapping_add(j.imm() as i64 as u64)),
        ),
        // rd = pc + 4; pc = (rs1 + imm) & ~1
        Instruction::Jalr(i) => (
            rd(i.rd(), Formula::constant(next, WIDTH)),
            Exit::Indirect(Formula::and(address(i.rs1(), i.imm()), Formula::constant(!1, WIDTH))),
        ),
        Instruction::Beq(b) => return (vec![], branch(pc, b, Formula::eq(reg(b.rs1()), reg(b.rs2())))),
        Instruction::Bne(b) => return (vec![], branch(pc, b, Formula::not(Formula::eq(reg(b.rs1()), reg(b.rs2()))))),
        Instruction::Blt(b) => return (vec![], branch(pc, b, Formula::slt(reg(b.rs1()), reg(b.rs2())))),
        Instruction::Bge(b) => return (vec![], branch(pc, b, Formula::sle(reg(b.rs2()), reg(b.rs1())))),
        Instruction::Bltu(b) => return (vec![], branch(pc, b, Formula::ult(reg(b.rs1()), reg(b.rs2())))),
        Instruction::Bgeu(b) => return (vec![], branch(pc, b, Formula::ule(reg(b.rs2()), reg(b.rs1())))),
        Instruction::Lb(i) => (rd(i.rd(), load(i, 8, true)), Exit::Next),
        Instruction::Lh(i) => (rd(i.rd(), load(i, 16, true)), Exit::Next),
        Instruction::Lw(i) => (rd(i.rd(), load(i, 32, true)), Exit::Next),
        Instruction::Ld(i) => (rd(i.rd(), load(i, 64, false)), Exit::Next),
        Instruction::Lbu(i) => (rd(i.rd(), load(i, 8, false)), Exit::Next),
        Instruction::Lhu(i) => (rd(i.rd(), load(i, 16, false)), Exit::Next),
        Instruction::Sb(s) => (store(s, 8), Exit::Next),
        Instruction::Sh(s) => (store(s, 16), Exit::Next),
        Instruction::Sw(s) => (store(s, 32), Exit::Next),
        Instruction::Sd(s) => (store(s, 64), Exit::Next),
        Instruction::Addi(i) => (rd(i.rd(), address(i.rs1(), i.imm())), Exit::Next),
        Instruction::Sltiu(i) => (rd(i.rd(), bool_to_word(Formula::ult(reg(i.rs1()), imm(i.imm())))), Exit::Next),
        Instruction::Xori(i) => (rd(i.rd(), Formula::xor(reg(i.rs1()), imm(i.imm()))), Exit::Next),
        Instruction::Ori(i) => (rd(i.rd(), Formula::or(reg(i.rs1()), imm(i.imm()))), Exit::Next),
        Instruction::Andi(i) => (rd(i.rd(), Formula::and(reg(i.rs1()), imm(i.imm()))), Exit::Next),
        Instruction::Slli(i) => (rd(i.rd(), Formula::shl(reg(i.rs1()), imm(i.imm() & 0x3f))), Exit::Next),
        Instruction::Srli(i) => (rd(i.rd(), Formula::lshr(reg(i.rs1()), imm(i.imm() & 0x3f))), Exit::Next),
        Instruction::Srai(i) => (rd(i.rd(), Formula::ashr(reg(i.rs1()), imm(i.imm() & 0x3f))), Exit::Next),
        Instruction::Addiw(i) => (rd(i.rd(), word(Formula::add, reg(i.rs1()), imm(i.imm()))), Exit::Next),
        Instruction::Slliw(i) => (rd(i.rd(), word(Formula::shl, reg(i.rs1()), imm(i.imm() & 0x1f))), Exit::Next),
        Instruction::Srliw(i) => (rd(i.rd(), word(Formula::lshr, reg(i.rs1()), imm(i.imm() & 0x1f))), Exit::Next),
        Instruction::Sraiw(i) => (rd(i.rd(), word(Formula::ashr, reg(i.rs1()), imm(i.imm() & 0x1f))), Exit::Next),
        Instruction::Add(r) => (rd(r.rd(), Formula::add(reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::Sub(r) => (rd(r.rd(), Formula::sub(reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::Sll(r) => (rd(r.rd(), Formula::shl(reg(r.rs1()), shamt(reg(r.rs2()), 0x3f, WIDTH))), Exit::Next),
        Instruction::Slt(r) => (rd(r.rd(), bool_to_word(Formula::slt(reg(r.rs1()), reg(r.rs2())))), Exit::Next),
        Instruction::Sltu(r) => (rd(r.rd(), bool_to_word(Formula::ult(reg(r.rs1()), reg(r.rs2())))), Exit::Next),
        Instruction::Srl(r) => (rd(r.rd(), Formula::lshr(reg(r.rs1()), shamt(reg(r.rs2()), 0x3f, WIDTH))), Exit::Next),
        Instruction::Sra(r) => (rd(r.rd(), Formula::ashr(reg(r.rs1()), shamt(reg(r.rs2()), 0x3f, WIDTH))), Exit::Next),
        Instruction::Or(r) => (rd(r.rd(), Formula::or(reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::And(r) => (rd(r.rd(), Formula::and(reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::Mul(r) => (rd(r.rd(), Formula::mul(reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::Div(r) => (rd(r.rd(), signed_division(Formula::sdiv, reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::Divu(r) => (rd(r.rd(), Formula::udiv(reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::Rem(r) => (rd(r.rd(), Formula::srem(reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::Remu(r) => (rd(r.rd(), Formula::urem(reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::Addw(r) => (rd(r.rd(), word(Formula::add, reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::Subw(r) => (rd(r.rd(), word(Formula::sub, reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::Sllw(r) => (
            rd(r.rd(), Formula::sign_extend(
                Formula::shl(Formula::slice(reg(r.rs1()), 0, 32), shamt(reg(r.rs2()), 0x1f, 32)),
                WIDTH,
            )),
            Exit::Next,
        ),
        Instruction::Mulw(r) => (rd(r.rd(), word(Formula::mul, reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        Instruction::Divw(r) => (
            rd(r.rd(), Formula::sign_extend(
                signed_division(Formula::sdiv, Formula::slice(reg(r.rs1()), 0, 32), Formula::slice(reg(r.rs2()), 0, 32)),
                WIDTH,
            )),
            Exit::Next,
        ),
        Instruction::Remw(r) => (rd(r.rd(), word(Formula::srem, reg(r.rs1()), reg(r.rs2()))), Exit::Next),
        // system calls end the handler
        Instruction::Ecall(_) => return (vec![], Exit::Halt),
    };

    (vec![effect], exit)
}

#[cfg(test)]
mod tests {
    use super::*;

    // addi a0, zero, 5
    const ADDI_A0_5: u32 = 0x0050_0513;
    // beq a0, zero, +8
    const BEQ_A0_ZERO_8: u32 = 0x0005_0463;
    // ecall
    const ECALL: u32 = 0x0000_0073;

    fn code(words: &[u32]) -> Vec<u8> {
        let mut bytes = vec![0; words.len() * 4];
        for (i, w) in words.iter().enumerate() {
            LittleEndian::write_u32(&mut bytes[i * 4..], *w);
        }
        bytes
    }

    #[test]
    fn branches_split_blocks() {
        let provider = RiscuProvider::new(
            0x1000,
            code(&[ADDI_A0_5, BEQ_A0_ZERO_8, ADDI_A0_5, ECALL]),
        );
        let cfg = provider.lift(0x1000).unwrap();

        assert_eq!(cfg.len(), 3);
        assert_eq!(cfg.successors(BlockKey(0x1000)), &[BlockKey(0x100c), BlockKey(0x1008)]);
        assert_eq!(cfg.successors(BlockKey(0x1008)), &[BlockKey(0x100c)]);
        assert!(cfg.is_leaf(BlockKey(0x100c)));
        assert_eq!(cfg.native_offsets().len(), 4);
        assert_eq!(
            cfg.address_path(&[BlockKey(0x1000), BlockKey(0x1008), BlockKey(0x100c)]).unwrap(),
            vec![0x1000, 0x1004, 0x1008, 0x100c]
        );
    }

    #[test]
    fn undecodable_code_fails_lifting() {
        let provider = RiscuProvider::new(0x1000, code(&[0xffff_ffff]));
        assert!(matches!(
            provider.lift(0x1000),
            Err(EngineError::LiftingFailure { address: 0x1000, .. })
        ));

        let provider = RiscuProvider::new(0x1000, code(&[ADDI_A0_5]));
        assert!(matches!(
            provider.lift(0x2000),
            Err(EngineError::LiftingFailure { .. })
        ));
    }
}
