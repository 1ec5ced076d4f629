#![allow(dead_code)]

use std::sync::Once;
use vmattack::{
    formula::Formula,
    ir::{Assignment, BasicBlock, BlockKey, ControlFlowGraph, Location},
};

static INIT_LOGGER: Once = Once::new();

pub fn init() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn reg(name: &str) -> Formula {
    Formula::id(name, 64)
}

pub fn constant(value: u64) -> Formula {
    Formula::constant(value, 64)
}

pub fn set(name: &str, value: Formula, offset: u64) -> Assignment {
    Assignment::new(Location::register(name, 64), value, offset)
}

pub fn store(address: Formula, value: Formula, offset: u64) -> Assignment {
    Assignment::new(Location::memory(address, 64), value, offset)
}

pub fn jump(target: u64, offset: u64) -> Assignment {
    Assignment::new(Location::flow(), constant(target), offset)
}

/// Builds a graph whose block keys equal their addresses; the first block
/// is the entry.
pub fn graph(blocks: Vec<(u64, Vec<Assignment>)>, edges: &[(u64, u64)]) -> ControlFlowGraph {
    let mut cfg = ControlFlowGraph::new(BlockKey(blocks[0].0));
    for (address, assignments) in blocks {
        cfg.add_block(BasicBlock::new(BlockKey(address), address, assignments));
    }
    for (from, to) in edges {
        cfg.add_edge(BlockKey(*from), BlockKey(*to));
    }
    cfg
}

/// `0 -> {0x10, 0x20} -> 0x30`, branching on `c`. The left arm adds `y`
/// to `x`, the right arm subtracts it.
pub fn diamond() -> ControlFlowGraph {
    graph(
        vec![
            (
                0x0,
                vec![
                    set("a", reg("x"), 0x0),
                    Assignment::new(
                        Location::flow(),
                        Formula::cond(
                            Formula::eq(reg("c"), constant(0)),
                            constant(0x10),
                            constant(0x20),
                        ),
                        0x4,
                    ),
                ],
            ),
            (
                0x10,
                vec![set("a", Formula::add(reg("a"), reg("y")), 0x10), jump(0x30, 0x14)],
            ),
            (
                0x20,
                vec![set("a", Formula::sub(reg("a"), reg("y")), 0x20), jump(0x30, 0x24)],
            ),
            (0x30, vec![set("out", reg("a"), 0x30)]),
        ],
        &[(0x0, 0x10), (0x0, 0x20), (0x10, 0x30), (0x20, 0x30)],
    )
}

pub fn keys(path: &[BlockKey]) -> Vec<u64> {
    path.iter().map(|k| k.0).collect()
}

/// Deterministic sample source (splitmix64).
pub struct Samples(u64);

impl Samples {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }
}

/// Encoders for the RISC-U instructions used by the tests.
pub mod encode {
    pub const ZERO: u32 = 0;
    pub const SP: u32 = 2;
    pub const T0: u32 = 5;
    pub const T1: u32 = 6;
    pub const T2: u32 = 7;
    pub const A0: u32 = 10;
    pub const A1: u32 = 11;
    pub const A2: u32 = 12;
    pub const A3: u32 = 13;
    pub const T3: u32 = 28;
    pub const T4: u32 = 29;
    pub const T5: u32 = 30;
    pub const T6: u32 = 31;

    fn itype(opcode: u32, funct3: u32, rd: u32, rs1: u32, imm: i32) -> u32 {
        ((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn stype(funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
        let imm = imm as u32;
        (((imm >> 5) & 0x7f) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (funct3 << 12)
            | ((imm & 0x1f) << 7)
            | 0x23
    }

    fn rtype(funct7: u32, funct3: u32, rd: u32, rs1: u32, rs2: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | 0x33
    }

    pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
        itype(0x13, 0, rd, rs1, imm)
    }

    pub fn slli(rd: u32, rs1: u32, shamt: u32) -> u32 {
        itype(0x13, 1, rd, rs1, shamt as i32)
    }

    pub fn ld(rd: u32, rs1: u32, imm: i32) -> u32 {
        itype(0x03, 3, rd, rs1, imm)
    }

    pub fn lhu(rd: u32, rs1: u32, imm: i32) -> u32 {
        itype(0x03, 5, rd, rs1, imm)
    }

    pub fn sd(rs1: u32, rs2: u32, imm: i32) -> u32 {
        stype(3, rs1, rs2, imm)
    }

    pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
        rtype(0, 0, rd, rs1, rs2)
    }

    pub fn sub(rd: u32, rs1: u32, rs2: u32) -> u32 {
        rtype(0x20, 0, rd, rs1, rs2)
    }

    pub fn xor(rd: u32, rs1: u32, rs2: u32) -> u32 {
        rtype(0, 4, rd, rs1, rs2)
    }

    pub fn lui(rd: u32, imm: u32) -> u32 {
        (imm << 12) | (rd << 7) | 0x37
    }

    pub fn beq(rs1: u32, rs2: u32, imm: i32) -> u32 {
        let imm = imm as u32;
        (((imm >> 12) & 1) << 31)
            | (((imm >> 5) & 0x3f) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (((imm >> 1) & 0xf) << 8)
            | (((imm >> 11) & 1) << 7)
            | 0x63
    }

    pub fn jal(rd: u32, imm: i32) -> u32 {
        let imm = imm as u32;
        (((imm >> 20) & 1) << 31)
            | (((imm >> 1) & 0x3ff) << 21)
            | (((imm >> 11) & 1) << 20)
            | (((imm >> 12) & 0xff) << 12)
            | (rd << 7)
            | 0x6f
    }

    pub fn ecall() -> u32 {
        0x73
    }

    pub fn code(instructions: &[u32]) -> Vec<u8> {
        instructions.iter().flat_map(|i| i.to_le_bytes()).collect()
    }
}

/// Handlers in the shape generated virtual machines use.
pub mod handlers {
    use super::encode::*;

    /// Loads the addresses of `x`, `y` and the output operand:
    /// `t1 = x`, `t2 = y`, `t4 = &output`.
    pub fn operand_prologue(context: u64, bytecode: u64) -> Vec<u32> {
        vec![
            lui(T6, (context >> 12) as u32),
            lui(T5, (bytecode >> 12) as u32),
            ld(T0, T6, 8),
            add(T0, T0, T5),
            lhu(T1, T0, 2),
            slli(T1, T1, 3),
            add(T1, T1, T6),
            ld(T1, T1, 0),
            lhu(T2, T0, 4),
            slli(T2, T2, 3),
            add(T2, T2, T6),
            ld(T2, T2, 0),
            lhu(T4, T0, 0),
            slli(T4, T4, 3),
            add(T4, T4, T6),
        ]
    }

    pub const PROLOGUE_LENGTH: u64 = 15;

    pub fn adding(context: u64, bytecode: u64) -> Vec<u32> {
        let mut instructions = operand_prologue(context, bytecode);
        instructions.extend([add(T3, T1, T2), sd(T4, T3, 0), ecall()]);
        instructions
    }

    /// Adds if the key is zero and subtracts otherwise.
    pub fn keyed(context: u64, bytecode: u64) -> Vec<u32> {
        let mut instructions = operand_prologue(context, bytecode);
        instructions.extend([
            ld(T3, T0, 14),
            beq(T3, ZERO, 12),
            sub(A0, T1, T2),
            jal(ZERO, 8),
            add(A0, T1, T2),
            sd(T4, A0, 0),
            ecall(),
        ]);
        instructions
    }
}

/// Writer for RISC-V ELF executables with one code and one data segment.
///
/// Both segments are mirrored by `.text` and `.data` sections, symbols are
/// global functions in `.text`. Segment addresses have to be page aligned.
pub mod elf {
    use byteorder::{LittleEndian, WriteBytesExt};

    const PAGE: u64 = 0x1000;
    const HEADER_SIZE: u16 = 64;
    const PROGRAM_HEADER_SIZE: u16 = 56;
    const SECTION_HEADER_SIZE: u16 = 64;
    const SYMBOL_SIZE: u64 = 24;
    const EM_RISCV: u16 = 243;

    const PT_LOAD: u32 = 1;
    const PF_X: u32 = 1;
    const PF_W: u32 = 2;
    const PF_R: u32 = 4;

    const SHT_PROGBITS: u32 = 1;
    const SHT_SYMTAB: u32 = 2;
    const SHT_STRTAB: u32 = 3;
    const SHF_WRITE: u64 = 1;
    const SHF_ALLOC: u64 = 2;
    const SHF_EXECINSTR: u64 = 4;

    struct Section {
        name: u32,
        kind: u32,
        flags: u64,
        address: u64,
        offset: u64,
        size: u64,
        link: u32,
        info: u32,
        entry_size: u64,
    }

    fn align(value: u64, to: u64) -> u64 {
        (value + to - 1) / to * to
    }

    fn pad(image: &mut Vec<u8>, to: u64) {
        image.resize(to as usize, 0);
    }

    /// Adds `name` to a string table and returns its index.
    fn intern(table: &mut Vec<u8>, name: &str) -> u32 {
        let index = table.len() as u32;
        table.extend(name.as_bytes());
        table.push(0);
        index
    }

    pub fn executable(
        code_address: u64,
        code: &[u8],
        data_address: u64,
        data: &[u8],
        symbols: &[(&str, u64)],
    ) -> Vec<u8> {
        assert_eq!(code_address % PAGE, 0);
        assert_eq!(data_address % PAGE, 0);

        let code_offset = PAGE;
        let data_offset = align(code_offset + code.len() as u64, PAGE);
        let symtab_offset = align(data_offset + data.len() as u64, 8);

        let mut symtab = vec![0_u8; SYMBOL_SIZE as usize];
        let mut strtab = vec![0_u8];
        for (name, value) in symbols {
            let name = intern(&mut strtab, name);
            symtab.write_u32::<LittleEndian>(name).unwrap();
            // global function
            symtab.write_u8(0x12).unwrap();
            symtab.write_u8(0).unwrap();
            // defined in .text
            symtab.write_u16::<LittleEndian>(1).unwrap();
            symtab.write_u64::<LittleEndian>(*value).unwrap();
            symtab.write_u64::<LittleEndian>(0).unwrap();
        }
        let strtab_offset = symtab_offset + symtab.len() as u64;

        let mut shstrtab = vec![0_u8];
        let text_name = intern(&mut shstrtab, ".text");
        let data_name = intern(&mut shstrtab, ".data");
        let symtab_name = intern(&mut shstrtab, ".symtab");
        let strtab_name = intern(&mut shstrtab, ".strtab");
        let shstrtab_name = intern(&mut shstrtab, ".shstrtab");
        let shstrtab_offset = strtab_offset + strtab.len() as u64;
        let section_headers_offset = align(shstrtab_offset + shstrtab.len() as u64, 8);

        let sections = [
            Section {
                name: 0,
                kind: 0,
                flags: 0,
                address: 0,
                offset: 0,
                size: 0,
                link: 0,
                info: 0,
                entry_size: 0,
            },
            Section {
                name: text_name,
                kind: SHT_PROGBITS,
                flags: SHF_ALLOC | SHF_EXECINSTR,
                address: code_address,
                offset: code_offset,
                size: code.len() as u64,
                link: 0,
                info: 0,
                entry_size: 0,
            },
            Section {
                name: data_name,
                kind: SHT_PROGBITS,
                flags: SHF_ALLOC | SHF_WRITE,
                address: data_address,
                offset: data_offset,
                size: data.len() as u64,
                link: 0,
                info: 0,
                entry_size: 0,
            },
            Section {
                name: symtab_name,
                kind: SHT_SYMTAB,
                flags: 0,
                address: 0,
                offset: symtab_offset,
                size: symtab.len() as u64,
                link: 4,
                info: 1,
                entry_size: SYMBOL_SIZE,
            },
            Section {
                name: strtab_name,
                kind: SHT_STRTAB,
                flags: 0,
                address: 0,
                offset: strtab_offset,
                size: strtab.len() as u64,
                link: 0,
                info: 0,
                entry_size: 0,
            },
            Section {
                name: shstrtab_name,
                kind: SHT_STRTAB,
                flags: 0,
                address: 0,
                offset: shstrtab_offset,
                size: shstrtab.len() as u64,
                link: 0,
                info: 0,
                entry_size: 0,
            },
        ];

        let mut image = Vec::new();
        image.extend([0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        image.extend([0_u8; 8]);
        image.write_u16::<LittleEndian>(2).unwrap();
        image.write_u16::<LittleEndian>(EM_RISCV).unwrap();
        image.write_u32::<LittleEndian>(1).unwrap();
        image.write_u64::<LittleEndian>(code_address).unwrap();
        image.write_u64::<LittleEndian>(u64::from(HEADER_SIZE)).unwrap();
        image.write_u64::<LittleEndian>(section_headers_offset).unwrap();
        image.write_u32::<LittleEndian>(0).unwrap();
        image.write_u16::<LittleEndian>(HEADER_SIZE).unwrap();
        image.write_u16::<LittleEndian>(PROGRAM_HEADER_SIZE).unwrap();
        image.write_u16::<LittleEndian>(2).unwrap();
        image.write_u16::<LittleEndian>(SECTION_HEADER_SIZE).unwrap();
        image.write_u16::<LittleEndian>(sections.len() as u16).unwrap();
        image.write_u16::<LittleEndian>(sections.len() as u16 - 1).unwrap();

        let segments = [
            (PF_R | PF_X, code_offset, code_address, code.len() as u64),
            (PF_R | PF_W, data_offset, data_address, data.len() as u64),
        ];
        for (flags, offset, address, size) in segments {
            image.write_u32::<LittleEndian>(PT_LOAD).unwrap();
            image.write_u32::<LittleEndian>(flags).unwrap();
            image.write_u64::<LittleEndian>(offset).unwrap();
            image.write_u64::<LittleEndian>(address).unwrap();
            image.write_u64::<LittleEndian>(address).unwrap();
            image.write_u64::<LittleEndian>(size).unwrap();
            image.write_u64::<LittleEndian>(size).unwrap();
            image.write_u64::<LittleEndian>(PAGE).unwrap();
        }

        pad(&mut image, code_offset);
        image.extend(code);
        pad(&mut image, data_offset);
        image.extend(data);
        pad(&mut image, symtab_offset);
        image.extend(symtab);
        image.extend(strtab);
        image.extend(shstrtab);
        pad(&mut image, section_headers_offset);

        for section in &sections {
            image.write_u32::<LittleEndian>(section.name).unwrap();
            image.write_u32::<LittleEndian>(section.kind).unwrap();
            image.write_u64::<LittleEndian>(section.flags).unwrap();
            image.write_u64::<LittleEndian>(section.address).unwrap();
            image.write_u64::<LittleEndian>(section.offset).unwrap();
            image.write_u64::<LittleEndian>(section.size).unwrap();
            image.write_u32::<LittleEndian>(section.link).unwrap();
            image.write_u32::<LittleEndian>(section.info).unwrap();
            image.write_u64::<LittleEndian>(if section.kind == SHT_PROGBITS { 4 } else { 1 })
                .unwrap();
            image.write_u64::<LittleEndian>(section.entry_size).unwrap();
        }

        image
    }
}
