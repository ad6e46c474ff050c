//! MIPS32 (Allegrex) instruction model: opcode newtype, field accessors and
//! the sentinel encoding the block cache writes into guest memory.

pub mod interp;
pub mod tables;

/// Opcode-space prefix for sentinel words. `0x68 >> 2 = 0b011010` is an
/// unused primary opcode on the Allegrex, so sentinels never collide with
/// real instructions.
pub const EMUHACK_OPCODE: u32 = 0x6800_0000;
/// Mask selecting the primary-opcode field.
pub const EMUHACK_MASK: u32 = 0xFC00_0000;
/// Payload bits of a sentinel word (the owning block index).
pub const EMUHACK_VALUE_MASK: u32 = 0x00FF_FFFF;

/// A raw 32-bit MIPS instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MipsOpcode(pub u32);

impl MipsOpcode {
    pub const NOP: MipsOpcode = MipsOpcode(0);

    /// Primary opcode field, bits 31..26.
    pub fn op(self) -> u32 {
        self.0 >> 26
    }

    pub fn rs(self) -> usize {
        ((self.0 >> 21) & 0x1f) as usize
    }

    pub fn rt(self) -> usize {
        ((self.0 >> 16) & 0x1f) as usize
    }

    pub fn rd(self) -> usize {
        ((self.0 >> 11) & 0x1f) as usize
    }

    /// Shift amount field, bits 10..6.
    pub fn sa(self) -> u32 {
        (self.0 >> 6) & 0x1f
    }

    pub fn funct(self) -> u32 {
        self.0 & 0x3f
    }

    pub fn imm16(self) -> u32 {
        self.0 & 0xffff
    }

    pub fn simm16(self) -> i32 {
        (self.0 & 0xffff) as u16 as i16 as i32
    }

    /// 26-bit jump target field.
    pub fn target26(self) -> u32 {
        self.0 & 0x03ff_ffff
    }

    /// Absolute target of a j/jal at `pc`.
    pub fn jump_target(self, pc: u32) -> u32 {
        ((pc + 4) & 0xf000_0000) | (self.target26() << 2)
    }

    /// Absolute target of a conditional branch at `pc`.
    pub fn branch_target(self, pc: u32) -> u32 {
        pc.wrapping_add(4).wrapping_add((self.simm16() << 2) as u32)
    }

    /// FPU register fields (fmt/ft/fs/fd occupy the rs/rt/rd/sa slots).
    pub fn ft(self) -> usize {
        self.rt()
    }

    pub fn fs(self) -> usize {
        self.rd()
    }

    pub fn fd(self) -> usize {
        (self.sa()) as usize
    }

    pub fn is_emuhack(self) -> bool {
        self.0 & EMUHACK_MASK == EMUHACK_OPCODE
    }

    pub fn emuhack_value(self) -> u32 {
        debug_assert!(self.is_emuhack());
        self.0 & EMUHACK_VALUE_MASK
    }

    pub fn make_emuhack(block_num: u32) -> MipsOpcode {
        debug_assert_eq!(block_num & !EMUHACK_VALUE_MASK, 0);
        MipsOpcode(EMUHACK_OPCODE | block_num)
    }
}

pub const GPR_NAMES: [&str; 32] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3",
    "t4", "t5", "t6", "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7",
    "t8", "t9", "k0", "k1", "gp", "sp", "fp", "ra",
];
