//! Instruction metadata.
//!
//! Every opcode decodes to an `InstrClass` (which emission family handles it)
//! plus a `MipsInfo` flag set describing register reads/writes and control
//! flow. The block compiler dispatches on the class; delay-slot analysis and
//! the register cache consume the flags.

use bitflags::bitflags;

use super::MipsOpcode;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MipsInfo: u32 {
        const IN_RS        = 1 << 0;
        const IN_RT        = 1 << 1;
        const IN_IMM16     = 1 << 2;
        const IN_IMM26     = 1 << 3;
        const OUT_RT       = 1 << 4;
        const OUT_RD       = 1 << 5;
        const OUT_RA       = 1 << 6;
        const IN_HI        = 1 << 7;
        const IN_LO        = 1 << 8;
        const OUT_HI       = 1 << 9;
        const OUT_LO       = 1 << 10;
        /// The next instruction executes in this one's delay slot.
        const DELAYSLOT    = 1 << 11;
        const IS_CONDBRANCH = 1 << 12;
        const IS_JUMP      = 1 << 13;
        /// Likely-variant branch: the delay slot is skipped when not taken.
        const LIKELY       = 1 << 14;
        const IS_SYSCALL   = 1 << 15;
        const IN_FPUFLAG   = 1 << 16;
        const OUT_FPUFLAG  = 1 << 17;
        const IN_VFPU_CC   = 1 << 18;
        const OUT_VFPU_CC  = 1 << 19;
        /// Touches FPU state (registers or fcr31).
        const IS_FPU       = 1 << 20;
        /// Touches VFPU state.
        const IS_VFPU      = 1 << 21;
        const MEM_READ     = 1 << 22;
        const MEM_WRITE    = 1 << 23;
        /// rs is used as a load/store base address.
        const IN_RS_ADDR   = 1 << 24;
    }
}

/// Which emission family compiles an instruction. `Generic` means a real,
/// recognized opcode that goes through the interpreter fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrClass {
    Nop,
    /// addi/addiu/slti/sltiu/andi/ori/xori.
    AluImm,
    Lui,
    /// Three-register ALU (add/sub/and/or/xor/nor/slt/sltu and friends).
    Alu,
    /// sll/srl/sra with a constant shift amount.
    Shift,
    /// sllv/srlv/srav.
    ShiftVar,
    /// mult/multu compiled natively; div/divu fall back to `Generic`.
    Mult,
    /// mfhi/mflo/mthi/mtlo.
    HiLo,
    /// movz/movn.
    CondMove,
    /// Aligned lb/lbu/lh/lhu/lw.
    Load,
    /// Aligned sb/sh/sw.
    Store,
    /// beq/bne (two-register compare).
    BranchCmp,
    /// Branches comparing rs against zero, including the and-link forms.
    BranchZero,
    /// bc1f/bc1t and likely variants.
    BranchFpu,
    /// j/jal.
    Jump,
    /// jr/jalr.
    JumpReg,
    Syscall,
    Break,
    /// Recognized opcode with no native emission; interpreter fallback.
    Generic,
    /// VFPU opcode; fallback, never executed natively.
    Vfpu,
    /// Unrecognized word.
    Unknown,
}

/// Decoded metadata for one instruction word.
#[derive(Debug, Clone, Copy)]
pub struct InstrMeta {
    pub class: InstrClass,
    pub info: MipsInfo,
}

impl InstrMeta {
    fn new(class: InstrClass, info: MipsInfo) -> Self {
        InstrMeta { class, info }
    }
}

pub fn decode(op: MipsOpcode) -> InstrMeta {
    use InstrClass as C;
    use MipsInfo as I;

    if op.is_emuhack() {
        // Sentinels are replaced with the original word before decode; seeing
        // one here means a stale cache entry, handled by the caller.
        return InstrMeta::new(C::Unknown, I::empty());
    }

    match op.op() {
        0x00 => decode_special(op),
        0x01 => decode_regimm(op),
        0x02 => InstrMeta::new(C::Jump, I::IN_IMM26 | I::DELAYSLOT | I::IS_JUMP),
        0x03 => InstrMeta::new(C::Jump, I::IN_IMM26 | I::DELAYSLOT | I::IS_JUMP | I::OUT_RA),
        0x04 | 0x05 => InstrMeta::new(
            C::BranchCmp,
            I::IN_RS | I::IN_RT | I::IN_IMM16 | I::DELAYSLOT | I::IS_CONDBRANCH,
        ),
        0x06 | 0x07 => InstrMeta::new(
            C::BranchZero,
            I::IN_RS | I::IN_IMM16 | I::DELAYSLOT | I::IS_CONDBRANCH,
        ),
        0x08 | 0x09 | 0x0a | 0x0b | 0x0c | 0x0d | 0x0e => {
            InstrMeta::new(C::AluImm, I::IN_RS | I::IN_IMM16 | I::OUT_RT)
        }
        0x0f => InstrMeta::new(C::Lui, I::IN_IMM16 | I::OUT_RT),
        0x10 => InstrMeta::new(C::Generic, I::empty()), // COP0
        0x11 => decode_cop1(op),
        0x12 => decode_cop2(op),
        0x14 | 0x15 => InstrMeta::new(
            C::BranchCmp,
            I::IN_RS | I::IN_RT | I::IN_IMM16 | I::DELAYSLOT | I::IS_CONDBRANCH | I::LIKELY,
        ),
        0x16 | 0x17 => InstrMeta::new(
            C::BranchZero,
            I::IN_RS | I::IN_IMM16 | I::DELAYSLOT | I::IS_CONDBRANCH | I::LIKELY,
        ),
        // lb/lh/lw/lbu/lhu
        0x20 | 0x21 | 0x23 | 0x24 | 0x25 => InstrMeta::new(
            C::Load,
            I::IN_RS | I::IN_RS_ADDR | I::IN_IMM16 | I::OUT_RT | I::MEM_READ,
        ),
        // lwl/lwr merge into rt, so rt is also an input.
        0x22 | 0x26 => InstrMeta::new(
            C::Generic,
            I::IN_RS | I::IN_RS_ADDR | I::IN_RT | I::IN_IMM16 | I::OUT_RT | I::MEM_READ,
        ),
        0x28 | 0x29 | 0x2b => InstrMeta::new(
            C::Store,
            I::IN_RS | I::IN_RS_ADDR | I::IN_RT | I::IN_IMM16 | I::MEM_WRITE,
        ),
        0x2a | 0x2e => InstrMeta::new(
            C::Generic,
            I::IN_RS | I::IN_RS_ADDR | I::IN_RT | I::IN_IMM16 | I::MEM_WRITE,
        ),
        // cache / pref: no architectural effect here.
        0x2f | 0x33 => InstrMeta::new(C::Nop, I::empty()),
        // ll / sc
        0x30 => InstrMeta::new(
            C::Generic,
            I::IN_RS | I::IN_RS_ADDR | I::IN_IMM16 | I::OUT_RT | I::MEM_READ,
        ),
        0x38 => InstrMeta::new(
            C::Generic,
            I::IN_RS | I::IN_RS_ADDR | I::IN_RT | I::IN_IMM16 | I::OUT_RT | I::MEM_WRITE,
        ),
        // lwc1 / swc1
        0x31 => InstrMeta::new(
            C::Generic,
            I::IN_RS | I::IN_RS_ADDR | I::IN_IMM16 | I::MEM_READ | I::IS_FPU,
        ),
        0x39 => InstrMeta::new(
            C::Generic,
            I::IN_RS | I::IN_RS_ADDR | I::IN_IMM16 | I::MEM_WRITE | I::IS_FPU,
        ),
        // VFPU loads/stores (lv.s/lv.q/sv.s/sv.q and friends).
        0x32 | 0x35 | 0x36 | 0x3a | 0x3d | 0x3e => InstrMeta::new(
            C::Vfpu,
            I::IN_RS | I::IN_RS_ADDR | I::IN_IMM16 | I::IS_VFPU,
        ),
        // Remaining VFPU arithmetic blocks.
        0x18 | 0x19 | 0x1b | 0x34 | 0x37 | 0x3c | 0x3f => {
            InstrMeta::new(C::Vfpu, I::IS_VFPU)
        }
        // Allegrex special2 (halt/mfic/mtic).
        0x1c => InstrMeta::new(C::Generic, I::empty()),
        _ => InstrMeta::new(C::Unknown, I::empty()),
    }
}

fn decode_special(op: MipsOpcode) -> InstrMeta {
    use InstrClass as C;
    use MipsInfo as I;

    match op.funct() {
        0x00 => {
            if op.0 == 0 {
                InstrMeta::new(C::Nop, I::empty())
            } else {
                InstrMeta::new(C::Shift, I::IN_RT | I::OUT_RD)
            }
        }
        0x02 | 0x03 => InstrMeta::new(C::Shift, I::IN_RT | I::OUT_RD),
        0x04 | 0x06 | 0x07 => InstrMeta::new(C::ShiftVar, I::IN_RS | I::IN_RT | I::OUT_RD),
        0x08 => InstrMeta::new(C::JumpReg, I::IN_RS | I::DELAYSLOT | I::IS_JUMP),
        0x09 => InstrMeta::new(C::JumpReg, I::IN_RS | I::OUT_RD | I::DELAYSLOT | I::IS_JUMP),
        0x0a | 0x0b => InstrMeta::new(C::CondMove, I::IN_RS | I::IN_RT | I::OUT_RD),
        0x0c => InstrMeta::new(C::Syscall, I::IS_SYSCALL),
        0x0d => InstrMeta::new(C::Break, I::empty()),
        0x10 => InstrMeta::new(C::HiLo, I::IN_HI | I::OUT_RD),
        0x11 => InstrMeta::new(C::HiLo, I::IN_RS | I::OUT_HI),
        0x12 => InstrMeta::new(C::HiLo, I::IN_LO | I::OUT_RD),
        0x13 => InstrMeta::new(C::HiLo, I::IN_RS | I::OUT_LO),
        // Allegrex clz/clo.
        0x16 | 0x17 => InstrMeta::new(C::Generic, I::IN_RS | I::OUT_RD),
        0x18 | 0x19 => InstrMeta::new(C::Mult, I::IN_RS | I::IN_RT | I::OUT_HI | I::OUT_LO),
        0x1a | 0x1b => InstrMeta::new(C::Generic, I::IN_RS | I::IN_RT | I::OUT_HI | I::OUT_LO),
        // Allegrex madd/maddu.
        0x1c | 0x1d => InstrMeta::new(
            C::Generic,
            I::IN_RS | I::IN_RT | I::IN_HI | I::IN_LO | I::OUT_HI | I::OUT_LO,
        ),
        0x20 | 0x21 | 0x22 | 0x23 | 0x24 | 0x25 | 0x26 | 0x27 | 0x2a | 0x2b => {
            InstrMeta::new(C::Alu, I::IN_RS | I::IN_RT | I::OUT_RD)
        }
        // Allegrex max/min.
        0x2c | 0x2d => InstrMeta::new(C::Generic, I::IN_RS | I::IN_RT | I::OUT_RD),
        // Allegrex msub/msubu.
        0x2e | 0x2f => InstrMeta::new(
            C::Generic,
            I::IN_RS | I::IN_RT | I::IN_HI | I::IN_LO | I::OUT_HI | I::OUT_LO,
        ),
        _ => InstrMeta::new(C::Unknown, I::empty()),
    }
}

fn decode_regimm(op: MipsOpcode) -> InstrMeta {
    use InstrClass as C;
    use MipsInfo as I;

    let base = I::IN_RS | I::IN_IMM16 | I::DELAYSLOT | I::IS_CONDBRANCH;
    match op.rt() as u32 {
        0x00 | 0x01 => InstrMeta::new(C::BranchZero, base),
        0x02 | 0x03 => InstrMeta::new(C::BranchZero, base | I::LIKELY),
        0x10 | 0x11 => InstrMeta::new(C::BranchZero, base | I::OUT_RA),
        0x12 | 0x13 => InstrMeta::new(C::BranchZero, base | I::LIKELY | I::OUT_RA),
        _ => InstrMeta::new(C::Unknown, I::empty()),
    }
}

fn decode_cop1(op: MipsOpcode) -> InstrMeta {
    use InstrClass as C;
    use MipsInfo as I;

    match op.rs() as u32 {
        // mfc1 / cfc1
        0x00 | 0x02 => InstrMeta::new(C::Generic, I::OUT_RT | I::IS_FPU),
        // mtc1 / ctc1 (ctc1 to fcr31 rewrites the condition flag).
        0x04 => InstrMeta::new(C::Generic, I::IN_RT | I::IS_FPU),
        0x06 => InstrMeta::new(C::Generic, I::IN_RT | I::IS_FPU | I::OUT_FPUFLAG),
        0x08 => {
            let base = I::IN_FPUFLAG | I::DELAYSLOT | I::IS_CONDBRANCH | I::IN_IMM16 | I::IS_FPU;
            match op.rt() as u32 {
                0x00 | 0x01 => InstrMeta::new(C::BranchFpu, base),
                0x02 | 0x03 => InstrMeta::new(C::BranchFpu, base | I::LIKELY),
                _ => InstrMeta::new(C::Unknown, I::empty()),
            }
        }
        // S-format and W-format arithmetic; compares write the condition flag.
        0x10 | 0x14 => {
            if op.funct() >= 0x30 {
                InstrMeta::new(C::Generic, I::IS_FPU | I::OUT_FPUFLAG)
            } else {
                InstrMeta::new(C::Generic, I::IS_FPU)
            }
        }
        _ => InstrMeta::new(C::Unknown, I::empty()),
    }
}

fn decode_cop2(op: MipsOpcode) -> InstrMeta {
    use InstrClass as C;
    use MipsInfo as I;

    // The VFPU branch block sits at rs = 8, like BC1 on COP1. Nothing VFPU
    // is compiled natively, but the flags keep delay-slot analysis honest.
    match op.rs() as u32 {
        0x08 => InstrMeta::new(
            C::Vfpu,
            I::IN_VFPU_CC | I::DELAYSLOT | I::IS_CONDBRANCH | I::IS_VFPU,
        ),
        0x03 => InstrMeta::new(C::Vfpu, I::OUT_RT | I::IS_VFPU),
        0x07 => InstrMeta::new(C::Vfpu, I::IN_RT | I::IS_VFPU),
        _ => InstrMeta::new(C::Vfpu, I::IS_VFPU | I::OUT_VFPU_CC),
    }
}

/// The GPR written by this instruction, if any.
pub fn out_gpr(op: MipsOpcode) -> Option<usize> {
    let meta = decode(op);
    if meta.info.contains(MipsInfo::OUT_RT) {
        Some(op.rt())
    } else if meta.info.contains(MipsInfo::OUT_RD) {
        Some(op.rd())
    } else if meta.info.contains(MipsInfo::OUT_RA) {
        Some(crate::cpu::REG_RA)
    } else {
        None
    }
}

/// Whether this instruction reads GPR `r`.
pub fn reads_gpr(op: MipsOpcode, r: usize) -> bool {
    if r == crate::cpu::REG_ZERO {
        return false;
    }
    let meta = decode(op);
    (meta.info.contains(MipsInfo::IN_RS) && op.rs() == r)
        || (meta.info.contains(MipsInfo::IN_RT) && op.rt() == r)
}

/// Memory access width in bytes, 0 for non-memory instructions.
pub fn mem_access_size(op: MipsOpcode) -> u32 {
    match op.op() {
        0x20 | 0x24 | 0x28 => 1,
        0x21 | 0x25 | 0x29 => 2,
        0x22 | 0x23 | 0x26 | 0x2a | 0x2b | 0x2e | 0x30 | 0x31 | 0x38 | 0x39 => 4,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(word: u32) -> InstrMeta {
        decode(MipsOpcode(word))
    }

    #[test]
    fn test_nop_is_nop() {
        assert_eq!(meta(0).class, InstrClass::Nop);
    }

    #[test]
    fn test_branch_flags() {
        // beq $a0, $a1, +4
        let m = meta(0x1085_0004);
        assert_eq!(m.class, InstrClass::BranchCmp);
        assert!(m.info.contains(MipsInfo::DELAYSLOT));
        assert!(!m.info.contains(MipsInfo::LIKELY));
        // beql
        let m = meta(0x5085_0004);
        assert!(m.info.contains(MipsInfo::LIKELY));
        // bgezal writes $ra.
        let m = meta(0x0491_0004);
        assert_eq!(m.class, InstrClass::BranchZero);
        assert!(m.info.contains(MipsInfo::OUT_RA));
    }

    #[test]
    fn test_jalr_and_jr() {
        // jr $ra
        let m = meta(0x03e0_0008);
        assert_eq!(m.class, InstrClass::JumpReg);
        assert!(m.info.contains(MipsInfo::DELAYSLOT));
        // jalr $t9 (rd = ra)
        let m = meta(0x0320_f809);
        assert!(m.info.contains(MipsInfo::OUT_RD));
    }

    #[test]
    fn test_out_gpr() {
        // addiu $v0, $zero, 1 writes $v0.
        assert_eq!(out_gpr(MipsOpcode(0x2402_0001)), Some(2));
        // addu $s0, $a0, $a1 writes $s0.
        assert_eq!(out_gpr(MipsOpcode(0x0085_8021)), Some(16));
        // jal writes $ra.
        assert_eq!(out_gpr(MipsOpcode(0x0c00_0000)), Some(31));
        // sw writes nothing.
        assert_eq!(out_gpr(MipsOpcode(0xac82_0000)), None);
    }

    #[test]
    fn test_reads_gpr_ignores_zero() {
        // addu $v0, $zero, $zero "reads" only the hardwired zero.
        assert!(!reads_gpr(MipsOpcode(0x0000_1021), 0));
        // sw $v0, 0($sp) reads both.
        assert!(reads_gpr(MipsOpcode(0xafa2_0000), 2));
        assert!(reads_gpr(MipsOpcode(0xafa2_0000), 29));
    }

    #[test]
    fn test_divide_goes_generic() {
        // div $a0, $a1
        let m = meta(0x0085_001a);
        assert_eq!(m.class, InstrClass::Generic);
        assert!(m.info.contains(MipsInfo::OUT_HI | MipsInfo::OUT_LO));
        // mult stays native.
        assert_eq!(meta(0x0085_0018).class, InstrClass::Mult);
    }

    #[test]
    fn test_mem_access_size() {
        assert_eq!(mem_access_size(MipsOpcode(0x8c82_0000)), 4); // lw
        assert_eq!(mem_access_size(MipsOpcode(0x9082_0000)), 1); // lbu
        assert_eq!(mem_access_size(MipsOpcode(0xa482_0000)), 2); // sh
        assert_eq!(mem_access_size(MipsOpcode(0x0085_0018)), 0); // mult
    }
}
