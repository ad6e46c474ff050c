//! Single-instruction fallback interpreter.
//!
//! The block compiler routes instructions it has no native emission for
//! through here (divides, unaligned memory quads, scalar FPU, the odd COP0
//! word). Branches never reach this path; the compiler owns all control
//! flow so the rules about delay slots stay in one place.

use tracing::error;

use crate::cpu::MipsState;
use crate::mem::GuestMemory;
use crate::mips::tables::{self, InstrClass, MipsInfo};
use crate::mips::MipsOpcode;

/// Executes `op` at `pc` against the live state. The caller has already
/// flushed any cached registers.
pub fn interpret(state: &mut MipsState, mem: &mut GuestMemory, op: MipsOpcode, pc: u32) {
    let meta = tables::decode(op);
    debug_assert!(
        !meta.info.contains(MipsInfo::DELAYSLOT),
        "branch {:08x} routed to the fallback interpreter",
        op.0
    );

    match meta.class {
        InstrClass::Nop | InstrClass::Break => {}
        InstrClass::AluImm => alu_imm(state, op),
        InstrClass::Lui => set_gpr(state, op.rt(), op.imm16() << 16),
        InstrClass::Alu | InstrClass::CondMove => alu(state, op),
        InstrClass::Shift | InstrClass::ShiftVar => shift(state, op),
        InstrClass::Mult => mult(state, op),
        InstrClass::HiLo => hilo(state, op),
        InstrClass::Load | InstrClass::Store => aligned_mem(state, mem, op),
        InstrClass::Generic => generic(state, mem, op, pc),
        InstrClass::Vfpu => {
            error!(op = format_args!("{:08x}", op.0), pc = format_args!("{pc:08x}"),
                   "VFPU instruction is not supported; ignoring");
        }
        InstrClass::Unknown => {
            error!(op = format_args!("{:08x}", op.0), pc = format_args!("{pc:08x}"),
                   "unknown instruction; ignoring");
        }
        InstrClass::Syscall
        | InstrClass::BranchCmp
        | InstrClass::BranchZero
        | InstrClass::BranchFpu
        | InstrClass::Jump
        | InstrClass::JumpReg => {
            // Unreachable by construction; see the debug_assert above.
            error!(op = format_args!("{:08x}", op.0), "control-flow op in fallback interpreter");
        }
    }
}

fn set_gpr(state: &mut MipsState, r: usize, v: u32) {
    if r != 0 {
        state.gpr[r] = v;
    }
}

fn alu_imm(state: &mut MipsState, op: MipsOpcode) {
    let rs = state.gpr[op.rs()];
    let simm = op.simm16();
    let v = match op.op() {
        // addi overflow traps are not implemented on the Allegrex path.
        0x08 | 0x09 => rs.wrapping_add(simm as u32),
        0x0a => ((rs as i32) < simm) as u32,
        0x0b => (rs < simm as u32) as u32,
        0x0c => rs & op.imm16(),
        0x0d => rs | op.imm16(),
        0x0e => rs ^ op.imm16(),
        _ => unreachable!(),
    };
    set_gpr(state, op.rt(), v);
}

fn alu(state: &mut MipsState, op: MipsOpcode) {
    let rs = state.gpr[op.rs()];
    let rt = state.gpr[op.rt()];
    match op.funct() {
        0x0a => {
            // movz
            if rt == 0 {
                set_gpr(state, op.rd(), rs);
            }
            return;
        }
        0x0b => {
            if rt != 0 {
                set_gpr(state, op.rd(), rs);
            }
            return;
        }
        _ => {}
    }
    let v = match op.funct() {
        0x20 | 0x21 => rs.wrapping_add(rt),
        0x22 | 0x23 => rs.wrapping_sub(rt),
        0x24 => rs & rt,
        0x25 => rs | rt,
        0x26 => rs ^ rt,
        0x27 => !(rs | rt),
        0x2a => (((rs as i32) < rt as i32) as u32),
        0x2b => ((rs < rt) as u32),
        _ => unreachable!(),
    };
    set_gpr(state, op.rd(), v);
}

fn shift(state: &mut MipsState, op: MipsOpcode) {
    let rt = state.gpr[op.rt()];
    let sa = match op.funct() {
        0x00 | 0x02 | 0x03 => op.sa(),
        _ => state.gpr[op.rs()] & 0x1f,
    };
    let v = match op.funct() {
        0x00 | 0x04 => rt << sa,
        0x02 | 0x06 => rt >> sa,
        0x03 | 0x07 => ((rt as i32) >> sa) as u32,
        _ => unreachable!(),
    };
    set_gpr(state, op.rd(), v);
}

fn mult(state: &mut MipsState, op: MipsOpcode) {
    let rs = state.gpr[op.rs()];
    let rt = state.gpr[op.rt()];
    let wide = match op.funct() {
        0x18 => (rs as i32 as i64).wrapping_mul(rt as i32 as i64) as u64,
        0x19 => (rs as u64) * (rt as u64),
        _ => unreachable!(),
    };
    state.lo = wide as u32;
    state.hi = (wide >> 32) as u32;
}

fn hilo(state: &mut MipsState, op: MipsOpcode) {
    match op.funct() {
        0x10 => set_gpr(state, op.rd(), state.hi),
        0x11 => state.hi = state.gpr[op.rs()],
        0x12 => set_gpr(state, op.rd(), state.lo),
        0x13 => state.lo = state.gpr[op.rs()],
        _ => unreachable!(),
    }
}

fn aligned_mem(state: &mut MipsState, mem: &mut GuestMemory, op: MipsOpcode) {
    let addr = state.gpr[op.rs()].wrapping_add(op.simm16() as u32);
    match op.op() {
        0x20 => set_gpr(state, op.rt(), mem.read8(addr) as i8 as i32 as u32),
        0x21 => set_gpr(state, op.rt(), mem.read16(addr) as i16 as i32 as u32),
        0x23 => set_gpr(state, op.rt(), mem.read32(addr)),
        0x24 => set_gpr(state, op.rt(), mem.read8(addr) as u32),
        0x25 => set_gpr(state, op.rt(), mem.read16(addr) as u32),
        0x28 => mem.write8(addr, state.gpr[op.rt()] as u8),
        0x29 => mem.write16(addr, state.gpr[op.rt()] as u16),
        0x2b => mem.write32(addr, state.gpr[op.rt()]),
        _ => unreachable!(),
    }
}

fn generic(state: &mut MipsState, mem: &mut GuestMemory, op: MipsOpcode, pc: u32) {
    match op.op() {
        0x00 => special_generic(state, op, pc),
        0x10 => {} // COP0: privileged state is not modeled.
        0x11 => fpu(state, op, pc),
        0x22 | 0x26 | 0x2a | 0x2e => unaligned_word(state, mem, op),
        0x1c => {} // special2 halt/mfic: ignored.
        0x30 => {
            // ll behaves as a plain lw; sc always succeeds (uniprocessor).
            let addr = state.gpr[op.rs()].wrapping_add(op.simm16() as u32);
            set_gpr(state, op.rt(), mem.read32(addr));
        }
        0x38 => {
            let addr = state.gpr[op.rs()].wrapping_add(op.simm16() as u32);
            mem.write32(addr, state.gpr[op.rt()]);
            set_gpr(state, op.rt(), 1);
        }
        0x31 => {
            let addr = state.gpr[op.rs()].wrapping_add(op.simm16() as u32);
            state.set_fpr_bits(op.ft(), mem.read32(addr));
        }
        0x39 => {
            let addr = state.gpr[op.rs()].wrapping_add(op.simm16() as u32);
            mem.write32(addr, state.fpr_bits(op.ft()));
        }
        _ => {
            error!(op = format_args!("{:08x}", op.0), pc = format_args!("{pc:08x}"),
                   "unimplemented generic instruction");
        }
    }
}

fn special_generic(state: &mut MipsState, op: MipsOpcode, pc: u32) {
    let rs = state.gpr[op.rs()];
    let rt = state.gpr[op.rt()];
    match op.funct() {
        0x16 => set_gpr(state, op.rd(), rs.leading_zeros()),
        0x17 => set_gpr(state, op.rd(), rs.leading_ones()),
        0x1a => {
            // div: MIPS leaves hi/lo unpredictable on zero divisors; mirror
            // hardware-observed behavior rather than trapping.
            if rt != 0 {
                let (rs, rt) = (rs as i32, rt as i32);
                if rs as u32 == 0x8000_0000 && rt == -1 {
                    state.lo = 0x8000_0000;
                    state.hi = 0;
                } else {
                    state.lo = rs.wrapping_div(rt) as u32;
                    state.hi = rs.wrapping_rem(rt) as u32;
                }
            } else {
                state.lo = if (rs as i32) < 0 { 1 } else { 0xffff_ffff };
                state.hi = rs;
            }
        }
        0x1b => {
            if rt != 0 {
                state.lo = rs / rt;
                state.hi = rs % rt;
            } else {
                state.lo = 0xffff_ffff;
                state.hi = rs;
            }
        }
        0x1c | 0x1d => {
            let acc = ((state.hi as u64) << 32) | state.lo as u64;
            let prod = if op.funct() == 0x1c {
                (rs as i32 as i64).wrapping_mul(rt as i32 as i64) as u64
            } else {
                (rs as u64) * (rt as u64)
            };
            let acc = acc.wrapping_add(prod);
            state.lo = acc as u32;
            state.hi = (acc >> 32) as u32;
        }
        0x2c => set_gpr(state, op.rd(), (rs as i32).max(rt as i32) as u32),
        0x2d => set_gpr(state, op.rd(), (rs as i32).min(rt as i32) as u32),
        0x2e | 0x2f => {
            let acc = ((state.hi as u64) << 32) | state.lo as u64;
            let prod = if op.funct() == 0x2e {
                (rs as i32 as i64).wrapping_mul(rt as i32 as i64) as u64
            } else {
                (rs as u64) * (rt as u64)
            };
            let acc = acc.wrapping_sub(prod);
            state.lo = acc as u32;
            state.hi = (acc >> 32) as u32;
        }
        _ => {
            error!(op = format_args!("{:08x}", op.0), pc = format_args!("{pc:08x}"),
                   "unimplemented special instruction");
        }
    }
}

/// lwl/lwr/swl/swr. Little-endian merge semantics.
fn unaligned_word(state: &mut MipsState, mem: &mut GuestMemory, op: MipsOpcode) {
    let addr = state.gpr[op.rs()].wrapping_add(op.simm16() as u32);
    let shift = (addr & 3) * 8;
    let aligned = addr & !3;
    let rt = state.gpr[op.rt()];
    match op.op() {
        0x22 => {
            // lwl
            let word = mem.read32(aligned);
            let v = (rt & (0x00ff_ffff >> shift)) | (word << (24 - shift));
            set_gpr(state, op.rt(), v);
        }
        0x26 => {
            // lwr
            let word = mem.read32(aligned);
            let v = (rt & (0xffff_ff00u32 << (24 - shift))) | (word >> shift);
            set_gpr(state, op.rt(), v);
        }
        0x2a => {
            // swl
            let word = mem.read32(aligned);
            mem.write32(aligned, (word & (0xffff_ff00u32 << shift)) | (rt >> (24 - shift)));
        }
        0x2e => {
            // swr
            let word = mem.read32(aligned);
            mem.write32(aligned, (word & (0x00ff_ffffu32 >> (24 - shift))) | (rt << shift));
        }
        _ => unreachable!(),
    }
}

fn fpu(state: &mut MipsState, op: MipsOpcode, pc: u32) {
    match op.rs() as u32 {
        0x00 => set_gpr(state, op.rt(), state.fpr_bits(op.fs())),
        0x02 => {
            let v = match op.fs() {
                31 => state.fcr31,
                0 => 0x0000_3351, // FIR: PSP FPU implementation id
                _ => 0,
            };
            set_gpr(state, op.rt(), v);
        }
        0x04 => state.set_fpr_bits(op.fs(), state.gpr[op.rt()]),
        0x06 => {
            if op.fs() == 31 {
                let v = state.gpr[op.rt()];
                state.fcr31 = v;
                state.fpu_cond = (v >> 23) & 1;
            }
        }
        0x10 => fpu_s(state, op, pc),
        0x14 => {
            // W format: cvt.s.w is the only one that matters.
            if op.funct() == 0x20 {
                let v = state.fpr_bits(op.fs()) as i32;
                state.fpr[op.fd()] = v as f32;
            } else {
                error!(op = format_args!("{:08x}", op.0), "unimplemented FPU W-format op");
            }
        }
        _ => {
            error!(op = format_args!("{:08x}", op.0), pc = format_args!("{pc:08x}"),
                   "unimplemented COP1 instruction");
        }
    }
}

fn fpu_s(state: &mut MipsState, op: MipsOpcode, pc: u32) {
    let fs = state.fpr[op.fs()];
    let ft = state.fpr[op.ft()];
    match op.funct() {
        0x00 => state.fpr[op.fd()] = fs + ft,
        0x01 => state.fpr[op.fd()] = fs - ft,
        0x02 => state.fpr[op.fd()] = fs * ft,
        0x03 => state.fpr[op.fd()] = fs / ft,
        0x04 => state.fpr[op.fd()] = fs.sqrt(),
        0x05 => state.fpr[op.fd()] = fs.abs(),
        0x06 => state.fpr[op.fd()] = fs,
        0x07 => state.fpr[op.fd()] = -fs,
        0x0d => {
            // trunc.w.s
            let v = if fs.is_nan() { 0x7fff_ffff } else { fs as i32 as u32 };
            state.set_fpr_bits(op.fd(), v);
        }
        0x24 => {
            // cvt.w.s, default rounding (round to nearest even).
            let v = if fs.is_nan() {
                0x7fff_ffff
            } else {
                fs.round_ties_even() as i32 as u32
            };
            state.set_fpr_bits(op.fd(), v);
        }
        0x30..=0x3f => {
            // c.cond.s: decode the three condition bits.
            let cond = op.funct() & 0xf;
            let unordered = fs.is_nan() || ft.is_nan();
            let less = !unordered && fs < ft;
            let equal = !unordered && fs == ft;
            let result = ((cond & 1 != 0) && unordered)
                || ((cond & 2 != 0) && equal)
                || ((cond & 4 != 0) && less);
            state.set_fpu_cond(result);
        }
        _ => {
            error!(op = format_args!("{:08x}", op.0), pc = format_args!("{pc:08x}"),
                   "unimplemented FPU S-format op");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::RAM_BASE;

    fn fresh() -> (MipsState, GuestMemory) {
        (MipsState::new(), GuestMemory::new())
    }

    fn run(state: &mut MipsState, mem: &mut GuestMemory, word: u32) {
        interpret(state, mem, MipsOpcode(word), RAM_BASE);
    }

    #[test]
    fn test_zero_register_stays_zero() {
        let (mut state, mut mem) = fresh();
        run(&mut state, &mut mem, 0x2400_0007); // addiu $zero, $zero, 7
        assert_eq!(state.gpr[0], 0);
    }

    #[test]
    fn test_div_by_zero_does_not_trap() {
        let (mut state, mut mem) = fresh();
        state.gpr[4] = 100;
        state.gpr[5] = 0;
        run(&mut state, &mut mem, 0x0085_001a); // div $a0, $a1
        assert_eq!(state.lo, 0xffff_ffff);
        assert_eq!(state.hi, 100);
    }

    #[test]
    fn test_div_int_min_by_minus_one() {
        let (mut state, mut mem) = fresh();
        state.gpr[4] = 0x8000_0000;
        state.gpr[5] = 0xffff_ffff;
        run(&mut state, &mut mem, 0x0085_001a);
        assert_eq!(state.lo, 0x8000_0000);
        assert_eq!(state.hi, 0);
    }

    #[test]
    fn test_lwl_lwr_pair_loads_unaligned_word() {
        let (mut state, mut mem) = fresh();
        mem.write32(RAM_BASE, 0x4433_2211);
        mem.write32(RAM_BASE + 4, 0x8877_6655);
        state.gpr[4] = RAM_BASE + 1;
        // lwl $v0, 3($a0); lwr $v0, 0($a0)  (LE idiom for unaligned lw)
        run(&mut state, &mut mem, 0x8882_0003);
        run(&mut state, &mut mem, 0x9882_0000);
        assert_eq!(state.gpr[2], 0x5544_3322);
    }

    #[test]
    fn test_swl_swr_pair_stores_unaligned_word() {
        let (mut state, mut mem) = fresh();
        mem.write32(RAM_BASE, 0xffff_ffff);
        mem.write32(RAM_BASE + 4, 0xffff_ffff);
        state.gpr[4] = RAM_BASE + 1;
        state.gpr[2] = 0xddcc_bbaa;
        // swl $v0, 3($a0); swr $v0, 0($a0)
        run(&mut state, &mut mem, 0xa882_0003);
        run(&mut state, &mut mem, 0xb882_0000);
        assert_eq!(mem.read32(RAM_BASE), 0xccbb_aaff);
        assert_eq!(mem.read32(RAM_BASE + 4), 0xffff_ffdd);
    }

    #[test]
    fn test_fpu_compare_sets_condition() {
        let (mut state, mut mem) = fresh();
        state.fpr[1] = 1.0;
        state.fpr[2] = 2.0;
        // c.lt.s $f1, $f2
        run(&mut state, &mut mem, 0x4602_083c);
        assert_eq!(state.fpu_cond, 1);
        // c.eq.s $f1, $f2
        run(&mut state, &mut mem, 0x4602_0832);
        assert_eq!(state.fpu_cond, 0);
    }

    #[test]
    fn test_madd_accumulates() {
        let (mut state, mut mem) = fresh();
        state.hi = 0;
        state.lo = 10;
        state.gpr[4] = 3;
        state.gpr[5] = 4;
        run(&mut state, &mut mem, 0x0085_001c); // madd $a0, $a1
        assert_eq!(state.lo, 22);
        assert_eq!(state.hi, 0);
    }
}
