//! Guest CPU state.
//!
//! The register file is a fixed-layout struct that compiled code reads and
//! writes directly by computed byte offset, so the layout is `repr(C)` and
//! the offsets are exposed as constants-by-function below.

use std::mem::offset_of;

/// The `$zero` register, hardwired to 0.
pub const REG_ZERO: usize = 0;
/// The return-address register `$ra`.
pub const REG_RA: usize = 31;
/// The syscall/function result register `$v0`.
pub const REG_V0: usize = 2;

/// Coarse run state, stored as a plain `u32` so the dispatcher helper can
/// test it without any enum layout assumptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CoreState {
    Running = 0,
    Halted = 1,
}

/// The MIPS32 (Allegrex) register file and execution bookkeeping.
///
/// Compiled code keeps a pointer to this struct pinned in a host register and
/// addresses every field by offset, so fields must not be reordered.
#[repr(C)]
pub struct MipsState {
    /// Current guest program counter.
    pub pc: u32,
    /// Cycles remaining in the current timeslice. Blocks subtract their cycle
    /// estimate on exit; checked entries bail out when this is <= 0.
    pub downcount: i32,
    /// General purpose registers. Index 0 always reads as zero.
    pub gpr: [u32; 32],
    pub hi: u32,
    pub lo: u32,
    /// FPU registers, bit-addressed through `fpr_bits`/`set_fpr_bits` when
    /// integer views are needed (mfc1/mtc1).
    pub fpr: [f32; 32],
    /// FPU control/status register.
    pub fcr31: u32,
    /// The FPU condition bit (fcr31 bit 23), mirrored into its own word so
    /// bc1f/bc1t compile to a single memory compare.
    pub fpu_cond: u32,
    /// VFPU condition codes, kept only so delay-slot analysis can reason
    /// about them; no VFPU ops are compiled natively.
    pub vfpu_cc: u32,
    /// Set by the interpreter while executing a delay slot.
    pub in_delay_slot: u32,
    /// `CoreState` as a raw word.
    pub core_state: u32,
    /// Scratch slot for host flag save/restore around delay slots.
    pub saved_flags: u64,
    /// Scratch slot for indirect-jump targets held across a delay slot.
    pub temp_pc: u32,
}

impl MipsState {
    pub fn new() -> Self {
        MipsState {
            pc: 0,
            downcount: 0,
            gpr: [0; 32],
            hi: 0,
            lo: 0,
            fpr: [0.0; 32],
            fcr31: 0,
            fpu_cond: 0,
            vfpu_cc: 0,
            in_delay_slot: 0,
            core_state: CoreState::Running as u32,
            saved_flags: 0,
            temp_pc: 0,
        }
    }

    pub fn reset(&mut self, entry: u32) {
        *self = MipsState::new();
        self.pc = entry;
    }

    pub fn is_running(&self) -> bool {
        self.core_state == CoreState::Running as u32
    }

    pub fn halt(&mut self) {
        self.core_state = CoreState::Halted as u32;
    }

    pub fn fpr_bits(&self, i: usize) -> u32 {
        self.fpr[i].to_bits()
    }

    pub fn set_fpr_bits(&mut self, i: usize, bits: u32) {
        self.fpr[i] = f32::from_bits(bits);
    }

    /// Sets the FPU condition bit, keeping fcr31 and the mirror in sync.
    pub fn set_fpu_cond(&mut self, cond: bool) {
        self.fpu_cond = cond as u32;
        if cond {
            self.fcr31 |= 1 << 23;
        } else {
            self.fcr31 &= !(1 << 23);
        }
    }
}

impl Default for MipsState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn pc_disp() -> i32 {
    offset_of!(MipsState, pc) as i32
}

pub fn downcount_disp() -> i32 {
    offset_of!(MipsState, downcount) as i32
}

pub fn gpr_disp(r: usize) -> i32 {
    debug_assert!(r < 32);
    (offset_of!(MipsState, gpr) + r * 4) as i32
}

pub fn hi_disp() -> i32 {
    offset_of!(MipsState, hi) as i32
}

pub fn lo_disp() -> i32 {
    offset_of!(MipsState, lo) as i32
}

pub fn fpu_cond_disp() -> i32 {
    offset_of!(MipsState, fpu_cond) as i32
}

pub fn saved_flags_disp() -> i32 {
    offset_of!(MipsState, saved_flags) as i32
}

pub fn temp_pc_disp() -> i32 {
    offset_of!(MipsState, temp_pc) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpr_offsets_are_contiguous() {
        assert_eq!(gpr_disp(1), gpr_disp(0) + 4);
        assert_eq!(gpr_disp(31), gpr_disp(0) + 124);
    }

    #[test]
    fn test_fpu_cond_mirror() {
        let mut state = MipsState::new();
        state.set_fpu_cond(true);
        assert_eq!(state.fpu_cond, 1);
        assert_ne!(state.fcr31 & (1 << 23), 0);
        state.set_fpu_cond(false);
        assert_eq!(state.fpu_cond, 0);
        assert_eq!(state.fcr31 & (1 << 23), 0);
    }
}
