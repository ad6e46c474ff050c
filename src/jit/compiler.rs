//! The per-block translator.
//!
//! Walks guest instructions from a block's start address, emitting native
//! code until a control-flow instruction (or a size limit) closes the
//! block. Branches own all the delay-slot choreography:
//!
//!   - ordinary branch, harmless slot: the slot is compiled before the
//!     compare ("nice"), so nothing needs saving.
//!   - ordinary branch, interfering slot: compare first, then compile the
//!     slot with host flags saved around it, then branch on the restored
//!     flags.
//!   - likely branch: the slot only executes on the taken path, so the
//!     conditional jump is emitted first and the slot lands after it.
//!
//! Register flushes emit only moves, which keeps them legal between a
//! compare and the jump that consumes its flags.

use std::ffi::c_void;

use tracing::{debug, error, warn};

use crate::analyst;
use crate::config::RuntimeConfig;
use crate::cpu::{self, REG_RA};
use crate::mem::{GuestMemory, PHYS_MASK};
use crate::mips::tables::{self, InstrClass, InstrMeta, MipsInfo};
use crate::mips::MipsOpcode;

use super::arena::{CodeArena, CodeOffset};
use super::block::MAX_JIT_BLOCK_EXITS;
use super::cache::JitBlockCache;
use super::regcache::GprCache;
use super::x86_64::{Assembler, Cond, Reg};

/// Rust-side helpers reachable from generated code. All take the runtime
/// context (pinned in r13) as their first argument.
#[derive(Clone, Copy)]
pub struct HelperFns {
    /// Interpret one non-branch instruction: (ctx, opcode, pc).
    pub interp: unsafe extern "C" fn(*mut c_void, u32, u32),
    /// HLE syscall entry: (ctx, opcode). pc has already been stored.
    pub syscall: unsafe extern "C" fn(*mut c_void, u32),
    /// Breakpoint instruction: (ctx). pc has already been stored.
    pub brk: unsafe extern "C" fn(*mut c_void),
    /// Run native replacement #index: (ctx, index). Sets pc and charges
    /// cycles itself.
    pub replacement: unsafe extern "C" fn(*mut c_void, u32),
}

enum DelaySlotMode {
    /// The slot cannot affect the branch; compile it before the compare.
    Nice,
    /// Compile after the compare with host flags saved around it.
    SafeFlush,
    /// Unconditional path; just compile and flush.
    Flush,
}

pub struct BlockCompiler<'a> {
    arena: &'a mut CodeArena,
    cache: &'a mut JitBlockCache,
    mem: &'a mut GuestMemory,
    config: &'a RuntimeConfig,
    helpers: HelperFns,
    dispatch: CodeOffset,
    gpr: GprCache,

    block_num: u32,
    block_start: u32,
    compiler_pc: u32,
    num_instructions: usize,
    downcount: i32,
    next_exit: usize,
    in_delay_slot: bool,
    compiling: bool,
}

impl<'a> BlockCompiler<'a> {
    pub fn new(
        arena: &'a mut CodeArena,
        cache: &'a mut JitBlockCache,
        mem: &'a mut GuestMemory,
        config: &'a RuntimeConfig,
        helpers: HelperFns,
    ) -> Self {
        let dispatch = cache.dispatch();
        BlockCompiler {
            arena,
            cache,
            mem,
            config,
            helpers,
            dispatch,
            gpr: GprCache::new(),
            block_num: 0,
            block_start: 0,
            compiler_pc: 0,
            num_instructions: 0,
            downcount: 0,
            next_exit: 0,
            in_delay_slot: false,
            compiling: false,
        }
    }

    /// Translates the block reserved as `block_num`, filling in its entry
    /// points, size and exits. The caller finalizes afterwards.
    pub fn compile(&mut self, block_num: u32) {
        self.block_num = block_num;
        self.block_start = self.cache.block(block_num).original_address;
        self.compiler_pc = self.block_start;
        self.num_instructions = 0;
        self.downcount = 0;
        self.next_exit = 0;
        self.in_delay_slot = false;
        self.compiling = true;
        self.gpr.start();

        let checked_entry = self.emit_checked_entry(self.block_start);
        let normal_entry = self.arena.offset();

        while self.compiling {
            if self.num_instructions >= self.config.max_block_instructions
                || self.arena.space_left() < 0x800
            {
                let continue_at = self.compiler_pc;
                self.gpr.flush_all(self.arena);
                self.write_exit(continue_at);
                break;
            }
            self.compile_at(self.compiler_pc);
            self.compiler_pc += 4;
        }

        let code_size = self.arena.offset().0 - checked_entry.0;
        let b = self.cache.block_mut(block_num);
        b.checked_entry = checked_entry;
        b.normal_entry = normal_entry;
        b.original_size = (self.num_instructions * 4) as u32;
        b.code_size = code_size;
        if self.config.trace_jit {
            debug!(
                block = block_num,
                addr = format_args!("{:08x}", self.block_start),
                instructions = self.num_instructions,
                code_size,
                "compiled block"
            );
        }
    }

    /// Emits a block whose body is one native replacement call covering a
    /// whole recognized function.
    pub fn compile_replacement(&mut self, block_num: u32, index: u32, func_size: u32) {
        self.block_num = block_num;
        self.block_start = self.cache.block(block_num).original_address;

        let checked_entry = self.emit_checked_entry(self.block_start);
        let normal_entry = self.arena.offset();
        {
            let mut asm = Assembler::new(self.arena);
            asm.mov_rr64(Reg::Rdi, Reg::R13);
            asm.mov_ri32(Reg::Rsi, index);
            asm.mov_ri64(Reg::Rax, self.helpers.replacement as usize as u64);
            asm.call_r64(Reg::Rax);
            asm.jmp_to(self.dispatch);
        }
        let code_size = self.arena.offset().0 - checked_entry.0;
        let b = self.cache.block_mut(block_num);
        b.checked_entry = checked_entry;
        b.normal_entry = normal_entry;
        b.original_size = func_size;
        b.code_size = code_size;
    }

    /// Downcount guard: blocks entered by direct links bail back to the
    /// dispatcher once the timeslice is spent.
    fn emit_checked_entry(&mut self, addr: u32) -> CodeOffset {
        self.arena.align(16);
        let checked_entry = self.arena.offset();
        let mut asm = Assembler::new(self.arena);
        asm.cmp_mi32(Reg::R15, cpu::downcount_disp(), 0);
        let ok = asm.jcc_fixup(Cond::G);
        asm.mov_mi32(Reg::R15, cpu::pc_disp(), addr);
        asm.jmp_to(self.dispatch);
        asm.set_jump_target(ok);
        checked_entry
    }

    fn read_op(&self, pc: u32) -> MipsOpcode {
        self.cache.read_guest_opcode(self.mem, pc)
    }

    fn compile_at(&mut self, pc: u32) {
        let op = self.read_op(pc);
        let meta = tables::decode(op);
        self.num_instructions += 1;
        self.downcount += 1;

        if self.in_delay_slot
            && meta
                .info
                .intersects(MipsInfo::DELAYSLOT | MipsInfo::IS_SYSCALL)
        {
            error!(
                pc = format_args!("{pc:08x}"),
                op = format_args!("{:08x}", op.0),
                "branch or syscall in delay slot, skipping"
            );
            return;
        }

        match meta.class {
            InstrClass::Nop => {}
            InstrClass::AluImm => self.comp_alu_imm(op),
            InstrClass::Lui => self.gpr.set_imm(op.rt(), op.imm16() << 16),
            InstrClass::Alu | InstrClass::CondMove => self.comp_alu(op),
            InstrClass::Shift => self.comp_shift(op),
            InstrClass::ShiftVar => self.comp_shift_var(op),
            InstrClass::Mult => self.comp_mult(op),
            InstrClass::HiLo => self.comp_hilo(op),
            InstrClass::Load => self.comp_load(op),
            InstrClass::Store => self.comp_store(op),
            InstrClass::BranchCmp => self.comp_branch_cmp(op, meta),
            InstrClass::BranchZero => self.comp_branch_zero(op, meta),
            InstrClass::BranchFpu => self.comp_branch_fpu(op, meta),
            InstrClass::Jump => self.comp_jump(op, meta),
            InstrClass::JumpReg => self.comp_jump_reg(op),
            InstrClass::Syscall => self.comp_syscall(op, pc),
            InstrClass::Break => self.comp_break(pc),
            InstrClass::Vfpu if meta.info.contains(MipsInfo::IS_CONDBRANCH) => {
                error!(
                    pc = format_args!("{pc:08x}"),
                    "VFPU branch is not supported, ignoring"
                );
            }
            InstrClass::Generic | InstrClass::Vfpu | InstrClass::Unknown => {
                self.comp_generic(op, pc);
            }
        }
    }

    // ==================== delay slots & exits ====================

    fn compile_delay_slot(&mut self, mode: DelaySlotMode) {
        let pc = self.compiler_pc + 4;
        self.in_delay_slot = true;
        match mode {
            DelaySlotMode::Nice => self.compile_at(pc),
            DelaySlotMode::Flush => {
                self.compile_at(pc);
                self.gpr.flush_all(self.arena);
            }
            DelaySlotMode::SafeFlush => {
                self.save_host_flags();
                self.compile_at(pc);
                self.gpr.flush_all(self.arena);
                self.load_host_flags();
            }
        }
        self.in_delay_slot = false;
    }

    /// Accounts for a skipped delay slot (likely branch folded not-taken).
    fn eat_instruction(&mut self) {
        self.num_instructions += 1;
        self.downcount += 1;
    }

    fn save_host_flags(&mut self) {
        let mut asm = Assembler::new(self.arena);
        asm.pushfq();
        asm.pop_r64(Reg::Rax);
        asm.mov_mr64(Reg::R15, cpu::saved_flags_disp(), Reg::Rax);
    }

    fn load_host_flags(&mut self) {
        let mut asm = Assembler::new(self.arena);
        asm.mov_rm64(Reg::Rax, Reg::R15, cpu::saved_flags_disp());
        asm.push_r64(Reg::Rax);
        asm.popfq();
    }

    fn write_downcount(&mut self) {
        if self.downcount != 0 {
            Assembler::new(self.arena).sub_mi32(
                Reg::R15,
                cpu::downcount_disp(),
                self.downcount as u32,
            );
        }
    }

    /// Ends a control path: charge cycles, then either a recorded,
    /// patchable exit stub or (when the static slots are spent) a plain
    /// dispatcher exit.
    fn write_exit(&mut self, dest: u32) {
        self.write_downcount();
        if self.next_exit >= MAX_JIT_BLOCK_EXITS {
            warn!(
                block = self.block_num,
                "static exits exhausted, routing through dispatcher"
            );
            let mut asm = Assembler::new(self.arena);
            asm.mov_mi32(Reg::R15, cpu::pc_disp(), dest);
            asm.jmp_to(self.dispatch);
            return;
        }
        let e = self.next_exit;
        self.next_exit += 1;

        let ptr = self.arena.offset();
        let target = if self.config.block_link {
            self.cache.get_block_number_from_start_address(self.mem, dest)
        } else {
            None
        };
        let linked = match target {
            Some(t) => {
                let entry = self.cache.block(t).checked_entry;
                self.cache.emit_linked_stub(self.arena, entry);
                true
            }
            None => {
                self.cache.emit_exit_stub(self.arena, dest);
                false
            }
        };
        let b = self.cache.block_mut(self.block_num);
        b.exit_address[e] = dest;
        b.exit_ptrs[e] = ptr;
        b.link_status[e] = linked;
    }

    /// Exit to a target computed at runtime, currently in eax.
    fn write_exit_in_eax(&mut self) {
        Assembler::new(self.arena).mov_mr32(Reg::R15, cpu::pc_disp(), Reg::Rax);
        self.write_downcount();
        Assembler::new(self.arena).jmp_to(self.dispatch);
    }

    // ==================== helper calls ====================

    fn call_helper(&mut self, f: usize, arg1: Option<u32>, arg2: Option<u32>) {
        let mut asm = Assembler::new(self.arena);
        asm.mov_rr64(Reg::Rdi, Reg::R13);
        if let Some(a) = arg1 {
            asm.mov_ri32(Reg::Rsi, a);
        }
        if let Some(a) = arg2 {
            asm.mov_ri32(Reg::Rdx, a);
        }
        asm.mov_ri64(Reg::Rax, f as u64);
        asm.call_r64(Reg::Rax);
    }

    /// Interpreter fallback for one instruction. Everything is flushed so
    /// the helper sees and edits authoritative state.
    fn comp_generic(&mut self, op: MipsOpcode, pc: u32) {
        self.gpr.flush_all(self.arena);
        Assembler::new(self.arena).mov_mi32(Reg::R15, cpu::pc_disp(), pc);
        self.call_helper(self.helpers.interp as usize, Some(op.0), Some(pc));
    }

    fn comp_syscall(&mut self, op: MipsOpcode, pc: u32) {
        self.gpr.flush_all(self.arena);
        // The handler sees pc past the instruction and may redirect it; the
        // dispatcher picks up whatever it left there.
        Assembler::new(self.arena).mov_mi32(Reg::R15, cpu::pc_disp(), pc + 4);
        self.call_helper(self.helpers.syscall as usize, Some(op.0), None);
        self.write_downcount();
        Assembler::new(self.arena).jmp_to(self.dispatch);
        self.compiling = false;
    }

    fn comp_break(&mut self, pc: u32) {
        self.gpr.flush_all(self.arena);
        Assembler::new(self.arena).mov_mi32(Reg::R15, cpu::pc_disp(), pc);
        self.call_helper(self.helpers.brk as usize, None, None);
        self.write_downcount();
        Assembler::new(self.arena).jmp_to(self.dispatch);
        self.compiling = false;
    }

    // ==================== integer ALU ====================

    fn comp_alu_imm(&mut self, op: MipsOpcode) {
        let rt = op.rt();
        let rs = op.rs();
        if rt == 0 {
            return;
        }
        let simm = op.simm16();
        let uimm = op.imm16();

        if let Some(v) = self.gpr.get_imm(rs) {
            let folded = match op.op() {
                0x08 | 0x09 => v.wrapping_add(simm as u32),
                0x0a => ((v as i32) < simm) as u32,
                0x0b => (v < simm as u32) as u32,
                0x0c => v & uimm,
                0x0d => v | uimm,
                0x0e => v ^ uimm,
                _ => unreachable!(),
            };
            self.gpr.set_imm(rt, folded);
            return;
        }

        self.gpr.spill_lock(&[rs, rt]);
        let rs_r = self.gpr.map_in(self.arena, rs);
        let rt_r = if rt == rs {
            self.gpr.map_dirty(self.arena, rt, true)
        } else {
            let r = self.gpr.map_dirty(self.arena, rt, false);
            if !matches!(op.op(), 0x0a | 0x0b) {
                Assembler::new(self.arena).mov_rr32(r, rs_r);
            }
            r
        };
        let mut asm = Assembler::new(self.arena);
        match op.op() {
            0x08 | 0x09 => asm.add_ri32(rt_r, simm as u32),
            0x0a => {
                asm.cmp_ri32(rs_r, simm as u32);
                asm.setcc(Cond::L, rt_r);
                asm.movzx8_rr32(rt_r, rt_r);
            }
            0x0b => {
                asm.cmp_ri32(rs_r, simm as u32);
                asm.setcc(Cond::B, rt_r);
                asm.movzx8_rr32(rt_r, rt_r);
            }
            0x0c => asm.and_ri32(rt_r, uimm),
            0x0d => asm.or_ri32(rt_r, uimm),
            0x0e => asm.xor_ri32(rt_r, uimm),
            _ => unreachable!(),
        }
        self.gpr.release_spill_locks();
    }

    fn comp_alu(&mut self, op: MipsOpcode) {
        let rd = op.rd();
        let rs = op.rs();
        let rt = op.rt();
        if rd == 0 {
            return;
        }
        let funct = op.funct();

        if let (Some(a), Some(b)) = (self.gpr.get_imm(rs), self.gpr.get_imm(rt)) {
            let folded = match funct {
                0x20 | 0x21 => Some(a.wrapping_add(b)),
                0x22 | 0x23 => Some(a.wrapping_sub(b)),
                0x24 => Some(a & b),
                0x25 => Some(a | b),
                0x26 => Some(a ^ b),
                0x27 => Some(!(a | b)),
                0x2a => Some(((a as i32) < b as i32) as u32),
                0x2b => Some((a < b) as u32),
                0x0a => (b == 0).then_some(a), // movz folds only when it moves
                0x0b => (b != 0).then_some(a),
                _ => None,
            };
            match (funct, folded) {
                (0x0a | 0x0b, None) => return, // a conditional move that does nothing
                (_, Some(v)) => {
                    self.gpr.set_imm(rd, v);
                    return;
                }
                _ => {}
            }
        }

        self.gpr.spill_lock(&[rd, rs, rt]);
        match funct {
            // movz/movn
            0x0a | 0x0b => {
                let rs_r = self.gpr.map_in(self.arena, rs);
                let rt_r = self.gpr.map_in(self.arena, rt);
                let rd_r = self.gpr.map_dirty(self.arena, rd, true);
                let mut asm = Assembler::new(self.arena);
                asm.test_rr32(rt_r, rt_r);
                let cond = if funct == 0x0a { Cond::E } else { Cond::Ne };
                asm.cmovcc_rr32(cond, rd_r, rs_r);
            }
            // slt/sltu
            0x2a | 0x2b => {
                let rs_r = self.gpr.map_in(self.arena, rs);
                let rt_r = self.gpr.map_in(self.arena, rt);
                let rd_r = self.gpr.map_dirty(self.arena, rd, rd == rs || rd == rt);
                let mut asm = Assembler::new(self.arena);
                asm.cmp_rr32(rs_r, rt_r);
                let cond = if funct == 0x2a { Cond::L } else { Cond::B };
                asm.setcc(cond, rd_r);
                asm.movzx8_rr32(rd_r, rd_r);
            }
            _ => {
                if rd == rs {
                    let rt_r = self.gpr.map_in(self.arena, rt);
                    let rd_r = self.gpr.map_dirty(self.arena, rd, true);
                    self.emit_alu_op(funct, rd_r, rt_r, false);
                } else if rd == rt {
                    let rs_r = self.gpr.map_in(self.arena, rs);
                    let rd_r = self.gpr.map_dirty(self.arena, rd, true);
                    self.emit_alu_op(funct, rd_r, rs_r, true);
                } else {
                    let rs_r = self.gpr.map_in(self.arena, rs);
                    let rt_r = self.gpr.map_in(self.arena, rt);
                    let rd_r = self.gpr.map_dirty(self.arena, rd, false);
                    Assembler::new(self.arena).mov_rr32(rd_r, rs_r);
                    self.emit_alu_op(funct, rd_r, rt_r, false);
                }
            }
        }
        self.gpr.release_spill_locks();
    }

    /// dst = dst OP src. With `reversed`, dst holds the right operand and
    /// src the left (the destination aliased rt).
    fn emit_alu_op(&mut self, funct: u32, dst: Reg, src: Reg, reversed: bool) {
        let mut asm = Assembler::new(self.arena);
        match funct {
            0x20 | 0x21 => asm.add_rr32(dst, src),
            0x22 | 0x23 => {
                asm.sub_rr32(dst, src);
                if reversed {
                    // Computed rt - rs; negate for rs - rt.
                    asm.neg_r32(dst);
                }
            }
            0x24 => asm.and_rr32(dst, src),
            0x25 => asm.or_rr32(dst, src),
            0x26 => asm.xor_rr32(dst, src),
            0x27 => {
                asm.or_rr32(dst, src);
                asm.not_r32(dst);
            }
            _ => unreachable!(),
        }
    }

    fn comp_shift(&mut self, op: MipsOpcode) {
        let rd = op.rd();
        let rt = op.rt();
        if rd == 0 {
            return;
        }
        let sa = op.sa();
        if let Some(v) = self.gpr.get_imm(rt) {
            let folded = match op.funct() {
                0x00 => v << sa,
                0x02 => v >> sa,
                0x03 => ((v as i32) >> sa) as u32,
                _ => unreachable!(),
            };
            self.gpr.set_imm(rd, folded);
            return;
        }
        self.gpr.spill_lock(&[rd, rt]);
        let rt_r = self.gpr.map_in(self.arena, rt);
        let rd_r = if rd == rt {
            self.gpr.map_dirty(self.arena, rd, true)
        } else {
            let r = self.gpr.map_dirty(self.arena, rd, false);
            Assembler::new(self.arena).mov_rr32(r, rt_r);
            r
        };
        if sa != 0 {
            let mut asm = Assembler::new(self.arena);
            match op.funct() {
                0x00 => asm.shl_ri32(rd_r, sa),
                0x02 => asm.shr_ri32(rd_r, sa),
                0x03 => asm.sar_ri32(rd_r, sa),
                _ => unreachable!(),
            }
        }
        self.gpr.release_spill_locks();
    }

    fn comp_shift_var(&mut self, op: MipsOpcode) {
        let rd = op.rd();
        let rt = op.rt();
        let rs = op.rs();
        if rd == 0 {
            return;
        }
        if let Some(amount) = self.gpr.get_imm(rs) {
            // Known amount: rewrite into the constant form (clear the sa
            // field and the variable funct bit, insert the amount).
            let sa = amount & 0x1f;
            let shifted = MipsOpcode((op.0 & !0x07c4) | (sa << 6));
            self.comp_shift(shifted);
            return;
        }
        self.gpr.spill_lock(&[rd, rt, rs]);
        let rs_r = self.gpr.map_in(self.arena, rs);
        Assembler::new(self.arena).mov_rr32(Reg::Rcx, rs_r);
        let rt_r = self.gpr.map_in(self.arena, rt);
        let rd_r = if rd == rt {
            self.gpr.map_dirty(self.arena, rd, true)
        } else {
            let r = self.gpr.map_dirty(self.arena, rd, false);
            Assembler::new(self.arena).mov_rr32(r, rt_r);
            r
        };
        let mut asm = Assembler::new(self.arena);
        match op.funct() {
            0x04 => asm.shl_cl32(rd_r),
            0x06 => asm.shr_cl32(rd_r),
            0x07 => asm.sar_cl32(rd_r),
            _ => unreachable!(),
        }
        self.gpr.release_spill_locks();
    }

    fn comp_mult(&mut self, op: MipsOpcode) {
        self.gpr.spill_lock(&[op.rs(), op.rt()]);
        let rs_r = self.gpr.map_in(self.arena, op.rs());
        let rt_r = self.gpr.map_in(self.arena, op.rt());
        let mut asm = Assembler::new(self.arena);
        asm.mov_rr32(Reg::Rax, rs_r);
        match op.funct() {
            0x18 => asm.imul_r32(rt_r),
            0x19 => asm.mul_r32(rt_r),
            _ => unreachable!(),
        }
        asm.mov_mr32(Reg::R15, cpu::lo_disp(), Reg::Rax);
        asm.mov_mr32(Reg::R15, cpu::hi_disp(), Reg::Rdx);
        self.gpr.release_spill_locks();
    }

    fn comp_hilo(&mut self, op: MipsOpcode) {
        match op.funct() {
            // mfhi/mflo
            0x10 | 0x12 => {
                let rd = op.rd();
                if rd == 0 {
                    return;
                }
                let disp = if op.funct() == 0x10 {
                    cpu::hi_disp()
                } else {
                    cpu::lo_disp()
                };
                let rd_r = self.gpr.map_dirty(self.arena, rd, false);
                Assembler::new(self.arena).mov_rm32(rd_r, Reg::R15, disp);
            }
            // mthi/mtlo
            0x11 | 0x13 => {
                let rs = op.rs();
                let disp = if op.funct() == 0x11 {
                    cpu::hi_disp()
                } else {
                    cpu::lo_disp()
                };
                if let Some(v) = self.gpr.get_imm(rs) {
                    Assembler::new(self.arena).mov_mi32(Reg::R15, disp, v);
                } else {
                    let rs_r = self.gpr.map_in(self.arena, rs);
                    Assembler::new(self.arena).mov_mr32(Reg::R15, disp, rs_r);
                }
            }
            _ => unreachable!(),
        }
    }

    // ==================== memory ====================

    /// Leaves the masked physical address in eax.
    fn emit_address_calc(&mut self, op: MipsOpcode) {
        let rs = op.rs();
        let simm = op.simm16();
        if let Some(base) = self.gpr.get_imm(rs) {
            let phys = base.wrapping_add(simm as u32) & PHYS_MASK;
            Assembler::new(self.arena).mov_ri32(Reg::Rax, phys);
            return;
        }
        let rs_r = self.gpr.map_in(self.arena, rs);
        let mut asm = Assembler::new(self.arena);
        asm.lea32(Reg::Rax, rs_r, simm);
        asm.and_ri32(Reg::Rax, PHYS_MASK);
    }

    fn comp_load(&mut self, op: MipsOpcode) {
        let rt = op.rt();
        if rt == 0 {
            // A load to $zero is a prefetch idiom; no side effects here.
            return;
        }
        self.gpr.spill_lock(&[op.rs(), rt]);
        self.emit_address_calc(op);
        let rt_r = self.gpr.map_dirty(self.arena, rt, false);
        let mut asm = Assembler::new(self.arena);
        match op.op() {
            0x20 => asm.movsx8_rm32_sib(rt_r, Reg::R14, Reg::Rax),
            0x21 => asm.movsx16_rm32_sib(rt_r, Reg::R14, Reg::Rax),
            0x23 => asm.mov_rm32_sib(rt_r, Reg::R14, Reg::Rax),
            0x24 => asm.movzx8_rm32_sib(rt_r, Reg::R14, Reg::Rax),
            0x25 => asm.movzx16_rm32_sib(rt_r, Reg::R14, Reg::Rax),
            _ => unreachable!(),
        }
        self.gpr.release_spill_locks();
    }

    fn comp_store(&mut self, op: MipsOpcode) {
        let rt = op.rt();
        self.gpr.spill_lock(&[op.rs(), rt]);
        self.emit_address_calc(op);
        let rt_r = self.gpr.map_in(self.arena, rt);
        let mut asm = Assembler::new(self.arena);
        match op.op() {
            0x28 => asm.mov_mr8_sib(Reg::R14, Reg::Rax, rt_r),
            0x29 => asm.mov_mr16_sib(Reg::R14, Reg::Rax, rt_r),
            0x2b => asm.mov_mr32_sib(Reg::R14, Reg::Rax, rt_r),
            _ => unreachable!(),
        }
        self.gpr.release_spill_locks();
    }

    // ==================== branches ====================

    /// Shared tail for conditional branches, after the compare has been
    /// emitted. `cc` jumps when the branch is NOT taken.
    fn comp_branch_exits(
        &mut self,
        cc: Cond,
        target: u32,
        not_taken: u32,
        likely: bool,
        nice: bool,
    ) {
        if !likely {
            if nice {
                // Slot already compiled; only moves follow, flags survive.
                self.gpr.flush_all(self.arena);
            } else {
                self.compile_delay_slot(DelaySlotMode::SafeFlush);
            }
            let skip = Assembler::new(self.arena).jcc_fixup(cc);
            self.write_exit(target);
            Assembler::new(self.arena).set_jump_target(skip);
            self.write_exit(not_taken);
        } else {
            self.gpr.flush_all(self.arena);
            let skip = Assembler::new(self.arena).jcc_fixup(cc);
            // The delay slot belongs to the taken path only.
            self.compile_delay_slot(DelaySlotMode::Flush);
            self.write_exit(target);
            Assembler::new(self.arena).set_jump_target(skip);
            self.write_exit(not_taken);
        }
        self.compiling = false;
    }

    /// Both operands constant: one side of the branch is dead.
    fn comp_branch_folded(&mut self, taken: bool, target: u32, not_taken: u32, likely: bool) {
        if likely && !taken {
            // The delay slot of an untaken likely branch never runs.
            self.eat_instruction();
            self.gpr.flush_all(self.arena);
        } else {
            self.compile_delay_slot(DelaySlotMode::Flush);
        }
        self.write_exit(if taken { target } else { not_taken });
        self.compiling = false;
    }

    fn comp_branch_cmp(&mut self, op: MipsOpcode, meta: InstrMeta) {
        let pc = self.compiler_pc;
        let likely = meta.info.contains(MipsInfo::LIKELY);
        let rs = op.rs();
        let rt = op.rt();
        let target = op.branch_target(pc);
        let not_taken = pc + 8;
        // beq branches on equality; the not-taken jump is its inverse.
        let cc = if op.op() & 1 == 0 { Cond::Ne } else { Cond::E };

        if let (Some(a), Some(b)) = (self.gpr.get_imm(rs), self.gpr.get_imm(rt)) {
            let taken = if op.op() & 1 == 0 { a == b } else { a != b };
            self.comp_branch_folded(taken, target, not_taken, likely);
            return;
        }

        let ds = self.read_op(pc + 4);
        let nice = analyst::is_delay_slot_nice_reg(ds, rs, rt);
        if !likely && nice {
            self.compile_delay_slot(DelaySlotMode::Nice);
        }

        // Equality is symmetric, so a constant on either side can be the
        // immediate operand.
        if let Some(b) = self.gpr.get_imm(rt) {
            let rs_r = self.gpr.map_in(self.arena, rs);
            Assembler::new(self.arena).cmp_ri32(rs_r, b);
        } else if let Some(a) = self.gpr.get_imm(rs) {
            let rt_r = self.gpr.map_in(self.arena, rt);
            Assembler::new(self.arena).cmp_ri32(rt_r, a);
        } else {
            self.gpr.spill_lock(&[rs, rt]);
            let rs_r = self.gpr.map_in(self.arena, rs);
            let rt_r = self.gpr.map_in(self.arena, rt);
            Assembler::new(self.arena).cmp_rr32(rs_r, rt_r);
            self.gpr.release_spill_locks();
        }

        self.comp_branch_exits(cc, target, not_taken, likely, nice);
    }

    fn comp_branch_zero(&mut self, op: MipsOpcode, meta: InstrMeta) {
        let pc = self.compiler_pc;
        let likely = meta.info.contains(MipsInfo::LIKELY);
        let and_link = meta.info.contains(MipsInfo::OUT_RA);
        let rs = op.rs();
        let target = op.branch_target(pc);
        let not_taken = pc + 8;

        // cc jumps when NOT taken.
        let cc = if op.op() == 0x01 {
            if op.rt() & 1 == 0 {
                Cond::Ge // bltz
            } else {
                Cond::L // bgez
            }
        } else if op.op() & 1 == 0 {
            Cond::G // blez
        } else {
            Cond::Le // bgtz
        };

        if let Some(v) = self.gpr.get_imm(rs) {
            let v = v as i32;
            let taken = match cc {
                Cond::Ge => v < 0,
                Cond::L => v >= 0,
                Cond::G => v <= 0,
                _ => v > 0,
            };
            if and_link {
                self.gpr.set_imm(REG_RA, pc + 8);
            }
            self.comp_branch_folded(taken, target, not_taken, likely);
            return;
        }

        let ds = self.read_op(pc + 4);
        let nice =
            analyst::is_delay_slot_nice_reg(ds, rs, if and_link { REG_RA } else { 0 });
        if !likely && nice {
            self.compile_delay_slot(DelaySlotMode::Nice);
        }

        let rs_r = self.gpr.map_in(self.arena, rs);
        Assembler::new(self.arena).cmp_ri32(rs_r, 0);
        if and_link {
            self.gpr.set_imm(REG_RA, pc + 8);
        }
        self.comp_branch_exits(cc, target, not_taken, likely, nice);
    }

    fn comp_branch_fpu(&mut self, op: MipsOpcode, meta: InstrMeta) {
        let pc = self.compiler_pc;
        let likely = meta.info.contains(MipsInfo::LIKELY);
        let target = op.branch_target(pc);
        let not_taken = pc + 8;
        // bc1t branches when the condition bit is set.
        let cc = if op.rt() & 1 == 1 { Cond::E } else { Cond::Ne };

        let ds = self.read_op(pc + 4);
        let nice = analyst::is_delay_slot_nice_fpu(ds);
        if !likely && nice {
            self.compile_delay_slot(DelaySlotMode::Nice);
        }
        Assembler::new(self.arena).cmp_mi32(Reg::R15, cpu::fpu_cond_disp(), 0);
        self.comp_branch_exits(cc, target, not_taken, likely, nice);
    }

    fn comp_jump(&mut self, op: MipsOpcode, meta: InstrMeta) {
        let pc = self.compiler_pc;
        let target = op.jump_target(pc);
        if meta.info.contains(MipsInfo::OUT_RA) {
            self.gpr.set_imm(REG_RA, pc + 8);
        }
        self.compile_delay_slot(DelaySlotMode::Flush);
        self.write_exit(target);
        self.compiling = false;
    }

    fn comp_jump_reg(&mut self, op: MipsOpcode) {
        let pc = self.compiler_pc;
        let rs = op.rs();
        let and_link = op.funct() == 0x09;
        let rd = op.rd();

        if let Some(target) = self.gpr.get_imm(rs) {
            // Register target known at compile time (lui/ori thunks);
            // becomes a static exit like a plain jump.
            if and_link && rd != 0 {
                self.gpr.set_imm(rd, pc + 8);
            }
            self.compile_delay_slot(DelaySlotMode::Flush);
            self.write_exit(target);
            self.compiling = false;
            return;
        }

        let ds = self.read_op(pc + 4);
        if analyst::is_delay_slot_nice_reg(ds, rs, 0) {
            self.compile_delay_slot(DelaySlotMode::Nice);
            if and_link && rd != 0 {
                self.gpr.set_imm(rd, pc + 8);
            }
            let rs_r = self.gpr.map_in(self.arena, rs);
            Assembler::new(self.arena).mov_rr32(Reg::Rax, rs_r);
            self.gpr.flush_all(self.arena);
        } else {
            // The slot may overwrite rs; park the target in state first.
            let rs_r = self.gpr.map_in(self.arena, rs);
            Assembler::new(self.arena).mov_mr32(Reg::R15, cpu::temp_pc_disp(), rs_r);
            if and_link && rd != 0 {
                self.gpr.set_imm(rd, pc + 8);
            }
            self.compile_delay_slot(DelaySlotMode::Flush);
            Assembler::new(self.arena).mov_rm32(Reg::Rax, Reg::R15, cpu::temp_pc_disp());
        }
        self.write_exit_in_eax();
        self.compiling = false;
    }
}
