//! Emitted entry/dispatch trampolines.
//!
//! `enter` is the only crossing point between Rust and generated code. It
//! saves callee-saved registers, pins the runtime pointers and falls into
//! the dispatch loop, which asks a Rust helper for the next block to run.
//! The helper returns null to leave the loop (timeslice over, core halted,
//! or nothing compilable at pc).
//!
//! Pinned registers, for the whole time generated code is on the stack:
//!   r15 = &mut MipsState
//!   r14 = guest memory base (physical offset addressing)
//!   r13 = runtime context passed back to helpers
//!
//! Stack discipline: after the prologue rsp is 16-byte aligned, and every
//! block-level helper call happens at that alignment. Blocks are entered by
//! jumps, never calls.

use std::ffi::c_void;

use crate::cpu::MipsState;

use super::arena::{CodeArena, CodeOffset};
use super::x86_64::{Assembler, Cond, Reg};

/// Signature of the emitted entry point.
pub type EnterFn = unsafe extern "C" fn(ctx: *mut c_void, state: *mut MipsState, membase: *mut u8);

/// Signature of the Rust-side dispatch helper: returns the host address to
/// jump to, or null to leave the dispatcher.
pub type DispatchHelper = unsafe extern "C" fn(ctx: *mut c_void) -> *const u8;

#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    pub enter: CodeOffset,
    /// Jump target for block exits that go back through the lookup loop.
    pub dispatch: CodeOffset,
}

impl Dispatcher {
    pub fn enter_fn(&self, arena: &CodeArena) -> EnterFn {
        unsafe { std::mem::transmute(arena.ptr_at(self.enter)) }
    }
}

/// Emits the trampolines at the arena cursor.
pub fn generate(arena: &mut CodeArena, dispatch_helper: DispatchHelper) -> Dispatcher {
    arena.align(16);
    let enter = arena.offset();
    let mut asm = Assembler::new(arena);

    // System V: args in rdi (ctx), rsi (state), rdx (membase).
    asm.push_r64(Reg::Rbx);
    asm.push_r64(Reg::Rbp);
    asm.push_r64(Reg::R12);
    asm.push_r64(Reg::R13);
    asm.push_r64(Reg::R14);
    asm.push_r64(Reg::R15);
    // 6 pushes on top of the return address: realign to 16.
    asm.sub_ri64(Reg::Rsp, 8);
    asm.mov_rr64(Reg::R13, Reg::Rdi);
    asm.mov_rr64(Reg::R15, Reg::Rsi);
    asm.mov_rr64(Reg::R14, Reg::Rdx);

    let dispatch = asm.offset();
    asm.mov_rr64(Reg::Rdi, Reg::R13);
    asm.mov_ri64(Reg::Rax, dispatch_helper as usize as u64);
    asm.call_r64(Reg::Rax);
    asm.test_rr64(Reg::Rax, Reg::Rax);
    let leave = asm.jcc_fixup(Cond::E);
    asm.jmp_r64(Reg::Rax);

    asm.set_jump_target(leave);
    asm.add_ri64(Reg::Rsp, 8);
    asm.pop_r64(Reg::R15);
    asm.pop_r64(Reg::R14);
    asm.pop_r64(Reg::R13);
    asm.pop_r64(Reg::R12);
    asm.pop_r64(Reg::Rbp);
    asm.pop_r64(Reg::Rbx);
    asm.ret();

    Dispatcher { enter, dispatch }
}
