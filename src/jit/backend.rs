//! Host-architecture capability surface.
//!
//! The block cache's graph algorithms (linking, unlinking, destroying) are
//! backend-agnostic; everything that actually writes host instructions sits
//! behind this trait. Stub layouts are fixed-size so patches can always be
//! written over the bytes they replace.

use crate::cpu;

use super::arena::{CodeArena, CodeOffset};
use super::x86_64::{Assembler, Reg};

/// Everything the block cache needs from a code generator backend.
pub trait HostArch {
    /// Fixed byte size of one exit stub.
    fn exit_stub_size(&self) -> usize;

    /// Appends an unlinked exit stub at the cursor: store the destination
    /// into the guest pc, then jump to the dispatcher. Padded to
    /// `exit_stub_size`.
    fn emit_exit_stub(&self, arena: &mut CodeArena, guest_dest: u32, dispatch: CodeOffset);

    /// Appends an already-linked exit stub: a direct jump to `entry`,
    /// padded to `exit_stub_size` so it can be unlinked later.
    fn emit_linked_stub(&self, arena: &mut CodeArena, entry: CodeOffset);

    /// Overwrites the exit stub at `exit_ptr` with a direct jump to
    /// `entry` (a target block's checked entry).
    fn link_jump(&self, arena: &mut CodeArena, exit_ptr: CodeOffset, entry: CodeOffset);

    /// Restores the exit stub at `exit_ptr` to its unlinked form.
    fn unlink_jump(
        &self,
        arena: &mut CodeArena,
        exit_ptr: CodeOffset,
        guest_dest: u32,
        dispatch: CodeOffset,
    );

    /// Overwrites a destroyed block's checked entry so stale linked jumps
    /// that still land there fall back to the dispatcher.
    fn write_redirect(
        &self,
        arena: &mut CodeArena,
        checked_entry: CodeOffset,
        guest_pc: u32,
        dispatch: CodeOffset,
    );

    /// Whether the stub at `exit_ptr` is currently a direct jump.
    fn is_linked(&self, arena: &CodeArena, exit_ptr: CodeOffset) -> bool;
}

/// x86-64 backend. Guest pc lives at `[r15 + pc_disp]`.
pub struct X64Arch {
    pc_disp: i32,
}

/// mov dword [r15 + pc], imm32 (7..8 bytes) + jmp rel32 (5 bytes), padded.
const EXIT_STUB_SIZE: usize = 16;

impl X64Arch {
    pub fn new() -> Self {
        X64Arch {
            pc_disp: cpu::pc_disp(),
        }
    }

    fn pad_to(&self, arena: &mut CodeArena, end: CodeOffset) {
        while arena.offset() < end {
            arena.emit_u8(0xCC);
        }
    }
}

impl Default for X64Arch {
    fn default() -> Self {
        Self::new()
    }
}

impl HostArch for X64Arch {
    fn exit_stub_size(&self) -> usize {
        EXIT_STUB_SIZE
    }

    fn emit_exit_stub(&self, arena: &mut CodeArena, guest_dest: u32, dispatch: CodeOffset) {
        let start = arena.offset();
        let end = CodeOffset(start.0 + EXIT_STUB_SIZE as u32);
        {
            let mut asm = Assembler::new(arena);
            asm.mov_mi32(Reg::R15, self.pc_disp, guest_dest);
            asm.jmp_to(dispatch);
        }
        self.pad_to(arena, end);
    }

    fn emit_linked_stub(&self, arena: &mut CodeArena, entry: CodeOffset) {
        let start = arena.offset();
        let end = CodeOffset(start.0 + EXIT_STUB_SIZE as u32);
        Assembler::new(arena).jmp_to(entry);
        self.pad_to(arena, end);
    }

    fn link_jump(&self, arena: &mut CodeArena, exit_ptr: CodeOffset, entry: CodeOffset) {
        arena.patch_at(exit_ptr, |arena| {
            let end = CodeOffset(exit_ptr.0 + EXIT_STUB_SIZE as u32);
            Assembler::new(arena).jmp_to(entry);
            self.pad_to(arena, end);
        });
    }

    fn unlink_jump(
        &self,
        arena: &mut CodeArena,
        exit_ptr: CodeOffset,
        guest_dest: u32,
        dispatch: CodeOffset,
    ) {
        arena.patch_at(exit_ptr, |arena| {
            let end = CodeOffset(exit_ptr.0 + EXIT_STUB_SIZE as u32);
            let mut asm = Assembler::new(arena);
            asm.mov_mi32(Reg::R15, self.pc_disp, guest_dest);
            asm.jmp_to(dispatch);
            self.pad_to(arena, end);
        });
    }

    fn write_redirect(
        &self,
        arena: &mut CodeArena,
        checked_entry: CodeOffset,
        guest_pc: u32,
        dispatch: CodeOffset,
    ) {
        // The redirect is shorter than any checked entry, and the jump makes
        // the stale tail unreachable.
        arena.patch_at(checked_entry, |arena| {
            let mut asm = Assembler::new(arena);
            asm.mov_mi32(Reg::R15, self.pc_disp, guest_pc);
            asm.jmp_to(dispatch);
        });
    }

    fn is_linked(&self, arena: &CodeArena, exit_ptr: CodeOffset) -> bool {
        arena.read_u8(exit_ptr) == 0xE9
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_stub_layout_round_trips() {
        let mut arena = CodeArena::new(4096).unwrap();
        let arch = X64Arch::new();
        // Pretend the dispatcher lives at 0.
        Assembler::new(&mut arena).ret();
        let stub = arena.offset();
        arch.emit_exit_stub(&mut arena, 0x0800_0000, CodeOffset(0));
        assert_eq!(arena.offset().0 - stub.0, EXIT_STUB_SIZE as u32);
        assert!(!arch.is_linked(&arena, stub));

        arch.link_jump(&mut arena, stub, CodeOffset(0));
        assert!(arch.is_linked(&arena, stub));

        arch.unlink_jump(&mut arena, stub, 0x0800_0000, CodeOffset(0));
        assert!(!arch.is_linked(&arena, stub));
        // The unlinked form stores the destination pc as its immediate.
        assert_eq!(arena.read_u32(CodeOffset(stub.0 + 3)), 0x0800_0000);
    }
}
