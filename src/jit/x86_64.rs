//! x86-64 instruction encoding.
//!
//! Encodes into the code arena. Uses System V AMD64 ABI conventions. Guest
//! registers are 32-bit, so most of the surface here is the 32-bit operand
//! forms; the 64-bit forms exist for pointer plumbing in the trampolines.

use super::arena::{CodeArena, CodeOffset};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// REX.B bit (base/rm position).
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    /// REX.X bit (index position).
    pub fn rex_x(self) -> u8 {
        if self.needs_rex_ext() { 0x02 } else { 0x00 }
    }

    /// REX.R bit (reg position).
    pub fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }
}

/// x86-64 condition codes (for Jcc, SETcc, CMOVcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    /// Invert the condition.
    pub fn invert(self) -> Self {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// A forward branch waiting for its target.
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct FixupBranch {
    /// Offset of the rel32 field.
    rel32_at: CodeOffset,
}

/// x86-64 assembler writing at the arena cursor.
pub struct Assembler<'a> {
    arena: &'a mut CodeArena,
}

impl<'a> Assembler<'a> {
    pub fn new(arena: &'a mut CodeArena) -> Self {
        Self { arena }
    }

    pub fn offset(&self) -> CodeOffset {
        self.arena.offset()
    }

    // ==================== encoding helpers ====================

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// REX for a reg/rm pair, emitted only when a bit is set.
    fn rex_opt(&mut self, w: bool, reg: Reg, index: Option<Reg>, base: Reg) {
        let mut rex = 0x40u8 | reg.rex_r() | base.rex_b();
        if let Some(i) = index {
            rex |= i.rex_x();
        }
        if w {
            rex |= 0x08;
        }
        if rex != 0x40 {
            self.arena.emit_u8(rex);
        }
    }

    /// REX that must be present even when empty (byte registers 4..=7
    /// otherwise encode ah/ch/dh/bh).
    fn rex_force(&mut self, reg: Reg, index: Option<Reg>, base: Reg) {
        let mut rex = 0x40u8 | reg.rex_r() | base.rex_b();
        if let Some(i) = index {
            rex |= i.rex_x();
        }
        self.arena.emit_u8(rex);
    }

    /// ModRM + optional SIB + displacement for `[base + disp]`.
    fn mem_operand(&mut self, reg: u8, base: Reg, disp: i32) {
        let code = base.code();
        let need_sib = code == 4; // rsp/r12 need a SIB byte
        let rm = if need_sib { 4 } else { code };
        if disp == 0 && code != 5 {
            self.arena.emit_u8(Self::modrm(0b00, reg, rm));
            if need_sib {
                self.arena.emit_u8(0x24);
            }
        } else if (-128..=127).contains(&disp) {
            self.arena.emit_u8(Self::modrm(0b01, reg, rm));
            if need_sib {
                self.arena.emit_u8(0x24);
            }
            self.arena.emit_u8(disp as u8);
        } else {
            self.arena.emit_u8(Self::modrm(0b10, reg, rm));
            if need_sib {
                self.arena.emit_u8(0x24);
            }
            self.arena.emit_u32(disp as u32);
        }
    }

    /// ModRM + SIB for `[base + index]`, scale 1, no displacement.
    fn sib_operand(&mut self, reg: u8, base: Reg, index: Reg) {
        debug_assert!(index != Reg::Rsp, "rsp cannot be an index");
        debug_assert!(base.code() != 5, "rbp/r13 base needs a displacement form");
        self.arena.emit_u8(Self::modrm(0b00, reg, 0b100));
        self.arena.emit_u8((index.code() << 3) | base.code());
    }

    // ==================== moves ====================

    /// MOV r32, r32.
    pub fn mov_rr32(&mut self, dst: Reg, src: Reg) {
        self.rex_opt(false, src, None, dst);
        self.arena.emit_u8(0x89);
        self.arena.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, r64.
    pub fn mov_rr64(&mut self, dst: Reg, src: Reg) {
        self.rex_opt(true, src, None, dst);
        self.arena.emit_u8(0x89);
        self.arena.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r32, imm32 (zero-extends into the full register).
    ///
    /// Deliberately never optimized to `xor reg, reg`: register flushes are
    /// emitted between a compare and its consuming jump, so loads here must
    /// not touch flags.
    pub fn mov_ri32(&mut self, dst: Reg, imm: u32) {
        if dst.needs_rex_ext() {
            self.arena.emit_u8(0x41);
        }
        self.arena.emit_u8(0xB8 + dst.code());
        self.arena.emit_u32(imm);
    }

    /// MOV r64, imm64.
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) {
        self.arena.emit_u8(0x48 | dst.rex_b());
        self.arena.emit_u8(0xB8 + dst.code());
        self.arena.emit_u64(imm);
    }

    /// MOV r32, [base + disp].
    pub fn mov_rm32(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_opt(false, dst, None, base);
        self.arena.emit_u8(0x8B);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOV r64, [base + disp].
    pub fn mov_rm64(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_opt(true, dst, None, base);
        self.arena.emit_u8(0x8B);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOV [base + disp], r32.
    pub fn mov_mr32(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_opt(false, src, None, base);
        self.arena.emit_u8(0x89);
        self.mem_operand(src.code(), base, disp);
    }

    /// MOV [base + disp], r64.
    pub fn mov_mr64(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_opt(true, src, None, base);
        self.arena.emit_u8(0x89);
        self.mem_operand(src.code(), base, disp);
    }

    /// MOV dword [base + disp], imm32.
    pub fn mov_mi32(&mut self, base: Reg, disp: i32, imm: u32) {
        self.rex_opt(false, Reg::Rax, None, base);
        self.arena.emit_u8(0xC7);
        self.mem_operand(0, base, disp);
        self.arena.emit_u32(imm);
    }

    /// MOV r32, [base + index] (scale 1).
    pub fn mov_rm32_sib(&mut self, dst: Reg, base: Reg, index: Reg) {
        self.rex_opt(false, dst, Some(index), base);
        self.arena.emit_u8(0x8B);
        self.sib_operand(dst.code(), base, index);
    }

    /// MOV [base + index], r32.
    pub fn mov_mr32_sib(&mut self, base: Reg, index: Reg, src: Reg) {
        self.rex_opt(false, src, Some(index), base);
        self.arena.emit_u8(0x89);
        self.sib_operand(src.code(), base, index);
    }

    /// MOV [base + index], r16.
    pub fn mov_mr16_sib(&mut self, base: Reg, index: Reg, src: Reg) {
        self.arena.emit_u8(0x66);
        self.rex_opt(false, src, Some(index), base);
        self.arena.emit_u8(0x89);
        self.sib_operand(src.code(), base, index);
    }

    /// MOV [base + index], r8. Always emits REX so sil/dil encode correctly.
    pub fn mov_mr8_sib(&mut self, base: Reg, index: Reg, src: Reg) {
        self.rex_force(src, Some(index), base);
        self.arena.emit_u8(0x88);
        self.sib_operand(src.code(), base, index);
    }

    /// MOVZX r32, byte [base + index].
    pub fn movzx8_rm32_sib(&mut self, dst: Reg, base: Reg, index: Reg) {
        self.rex_opt(false, dst, Some(index), base);
        self.arena.emit_u8(0x0F);
        self.arena.emit_u8(0xB6);
        self.sib_operand(dst.code(), base, index);
    }

    /// MOVSX r32, byte [base + index].
    pub fn movsx8_rm32_sib(&mut self, dst: Reg, base: Reg, index: Reg) {
        self.rex_opt(false, dst, Some(index), base);
        self.arena.emit_u8(0x0F);
        self.arena.emit_u8(0xBE);
        self.sib_operand(dst.code(), base, index);
    }

    /// MOVZX r32, word [base + index].
    pub fn movzx16_rm32_sib(&mut self, dst: Reg, base: Reg, index: Reg) {
        self.rex_opt(false, dst, Some(index), base);
        self.arena.emit_u8(0x0F);
        self.arena.emit_u8(0xB7);
        self.sib_operand(dst.code(), base, index);
    }

    /// MOVSX r32, word [base + index].
    pub fn movsx16_rm32_sib(&mut self, dst: Reg, base: Reg, index: Reg) {
        self.rex_opt(false, dst, Some(index), base);
        self.arena.emit_u8(0x0F);
        self.arena.emit_u8(0xBF);
        self.sib_operand(dst.code(), base, index);
    }

    /// MOVZX r32, r8.
    pub fn movzx8_rr32(&mut self, dst: Reg, src: Reg) {
        self.rex_force(dst, None, src);
        self.arena.emit_u8(0x0F);
        self.arena.emit_u8(0xB6);
        self.arena.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    // ==================== 32-bit ALU ====================

    fn alu_rr32(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.rex_opt(false, src, None, dst);
        self.arena.emit_u8(opcode);
        self.arena.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    pub fn add_rr32(&mut self, dst: Reg, src: Reg) {
        self.alu_rr32(0x01, dst, src);
    }

    pub fn sub_rr32(&mut self, dst: Reg, src: Reg) {
        self.alu_rr32(0x29, dst, src);
    }

    pub fn and_rr32(&mut self, dst: Reg, src: Reg) {
        self.alu_rr32(0x21, dst, src);
    }

    pub fn or_rr32(&mut self, dst: Reg, src: Reg) {
        self.alu_rr32(0x09, dst, src);
    }

    pub fn xor_rr32(&mut self, dst: Reg, src: Reg) {
        self.alu_rr32(0x31, dst, src);
    }

    pub fn cmp_rr32(&mut self, a: Reg, b: Reg) {
        self.alu_rr32(0x39, a, b);
    }

    pub fn test_rr32(&mut self, a: Reg, b: Reg) {
        self.alu_rr32(0x85, a, b);
    }

    pub fn test_rr64(&mut self, a: Reg, b: Reg) {
        self.rex_opt(true, b, None, a);
        self.arena.emit_u8(0x85);
        self.arena.emit_u8(Self::modrm(0b11, b.code(), a.code()));
    }

    /// Group-1 ALU with immediate; `ext` is the /digit.
    fn alu_ri32(&mut self, ext: u8, dst: Reg, imm: u32) {
        self.rex_opt(false, Reg::Rax, None, dst);
        if (-128..=127).contains(&(imm as i32)) {
            self.arena.emit_u8(0x83);
            self.arena.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.arena.emit_u8(imm as u8);
        } else {
            self.arena.emit_u8(0x81);
            self.arena.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.arena.emit_u32(imm);
        }
    }

    pub fn add_ri32(&mut self, dst: Reg, imm: u32) {
        self.alu_ri32(0, dst, imm);
    }

    pub fn or_ri32(&mut self, dst: Reg, imm: u32) {
        self.alu_ri32(1, dst, imm);
    }

    pub fn and_ri32(&mut self, dst: Reg, imm: u32) {
        self.alu_ri32(4, dst, imm);
    }

    pub fn sub_ri32(&mut self, dst: Reg, imm: u32) {
        self.alu_ri32(5, dst, imm);
    }

    pub fn xor_ri32(&mut self, dst: Reg, imm: u32) {
        self.alu_ri32(6, dst, imm);
    }

    pub fn cmp_ri32(&mut self, dst: Reg, imm: u32) {
        self.alu_ri32(7, dst, imm);
    }

    /// CMP dword [base + disp], imm.
    pub fn cmp_mi32(&mut self, base: Reg, disp: i32, imm: u32) {
        self.rex_opt(false, Reg::Rax, None, base);
        if (-128..=127).contains(&(imm as i32)) {
            self.arena.emit_u8(0x83);
            self.mem_operand(7, base, disp);
            self.arena.emit_u8(imm as u8);
        } else {
            self.arena.emit_u8(0x81);
            self.mem_operand(7, base, disp);
            self.arena.emit_u32(imm);
        }
    }

    /// SUB dword [base + disp], imm.
    pub fn sub_mi32(&mut self, base: Reg, disp: i32, imm: u32) {
        self.rex_opt(false, Reg::Rax, None, base);
        if (-128..=127).contains(&(imm as i32)) {
            self.arena.emit_u8(0x83);
            self.mem_operand(5, base, disp);
            self.arena.emit_u8(imm as u8);
        } else {
            self.arena.emit_u8(0x81);
            self.mem_operand(5, base, disp);
            self.arena.emit_u32(imm);
        }
    }

    pub fn add_ri64(&mut self, dst: Reg, imm: i32) {
        debug_assert!((-128..=127).contains(&imm));
        self.rex_opt(true, Reg::Rax, None, dst);
        self.arena.emit_u8(0x83);
        self.arena.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.arena.emit_u8(imm as u8);
    }

    pub fn sub_ri64(&mut self, dst: Reg, imm: i32) {
        debug_assert!((-128..=127).contains(&imm));
        self.rex_opt(true, Reg::Rax, None, dst);
        self.arena.emit_u8(0x83);
        self.arena.emit_u8(Self::modrm(0b11, 5, dst.code()));
        self.arena.emit_u8(imm as u8);
    }

    /// LEA r32, [base + disp] (32-bit add without touching flags).
    pub fn lea32(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_opt(false, dst, None, base);
        self.arena.emit_u8(0x8D);
        self.mem_operand(dst.code(), base, disp);
    }

    pub fn neg_r32(&mut self, dst: Reg) {
        self.rex_opt(false, Reg::Rax, None, dst);
        self.arena.emit_u8(0xF7);
        self.arena.emit_u8(Self::modrm(0b11, 3, dst.code()));
    }

    pub fn not_r32(&mut self, dst: Reg) {
        self.rex_opt(false, Reg::Rax, None, dst);
        self.arena.emit_u8(0xF7);
        self.arena.emit_u8(Self::modrm(0b11, 2, dst.code()));
    }

    /// One-operand MUL: edx:eax = eax * src.
    pub fn mul_r32(&mut self, src: Reg) {
        self.rex_opt(false, Reg::Rax, None, src);
        self.arena.emit_u8(0xF7);
        self.arena.emit_u8(Self::modrm(0b11, 4, src.code()));
    }

    /// One-operand IMUL: edx:eax = eax * src (signed).
    pub fn imul_r32(&mut self, src: Reg) {
        self.rex_opt(false, Reg::Rax, None, src);
        self.arena.emit_u8(0xF7);
        self.arena.emit_u8(Self::modrm(0b11, 5, src.code()));
    }

    // ==================== shifts ====================

    fn shift_ri32(&mut self, ext: u8, dst: Reg, amount: u32) {
        debug_assert!(amount < 32);
        self.rex_opt(false, Reg::Rax, None, dst);
        if amount == 1 {
            self.arena.emit_u8(0xD1);
            self.arena.emit_u8(Self::modrm(0b11, ext, dst.code()));
        } else {
            self.arena.emit_u8(0xC1);
            self.arena.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.arena.emit_u8(amount as u8);
        }
    }

    pub fn shl_ri32(&mut self, dst: Reg, amount: u32) {
        self.shift_ri32(4, dst, amount);
    }

    pub fn shr_ri32(&mut self, dst: Reg, amount: u32) {
        self.shift_ri32(5, dst, amount);
    }

    pub fn sar_ri32(&mut self, dst: Reg, amount: u32) {
        self.shift_ri32(7, dst, amount);
    }

    fn shift_cl32(&mut self, ext: u8, dst: Reg) {
        self.rex_opt(false, Reg::Rax, None, dst);
        self.arena.emit_u8(0xD3);
        self.arena.emit_u8(Self::modrm(0b11, ext, dst.code()));
    }

    /// Shift by cl; x86 masks the count to 5 bits, same as MIPS.
    pub fn shl_cl32(&mut self, dst: Reg) {
        self.shift_cl32(4, dst);
    }

    pub fn shr_cl32(&mut self, dst: Reg) {
        self.shift_cl32(5, dst);
    }

    pub fn sar_cl32(&mut self, dst: Reg) {
        self.shift_cl32(7, dst);
    }

    // ==================== conditionals ====================

    /// SETcc r8. Always emits REX so sil/dil encode correctly.
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        self.rex_force(Reg::Rax, None, dst);
        self.arena.emit_u8(0x0F);
        self.arena.emit_u8(0x90 + cond as u8);
        self.arena.emit_u8(Self::modrm(0b11, 0, dst.code()));
    }

    /// CMOVcc r32, r32.
    pub fn cmovcc_rr32(&mut self, cond: Cond, dst: Reg, src: Reg) {
        self.rex_opt(false, dst, None, src);
        self.arena.emit_u8(0x0F);
        self.arena.emit_u8(0x40 + cond as u8);
        self.arena.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    // ==================== control flow ====================

    /// Jcc rel32 with the target not yet known.
    pub fn jcc_fixup(&mut self, cond: Cond) -> FixupBranch {
        self.arena.emit_u8(0x0F);
        self.arena.emit_u8(0x80 + cond as u8);
        let rel32_at = self.arena.offset();
        self.arena.emit_u32(0);
        FixupBranch { rel32_at }
    }

    /// JMP rel32 with the target not yet known.
    pub fn jmp_fixup(&mut self) -> FixupBranch {
        self.arena.emit_u8(0xE9);
        let rel32_at = self.arena.offset();
        self.arena.emit_u32(0);
        FixupBranch { rel32_at }
    }

    /// Points a pending branch at the current position.
    pub fn set_jump_target(&mut self, fixup: FixupBranch) {
        let target = self.arena.offset();
        self.patch_jump(fixup, target);
    }

    pub fn patch_jump(&mut self, fixup: FixupBranch, target: CodeOffset) {
        let rel = (target.0 as i64) - (fixup.rel32_at.0 as i64 + 4);
        self.arena.patch_u32(fixup.rel32_at, rel as i32 as u32);
    }

    /// JMP rel32 to a known arena offset.
    pub fn jmp_to(&mut self, target: CodeOffset) {
        self.arena.emit_u8(0xE9);
        let rel = (target.0 as i64) - (self.arena.offset().0 as i64 + 4);
        self.arena.emit_u32(rel as i32 as u32);
    }

    /// Jcc rel32 to a known arena offset.
    pub fn jcc_to(&mut self, cond: Cond, target: CodeOffset) {
        self.arena.emit_u8(0x0F);
        self.arena.emit_u8(0x80 + cond as u8);
        let rel = (target.0 as i64) - (self.arena.offset().0 as i64 + 4);
        self.arena.emit_u32(rel as i32 as u32);
    }

    /// JMP r64 (indirect).
    pub fn jmp_r64(&mut self, target: Reg) {
        if target.needs_rex_ext() {
            self.arena.emit_u8(0x41);
        }
        self.arena.emit_u8(0xFF);
        self.arena.emit_u8(Self::modrm(0b11, 4, target.code()));
    }

    /// CALL r64 (indirect).
    pub fn call_r64(&mut self, target: Reg) {
        if target.needs_rex_ext() {
            self.arena.emit_u8(0x41);
        }
        self.arena.emit_u8(0xFF);
        self.arena.emit_u8(Self::modrm(0b11, 2, target.code()));
    }

    pub fn push_r64(&mut self, r: Reg) {
        if r.needs_rex_ext() {
            self.arena.emit_u8(0x41);
        }
        self.arena.emit_u8(0x50 + r.code());
    }

    pub fn pop_r64(&mut self, r: Reg) {
        if r.needs_rex_ext() {
            self.arena.emit_u8(0x41);
        }
        self.arena.emit_u8(0x58 + r.code());
    }

    pub fn pushfq(&mut self) {
        self.arena.emit_u8(0x9C);
    }

    pub fn popfq(&mut self) {
        self.arena.emit_u8(0x9D);
    }

    pub fn ret(&mut self) {
        self.arena.emit_u8(0xC3);
    }

    pub fn int3(&mut self) {
        self.arena.emit_u8(0xCC);
    }

    pub fn nop(&mut self) {
        self.arena.emit_u8(0x90);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut arena = CodeArena::new(4096).unwrap();
        let mut asm = Assembler::new(&mut arena);
        f(&mut asm);
        let len = arena.offset().0 as usize;
        let mut out = vec![0u8; len];
        arena.read_bytes(CodeOffset(0), &mut out);
        out
    }

    #[test]
    fn test_mov_rr32() {
        assert_eq!(emit(|a| a.mov_rr32(Reg::Rbx, Reg::Rax)), [0x89, 0xC3]);
        assert_eq!(emit(|a| a.mov_rr32(Reg::R8, Reg::Rsi)), [0x41, 0x89, 0xF0]);
    }

    #[test]
    fn test_mov_ri32_has_no_rex_w() {
        assert_eq!(
            emit(|a| a.mov_ri32(Reg::Rax, 0x1234_5678)),
            [0xB8, 0x78, 0x56, 0x34, 0x12]
        );
        assert_eq!(
            emit(|a| a.mov_ri32(Reg::R9, 1)),
            [0x41, 0xB9, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_state_field_store() {
        // mov dword [r15 + 0x10], imm32
        assert_eq!(
            emit(|a| a.mov_mi32(Reg::R15, 0x10, 0xAABB_CCDD)),
            [0x41, 0xC7, 0x47, 0x10, 0xDD, 0xCC, 0xBB, 0xAA]
        );
    }

    #[test]
    fn test_guest_load_fast_path() {
        // mov ebx, [r14 + rax]
        assert_eq!(
            emit(|a| a.mov_rm32_sib(Reg::Rbx, Reg::R14, Reg::Rax)),
            [0x41, 0x8B, 0x1C, 0x06]
        );
    }

    #[test]
    fn test_byte_store_forces_rex_for_sil() {
        // mov [r14 + rax], sil
        assert_eq!(
            emit(|a| a.mov_mr8_sib(Reg::R14, Reg::Rax, Reg::Rsi)),
            [0x41, 0x88, 0x34, 0x06]
        );
    }

    #[test]
    fn test_alu_imm_picks_short_form() {
        // and eax, 0x1FFFFFFF needs the imm32 form
        assert_eq!(
            emit(|a| a.and_ri32(Reg::Rax, 0x1FFF_FFFF)),
            [0x81, 0xE0, 0xFF, 0xFF, 0xFF, 0x1F]
        );
        // add ebx, 4 takes the imm8 form
        assert_eq!(emit(|a| a.add_ri32(Reg::Rbx, 4)), [0x83, 0xC3, 0x04]);
    }

    #[test]
    fn test_jmp_to_backwards() {
        // jmp to offset 0 emitted at offset 0: rel32 = -5
        assert_eq!(
            emit(|a| a.jmp_to(CodeOffset(0))),
            [0xE9, 0xFB, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_forward_fixup_resolves() {
        let bytes = emit(|a| {
            let b = a.jcc_fixup(Cond::E);
            a.nop();
            a.set_jump_target(b);
        });
        assert_eq!(bytes, [0x0F, 0x84, 0x01, 0x00, 0x00, 0x00, 0x90]);
    }

    #[test]
    fn test_downcount_check() {
        // cmp dword [r15 + 4], 0
        assert_eq!(
            emit(|a| a.cmp_mi32(Reg::R15, 4, 0)),
            [0x41, 0x83, 0x7F, 0x04, 0x00]
        );
    }
}
