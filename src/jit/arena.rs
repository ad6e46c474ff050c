//! Append-only code arena.
//!
//! All generated code lives in one executable mapping and is addressed by
//! `CodeOffset` handles rather than raw pointers, so block records stay valid
//! across snapshots and the cache can be reasoned about without pointer
//! provenance. Patching (links, unlinks, redirect stubs) rewrites bytes at a
//! previously issued offset; appending always happens at the cursor.

use super::memory::{ExecutableMemory, MemoryError};

/// A position inside the code arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeOffset(pub u32);

impl CodeOffset {
    /// Marker for "no code here", used in exit slots that were never emitted.
    pub const INVALID: CodeOffset = CodeOffset(u32::MAX);
}

pub struct CodeArena {
    mem: ExecutableMemory,
    cursor: usize,
}

impl CodeArena {
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        Ok(CodeArena {
            mem: ExecutableMemory::new(size)?,
            cursor: 0,
        })
    }

    /// Current append position.
    pub fn offset(&self) -> CodeOffset {
        CodeOffset(self.cursor as u32)
    }

    pub fn space_left(&self) -> usize {
        self.mem.size() - self.cursor
    }

    /// Discards everything. All outstanding `CodeOffset`s become garbage;
    /// the caller owns invalidating whatever referenced them.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Executable address of `at`.
    pub fn ptr_at(&self, at: CodeOffset) -> *const u8 {
        debug_assert!((at.0 as usize) < self.mem.size());
        unsafe { self.mem.as_ptr().add(at.0 as usize) }
    }

    pub fn emit_u8(&mut self, v: u8) {
        assert!(self.cursor < self.mem.size(), "code arena exhausted");
        unsafe {
            *self.mem.as_mut_ptr().add(self.cursor) = v;
        }
        self.cursor += 1;
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        assert!(self.cursor + bytes.len() <= self.mem.size(), "code arena exhausted");
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.mem.as_mut_ptr().add(self.cursor),
                bytes.len(),
            );
        }
        self.cursor += bytes.len();
    }

    pub fn emit_u16(&mut self, v: u16) {
        self.emit_bytes(&v.to_le_bytes());
    }

    pub fn emit_u32(&mut self, v: u32) {
        self.emit_bytes(&v.to_le_bytes());
    }

    pub fn emit_u64(&mut self, v: u64) {
        self.emit_bytes(&v.to_le_bytes());
    }

    /// Pads with int3 up to `align` (power of two).
    pub fn align(&mut self, align: usize) {
        debug_assert!(align.is_power_of_two());
        while self.cursor & (align - 1) != 0 {
            self.emit_u8(0xcc);
        }
    }

    /// Overwrites bytes at an already-emitted position. Never moves the
    /// cursor.
    pub fn patch_bytes(&mut self, at: CodeOffset, bytes: &[u8]) {
        let at = at.0 as usize;
        assert!(at + bytes.len() <= self.cursor, "patch beyond emitted code");
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.mem.as_mut_ptr().add(at),
                bytes.len(),
            );
        }
    }

    pub fn patch_u32(&mut self, at: CodeOffset, v: u32) {
        self.patch_bytes(at, &v.to_le_bytes());
    }

    /// Re-runs emission at an already-issued offset, restoring the cursor
    /// afterwards. This is how multi-instruction patches (link, unlink,
    /// redirect stubs) reuse the assembler instead of hand-rolled bytes.
    pub fn patch_at<R>(&mut self, at: CodeOffset, f: impl FnOnce(&mut CodeArena) -> R) -> R {
        debug_assert!((at.0 as usize) < self.cursor, "patch window beyond emitted code");
        let saved = self.cursor;
        self.cursor = at.0 as usize;
        let result = f(self);
        debug_assert!(self.cursor <= saved, "patch window overran live code");
        self.cursor = saved;
        result
    }

    /// Reads back emitted bytes, for link-state checks and tests.
    pub fn read_bytes(&self, at: CodeOffset, buf: &mut [u8]) {
        let at = at.0 as usize;
        assert!(at + buf.len() <= self.mem.size());
        unsafe {
            std::ptr::copy_nonoverlapping(self.mem.as_ptr().add(at), buf.as_mut_ptr(), buf.len());
        }
    }

    pub fn read_u8(&self, at: CodeOffset) -> u8 {
        let mut b = [0u8; 1];
        self.read_bytes(at, &mut b);
        b[0]
    }

    pub fn read_u32(&self, at: CodeOffset) -> u32 {
        let mut b = [0u8; 4];
        self.read_bytes(at, &mut b);
        u32::from_le_bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_advances_cursor() {
        let mut arena = CodeArena::new(4096).unwrap();
        assert_eq!(arena.offset(), CodeOffset(0));
        arena.emit_u8(0x90);
        arena.emit_u32(0xdead_beef);
        assert_eq!(arena.offset(), CodeOffset(5));
        assert_eq!(arena.read_u32(CodeOffset(1)), 0xdead_beef);
    }

    #[test]
    fn test_patch_rewrites_in_place() {
        let mut arena = CodeArena::new(4096).unwrap();
        arena.emit_u32(0x1111_1111);
        arena.emit_u32(0x2222_2222);
        arena.patch_u32(CodeOffset(4), 0x3333_3333);
        assert_eq!(arena.read_u32(CodeOffset(0)), 0x1111_1111);
        assert_eq!(arena.read_u32(CodeOffset(4)), 0x3333_3333);
        assert_eq!(arena.offset(), CodeOffset(8));
    }

    #[test]
    fn test_align_pads_with_int3() {
        let mut arena = CodeArena::new(4096).unwrap();
        arena.emit_u8(0x90);
        arena.align(16);
        assert_eq!(arena.offset(), CodeOffset(16));
        assert_eq!(arena.read_u8(CodeOffset(1)), 0xcc);
    }
}
