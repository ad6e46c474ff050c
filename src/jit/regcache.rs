//! Guest GPR register cache.
//!
//! Maps guest registers onto host registers for the duration of one block.
//! A guest register is either unmapped (lives in `MipsState`), held in a
//! host register (possibly dirty), or a known constant. Constants fold into
//! immediates at use sites and are only materialized when something needs
//! them in a register.
//!
//! Every emission here is a plain mov, so flushes can be placed between a
//! compare and the jump that consumes its flags.

use crate::cpu::{self, REG_ZERO};

use super::arena::CodeArena;
use super::x86_64::{Assembler, Reg};

/// Host registers handed out to guest state, in allocation order. rax, rcx
/// and rdx stay scratch (memory fast path, shift counts, mult results);
/// r13/r14/r15 are pinned by the trampolines.
pub const ALLOC_ORDER: [Reg; 9] = [
    Reg::Rbx,
    Reg::Rbp,
    Reg::R12,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuestReg {
    Unmapped,
    /// Known constant, not yet in memory or a register.
    Imm(u32),
    /// Held in `ALLOC_ORDER[slot]`.
    Host { slot: usize, dirty: bool },
}

#[derive(Debug, Clone, Copy)]
struct HostSlot {
    guest: Option<usize>,
    last_used: u64,
}

pub struct GprCache {
    guest: [GuestReg; 32],
    host: [HostSlot; ALLOC_ORDER.len()],
    locked: [bool; 32],
    tick: u64,
}

impl GprCache {
    pub fn new() -> Self {
        let mut cache = GprCache {
            guest: [GuestReg::Unmapped; 32],
            host: [HostSlot {
                guest: None,
                last_used: 0,
            }; ALLOC_ORDER.len()],
            locked: [false; 32],
            tick: 0,
        };
        cache.guest[REG_ZERO] = GuestReg::Imm(0);
        cache
    }

    /// Resets to the block-entry state: everything in memory, $zero constant.
    pub fn start(&mut self) {
        *self = GprCache::new();
    }

    /// Maps `r` for reading. The returned register holds the current value.
    pub fn map_in(&mut self, arena: &mut CodeArena, r: usize) -> Reg {
        self.map(arena, r, true, false)
    }

    /// Maps `r` as a written destination. With `load` the old value is
    /// brought in first (for read-modify-write); without it the register
    /// starts undefined.
    pub fn map_dirty(&mut self, arena: &mut CodeArena, r: usize, load: bool) -> Reg {
        debug_assert_ne!(r, REG_ZERO, "cannot map $zero as a destination");
        self.map(arena, r, load, true)
    }

    fn map(&mut self, arena: &mut CodeArena, r: usize, load: bool, dirty: bool) -> Reg {
        self.tick += 1;
        match self.guest[r] {
            GuestReg::Host { slot, dirty: was } => {
                self.host[slot].last_used = self.tick;
                if dirty && !was {
                    self.guest[r] = GuestReg::Host { slot, dirty: true };
                }
                ALLOC_ORDER[slot]
            }
            GuestReg::Imm(v) => {
                let slot = self.alloc_slot(arena);
                let host = ALLOC_ORDER[slot];
                // Materialize even for pure destinations; the value is dirty
                // relative to memory either way.
                Assembler::new(arena).mov_ri32(host, v);
                self.host[slot].guest = Some(r);
                self.host[slot].last_used = self.tick;
                self.guest[r] = GuestReg::Host { slot, dirty: true };
                host
            }
            GuestReg::Unmapped => {
                let slot = self.alloc_slot(arena);
                let host = ALLOC_ORDER[slot];
                if load {
                    Assembler::new(arena).mov_rm32(host, Reg::R15, cpu::gpr_disp(r));
                }
                self.host[slot].guest = Some(r);
                self.host[slot].last_used = self.tick;
                self.guest[r] = GuestReg::Host { slot, dirty };
                host
            }
        }
    }

    fn alloc_slot(&mut self, arena: &mut CodeArena) -> usize {
        if let Some(free) = (0..self.host.len()).find(|&i| self.host[i].guest.is_none()) {
            return free;
        }
        // Evict the least recently used register whose guest is not
        // spill-locked.
        let victim = (0..self.host.len())
            .filter(|&i| !self.locked[self.host[i].guest.unwrap()])
            .min_by_key(|&i| self.host[i].last_used)
            .expect("all host registers spill-locked");
        let guest = self.host[victim].guest.unwrap();
        self.flush_reg(arena, guest);
        victim
    }

    /// The host register currently holding `r`. Panics when unmapped; call
    /// sites must map first.
    pub fn r(&self, r: usize) -> Reg {
        match self.guest[r] {
            GuestReg::Host { slot, .. } => ALLOC_ORDER[slot],
            _ => panic!("guest register {r} is not mapped"),
        }
    }

    /// Records `r = value` without emitting anything. Any host mapping is
    /// dropped; the constant is written back on flush.
    pub fn set_imm(&mut self, r: usize, value: u32) {
        if r == REG_ZERO {
            return;
        }
        if let GuestReg::Host { slot, .. } = self.guest[r] {
            self.host[slot].guest = None;
        }
        self.guest[r] = GuestReg::Imm(value);
    }

    pub fn get_imm(&self, r: usize) -> Option<u32> {
        match self.guest[r] {
            GuestReg::Imm(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_imm(&self, r: usize) -> bool {
        self.get_imm(r).is_some()
    }

    /// Protects `r`'s host register from eviction until the next
    /// `release_spill_locks`.
    pub fn spill_lock(&mut self, regs: &[usize]) {
        for &r in regs {
            self.locked[r] = true;
        }
    }

    pub fn release_spill_locks(&mut self) {
        self.locked = [false; 32];
    }

    /// Writes `r` back to `MipsState` (if dirty) and unmaps it.
    pub fn flush_reg(&mut self, arena: &mut CodeArena, r: usize) {
        match self.guest[r] {
            GuestReg::Unmapped => {}
            GuestReg::Imm(v) => {
                if r != REG_ZERO {
                    Assembler::new(arena).mov_mi32(Reg::R15, cpu::gpr_disp(r), v);
                    self.guest[r] = GuestReg::Unmapped;
                }
            }
            GuestReg::Host { slot, dirty } => {
                if dirty && r != REG_ZERO {
                    Assembler::new(arena).mov_mr32(Reg::R15, cpu::gpr_disp(r), ALLOC_ORDER[slot]);
                }
                self.host[slot].guest = None;
                // $zero goes back to being the constant it always was.
                self.guest[r] = if r == REG_ZERO {
                    GuestReg::Imm(0)
                } else {
                    GuestReg::Unmapped
                };
            }
        }
    }

    /// Flushes every live register and releases spill locks. The cache is
    /// back to block-entry state afterwards, so it is safe to call helpers
    /// or take an exit.
    pub fn flush_all(&mut self, arena: &mut CodeArena) {
        // Includes $zero: a materialized zero must not survive in a
        // caller-saved register across helper calls.
        for r in 0..32 {
            self.flush_reg(arena, r);
        }
        self.release_spill_locks();
    }

    /// True when nothing would be emitted by `flush_all`; block exits rely
    /// on this as a sanity check.
    #[cfg(test)]
    fn is_clean(&self) -> bool {
        (1..32).all(|r| self.guest[r] == GuestReg::Unmapped)
    }
}

impl Default for GprCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> CodeArena {
        CodeArena::new(65536).unwrap()
    }

    #[test]
    fn test_zero_register_is_constant() {
        let cache = GprCache::new();
        assert_eq!(cache.get_imm(REG_ZERO), Some(0));
    }

    #[test]
    fn test_remap_is_stable_and_silent() {
        let mut arena = arena();
        let mut cache = GprCache::new();
        let first = cache.map_in(&mut arena, 4);
        let emitted = arena.offset();
        let second = cache.map_in(&mut arena, 4);
        assert_eq!(first, second);
        assert_eq!(arena.offset(), emitted, "remap must not emit code");
    }

    #[test]
    fn test_distinct_guests_get_distinct_hosts() {
        let mut arena = arena();
        let mut cache = GprCache::new();
        let a = cache.map_in(&mut arena, 4);
        let b = cache.map_in(&mut arena, 5);
        assert_ne!(a, b);
    }

    #[test]
    fn test_eviction_prefers_least_recently_used() {
        let mut arena = arena();
        let mut cache = GprCache::new();
        for r in 1..=ALLOC_ORDER.len() {
            cache.map_in(&mut arena, r);
        }
        // Touch everything except guest 2, then demand one more register.
        for r in 1..=ALLOC_ORDER.len() {
            if r != 2 {
                cache.map_in(&mut arena, r);
            }
        }
        let newcomer = cache.map_in(&mut arena, 20);
        // Guest 2's old slot was recycled.
        assert_eq!(newcomer, Reg::Rbp);
        assert!(!cache.is_imm(2));
    }

    #[test]
    fn test_spill_lock_protects_victim() {
        let mut arena = arena();
        let mut cache = GprCache::new();
        for r in 1..=ALLOC_ORDER.len() {
            cache.map_in(&mut arena, r);
        }
        // Guest 1 is the LRU candidate but is locked.
        cache.spill_lock(&[1]);
        let newcomer = cache.map_in(&mut arena, 20);
        assert_ne!(newcomer, cache.r(1));
    }

    #[test]
    fn test_flush_all_writes_dirty_and_imm_state() {
        let mut arena = arena();
        let mut cache = GprCache::new();
        cache.map_dirty(&mut arena, 4, false);
        cache.set_imm(5, 1234);
        let before = arena.offset();
        cache.flush_all(&mut arena);
        assert!(arena.offset() > before, "dirty state must be stored");
        assert!(cache.is_clean());
        // A second flush has nothing to do.
        let after = arena.offset();
        cache.flush_all(&mut arena);
        assert_eq!(arena.offset(), after);
    }

    #[test]
    fn test_clean_registers_flush_silently() {
        let mut arena = arena();
        let mut cache = GprCache::new();
        cache.map_in(&mut arena, 4);
        let before = arena.offset();
        cache.flush_reg(&mut arena, 4);
        assert_eq!(arena.offset(), before, "clean register needs no store");
    }
}
