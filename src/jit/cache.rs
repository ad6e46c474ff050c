//! The translated-block cache.
//!
//! Owns the block table, the address index used by invalidation, the link
//! graph between blocks, and the in-memory sentinels that make block lookup
//! O(1). All host-code patching goes through the `HostArch` capability
//! trait; nothing in here is backend-specific.
//!
//! Sentinels: when a block is finalized, the first instruction word of its
//! guest range is overwritten in guest memory with a reserved encoding
//! carrying the block index. The displaced word is kept in the block record
//! and must be restored (or translated) whenever anyone reads that address.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::mem::{GuestMemory, PHYS_MASK, SCRATCH_BASE, SCRATCH_SIZE};
use crate::mips::MipsOpcode;

use super::arena::{CodeArena, CodeOffset};
use super::backend::HostArch;
use super::block::{JitBlock, INVALID_EXIT, MAX_JIT_BLOCK_EXITS, MAX_NUM_BLOCKS};

/// Why a block is being torn down; invalidation writes a redirect stub,
/// a full clear does not bother (the arena is reset right after).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Clear,
    Invalidate,
}

#[derive(Debug, Default, Clone)]
pub struct BlockCacheStats {
    pub num_blocks: usize,
    pub num_invalid: usize,
    pub total_code_bytes: u64,
    pub total_guest_bytes: u64,
}

pub struct JitBlockCache {
    target: Box<dyn HostArch>,
    dispatch: CodeOffset,
    blocks: Vec<JitBlock>,
    /// (inclusive physical end, physical start) -> block number. Keyed by
    /// end so invalidation can lower-bound on the range start.
    block_map: BTreeMap<(u32, u32), u32>,
    /// Same keying, for proxy blocks (replacement bodies with no code of
    /// their own).
    proxy_block_map: BTreeMap<(u32, u32), u32>,
    /// Guest target address -> blocks with a static exit to it. Entries are
    /// only removed on clear; stale ones are filtered on use.
    links_to: HashMap<u32, Vec<u32>>,
    /// Physical spans that may contain sentinels, per region, so save-state
    /// scans can skip untouched memory.
    scratch_span: Option<(u32, u32)>,
    ram_span: Option<(u32, u32)>,
}

fn phys(addr: u32) -> u32 {
    addr & PHYS_MASK
}

impl JitBlockCache {
    pub fn new(target: Box<dyn HostArch>) -> Self {
        JitBlockCache {
            target,
            dispatch: CodeOffset::INVALID,
            blocks: Vec::new(),
            block_map: BTreeMap::new(),
            proxy_block_map: BTreeMap::new(),
            links_to: HashMap::new(),
            scratch_span: None,
            ram_span: None,
        }
    }

    /// Must be called whenever the dispatcher is (re)generated, before any
    /// block is finalized.
    pub fn set_dispatcher(&mut self, dispatch: CodeOffset) {
        self.dispatch = dispatch;
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= MAX_NUM_BLOCKS
    }

    pub fn block(&self, block_num: u32) -> &JitBlock {
        &self.blocks[block_num as usize]
    }

    pub fn block_mut(&mut self, block_num: u32) -> &mut JitBlock {
        &mut self.blocks[block_num as usize]
    }

    pub fn dispatch(&self) -> CodeOffset {
        self.dispatch
    }

    /// Appends an unlinked exit stub for `dest` at the arena cursor.
    pub fn emit_exit_stub(&self, arena: &mut CodeArena, dest: u32) {
        self.target.emit_exit_stub(arena, dest, self.dispatch);
    }

    /// Appends an exit stub already linked to `entry`.
    pub fn emit_linked_stub(&self, arena: &mut CodeArena, entry: CodeOffset) {
        self.target.emit_linked_stub(arena, entry);
    }

    /// Reserves a slot for a block starting at `em_address`. The compiler
    /// fills it in and then calls `finalize_block`.
    pub fn allocate_block(&mut self, em_address: u32) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        self.blocks.push(JitBlock::new(em_address));
        Some((self.blocks.len() - 1) as u32)
    }

    /// Registers a proxy for a replaced function body: a pseudo-block
    /// covering `[addr, addr + size)` whose destruction tears down the real
    /// block at `root_address`. Proxies own no code and no sentinel.
    pub fn proxy_block(
        &mut self,
        mem: &mut GuestMemory,
        arena: &mut CodeArena,
        root_address: u32,
        addr: u32,
        size_bytes: u32,
    ) -> Option<u32> {
        let block_num = self.allocate_block(addr)?;
        {
            let b = &mut self.blocks[block_num as usize];
            b.set_pure_proxy();
            b.original_size = size_bytes;
            b.proxy_for = Some(vec![root_address]);
        }
        let start = phys(addr);
        let end = start + size_bytes - 1;
        self.proxy_block_map.insert((end, start), block_num);
        // Keep the sentinel coverage spans honest even though proxies write
        // no sentinel; the root block inside the range already did.
        let _ = (mem, arena);
        Some(block_num)
    }

    /// Makes a compiled block live: records its guest range, writes the
    /// sentinel, hashes the source words and wires up links in both
    /// directions.
    pub fn finalize_block(
        &mut self,
        mem: &mut GuestMemory,
        arena: &mut CodeArena,
        block_num: u32,
        block_link: bool,
    ) {
        debug_assert!(self.dispatch != CodeOffset::INVALID);
        let (addr, size, num_exits);
        {
            let b = &mut self.blocks[block_num as usize];
            addr = b.original_address;
            size = b.original_size;
            debug_assert!(size >= 4, "finalizing an empty block");

            b.original_first_opcode = MipsOpcode(mem.read32(addr));
            debug_assert!(
                !b.original_first_opcode.is_emuhack(),
                "compiling over a live sentinel"
            );
            num_exits = b
                .exit_address
                .iter()
                .filter(|&&a| a != INVALID_EXIT)
                .count();
        }
        mem.write32(addr, MipsOpcode::make_emuhack(block_num).0);
        self.note_sentinel(phys(addr));

        let start = phys(addr);
        let end = start + size - 1;
        self.block_map.insert((end, start), block_num);

        self.blocks[block_num as usize].compiled_hash = self.hash_guest_range(mem, addr, size);

        for e in 0..MAX_JIT_BLOCK_EXITS {
            let exit = self.blocks[block_num as usize].exit_address[e];
            if exit != INVALID_EXIT {
                self.links_to.entry(exit).or_default().push(block_num);
            }
        }
        if block_link {
            self.link_block_with(mem, arena, block_num);
        }
        debug!(
            block = block_num,
            addr = format_args!("{addr:08x}"),
            size,
            exits = num_exits,
            "finalized block"
        );
    }

    fn note_sentinel(&mut self, p: u32) {
        let span = if p < SCRATCH_BASE + SCRATCH_SIZE {
            &mut self.scratch_span
        } else {
            &mut self.ram_span
        };
        *span = match *span {
            None => Some((p, p)),
            Some((lo, hi)) => Some((lo.min(p), hi.max(p))),
        };
    }

    /// Whether `[start, start + size)` could contain sentinel words. Used
    /// by save-state to avoid scanning memory that never held code.
    pub fn range_may_have_emu_hacks(&self, start: u32, size: u32) -> bool {
        let (s, e) = (phys(start), phys(start) + size);
        for span in [self.scratch_span, self.ram_span].into_iter().flatten() {
            if s <= span.1 && e > span.0 {
                return true;
            }
        }
        false
    }

    /// Hashes the guest words a block covers, sentinel included; the hash
    /// is only ever compared against hashes taken the same way.
    fn hash_guest_range(&self, mem: &GuestMemory, addr: u32, size: u32) -> u64 {
        let mut words = Vec::with_capacity((size / 4) as usize);
        for i in (0..size).step_by(4) {
            words.extend_from_slice(&mem.read32(addr + i).to_le_bytes());
        }
        xxh3_64(&words)
    }

    // ==================== lookup ====================

    /// Block number for the block starting exactly at `addr`, via the
    /// sentinel. Invalid and displaced sentinels return None.
    pub fn get_block_number_from_start_address(
        &self,
        mem: &GuestMemory,
        addr: u32,
    ) -> Option<u32> {
        let word = MipsOpcode(mem.read32(addr));
        if !word.is_emuhack() {
            return None;
        }
        let block_num = word.emuhack_value();
        let b = self.blocks.get(block_num as usize)?;
        if b.invalid || b.original_address != addr {
            return None;
        }
        Some(block_num)
    }

    /// Resolves a sentinel word read from `addr` back to the instruction it
    /// displaced. Non-sentinel words pass through.
    pub fn get_original_first_op(&self, op: MipsOpcode, addr: u32) -> MipsOpcode {
        if !op.is_emuhack() {
            return op;
        }
        let block_num = op.emuhack_value();
        match self.blocks.get(block_num as usize) {
            Some(b) if b.original_address == addr => b.original_first_opcode,
            _ => {
                error!(
                    addr = format_args!("{addr:08x}"),
                    block = block_num,
                    "stale sentinel does not match any block"
                );
                op
            }
        }
    }

    /// Fetches the instruction at `addr` as the guest would see it,
    /// translating sentinels.
    pub fn read_guest_opcode(&self, mem: &GuestMemory, addr: u32) -> MipsOpcode {
        self.get_original_first_op(MipsOpcode(mem.read32(addr)), addr)
    }

    /// All block numbers whose guest range contains `addr`.
    pub fn blocks_containing(&self, addr: u32) -> Vec<u32> {
        let p = phys(addr);
        self.block_map
            .range((p, 0)..)
            .filter(|&(&(_end, start), _)| start <= p)
            .map(|(_, &bn)| bn)
            .filter(|&bn| !self.blocks[bn as usize].invalid)
            .collect()
    }

    // ==================== linking ====================

    /// Patches every unlinked exit of `block_num` whose target block exists.
    pub fn link_exits_with(&mut self, mem: &GuestMemory, arena: &mut CodeArena, block_num: u32) {
        if self.blocks[block_num as usize].invalid {
            return;
        }
        for e in 0..MAX_JIT_BLOCK_EXITS {
            let b = &self.blocks[block_num as usize];
            let dest = b.exit_address[e];
            if dest == INVALID_EXIT || b.link_status[e] {
                continue;
            }
            let Some(target) = self.get_block_number_from_start_address(mem, dest) else {
                continue;
            };
            let exit_ptr = b.exit_ptrs[e];
            let entry = self.blocks[target as usize].checked_entry;
            self.target.link_jump(arena, exit_ptr, entry);
            self.blocks[block_num as usize].link_status[e] = true;
            debug!(block = block_num, exit = e, target, "linked block exit");
        }
    }

    /// Links `block_num` and everything waiting on its address.
    pub fn link_block_with(&mut self, mem: &GuestMemory, arena: &mut CodeArena, block_num: u32) {
        self.link_exits_with(mem, arena, block_num);
        let addr = self.blocks[block_num as usize].original_address;
        if let Some(preds) = self.links_to.get(&addr).cloned() {
            for pred in preds {
                self.link_exits_with(mem, arena, pred);
            }
        }
    }

    /// Detaches every predecessor's direct jump into `block_num`, restoring
    /// their dispatcher exits.
    pub fn unlink_block(&mut self, arena: &mut CodeArena, block_num: u32) {
        let addr = self.blocks[block_num as usize].original_address;
        let Some(preds) = self.links_to.get(&addr).cloned() else {
            return;
        };
        for pred in preds {
            if self.blocks[pred as usize].invalid {
                continue;
            }
            for e in 0..MAX_JIT_BLOCK_EXITS {
                let p = &self.blocks[pred as usize];
                if p.exit_address[e] != addr || !p.link_status[e] {
                    continue;
                }
                let exit_ptr = p.exit_ptrs[e];
                self.target.unlink_jump(arena, exit_ptr, addr, self.dispatch);
                self.blocks[pred as usize].link_status[e] = false;
            }
        }
    }

    // ==================== destruction ====================

    /// Tears down one block: restores the displaced guest word, removes the
    /// address-index entry, unlinks predecessors and redirects the dead
    /// entry point through the dispatcher. The record itself survives as a
    /// tombstone so save-states can still translate its sentinel.
    pub fn destroy_block(
        &mut self,
        mem: &mut GuestMemory,
        arena: &mut CodeArena,
        block_num: u32,
        reason: DestroyReason,
    ) {
        if block_num as usize >= self.blocks.len() {
            error!(block = block_num, "destroying out-of-range block");
            return;
        }
        if self.blocks[block_num as usize].invalid {
            if reason == DestroyReason::Invalidate {
                warn!(block = block_num, "invalidating already-invalid block");
            }
            // A clear sweeping over tombstones stays silent.
            return;
        }

        // Proxies tear down the real blocks they front for.
        if let Some(roots) = self.blocks[block_num as usize].proxy_for.take() {
            for root in roots {
                if let Some(real) = self.get_block_number_from_start_address(mem, root) {
                    self.destroy_block(mem, arena, real, reason);
                }
            }
        }

        let b = &mut self.blocks[block_num as usize];
        b.invalid = true;
        let addr = b.original_address;
        let size = b.original_size;
        let checked_entry = b.checked_entry;
        let pure_proxy = b.is_pure_proxy;
        let original = b.original_first_opcode;

        let key = (phys(addr) + size - 1, phys(addr));
        if pure_proxy {
            self.proxy_block_map.remove(&key);
        } else {
            self.block_map.remove(&key);

            // Restore the displaced word, but only if our sentinel is still
            // in place; invalidation is usually caused by someone having
            // already overwritten it.
            if mem.read32(addr) == MipsOpcode::make_emuhack(block_num).0 {
                mem.write32(addr, original.0);
            }

            self.unlink_block(arena, block_num);

            if reason == DestroyReason::Invalidate {
                // Stale direct links may still land on the entry; send them
                // back through the dispatcher.
                self.target
                    .write_redirect(arena, checked_entry, addr, self.dispatch);
            }
        }
        debug!(
            block = block_num,
            addr = format_args!("{addr:08x}"),
            ?reason,
            "destroyed block"
        );
    }

    /// Invalidates every block overlapping `[addr, addr + size)`, typically
    /// because the guest wrote there.
    pub fn invalidate_icache(
        &mut self,
        mem: &mut GuestMemory,
        arena: &mut CodeArena,
        addr: u32,
        size: u32,
    ) {
        let start = phys(addr);
        let end = start + size; // exclusive
        let overlapping = |map: &BTreeMap<(u32, u32), u32>| -> Vec<u32> {
            map.range((start, 0)..)
                .filter(|&(&(_e, s), _)| s < end)
                .map(|(_, &bn)| bn)
                .collect()
        };
        for bn in overlapping(&self.proxy_block_map) {
            self.destroy_block(mem, arena, bn, DestroyReason::Invalidate);
        }
        for bn in overlapping(&self.block_map) {
            self.destroy_block(mem, arena, bn, DestroyReason::Invalidate);
        }
    }

    /// Re-hashes every live block and destroys the ones whose guest words
    /// changed. Slow path for when writes could not be attributed.
    pub fn invalidate_changed_blocks(&mut self, mem: &mut GuestMemory, arena: &mut CodeArena) {
        let mut doomed = Vec::new();
        for bn in 0..self.blocks.len() as u32 {
            let b = &self.blocks[bn as usize];
            if b.invalid || b.is_pure_proxy {
                continue;
            }
            let hash = self.hash_guest_range(mem, b.original_address, b.original_size);
            if hash != b.compiled_hash {
                doomed.push(bn);
            }
        }
        for bn in doomed {
            info!(block = bn, "block modified in guest memory, destroying");
            self.destroy_block(mem, arena, bn, DestroyReason::Invalidate);
        }
    }

    /// Destroys everything. The caller resets the arena and regenerates the
    /// dispatcher afterwards.
    pub fn clear(&mut self, mem: &mut GuestMemory, arena: &mut CodeArena) {
        for bn in 0..self.blocks.len() as u32 {
            if !self.blocks[bn as usize].invalid {
                self.destroy_block(mem, arena, bn, DestroyReason::Clear);
            }
        }
        self.blocks.clear();
        self.block_map.clear();
        self.proxy_block_map.clear();
        self.links_to.clear();
        self.scratch_span = None;
        self.ram_span = None;
    }

    // ==================== save-state support ====================

    /// Swaps every live sentinel back to its original word, returning the
    /// sentinels so they can be reinstated. Guest memory becomes fully
    /// clean for hashing or serialization in between.
    pub fn save_and_clear_emu_hack_ops(&mut self, mem: &mut GuestMemory) -> Vec<u32> {
        let mut saved = vec![0u32; self.blocks.len()];
        for (bn, slot) in saved.iter_mut().enumerate() {
            let b = &self.blocks[bn];
            if b.invalid || b.is_pure_proxy {
                continue;
            }
            let hack = MipsOpcode::make_emuhack(bn as u32).0;
            if mem.read32(b.original_address) == hack {
                *slot = hack;
                mem.write32(b.original_address, b.original_first_opcode.0);
            }
        }
        saved
    }

    /// Undoes `save_and_clear_emu_hack_ops`.
    pub fn restore_saved_emu_hack_ops(&mut self, mem: &mut GuestMemory, saved: &[u32]) {
        if saved.len() != self.blocks.len() {
            error!(
                saved = saved.len(),
                blocks = self.blocks.len(),
                "emuhack restore length mismatch"
            );
            return;
        }
        for (bn, &word) in saved.iter().enumerate() {
            if word == 0 {
                continue;
            }
            let b = &self.blocks[bn];
            debug_assert_eq!(word, MipsOpcode::make_emuhack(bn as u32).0);
            mem.write32(b.original_address, word);
        }
    }

    pub fn compute_stats(&self) -> BlockCacheStats {
        let mut stats = BlockCacheStats {
            num_blocks: self.blocks.len(),
            ..Default::default()
        };
        for b in &self.blocks {
            if b.invalid {
                stats.num_invalid += 1;
                continue;
            }
            stats.total_code_bytes += b.code_size as u64;
            stats.total_guest_bytes += b.original_size as u64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::backend::X64Arch;
    use crate::jit::x86_64::Assembler;
    use crate::mem::RAM_BASE as RAM;

    struct Fixture {
        cache: JitBlockCache,
        mem: GuestMemory,
        arena: CodeArena,
    }

    impl Fixture {
        fn new() -> Self {
            let mut arena = CodeArena::new(1 << 20).unwrap();
            // A stand-in dispatcher so stubs have somewhere to jump.
            let dispatch = arena.offset();
            Assembler::new(&mut arena).ret();
            let mut cache = JitBlockCache::new(Box::new(X64Arch::new()));
            cache.set_dispatcher(dispatch);
            Fixture {
                cache,
                mem: GuestMemory::new(),
                arena,
            }
        }

        /// Emits a minimal fake block: checked entry marker + one exit stub
        /// per requested destination.
        fn fake_block(&mut self, addr: u32, guest_words: u32, exits: &[u32]) -> u32 {
            let bn = self.cache.allocate_block(addr).unwrap();
            let checked_entry = self.arena.offset();
            {
                // Wide enough for the redirect destroy_block patches in.
                let mut asm = Assembler::new(&mut self.arena);
                for _ in 0..16 {
                    asm.nop();
                }
            }
            let normal_entry = self.arena.offset();
            let arch = X64Arch::new();
            let dispatch = self.cache.dispatch;
            let b = self.cache.block_mut(bn);
            b.checked_entry = checked_entry;
            b.normal_entry = normal_entry;
            b.original_size = guest_words * 4;
            for (i, &dest) in exits.iter().enumerate() {
                let ptr = self.arena.offset();
                arch.emit_exit_stub(&mut self.arena, dest, dispatch);
                let b = self.cache.block_mut(bn);
                b.exit_address[i] = dest;
                b.exit_ptrs[i] = ptr;
            }
            let b = self.cache.block_mut(bn);
            b.code_size = self.arena.offset().0 - checked_entry.0;
            self.cache
                .finalize_block(&mut self.mem, &mut self.arena, bn, true);
            bn
        }
    }

    #[test]
    fn test_finalize_writes_sentinel_and_restores_on_destroy() {
        let mut f = Fixture::new();
        f.mem.write32(RAM, 0x2402_0001); // addiu $v0, $zero, 1
        let bn = f.fake_block(RAM, 2, &[]);
        let word = MipsOpcode(f.mem.read32(RAM));
        assert!(word.is_emuhack());
        assert_eq!(word.emuhack_value(), bn);
        assert_eq!(
            f.cache.read_guest_opcode(&f.mem, RAM),
            MipsOpcode(0x2402_0001)
        );

        f.cache
            .destroy_block(&mut f.mem, &mut f.arena, bn, DestroyReason::Invalidate);
        assert_eq!(f.mem.read32(RAM), 0x2402_0001);
        assert!(f.cache.block(bn).invalid);
    }

    #[test]
    fn test_destroy_redirect_leaves_following_code_intact() {
        let mut f = Fixture::new();
        f.mem.write32(RAM, 0x2402_0001);
        let bn = f.fake_block(RAM, 2, &[RAM + 0x40]);
        let exit_ptr = f.cache.block(bn).exit_ptrs[0];
        let imm_at = CodeOffset(exit_ptr.0 + 3);
        assert_eq!(f.arena.read_u32(imm_at), RAM + 0x40);

        f.cache
            .destroy_block(&mut f.mem, &mut f.arena, bn, DestroyReason::Invalidate);
        // The redirect overwrites only the checked entry; the exit stub
        // right behind it still carries its destination.
        assert_eq!(f.arena.read_u32(imm_at), RAM + 0x40);
    }

    #[test]
    fn test_repeated_invalidate_is_harmless() {
        let mut f = Fixture::new();
        f.mem.write32(RAM, 0x2402_0001);
        let bn = f.fake_block(RAM, 2, &[]);
        f.cache
            .destroy_block(&mut f.mem, &mut f.arena, bn, DestroyReason::Invalidate);
        assert_eq!(f.mem.read32(RAM), 0x2402_0001);

        // The guest may rewrite the word after the first teardown; a second
        // destroy must not clobber it with the stale original.
        f.mem.write32(RAM, 0x2402_00ff);
        f.cache
            .destroy_block(&mut f.mem, &mut f.arena, bn, DestroyReason::Invalidate);
        assert_eq!(f.mem.read32(RAM), 0x2402_00ff);
        assert!(f.cache.block(bn).invalid);
    }

    #[test]
    fn test_block_map_range_is_inclusive_of_last_byte() {
        let mut f = Fixture::new();
        let bn = f.fake_block(RAM, 3, &[]); // covers RAM..RAM+12
        assert_eq!(f.cache.blocks_containing(RAM + 11), vec![bn]);
        assert!(f.cache.blocks_containing(RAM + 12).is_empty());
    }

    #[test]
    fn test_invalidate_icache_destroys_overlap_only() {
        let mut f = Fixture::new();
        let a = f.fake_block(RAM, 2, &[]);
        let b = f.fake_block(RAM + 0x100, 2, &[]);
        f.cache
            .invalidate_icache(&mut f.mem, &mut f.arena, RAM + 4, 4);
        assert!(f.cache.block(a).invalid);
        assert!(!f.cache.block(b).invalid);
    }

    #[test]
    fn test_link_patches_exit_and_unlink_restores_it() {
        let mut f = Fixture::new();
        // Predecessor exits to RAM+0x40 before that block exists.
        let pred = f.fake_block(RAM, 2, &[RAM + 0x40]);
        let exit_ptr = f.cache.block(pred).exit_ptrs[0];
        let arch = X64Arch::new();
        assert!(!arch.is_linked(&f.arena, exit_ptr));
        assert!(!f.cache.block(pred).link_status[0]);

        // Finalizing the successor links the pending exit.
        let succ = f.fake_block(RAM + 0x40, 2, &[]);
        assert!(f.cache.block(pred).link_status[0]);
        assert!(arch.is_linked(&f.arena, exit_ptr));

        // Destroying the successor unlinks it again.
        f.cache
            .destroy_block(&mut f.mem, &mut f.arena, succ, DestroyReason::Invalidate);
        assert!(!f.cache.block(pred).link_status[0]);
        assert!(!arch.is_linked(&f.arena, exit_ptr));
    }

    #[test]
    fn test_save_restore_emuhacks_round_trip() {
        let mut f = Fixture::new();
        f.mem.write32(RAM, 0x2402_0001);
        f.mem.write32(RAM + 0x20, 0x2403_0002);
        let a = f.fake_block(RAM, 2, &[]);
        let _b = f.fake_block(RAM + 0x20, 2, &[]);

        let saved = f.cache.save_and_clear_emu_hack_ops(&mut f.mem);
        assert_eq!(f.mem.read32(RAM), 0x2402_0001);
        assert_eq!(f.mem.read32(RAM + 0x20), 0x2403_0002);

        f.cache.restore_saved_emu_hack_ops(&mut f.mem, &saved);
        assert!(MipsOpcode(f.mem.read32(RAM)).is_emuhack());
        assert_eq!(MipsOpcode(f.mem.read32(RAM)).emuhack_value(), a);
    }

    #[test]
    fn test_changed_block_detection() {
        let mut f = Fixture::new();
        f.mem.write32(RAM, 0x2402_0001);
        let bn = f.fake_block(RAM, 2, &[]);
        // Overwrite the second word (not the sentinel).
        f.mem.write32(RAM + 4, 0x2402_00ff);
        f.cache.invalidate_changed_blocks(&mut f.mem, &mut f.arena);
        assert!(f.cache.block(bn).invalid);
    }

    #[test]
    fn test_proxy_destruction_tears_down_root() {
        let mut f = Fixture::new();
        f.mem.write32(RAM, 0x2402_0001);
        let root = f.fake_block(RAM, 2, &[]);
        f.cache
            .proxy_block(&mut f.mem, &mut f.arena, RAM, RAM + 0x80, 0x20)
            .unwrap();
        // A write inside the proxied body invalidates the root block.
        f.cache
            .invalidate_icache(&mut f.mem, &mut f.arena, RAM + 0x90, 4);
        assert!(f.cache.block(root).invalid);
    }

    #[test]
    fn test_range_may_have_emuhacks() {
        let mut f = Fixture::new();
        assert!(!f.cache.range_may_have_emu_hacks(RAM, 0x1000));
        f.fake_block(RAM + 0x100, 2, &[]);
        assert!(f.cache.range_may_have_emu_hacks(RAM, 0x1000));
        assert!(!f.cache.range_may_have_emu_hacks(RAM + 0x200, 0x100));
        assert!(!f.cache.range_may_have_emu_hacks(SCRATCH_BASE, 0x100));
    }
}
