//! The translator runtime.
//!
//! Owns the guest state, guest memory, code arena and block cache, and
//! provides the Rust half of the dispatch loop: generated code calls back
//! through `extern "C"` helpers that receive the `JitCore` pointer pinned
//! in r13.

use std::ffi::c_void;
use std::ptr;

use tracing::{error, info, warn};

use crate::analyst::{FunctionDb, ReplacementFn};
use crate::config::RuntimeConfig;
use crate::cpu::{MipsState, REG_RA};
use crate::mem::GuestMemory;
use crate::mips::{interp, MipsOpcode};

use super::arena::CodeArena;
use super::backend::X64Arch;
use super::cache::{BlockCacheStats, JitBlockCache};
use super::compiler::{BlockCompiler, HelperFns};
use super::dispatcher::{self, Dispatcher};
use super::memory::MemoryError;

/// OS surface for the guest. The handler sees pc already advanced past the
/// syscall instruction and may halt the core or redirect pc.
pub trait SyscallHandler {
    fn syscall(&mut self, state: &mut MipsState, mem: &mut GuestMemory, op: MipsOpcode);
}

/// Default handler: treat any syscall as "program finished".
pub struct HaltSyscalls;

impl SyscallHandler for HaltSyscalls {
    fn syscall(&mut self, state: &mut MipsState, _mem: &mut GuestMemory, _op: MipsOpcode) {
        state.halt();
    }
}

pub struct JitCore {
    state: Box<MipsState>,
    mem: GuestMemory,
    arena: CodeArena,
    cache: JitBlockCache,
    db: FunctionDb,
    config: RuntimeConfig,
    dispatcher: Dispatcher,
    syscalls: Box<dyn SyscallHandler>,
    /// Replacement functions baked into compiled blocks by index. Reset
    /// together with the cache; stale indices only live in destroyed code.
    replacements: Vec<ReplacementFn>,
}

unsafe extern "C" fn dispatch_helper(ctx: *mut c_void) -> *const u8 {
    let core = unsafe { &mut *(ctx as *mut JitCore) };
    core.next_block_ptr()
}

unsafe extern "C" fn interp_helper(ctx: *mut c_void, op: u32, pc: u32) {
    let core = unsafe { &mut *(ctx as *mut JitCore) };
    interp::interpret(&mut core.state, &mut core.mem, MipsOpcode(op), pc);
}

unsafe extern "C" fn syscall_helper(ctx: *mut c_void, op: u32) {
    let core = unsafe { &mut *(ctx as *mut JitCore) };
    let JitCore {
        state,
        mem,
        syscalls,
        ..
    } = core;
    syscalls.syscall(state, mem, MipsOpcode(op));
}

unsafe extern "C" fn break_helper(ctx: *mut c_void) {
    let core = unsafe { &mut *(ctx as *mut JitCore) };
    warn!(
        pc = format_args!("{:08x}", core.state.pc),
        "break instruction, halting"
    );
    core.state.halt();
}

unsafe extern "C" fn replacement_helper(ctx: *mut c_void, index: u32) {
    let core = unsafe { &mut *(ctx as *mut JitCore) };
    let f = core.replacements[index as usize];
    let cycles = f(&mut core.state, &mut core.mem);
    // Replacements stand in for a whole function: return to the caller.
    core.state.pc = core.state.gpr[REG_RA];
    core.state.downcount -= cycles;
}

impl JitCore {
    pub fn new(
        config: RuntimeConfig,
        syscalls: Box<dyn SyscallHandler>,
    ) -> Result<Self, MemoryError> {
        let mut arena = CodeArena::new(config.code_size)?;
        let dispatcher = dispatcher::generate(&mut arena, dispatch_helper);
        let mut cache = JitBlockCache::new(Box::new(X64Arch::new()));
        cache.set_dispatcher(dispatcher.dispatch);

        let mut db = FunctionDb::new();
        if let Some(path) = &config.func_db {
            match db.load(path) {
                Ok(()) => info!(path = %path.display(), "loaded function database"),
                Err(err) => warn!(
                    path = %path.display(),
                    %err,
                    "could not load function database"
                ),
            }
        }

        Ok(JitCore {
            state: Box::new(MipsState::new()),
            mem: GuestMemory::new(),
            arena,
            cache,
            db,
            config,
            dispatcher,
            syscalls,
            replacements: Vec::new(),
        })
    }

    pub fn state(&self) -> &MipsState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MipsState {
        &mut self.state
    }

    pub fn mem(&self) -> &GuestMemory {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut GuestMemory {
        &mut self.mem
    }

    pub fn db_mut(&mut self) -> &mut FunctionDb {
        &mut self.db
    }

    pub fn reset(&mut self, entry: u32) {
        self.state.reset(entry);
    }

    /// Runs up to `cycles` guest cycles, returning the count consumed.
    /// Stops early when the core halts.
    pub fn run(&mut self, cycles: i32) -> i32 {
        self.state.downcount = cycles;
        let ctx = self as *mut JitCore as *mut c_void;
        while self.state.is_running() && self.state.downcount > 0 {
            // Re-resolved every pass: a cache clear during dispatch
            // regenerates the trampolines (at the same offsets).
            let enter = self.dispatcher.enter_fn(&self.arena);
            let state_ptr: *mut MipsState = &mut *self.state;
            let membase = self.mem.fast_base();
            unsafe { enter(ctx, state_ptr, membase) };
        }
        cycles - self.state.downcount
    }

    /// One configured timeslice.
    pub fn run_slice(&mut self) -> i32 {
        self.run(self.config.timeslice)
    }

    /// The Rust side of the dispatch loop: host address of the block at pc,
    /// compiling it if needed, or null to leave generated code.
    fn next_block_ptr(&mut self) -> *const u8 {
        if !self.state.is_running() || self.state.downcount <= 0 {
            return ptr::null();
        }
        let pc = self.state.pc;
        if !self.mem.is_valid_address(pc) {
            error!(
                pc = format_args!("{pc:08x}"),
                "jump to unmapped address, halting"
            );
            self.state.halt();
            return ptr::null();
        }
        let block_num = match self.cache.get_block_number_from_start_address(&self.mem, pc) {
            Some(n) => n,
            None => self.compile_block_at(pc),
        };
        self.arena.ptr_at(self.cache.block(block_num).normal_entry)
    }

    fn helper_fns(&self) -> HelperFns {
        HelperFns {
            interp: interp_helper,
            syscall: syscall_helper,
            brk: break_helper,
            replacement: replacement_helper,
        }
    }

    pub fn compile_block_at(&mut self, addr: u32) -> u32 {
        if self.cache.is_full() || self.arena.space_left() < 0x10000 {
            warn!(
                blocks = self.cache.num_blocks(),
                "code cache full, clearing"
            );
            self.clear_cache();
        }

        if self.config.enable_replacements {
            let hit = self
                .db
                .replacement_at(addr)
                .map(|(f, func)| (f, func.size));
            if let Some((f, size)) = hit {
                let index = self.replacements.len() as u32;
                self.replacements.push(f);
                let block_num = self
                    .cache
                    .allocate_block(addr)
                    .expect("cache was just cleared");
                let helpers = self.helper_fns();
                let mut compiler = BlockCompiler::new(
                    &mut self.arena,
                    &mut self.cache,
                    &mut self.mem,
                    &self.config,
                    helpers,
                );
                compiler.compile_replacement(block_num, index, size);
                self.cache
                    .finalize_block(&mut self.mem, &mut self.arena, block_num, self.config.block_link);
                return block_num;
            }
        }

        let block_num = self
            .cache
            .allocate_block(addr)
            .expect("cache was just cleared");
        let helpers = self.helper_fns();
        let mut compiler = BlockCompiler::new(
            &mut self.arena,
            &mut self.cache,
            &mut self.mem,
            &self.config,
            helpers,
        );
        compiler.compile(block_num);
        self.cache
            .finalize_block(&mut self.mem, &mut self.arena, block_num, self.config.block_link);
        block_num
    }

    /// Destroys all translated code and starts the arena over. Guest memory
    /// is left sentinel-free.
    pub fn clear_cache(&mut self) {
        self.cache.clear(&mut self.mem, &mut self.arena);
        self.arena.reset();
        // Regenerating from a fresh cursor reproduces the trampolines at
        // the same offsets, so live return addresses stay valid.
        self.dispatcher = dispatcher::generate(&mut self.arena, dispatch_helper);
        self.cache.set_dispatcher(self.dispatcher.dispatch);
        self.replacements.clear();
    }

    /// Call after guest writes to `[addr, addr + size)` that may hold code.
    pub fn invalidate_icache(&mut self, addr: u32, size: u32) {
        self.cache
            .invalidate_icache(&mut self.mem, &mut self.arena, addr, size);
    }

    /// Slow revalidation: destroy every block whose guest words changed.
    pub fn invalidate_changed_blocks(&mut self) {
        self.cache
            .invalidate_changed_blocks(&mut self.mem, &mut self.arena);
    }

    /// Reads an instruction word, seeing through block sentinels.
    pub fn read_opcode(&self, addr: u32) -> MipsOpcode {
        self.cache.read_guest_opcode(&self.mem, addr)
    }

    /// Strips all sentinels out of guest memory for serialization,
    /// returning the words needed to reinstate them.
    pub fn save_emu_hacks(&mut self) -> Vec<u32> {
        self.cache.save_and_clear_emu_hack_ops(&mut self.mem)
    }

    pub fn restore_emu_hacks(&mut self, saved: &[u32]) {
        self.cache.restore_saved_emu_hack_ops(&mut self.mem, saved);
    }

    /// Pre-scans `[start, end)` for functions, matching them against the
    /// known-hash table.
    pub fn scan_functions(&mut self, start: u32, end: u32) {
        let JitCore { db, mem, .. } = self;
        db.scan(|a| MipsOpcode(mem.read32(a)), start, end);
    }

    pub fn stats(&self) -> BlockCacheStats {
        self.cache.compute_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::RAM_BASE;

    fn core() -> JitCore {
        JitCore::new(RuntimeConfig::default(), Box::new(HaltSyscalls)).unwrap()
    }

    fn load(core: &mut JitCore, addr: u32, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            core.mem_mut().write32(addr + (i as u32) * 4, *w);
        }
    }

    #[test]
    fn test_runs_straight_line_code_to_syscall() {
        let mut core = core();
        load(
            &mut core,
            RAM_BASE,
            &[
                0x2402_002a, // addiu v0, zero, 42
                0x0000_000c, // syscall
            ],
        );
        core.reset(RAM_BASE);
        let consumed = core.run(1000);
        assert!(!core.state().is_running());
        assert_eq!(core.state().gpr[2], 42);
        assert!(consumed >= 2);
    }

    #[test]
    fn test_likely_branch_skips_delay_slot_when_not_taken() {
        let mut core = core();
        let data = RAM_BASE + 0x80;
        load(
            &mut core,
            RAM_BASE,
            &[
                0x8c88_0000, // lw t0, 0(a0)
                0x5500_0002, // bnel t0, zero, +2
                0x2402_0063, // addiu v0, zero, 99 (slot: runs only if taken)
                0x2402_0007, // addiu v0, zero, 7
                0x0000_000c, // syscall
            ],
        );

        // t0 = 0: not taken, the slot must be skipped.
        core.mem_mut().write32(data, 0);
        core.reset(RAM_BASE);
        core.state_mut().gpr[4] = data;
        core.run(1000);
        assert_eq!(core.state().gpr[2], 7);

        // t0 = 1: taken, the slot runs and the target is the syscall.
        let mut core = self::core();
        load(
            &mut core,
            RAM_BASE,
            &[
                0x8c88_0000,
                0x5500_0002,
                0x2402_0063,
                0x2402_0007,
                0x0000_000c,
            ],
        );
        core.mem_mut().write32(data, 1);
        core.reset(RAM_BASE);
        core.state_mut().gpr[4] = data;
        core.run(1000);
        assert_eq!(core.state().gpr[2], 99);
    }

    #[test]
    fn test_loop_respects_downcount() {
        let mut core = core();
        // An infinite loop: b -1 / nop.
        load(
            &mut core,
            RAM_BASE,
            &[
                0x1000_ffff, // beq zero, zero, -1
                0x0000_0000, // nop
            ],
        );
        core.reset(RAM_BASE);
        let consumed = core.run(100);
        assert!(core.state().is_running());
        assert!(consumed >= 100);
    }

    #[test]
    fn test_function_call_and_return() {
        let mut core = core();
        let func = RAM_BASE + 0x100;
        load(
            &mut core,
            RAM_BASE,
            &[
                0x0c00_0000 | ((func & 0x0fff_ffff) >> 2), // jal func
                0x0000_0000,                               // nop
                0x0000_000c,                               // syscall
            ],
        );
        load(
            &mut core,
            func,
            &[
                0x03e0_0008, // jr ra
                0x2402_0011, // addiu v0, zero, 17 (delay slot)
            ],
        );
        core.reset(RAM_BASE);
        core.run(1000);
        assert!(!core.state().is_running());
        assert_eq!(core.state().gpr[2], 17);
    }

    #[test]
    fn test_self_modifying_code_revalidates() {
        let mut core = core();
        load(
            &mut core,
            RAM_BASE,
            &[
                0x2402_0001, // addiu v0, zero, 1
                0x0000_000c, // syscall
            ],
        );
        core.reset(RAM_BASE);
        core.run(1000);
        assert_eq!(core.state().gpr[2], 1);

        // Patch the immediate and invalidate; the block must recompile.
        core.mem_mut().write32(RAM_BASE, 0x2402_0002);
        core.invalidate_icache(RAM_BASE, 4);
        core.reset(RAM_BASE);
        core.run(1000);
        assert_eq!(core.state().gpr[2], 2);
    }

    #[test]
    fn test_replacement_function_is_called() {
        fn fake_memset(state: &mut MipsState, _mem: &mut GuestMemory) -> i32 {
            state.gpr[2] = 0xbeef;
            10
        }

        let mut core = core();
        let func = RAM_BASE + 0x200;
        // A tiny leaf function: addiu v0, zero, 1 / jr ra / nop.
        load(
            &mut core,
            func,
            &[
                0x2402_0001, // addiu v0, zero, 1
                0x03e0_0008, // jr ra
                0x0000_0000, // nop
            ],
        );
        let hash = {
            let mem = core.mem();
            crate::analyst::hash_function(|a| MipsOpcode(mem.read32(a)), func, 12)
        };
        core.db_mut().register_known("fake_memset", hash, Some(fake_memset));
        core.scan_functions(func, func + 12);

        load(
            &mut core,
            RAM_BASE,
            &[
                0x0c00_0000 | ((func & 0x0fff_ffff) >> 2), // jal func
                0x0000_0000,
                0x0000_000c, // syscall
            ],
        );
        core.reset(RAM_BASE);
        core.run(1000);
        assert_eq!(core.state().gpr[2], 0xbeef);
    }
}
