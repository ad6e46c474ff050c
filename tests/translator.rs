//! End-to-end tests driving the translator through its public API.

use allegrex::mem::RAM_BASE;
use allegrex::mips::MipsOpcode;
use allegrex::{HaltSyscalls, JitCore, RuntimeConfig};

fn core() -> JitCore {
    JitCore::new(RuntimeConfig::default(), Box::new(HaltSyscalls)).unwrap()
}

fn load(core: &mut JitCore, addr: u32, words: &[u32]) {
    for (i, w) in words.iter().enumerate() {
        core.mem_mut().write32(addr + (i as u32) * 4, *w);
    }
}

/// Counts down from 10, accumulating into v0. Exercises ALU, branches with
/// delay slots, block re-entry and the downcount plumbing.
#[test]
fn test_countdown_loop_sums_correctly() {
    let mut core = core();
    load(
        &mut core,
        RAM_BASE,
        &[
            0x2408_000a, // addiu t0, zero, 10
            0x2402_0000, // addiu v0, zero, 0
            // loop:
            0x0048_1021, // addu v0, v0, t0
            0x2508_ffff, // addiu t0, t0, -1
            0x1500_fffd, // bne t0, zero, loop
            0x0000_0000, // nop
            0x0000_000c, // syscall
        ],
    );
    core.reset(RAM_BASE);
    core.run(10_000);
    assert!(!core.state().is_running());
    assert_eq!(core.state().gpr[2], 55);
}

/// Compiled blocks leave a sentinel at their start address; raw reads see
/// it, instruction reads see through it.
#[test]
fn test_sentinel_visible_in_memory_but_not_to_fetch() {
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
    core.run(100);

    let raw = MipsOpcode(core.mem().read32(RAM_BASE));
    assert!(raw.is_emuhack());
    assert_eq!(core.read_opcode(RAM_BASE), MipsOpcode(0x2402_0001));
}

/// A write anywhere inside a block's guest range invalidates it, including
/// the last byte of its final instruction.
#[test]
fn test_invalidation_covers_full_block_range() {
    let mut core = core();
    load(
        &mut core,
        RAM_BASE,
        &[
            0x2402_0001, // addiu v0, zero, 1
            0x2403_0002, // addiu v1, zero, 2
            0x0000_000c, // syscall
        ],
    );
    core.reset(RAM_BASE);
    core.run(100);
    assert!(MipsOpcode(core.mem().read32(RAM_BASE)).is_emuhack());

    // Touch only the last byte of the block's range.
    core.invalidate_icache(RAM_BASE + 11, 1);
    assert!(!MipsOpcode(core.mem().read32(RAM_BASE)).is_emuhack());

    // An adjacent write must leave other blocks alone.
    core.reset(RAM_BASE);
    core.run(100);
    assert!(MipsOpcode(core.mem().read32(RAM_BASE)).is_emuhack());
    core.invalidate_icache(RAM_BASE + 12, 4);
    assert!(MipsOpcode(core.mem().read32(RAM_BASE)).is_emuhack());
}

/// Patching an instruction and invalidating recompiles the block; linked
/// callers pick up the fresh code through the dispatcher.
#[test]
fn test_patched_callee_recompiles() {
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
            0x2402_0007, // addiu v0, zero, 7 (delay slot)
        ],
    );
    core.reset(RAM_BASE);
    core.run(1000);
    assert_eq!(core.state().gpr[2], 7);

    // Patch the delay slot and invalidate the callee.
    core.mem_mut().write32(func + 4, 0x2402_0009);
    core.invalidate_icache(func + 4, 4);
    core.reset(RAM_BASE);
    core.run(1000);
    assert_eq!(core.state().gpr[2], 9);
}

/// Save-state sweep: sentinels leave guest memory entirely, then come back.
#[test]
fn test_emuhack_save_restore_round_trip() {
    let words = [
        0x2402_0005, // addiu v0, zero, 5
        0x0000_000c, // syscall
    ];
    let mut core = core();
    load(&mut core, RAM_BASE, &words);
    core.reset(RAM_BASE);
    core.run(100);
    assert!(MipsOpcode(core.mem().read32(RAM_BASE)).is_emuhack());

    let saved = core.save_emu_hacks();
    // Memory is pristine in between.
    for (i, w) in words.iter().enumerate() {
        assert_eq!(core.mem().read32(RAM_BASE + (i as u32) * 4), *w);
    }

    core.restore_emu_hacks(&saved);
    assert!(MipsOpcode(core.mem().read32(RAM_BASE)).is_emuhack());

    // The block is still live and runnable after restore.
    core.reset(RAM_BASE);
    core.run(100);
    assert_eq!(core.state().gpr[2], 5);
}

/// Hash-based revalidation catches writes that bypassed invalidation.
#[test]
fn test_changed_block_detected_by_hash() {
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
    core.run(100);
    assert_eq!(core.state().gpr[2], 1);

    // Sneaky write, no invalidate call.
    core.mem_mut().write32(RAM_BASE + 4, 0x0000_000d); // break instead of syscall
    core.invalidate_changed_blocks();
    assert!(!MipsOpcode(core.mem().read32(RAM_BASE)).is_emuhack());
}

/// Unaligned loads/stores go through the interpreter fallback and still
/// produce the architectural merge behavior.
#[test]
fn test_unaligned_access_via_fallback() {
    let mut core = core();
    let data = RAM_BASE + 0x80;
    load(
        &mut core,
        RAM_BASE,
        &[
            // lwl/lwr t1, 1(a0): load the unaligned word at a0+1.
            0x8889_0004, // lwl t1, 4(a0)
            0x9889_0001, // lwr t1, 1(a0)
            0x0120_1021, // addu v0, t1, zero
            0x0000_000c, // syscall
        ],
    );
    core.mem_mut().write32(data, 0x4433_2211);
    core.mem_mut().write32(data + 4, 0x8877_6655);
    core.reset(RAM_BASE);
    core.state_mut().gpr[4] = data;
    core.run(1000);
    assert_eq!(core.state().gpr[2], 0x5544_3322);
}

/// 64-bit multiply results land in hi/lo.
#[test]
fn test_mult_writes_hi_lo() {
    let mut core = core();
    load(
        &mut core,
        RAM_BASE,
        &[
            0x3c08_0001, // lui t0, 1
            0x3c09_0001, // lui t1, 1
            0x0109_0019, // multu t0, t1
            0x0000_1010, // mfhi v0
            0x0000_1812, // mflo v1
            0x0000_000c, // syscall
        ],
    );
    core.reset(RAM_BASE);
    core.run(1000);
    // 0x10000 * 0x10000 = 2^32: hi = 1, lo = 0.
    assert_eq!(core.state().gpr[2], 1);
    assert_eq!(core.state().gpr[3], 0);
}
