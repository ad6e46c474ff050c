//! Static analysis over guest code.
//!
//! Three concerns live here: delay-slot classification for the block
//! compiler, register-usage scans, and whole-function discovery with masked
//! hashing so known library routines can be recognized (and optionally
//! replaced with native implementations) regardless of where they were
//! linked.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::cpu::{MipsState, REG_RA};
use crate::mem::GuestMemory;
use crate::mips::tables::{self, InstrClass, MipsInfo};
use crate::mips::MipsOpcode;

// ==================== delay slots ====================

/// A delay slot is "nice" for a branch reading `r1`/`r2` when executing it
/// first cannot change the branch decision: it writes neither register and
/// is not itself a branch.
pub fn is_delay_slot_nice_reg(ds: MipsOpcode, r1: usize, r2: usize) -> bool {
    let meta = tables::decode(ds);
    if meta.info.contains(MipsInfo::DELAYSLOT) {
        return false;
    }
    match tables::out_gpr(ds) {
        Some(0) => true,
        Some(w) => w != r1 && w != r2,
        None => true,
    }
}

/// Nice for bc1f/bc1t: the slot must not rewrite the FPU condition bit.
pub fn is_delay_slot_nice_fpu(ds: MipsOpcode) -> bool {
    let meta = tables::decode(ds);
    !meta.info.contains(MipsInfo::DELAYSLOT) && !meta.info.contains(MipsInfo::OUT_FPUFLAG)
}

/// Nice for VFPU branches: the slot must not rewrite the VFPU condition
/// codes.
pub fn is_delay_slot_nice_vfpu(ds: MipsOpcode) -> bool {
    let meta = tables::decode(ds);
    !meta.info.contains(MipsInfo::DELAYSLOT) && !meta.info.contains(MipsInfo::OUT_VFPU_CC)
}

// ==================== register usage ====================

#[derive(Debug, Default, Clone)]
pub struct AnalysisResults {
    pub gpr_reads: [u32; 32],
    pub gpr_writes: [u32; 32],
    pub instructions: usize,
}

impl AnalysisResults {
    pub fn is_used(&self, r: usize) -> bool {
        self.gpr_reads[r] + self.gpr_writes[r] > 0
    }
}

/// Counts register usage from `addr` to the end of the basic block (the
/// instruction after the first branch's delay slot), bounded by
/// `max_instructions`.
pub fn analyze(
    read: impl Fn(u32) -> MipsOpcode,
    addr: u32,
    max_instructions: usize,
) -> AnalysisResults {
    let mut results = AnalysisResults::default();
    let mut pc = addr;
    let mut remaining = max_instructions;
    let mut in_final_slot = false;
    while remaining > 0 {
        let op = read(pc);
        let meta = tables::decode(op);
        for r in 1..32 {
            if tables::reads_gpr(op, r) {
                results.gpr_reads[r] += 1;
            }
        }
        if let Some(w) = tables::out_gpr(op) {
            if w != 0 {
                results.gpr_writes[w] += 1;
            }
        }
        results.instructions += 1;
        if in_final_slot {
            break;
        }
        if meta.info.contains(MipsInfo::DELAYSLOT) {
            in_final_slot = true;
        }
        pc += 4;
        remaining -= 1;
    }
    results
}

// ==================== functions ====================

/// A discovered guest function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzedFunction {
    pub start: u32,
    /// Size in bytes, delay slot of the final return included.
    pub size: u32,
    /// Masked hash: immediates and jump targets zeroed, so relinked or
    /// rebased copies of the same routine hash identically.
    pub hash: u64,
    pub name: Option<String>,
}

/// Masked hash over `[start, start + size)`.
pub fn hash_function(read: impl Fn(u32) -> MipsOpcode, start: u32, size: u32) -> u64 {
    let mut bytes = Vec::with_capacity(size as usize);
    for off in (0..size).step_by(4) {
        let op = read(start + off);
        let meta = tables::decode(op);
        let mut word = op.0;
        if meta.info.contains(MipsInfo::IN_IMM16) {
            word &= !0xffff;
        }
        if meta.info.contains(MipsInfo::IN_IMM26) {
            word &= !0x03ff_ffff;
        }
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    xxh3_64(&bytes)
}

/// Walks forward from `start`, discovering function extents: a function
/// ends at the first `jr $ra` (plus delay slot) that no earlier branch
/// jumps past.
pub fn scan_for_functions(
    read: impl Fn(u32) -> MipsOpcode,
    start: u32,
    end: u32,
) -> Vec<AnalyzedFunction> {
    let mut functions = Vec::new();
    let mut func_start = start;
    let mut furthest_branch = 0u32;
    let mut pc = start;
    while pc < end {
        let op = read(pc);
        let meta = tables::decode(op);

        if meta.info.contains(MipsInfo::IS_CONDBRANCH) {
            let target = op.branch_target(pc);
            if target > furthest_branch && target < end && target > pc {
                furthest_branch = target;
            }
        }

        // jr $ra past every known forward branch closes the function.
        let is_return = meta.class == InstrClass::JumpReg && op.funct() == 0x08 && op.rs() == REG_RA;
        if is_return && pc >= furthest_branch {
            let func_end = pc + 8; // include the delay slot
            let size = func_end - func_start;
            functions.push(AnalyzedFunction {
                start: func_start,
                size,
                hash: hash_function(&read, func_start, size),
                name: None,
            });
            func_start = func_end;
            furthest_branch = 0;
            pc = func_end;
            continue;
        }
        pc += 4;
    }
    debug!(
        start = format_args!("{start:08x}"),
        end = format_args!("{end:08x}"),
        found = functions.len(),
        "function scan complete"
    );
    functions
}

// ==================== known functions / replacements ====================

/// A native stand-in for a recognized guest routine. Returns the cycle cost
/// to charge. The guest's `$ra` is taken as the continuation address.
pub type ReplacementFn = fn(&mut MipsState, &mut GuestMemory) -> i32;

#[derive(Debug, thiserror::Error)]
pub enum AnalystError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed function database: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialization failed: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FunctionDbFile {
    functions: Vec<AnalyzedFunction>,
}

/// Discovered functions plus the hash-keyed table of known names and
/// native replacements.
#[derive(Default)]
pub struct FunctionDb {
    functions: Vec<AnalyzedFunction>,
    by_start: HashMap<u32, usize>,
    /// hash -> name for recognition.
    known_names: HashMap<u64, String>,
    /// hash -> native implementation.
    replacements: HashMap<u64, ReplacementFn>,
}

impl FunctionDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn functions(&self) -> &[AnalyzedFunction] {
        &self.functions
    }

    pub fn function_at(&self, start: u32) -> Option<&AnalyzedFunction> {
        self.by_start.get(&start).map(|&i| &self.functions[i])
    }

    /// Registers a known routine by masked hash, with an optional native
    /// replacement.
    pub fn register_known(&mut self, name: &str, hash: u64, replacement: Option<ReplacementFn>) {
        self.known_names.insert(hash, name.to_string());
        if let Some(f) = replacement {
            self.replacements.insert(hash, f);
        }
    }

    /// Scans a range and merges discoveries, naming any recognized hashes.
    pub fn scan(&mut self, read: impl Fn(u32) -> MipsOpcode, start: u32, end: u32) {
        for mut f in scan_for_functions(read, start, end) {
            if self.by_start.contains_key(&f.start) {
                continue;
            }
            if let Some(name) = self.known_names.get(&f.hash) {
                f.name = Some(name.clone());
                info!(
                    start = format_args!("{:08x}", f.start),
                    name, "recognized function"
                );
            }
            self.by_start.insert(f.start, self.functions.len());
            self.functions.push(f);
        }
    }

    /// Native replacement for the function starting at `addr`, if any.
    pub fn replacement_at(&self, addr: u32) -> Option<(ReplacementFn, &AnalyzedFunction)> {
        let f = self.function_at(addr)?;
        let imp = self.replacements.get(&f.hash)?;
        Some((*imp, f))
    }

    pub fn save(&self, path: &Path) -> Result<(), AnalystError> {
        let file = FunctionDbFile {
            functions: self.functions.clone(),
        };
        std::fs::write(path, toml::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn load(&mut self, path: &Path) -> Result<(), AnalystError> {
        let file: FunctionDbFile = toml::from_str(&std::fs::read_to_string(path)?)?;
        for f in file.functions {
            if self.by_start.contains_key(&f.start) {
                continue;
            }
            self.by_start.insert(f.start, self.functions.len());
            self.functions.push(f);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::RAM_BASE;

    fn reader(words: &[u32], base: u32) -> impl Fn(u32) -> MipsOpcode + '_ {
        move |addr| {
            let idx = ((addr - base) / 4) as usize;
            MipsOpcode(words.get(idx).copied().unwrap_or(0))
        }
    }

    #[test]
    fn test_delay_slot_niceness() {
        // addiu $v0, $zero, 1 writes $v0.
        let ds = MipsOpcode(0x2402_0001);
        assert!(!is_delay_slot_nice_reg(ds, 2, 0));
        assert!(is_delay_slot_nice_reg(ds, 4, 5));
        // A branch can never sit in a delay slot we reorder around.
        let branch = MipsOpcode(0x1085_0004);
        assert!(!is_delay_slot_nice_reg(branch, 8, 9));
        // c.lt.s rewrites the FPU flag.
        assert!(!is_delay_slot_nice_fpu(MipsOpcode(0x4602_083c)));
        assert!(is_delay_slot_nice_fpu(ds));
    }

    #[test]
    fn test_masked_hash_ignores_immediates() {
        let base = RAM_BASE;
        // Same routine, different immediates and jump targets.
        let a = [0x2402_0001, 0x0c00_0010, 0x0000_0000, 0x03e0_0008, 0];
        let b = [0x2402_00ff, 0x0c00_9999, 0x0000_0000, 0x03e0_0008, 0];
        let ha = hash_function(reader(&a, base), base, 20);
        let hb = hash_function(reader(&b, base), base, 20);
        assert_eq!(ha, hb);
        // A structurally different routine hashes differently.
        let c = [0x2402_0001, 0x0085_0018, 0x0000_0000, 0x03e0_0008, 0];
        let hc = hash_function(reader(&c, base), base, 20);
        assert_ne!(ha, hc);
    }

    #[test]
    fn test_scan_finds_two_functions() {
        let base = RAM_BASE;
        let words = [
            // f1: return 1
            0x2402_0001, // addiu $v0, $zero, 1
            0x03e0_0008, // jr $ra
            0x0000_0000, // nop (delay slot)
            // f2: branch over an early jr $ra inside the body
            0x1080_0003, // beq $a0, $zero, +3 (past the inner return)
            0x0000_0000, // nop
            0x03e0_0008, // jr $ra (inside, skipped by the branch above)
            0x0000_0000, // nop
            0x2402_0002, // addiu $v0, $zero, 2
            0x03e0_0008, // jr $ra
            0x0000_0000, // nop
        ];
        let funcs = scan_for_functions(reader(&words, base), base, base + words.len() as u32 * 4);
        assert_eq!(funcs.len(), 2);
        assert_eq!(funcs[0].start, base);
        assert_eq!(funcs[0].size, 12);
        assert_eq!(funcs[1].start, base + 12);
        assert_eq!(funcs[1].size, 28);
    }

    #[test]
    fn test_recognition_and_replacement() {
        let base = RAM_BASE;
        let words = [0x2402_0001, 0x03e0_0008, 0x0000_0000];
        let hash = hash_function(reader(&words, base), base, 12);

        fn stub(_state: &mut MipsState, _mem: &mut GuestMemory) -> i32 {
            10
        }

        let mut db = FunctionDb::new();
        db.register_known("return_one", hash, Some(stub));
        db.scan(reader(&words, base), base, base + 12);

        let f = db.function_at(base).unwrap();
        assert_eq!(f.name.as_deref(), Some("return_one"));
        assert!(db.replacement_at(base).is_some());
        assert!(db.replacement_at(base + 4).is_none());
    }

    #[test]
    fn test_db_round_trips_through_file() {
        let base = RAM_BASE;
        let words = [0x2402_0001, 0x03e0_0008, 0x0000_0000];
        let mut db = FunctionDb::new();
        db.scan(reader(&words, base), base, base + 12);

        let file = tempfile::NamedTempFile::new().unwrap();
        db.save(file.path()).unwrap();

        let mut restored = FunctionDb::new();
        restored.load(file.path()).unwrap();
        assert_eq!(restored.functions().len(), 1);
        assert_eq!(restored.functions()[0].hash, db.functions()[0].hash);
    }

    #[test]
    fn test_analyze_counts_block_usage() {
        let base = RAM_BASE;
        let words = [
            0x0085_1021, // addu $v0, $a0, $a1
            0x03e0_0008, // jr $ra
            0x2402_0001, // addiu $v0, $zero, 1 (delay slot)
        ];
        let results = analyze(reader(&words, base), base, 100);
        assert_eq!(results.instructions, 3);
        assert_eq!(results.gpr_reads[4], 1);
        assert_eq!(results.gpr_reads[31], 1);
        assert_eq!(results.gpr_writes[2], 2);
    }
}
