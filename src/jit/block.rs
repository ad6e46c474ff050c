//! Per-block metadata.

use crate::mips::MipsOpcode;

use super::arena::CodeOffset;

/// Hard cap on translated blocks; sentinel payloads are 24 bits, so this
/// must stay below 2^24.
pub const MAX_NUM_BLOCKS: usize = 65536;

/// Statically recorded exits per block. Exceeding this ends the block with
/// a dispatcher-routed exit instead.
pub const MAX_JIT_BLOCK_EXITS: usize = 2;

/// Marker for an unused exit slot.
pub const INVALID_EXIT: u32 = 0xFFFF_FFFF;

/// One translated guest block.
#[derive(Debug, Clone)]
pub struct JitBlock {
    /// Guest address of the first instruction.
    pub original_address: u32,
    /// The instruction word the sentinel displaced.
    pub original_first_opcode: MipsOpcode,
    /// Guest bytes covered (instruction count * 4).
    pub original_size: u32,
    /// Entry that validates the downcount before falling into the body.
    pub checked_entry: CodeOffset,
    /// Entry used by direct links, past the downcount check.
    pub normal_entry: CodeOffset,
    /// Bytes of generated code, from `checked_entry`.
    pub code_size: u32,
    /// Guest targets of the static exits; `INVALID_EXIT` when unused.
    pub exit_address: [u32; MAX_JIT_BLOCK_EXITS],
    /// Patchable exit-stub sites, one per used exit.
    pub exit_ptrs: [CodeOffset; MAX_JIT_BLOCK_EXITS],
    /// Whether each exit currently jumps straight to its target block.
    pub link_status: [bool; MAX_JIT_BLOCK_EXITS],
    /// Hash of the guest words this block was compiled from, for cheap
    /// re-validation after suspicious writes.
    pub compiled_hash: u64,
    /// Tombstone: the block survives in the table for save-state mapping
    /// but must never be entered again.
    pub invalid: bool,
    /// Addresses of blocks this is a proxy for, when the block only exists
    /// to re-route a shared function body.
    pub proxy_for: Option<Vec<u32>>,
    pub is_pure_proxy: bool,
}

impl JitBlock {
    pub fn new(address: u32) -> Self {
        JitBlock {
            original_address: address,
            original_first_opcode: MipsOpcode::NOP,
            original_size: 0,
            checked_entry: CodeOffset::INVALID,
            normal_entry: CodeOffset::INVALID,
            code_size: 0,
            exit_address: [INVALID_EXIT; MAX_JIT_BLOCK_EXITS],
            exit_ptrs: [CodeOffset::INVALID; MAX_JIT_BLOCK_EXITS],
            link_status: [false; MAX_JIT_BLOCK_EXITS],
            compiled_hash: 0,
            invalid: false,
            proxy_for: None,
            is_pure_proxy: false,
        }
    }

    /// Whether `addr` falls inside the guest range this block was built from.
    pub fn contains_address(&self, addr: u32) -> bool {
        self.original_address <= addr && self.original_address + self.original_size > addr
    }

    pub fn set_pure_proxy(&mut self) {
        self.is_pure_proxy = true;
        // A pure proxy covers exactly its own sentinel word.
        self.original_size = 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_address() {
        let mut b = JitBlock::new(0x0800_0100);
        b.original_size = 16;
        assert!(b.contains_address(0x0800_0100));
        assert!(b.contains_address(0x0800_010F));
        assert!(!b.contains_address(0x0800_0110));
        assert!(!b.contains_address(0x0800_00FF));
    }
}
