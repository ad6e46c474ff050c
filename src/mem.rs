//! Guest physical memory.
//!
//! The PSP address map is folded onto a single flat allocation covering the
//! physical span, indexed by `addr & PHYS_MASK`. Compiled code gets the base
//! pointer pinned in a host register and addresses guest memory with one
//! masked add, so the layout here and the fast path in the backend must
//! agree.

use tracing::warn;

/// Mask that strips the segment bits (kuseg/kseg mirrors) off a guest
/// address, leaving the physical offset.
pub const PHYS_MASK: u32 = 0x1FFF_FFFF;

pub const SCRATCH_BASE: u32 = 0x0001_0000;
pub const SCRATCH_SIZE: u32 = 0x0000_4000;
pub const VRAM_BASE: u32 = 0x0400_0000;
pub const VRAM_SIZE: u32 = 0x0020_0000;
pub const RAM_BASE: u32 = 0x0800_0000;
pub const RAM_SIZE: u32 = 0x0200_0000;

/// The whole masked physical space. Larger than the mapped regions so the
/// compiled fast path (`base + (addr & PHYS_MASK)`) stays in bounds for any
/// guest address; the untouched stretch costs only address space.
pub const PHYS_SPAN: usize = (PHYS_MASK as usize) + 1;

/// An image copy that would run off the end of the physical span.
#[derive(Debug, thiserror::Error)]
#[error("{size} byte image at {addr:08x} overruns guest memory")]
pub struct ImageOverrun {
    addr: u32,
    size: usize,
}

/// Flat guest memory. Reads and writes take full virtual addresses; the
/// segment bits are masked off internally.
pub struct GuestMemory {
    phys: Vec<u8>,
}

impl GuestMemory {
    pub fn new() -> Self {
        // Zero-filled; the allocator maps this lazily so the sparse layout
        // (scratch, VRAM, RAM islands) costs only what is touched.
        GuestMemory {
            phys: vec![0u8; PHYS_SPAN],
        }
    }

    /// Whether `addr` falls in a mapped region (scratchpad, VRAM or RAM,
    /// in any segment mirror).
    pub fn is_valid_address(&self, addr: u32) -> bool {
        let p = addr & PHYS_MASK;
        (SCRATCH_BASE..SCRATCH_BASE + SCRATCH_SIZE).contains(&p)
            || (VRAM_BASE..VRAM_BASE + VRAM_SIZE).contains(&p)
            || (RAM_BASE..RAM_BASE + RAM_SIZE).contains(&p)
    }

    /// Base pointer for the compiled fast path: guest byte `addr` lives at
    /// `base + (addr & PHYS_MASK)`.
    pub fn fast_base(&mut self) -> *mut u8 {
        self.phys.as_mut_ptr()
    }

    pub fn read8(&self, addr: u32) -> u8 {
        if !self.is_valid_address(addr) {
            warn!(addr = format_args!("{addr:08x}"), "read8 from unmapped address");
            return 0;
        }
        self.phys[(addr & PHYS_MASK) as usize]
    }

    pub fn read16(&self, addr: u32) -> u16 {
        if !self.is_valid_address(addr) {
            warn!(addr = format_args!("{addr:08x}"), "read16 from unmapped address");
            return 0;
        }
        let p = (addr & PHYS_MASK) as usize;
        u16::from_le_bytes([self.phys[p], self.phys[p + 1]])
    }

    pub fn read32(&self, addr: u32) -> u32 {
        if !self.is_valid_address(addr) {
            warn!(addr = format_args!("{addr:08x}"), "read32 from unmapped address");
            return 0;
        }
        let p = (addr & PHYS_MASK) as usize;
        u32::from_le_bytes([
            self.phys[p],
            self.phys[p + 1],
            self.phys[p + 2],
            self.phys[p + 3],
        ])
    }

    pub fn write8(&mut self, addr: u32, v: u8) {
        if !self.is_valid_address(addr) {
            warn!(addr = format_args!("{addr:08x}"), "write8 to unmapped address");
            return;
        }
        self.phys[(addr & PHYS_MASK) as usize] = v;
    }

    pub fn write16(&mut self, addr: u32, v: u16) {
        if !self.is_valid_address(addr) {
            warn!(addr = format_args!("{addr:08x}"), "write16 to unmapped address");
            return;
        }
        let p = (addr & PHYS_MASK) as usize;
        self.phys[p..p + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn write32(&mut self, addr: u32, v: u32) {
        if !self.is_valid_address(addr) {
            warn!(addr = format_args!("{addr:08x}"), "write32 to unmapped address");
            return;
        }
        let p = (addr & PHYS_MASK) as usize;
        self.phys[p..p + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Copies a raw image into guest memory, for loaders and tests.
    pub fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), ImageOverrun> {
        let p = (addr & PHYS_MASK) as usize;
        if data.len() > PHYS_SPAN - p {
            return Err(ImageOverrun {
                addr,
                size: data.len(),
            });
        }
        self.phys[p..p + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Default for GuestMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_mirrors_alias() {
        let mut mem = GuestMemory::new();
        mem.write32(0x0800_0000, 0xdead_beef);
        assert_eq!(mem.read32(0x8800_0000), 0xdead_beef);
        assert_eq!(mem.read32(0xA800_0000), 0xdead_beef);
    }

    #[test]
    fn test_unmapped_reads_zero() {
        let mem = GuestMemory::new();
        assert!(!mem.is_valid_address(0x0000_0000));
        assert!(!mem.is_valid_address(0x0700_0000));
        assert_eq!(mem.read32(0x0700_0000), 0);
    }

    #[test]
    fn test_region_bounds() {
        let mem = GuestMemory::new();
        assert!(mem.is_valid_address(SCRATCH_BASE));
        assert!(mem.is_valid_address(SCRATCH_BASE + SCRATCH_SIZE - 1));
        assert!(!mem.is_valid_address(SCRATCH_BASE + SCRATCH_SIZE));
        assert!(mem.is_valid_address(RAM_BASE + RAM_SIZE - 4));
        assert!(!mem.is_valid_address(RAM_BASE + RAM_SIZE));
    }

    #[test]
    fn test_write_block_rejects_image_past_physical_span() {
        let mut mem = GuestMemory::new();
        mem.write_block(RAM_BASE, &[0x01, 0x02, 0x03, 0x04]).unwrap();
        assert_eq!(mem.read32(RAM_BASE), 0x0403_0201);
        assert!(mem.write_block(PHYS_MASK - 1, &[0; 8]).is_err());
    }

    #[test]
    fn test_little_endian_words() {
        let mut mem = GuestMemory::new();
        mem.write32(RAM_BASE, 0x0403_0201);
        assert_eq!(mem.read8(RAM_BASE), 0x01);
        assert_eq!(mem.read16(RAM_BASE + 2), 0x0403);
    }
}
