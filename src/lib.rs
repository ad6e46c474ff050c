//! Allegrex - a MIPS32 to x86-64 dynamic binary translator.
//!
//! Guest code is translated one basic block at a time into an executable
//! arena. Compiled blocks announce themselves by patching a sentinel word
//! into guest memory at their start address, which makes block lookup a
//! single load and keeps save-states honest via explicit sentinel
//! save/restore sweeps.

pub mod analyst;
pub mod config;
pub mod cpu;
pub mod jit;
pub mod mem;
pub mod mips;

// Re-export the types most embedders need.
pub use config::RuntimeConfig;
pub use cpu::MipsState;
pub use jit::{HaltSyscalls, JitCore, SyscallHandler};
pub use mem::GuestMemory;
