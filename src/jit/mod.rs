//! The dynamic translator.
//!
//! Layering, bottom up:
//! - `memory`/`arena`: executable pages and the append-only code arena
//! - `x86_64`: instruction encoding
//! - `block`/`cache`: translated-block bookkeeping, sentinels, linking
//! - `regcache`: guest GPR to host register mapping during translation
//! - `backend`: the fixed-size stub layouts the cache patches
//! - `compiler`: per-block instruction translation
//! - `dispatcher`: the emitted entry/dispatch trampolines
//! - `core`: the runtime gluing all of it to guest state

pub mod arena;
pub mod backend;
pub mod block;
pub mod cache;
pub mod compiler;
pub mod core;
pub mod dispatcher;
pub mod memory;
pub mod regcache;
pub mod x86_64;

pub use cache::{BlockCacheStats, DestroyReason, JitBlockCache};
pub use core::{HaltSyscalls, JitCore, SyscallHandler};
