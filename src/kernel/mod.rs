//! Collaborator traits between the hook engine and the kernel it runs in.
//!
//! The engine never touches instruction memory or the VM layer directly; it
//! goes through `Patcher` and `VmSpace` so the whole state machine can be
//! exercised against a simulated backend.

use crate::types::{HookError, ProcessId, Protection};

pub mod sim;

/// A shared memory object backing one process's reflector mapping. The
/// handle is opaque to the engine; `base` is where the object is visible
/// from kernel context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryObject {
    pub handle: u64,
    pub base: u64,
    pub size: u64,
}

/// Returned by [`VmSpace::destroy_shared_mapping`] when the object still has
/// outstanding references and must be retried later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmBusy;

/// Instruction-memory access. Word granularity only; the engine's publication
/// guarantee rests on every patch being a single aligned 32-bit store.
pub trait Patcher {
    /// Make `len` bytes at `addr` writable from kernel context.
    fn make_writable(&self, addr: u64, len: u64) -> Result<(), HookError>;

    fn read_word(&self, addr: u64) -> Result<u32, HookError>;

    /// A single aligned 32-bit store, visible to other cores atomically.
    fn write_word(&self, addr: u64, word: u32) -> Result<(), HookError>;

    /// Invalidate the instruction cache for `len` bytes at `addr`.
    fn flush_icache(&self, addr: u64, len: u64);
}

/// Shared-mapping lifecycle for reflector memory.
pub trait VmSpace {
    /// Allocate a shared object of `size` bytes, writable from kernel
    /// context.
    fn create_shared_mapping(&self, owner: ProcessId, size: u64)
        -> Result<MemoryObject, HookError>;

    /// Map a shared object into `pid`'s address space, returning the
    /// user-visible base address.
    fn map_into(
        &self,
        pid: ProcessId,
        object: &MemoryObject,
        prot: Protection,
    ) -> Result<u64, HookError>;

    /// Tear down a shared object. `VmBusy` means the object is still pinned
    /// and destruction must be retried; the caller keeps ownership.
    fn destroy_shared_mapping(&self, object: &MemoryObject) -> Result<(), VmBusy>;

    fn page_size(&self) -> u64;
}
