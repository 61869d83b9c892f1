//! Syscall-table hooks.
//!
//! Unlike a function hook, a syscall hook never touches instruction memory:
//! it swaps the handler pointer in the sysent entry and puts it back on
//! removal. Only the `call` field is ever mutated, so publication is a single
//! 64-bit store. Syscall hooks participate in the same per-process mapping
//! refcount as function hooks, so a process's death tears both down.

use std::sync::{Arc, RwLock};

use log::debug;

use crate::hook::HookEngine;
use crate::kernel::{Patcher, VmSpace};
use crate::mapping::MappingMetadata;
use crate::types::{HookError, ProcessId};

/// One syscall-table entry, sysent-shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sysent {
    pub call: u64,
    pub narg: i16,
    pub arg_bytes: u16,
    pub return_type: i32,
}

pub struct SysentTable {
    entries: RwLock<Vec<Sysent>>,
}

impl SysentTable {
    pub fn new(entries: Vec<Sysent>) -> Self {
        Self { entries: RwLock::new(entries) }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Sysent> {
        self.entries.read().unwrap().get(index).copied()
    }

    /// Swap the handler pointer, returning the previous one. None when the
    /// index is out of range.
    pub(crate) fn swap_call(&self, index: usize, call: u64) -> Option<u64> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.get_mut(index)?;
        Some(std::mem::replace(&mut entry.call, call))
    }
}

pub(crate) struct SyscallRecord {
    table: Arc<SysentTable>,
    index: usize,
    original_call: u64,
    owner: ProcessId,
    mapping: Arc<MappingMetadata>,
}

impl<P: Patcher, V: VmSpace> HookEngine<P, V> {
    /// Swap in `replacement` as the handler for syscall `index`.
    pub fn install_syscall(
        &self,
        table: &Arc<SysentTable>,
        index: usize,
        replacement: u64,
        owner: ProcessId,
    ) -> Result<(), HookError> {
        let mut syscalls = self.syscalls.lock().unwrap();
        if syscalls
            .iter()
            .any(|r| r.index == index && Arc::ptr_eq(&r.table, table))
        {
            return Err(HookError::AlreadyHooked);
        }

        let mapping = self.mappings.acquire(owner)?;
        let original_call = match table.swap_call(index, replacement) {
            Some(call) => call,
            None => {
                self.mappings.release(&mapping);
                return Err(HookError::SysentIndexOutOfRange { index });
            }
        };

        debug!("hooked syscall {index} -> {replacement:#x} (owner {owner})");
        syscalls.push(SyscallRecord {
            table: Arc::clone(table),
            index,
            original_call,
            owner,
            mapping,
        });
        Ok(())
    }

    /// Restore the original handler for syscall `index`.
    pub fn remove_syscall(
        &self,
        table: &Arc<SysentTable>,
        index: usize,
    ) -> Result<(), HookError> {
        let mut syscalls = self.syscalls.lock().unwrap();
        let pos = syscalls
            .iter()
            .position(|r| r.index == index && Arc::ptr_eq(&r.table, table))
            .ok_or(HookError::NotHooked)?;
        let record = syscalls.remove(pos);
        let restored = record.table.swap_call(record.index, record.original_call);
        debug_assert!(restored.is_some(), "sysent entry vanished under a live hook");
        debug!("unhooked syscall {index}");
        self.mappings.release(&record.mapping);
        Ok(())
    }

    pub(crate) fn remove_syscalls_for(&self, pid: ProcessId) {
        let mut syscalls = self.syscalls.lock().unwrap();
        let mut kept = Vec::with_capacity(syscalls.len());
        for record in syscalls.drain(..) {
            if record.owner != pid {
                kept.push(record);
                continue;
            }
            let restored = record.table.swap_call(record.index, record.original_call);
            debug_assert!(restored.is_some(), "sysent entry vanished under a live hook");
            self.mappings.release(&record.mapping);
        }
        *syscalls = kept;
    }

    pub fn syscall_hook_count(&self) -> usize {
        self.syscalls.lock().unwrap().len()
    }
}
