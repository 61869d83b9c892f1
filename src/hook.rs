//! Hook installation and removal.
//!
//! Install is a strict sequence: read and classify the target's first
//! instruction, take a mapping reference, claim reflector pages, lay out the
//! slot, and only then patch the target with a single branch word. Any
//! failure unwinds everything acquired so far, so a failed install leaves no
//! trace. The target patch is the last store, which is what makes the hook
//! visible to other cores atomically.
//!
//! Slot layout in reflector memory, in words:
//!
//! ```text
//! +0x00  replacement address, low half
//! +0x04  replacement address, high half
//! +0x08  LDR X16, #-8          <- the patched branch lands here
//! +0x0C  BR X16
//! +0x10  trampoline words      <- position-independent displaced instruction
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};

use crate::arch::arm64::classifier::{classify, Category};
use crate::arch::arm64::trampoline::{entry_stub, synthesize};
use crate::arch::arm64::writer::branch_imm;
use crate::kernel::{Patcher, VmSpace};
use crate::mapping::{MappingManager, MappingMetadata};
use crate::pool::ReflectorPool;
use crate::syscall::SyscallRecord;
use crate::types::{HookError, ProcessId};

/// Words before the trampoline: replacement address halves plus entry stub.
const SLOT_HEADER_WORDS: u64 = 4;
/// Offset of the entry stub within the slot.
const STUB_OFFSET: u64 = 8;
/// Offset of the trampoline within the slot.
const TRAMPOLINE_OFFSET: u64 = 16;

pub(crate) struct HookRecord {
    orig_instr: u32,
    owner: ProcessId,
    slot: u64,
    pages: Vec<usize>,
    mapping: Arc<MappingMetadata>,
}

pub struct HookEngine<P: Patcher, V: VmSpace> {
    pub(crate) patcher: Arc<P>,
    pub(crate) mappings: MappingManager<V>,
    pub(crate) hooks: RwLock<HashMap<u64, HookRecord>>,
    pub(crate) syscalls: Mutex<Vec<SyscallRecord>>,
}

impl<P: Patcher, V: VmSpace> HookEngine<P, V> {
    pub fn new(patcher: Arc<P>, vm: Arc<V>, pool: ReflectorPool) -> Self {
        Self {
            patcher,
            mappings: MappingManager::new(vm, pool),
            hooks: RwLock::new(HashMap::new()),
            syscalls: Mutex::new(Vec::new()),
        }
    }

    /// Hook the function at `target`, redirecting it to `replacement` on
    /// behalf of process `owner`.
    pub fn install(
        &self,
        target: u64,
        replacement: u64,
        owner: ProcessId,
    ) -> Result<(), HookError> {
        let mut hooks = self.hooks.write().unwrap();
        if hooks.contains_key(&target) {
            return Err(HookError::AlreadyHooked);
        }

        let orig_instr = self.patcher.read_word(target)?;
        let category =
            classify(orig_instr).map_err(|_| HookError::UnsupportedInstruction)?;

        let mapping = self.mappings.acquire(owner)?;

        let slot_words = SLOT_HEADER_WORDS + category.trampoline_words() as u64;
        let page_size = self.mappings.page_size();
        let page_count = ((slot_words * 4 + page_size - 1) / page_size) as usize;
        // A slot is at most 14 words, far below any page size, so exactly
        // one page backs it. The pool scans for the first free index and
        // makes no contiguity promise, so a multi-page slot would need a
        // contiguous claim primitive that does not exist.
        debug_assert_eq!(page_count, 1, "slot must fit one reflector page");

        let pages = match self.mappings.claim_pages(&mapping, page_count) {
            Ok(pages) => pages,
            Err(err) => {
                self.mappings.release(&mapping);
                return Err(err);
            }
        };
        let slot = self.mappings.page_addr(pages[0]);

        if let Err(err) = self.lay_out_slot(slot, replacement, category, orig_instr, target) {
            self.mappings.release_pages(&mapping, &pages);
            self.mappings.release(&mapping);
            return Err(err);
        }

        // The branch into the entry stub is the publication point.
        let branch = match branch_imm(target, slot + STUB_OFFSET) {
            Some(word) => word,
            None => {
                self.mappings.release_pages(&mapping, &pages);
                self.mappings.release(&mapping);
                return Err(HookError::AddressNotPatchable { addr: target });
            }
        };
        if let Err(err) = self.patch_word(target, branch) {
            self.mappings.release_pages(&mapping, &pages);
            self.mappings.release(&mapping);
            return Err(err);
        }

        debug!("hooked {target:#x} -> {replacement:#x} (slot {slot:#x}, owner {owner})");
        hooks.insert(target, HookRecord { orig_instr, owner, slot, pages, mapping });
        Ok(())
    }

    fn lay_out_slot(
        &self,
        slot: u64,
        replacement: u64,
        category: Category,
        orig_instr: u32,
        target: u64,
    ) -> Result<(), HookError> {
        let trampoline = synthesize(category, orig_instr, target, slot + TRAMPOLINE_OFFSET);
        let slot_words = SLOT_HEADER_WORDS + trampoline.len() as u64;

        self.patcher.make_writable(slot, slot_words * 4)?;
        self.patcher.write_word(slot, replacement as u32)?;
        self.patcher.write_word(slot + 4, (replacement >> 32) as u32)?;
        let stub = entry_stub();
        self.patcher.write_word(slot + STUB_OFFSET, stub[0])?;
        self.patcher.write_word(slot + STUB_OFFSET + 4, stub[1])?;
        for (i, &word) in trampoline.iter().enumerate() {
            self.patcher
                .write_word(slot + TRAMPOLINE_OFFSET + i as u64 * 4, word)?;
        }
        self.patcher.flush_icache(slot, slot_words * 4);
        Ok(())
    }

    fn patch_word(&self, addr: u64, word: u32) -> Result<(), HookError> {
        self.patcher.make_writable(addr, 4)?;
        self.patcher.write_word(addr, word)?;
        self.patcher.flush_icache(addr, 4);
        Ok(())
    }

    /// Unhook `target`, restoring its original first instruction bit for bit.
    pub fn remove(&self, target: u64) -> Result<(), HookError> {
        let mut hooks = self.hooks.write().unwrap();
        let record = hooks.remove(&target).ok_or(HookError::NotHooked)?;
        if let Err(err) = self.patch_word(target, record.orig_instr) {
            hooks.insert(target, record);
            return Err(err);
        }
        debug!("unhooked {target:#x}");
        self.mappings.release_pages(&record.mapping, &record.pages);
        self.mappings.release(&record.mapping);
        Ok(())
    }

    /// Tear down everything owned by a dying process: function hooks,
    /// syscall hooks, and ultimately its mapping. Restoration is best
    /// effort; a target that can no longer be patched is logged and skipped.
    pub fn on_process_death(&self, pid: ProcessId) {
        let mut hooks = self.hooks.write().unwrap();
        let targets: Vec<u64> = hooks
            .iter()
            .filter(|(_, r)| r.owner == pid)
            .map(|(&t, _)| t)
            .collect();
        for target in targets {
            let record = match hooks.remove(&target) {
                Some(record) => record,
                None => continue,
            };
            if let Err(err) = self.patch_word(target, record.orig_instr) {
                warn!("could not restore {target:#x} on death of {pid}: {err}");
            }
            // Pages stay linked to the mapping: the final release returns
            // them, or hands them to the orphan queue when the shared
            // object cannot be destroyed yet.
            self.mappings.release(&record.mapping);
        }
        drop(hooks);

        self.remove_syscalls_for(pid);
    }

    /// Address of the synthesized original-instruction sequence, usable as
    /// "call the original" from replacement code.
    pub fn trampoline_addr(&self, target: u64) -> Option<u64> {
        self.hooks
            .read()
            .unwrap()
            .get(&target)
            .map(|r| r.slot + TRAMPOLINE_OFFSET)
    }

    pub fn is_hooked(&self, target: u64) -> bool {
        self.hooks.read().unwrap().contains_key(&target)
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.read().unwrap().len()
    }

    /// Retry teardown of mappings whose destruction was deferred.
    pub fn sweep_orphans(&self) -> usize {
        self.mappings.sweep()
    }

    pub fn orphan_count(&self) -> usize {
        self.mappings.orphan_count()
    }

    /// Fire `callback` once when `pid`'s mapping is fully torn down.
    pub fn set_death_callback<F>(&self, pid: ProcessId, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.mappings.set_death_callback(pid, callback);
    }

    pub fn pages_in_use(&self) -> usize {
        self.mappings.pages_in_use()
    }
}
