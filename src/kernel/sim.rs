//! Simulated kernel backend.
//!
//! Backs both collaborator traits with one anonymous mmap region, so the
//! engine's full install/remove/teardown state machine runs on any host.
//! Trampoline words are written and read back but never executed.

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::kernel::{MemoryObject, Patcher, VmBusy, VmSpace};
use crate::types::{HookError, ProcessId, Protection};

const PAGE_SIZE: u64 = 0x4000;

struct SimInner {
    bump: u64,
    objects: HashMap<u64, MemoryObject>,
    next_handle: u64,
}

pub struct SimKernel {
    base: *mut u8,
    size: u64,
    inner: Mutex<SimInner>,
    fail_destroy: AtomicBool,
}

// The raw base pointer is only dereferenced through checked offsets.
unsafe impl Send for SimKernel {}
unsafe impl Sync for SimKernel {}

impl SimKernel {
    pub fn new(size: u64) -> Result<Self, HookError> {
        let size = round_up(size);
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size as libc::size_t,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(HookError::MappingCreateFailed);
        }
        Ok(Self {
            base: base as *mut u8,
            size,
            inner: Mutex::new(SimInner { bump: 0, objects: HashMap::new(), next_handle: 1 }),
            fail_destroy: AtomicBool::new(false),
        })
    }

    /// Carve out a page-aligned region, e.g. to stand in for kernel text in
    /// tests. Panics when the region is exhausted.
    pub fn alloc(&self, size: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let addr = self
            .carve(&mut inner, size)
            .expect("simulated region exhausted");
        addr
    }

    /// Make the next `destroy_shared_mapping` calls report the object as
    /// still pinned.
    pub fn set_fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub fn live_objects(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    fn carve(&self, inner: &mut SimInner, size: u64) -> Option<u64> {
        let size = round_up(size);
        if inner.bump + size > self.size {
            return None;
        }
        let addr = self.base as u64 + inner.bump;
        inner.bump += size;
        Some(addr)
    }

    fn word_ptr(&self, addr: u64) -> Result<*mut u32, HookError> {
        let base = self.base as u64;
        if addr < base || addr + 4 > base + self.size || addr % 4 != 0 {
            return Err(HookError::AddressNotPatchable { addr });
        }
        Ok(addr as *mut u32)
    }
}

impl Drop for SimKernel {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size as libc::size_t);
        }
    }
}

impl Patcher for SimKernel {
    fn make_writable(&self, addr: u64, len: u64) -> Result<(), HookError> {
        let base = self.base as u64;
        if addr < base || addr + len > base + self.size {
            return Err(HookError::AddressNotPatchable { addr });
        }
        Ok(())
    }

    fn read_word(&self, addr: u64) -> Result<u32, HookError> {
        let p = self.word_ptr(addr)?;
        Ok(unsafe { ptr::read_volatile(p) })
    }

    fn write_word(&self, addr: u64, word: u32) -> Result<(), HookError> {
        let p = self.word_ptr(addr)?;
        unsafe { ptr::write_volatile(p, word) };
        Ok(())
    }

    fn flush_icache(&self, _addr: u64, _len: u64) {}
}

impl VmSpace for SimKernel {
    fn create_shared_mapping(
        &self,
        _owner: ProcessId,
        size: u64,
    ) -> Result<MemoryObject, HookError> {
        let mut inner = self.inner.lock().unwrap();
        let base = self
            .carve(&mut inner, size)
            .ok_or(HookError::MappingCreateFailed)?;
        let handle = inner.next_handle;
        inner.next_handle += 1;
        let object = MemoryObject { handle, base, size: round_up(size) };
        inner.objects.insert(handle, object);
        Ok(object)
    }

    fn map_into(
        &self,
        _pid: ProcessId,
        object: &MemoryObject,
        _prot: Protection,
    ) -> Result<u64, HookError> {
        // One flat address space; the process sees the object where the
        // kernel does.
        if !self.inner.lock().unwrap().objects.contains_key(&object.handle) {
            return Err(HookError::MappingCreateFailed);
        }
        Ok(object.base)
    }

    fn destroy_shared_mapping(&self, object: &MemoryObject) -> Result<(), VmBusy> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(VmBusy);
        }
        // The backing range is not recycled; the sim is append-only.
        self.inner.lock().unwrap().objects.remove(&object.handle);
        Ok(())
    }

    fn page_size(&self) -> u64 {
        PAGE_SIZE
    }
}

fn round_up(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
