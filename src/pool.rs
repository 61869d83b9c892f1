//! Fixed-capacity reflector page pool.
//!
//! Reflector pages are carved from one static region; the pool never grows
//! and never reorders. Claims scan for the first free slot, so a released
//! page is reused before any later one.

use crate::types::HookError;

pub struct ReflectorPool {
    base: u64,
    page_size: u64,
    used: Vec<bool>,
}

impl ReflectorPool {
    pub fn new(base: u64, capacity: usize, page_size: u64) -> Self {
        Self { base, page_size, used: vec![false; capacity] }
    }

    /// Claim the lowest-indexed free page.
    pub fn claim(&mut self) -> Result<usize, HookError> {
        match self.used.iter().position(|&u| !u) {
            Some(idx) => {
                self.used[idx] = true;
                Ok(idx)
            }
            None => Err(HookError::OutOfReflectorPages),
        }
    }

    /// Return a page to the pool. Double release is a logic error.
    pub fn release(&mut self, idx: usize) {
        assert!(self.used[idx], "releasing a free reflector page");
        self.used[idx] = false;
    }

    pub fn addr(&self, idx: usize) -> u64 {
        self.base + idx as u64 * self.page_size
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    pub fn in_use(&self) -> usize {
        self.used.iter().filter(|&&u| u).count()
    }
}
