//! khook: AArch64 kernel function hooking.
//!
//! Hooking a function overwrites its first instruction with a branch into a
//! two-word entry stub that redirects to caller-supplied replacement code.
//! Because that first instruction is displaced, a position-independent
//! equivalent sequence is synthesized so the replacement can still call
//! "the original". Replacement code is exposed through per-process shared
//! mappings backed by a fixed pool of reflector pages, with reference-counted,
//! exactly-once teardown even when the owning process dies mid-flight.

pub mod arch;
pub mod hook;
pub mod kernel;
pub mod mapping;
pub mod pool;
pub mod syscall;
pub mod types;

pub use arch::arm64::classifier::{classify, Category};
pub use arch::arm64::trampoline::{entry_stub, synthesize};
pub use hook::HookEngine;
pub use kernel::{Patcher, VmSpace};
pub use pool::ReflectorPool;
pub use syscall::{Sysent, SysentTable};
pub use types::{HookError, ProcessId, Protection};
