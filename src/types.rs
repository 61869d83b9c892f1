use thiserror::Error;

/// Opaque identity of the process owning a shared mapping (`p_uniqueid`-style).
pub type ProcessId = u64;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HookError {
    #[error("target is already hooked")]
    AlreadyHooked,
    #[error("target is not hooked")]
    NotHooked,
    #[error("first instruction of the target cannot be relocated")]
    UnsupportedInstruction,
    #[error("reflector page pool is exhausted")]
    OutOfReflectorPages,
    #[error("creating the shared mapping failed")]
    MappingCreateFailed,
    #[error("address {addr:#x} cannot be patched")]
    AddressNotPatchable { addr: u64 },
    #[error("sysent index {index} is out of range")]
    SysentIndexOutOfRange { index: usize },
}

/// Memory protection requested for a shared mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    pub const RX: Protection = Protection { read: true, write: false, execute: true };
    pub const RWX: Protection = Protection { read: true, write: true, execute: true };
}
