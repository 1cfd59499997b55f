//! Kernel error types
//!
//! Exhaustion is always reported to the caller. Invalid handles (bad heap
//! pointers, unallocated frames, unmapped pages) are neutralized where they
//! are detected and never surface here.

use core::fmt;

use lumen_hal::HalError;

/// Memory subsystem errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryError {
    /// No free physical frame left
    OutOfFrames,
    /// No heap block large enough for the request
    HeapExhausted,
    /// Bitmap storage cannot describe every frame
    BitmapTooSmall,
    /// A huge-page mapping sits where a page table was expected
    HugePageInPath,
    /// HAL error while reaching a page table
    Hal(HalError),
}

/// Kernel errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Memory exhausted or unreachable
    Memory(MemoryError),
    /// The PCB slab could not grow
    SlabExhausted,
    /// Process not found
    ProcessNotFound,
    /// Paging has not been initialized yet
    PagingNotInitialized,
}

impl From<HalError> for MemoryError {
    fn from(e: HalError) -> Self {
        MemoryError::Hal(e)
    }
}

impl From<MemoryError> for KernelError {
    fn from(e: MemoryError) -> Self {
        KernelError::Memory(e)
    }
}

impl From<HalError> for KernelError {
    fn from(e: HalError) -> Self {
        KernelError::Memory(MemoryError::Hal(e))
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfFrames => write!(f, "out of physical frames"),
            MemoryError::HeapExhausted => write!(f, "kernel heap exhausted"),
            MemoryError::BitmapTooSmall => write!(f, "frame bitmap storage too small"),
            MemoryError::HugePageInPath => write!(f, "huge page in mapping path"),
            MemoryError::Hal(e) => write!(f, "hal: {}", e),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Memory(e) => write!(f, "{}", e),
            KernelError::SlabExhausted => write!(f, "process table exhausted"),
            KernelError::ProcessNotFound => write!(f, "process not found"),
            KernelError::PagingNotInitialized => write!(f, "paging not initialized"),
        }
    }
}

impl KernelError {
    /// True for every out-of-memory flavour
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            KernelError::SlabExhausted
                | KernelError::Memory(MemoryError::OutOfFrames)
                | KernelError::Memory(MemoryError::HeapExhausted)
        )
    }
}
