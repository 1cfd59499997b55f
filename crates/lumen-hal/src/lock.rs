//! Interrupt-safe locking
//!
//! A spinlock that masks interrupts while held. If the timer handler fires
//! while the heap or the scheduler is mid-update and then tries to take the
//! same lock, a plain spinlock deadlocks; masking first rules that out on a
//! single processor.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

/// A spinlock that disables interrupts while held
pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

impl<T> IrqMutex<T> {
    /// Create a new unlocked mutex
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Mask interrupts, then acquire the lock.
    ///
    /// The previous interrupt state is restored when the guard drops.
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let restore = save_and_disable();
        IrqMutexGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            restore,
        }
    }

    /// Check if the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Guard returned by [`IrqMutex::lock`]
pub struct IrqMutexGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    restore: bool,
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before re-enabling interrupts.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        if self.restore {
            enable();
        }
    }
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(feature = "x86_64")]
fn save_and_disable() -> bool {
    use x86_64::instructions::interrupts;
    let enabled = interrupts::are_enabled();
    if enabled {
        interrupts::disable();
    }
    enabled
}

#[cfg(feature = "x86_64")]
fn enable() {
    x86_64::instructions::interrupts::enable();
}

// Host builds have no interrupts to mask.
#[cfg(not(feature = "x86_64"))]
fn save_and_disable() -> bool {
    false
}

#[cfg(not(feature = "x86_64"))]
fn enable() {}
