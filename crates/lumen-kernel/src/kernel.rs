//! Kernel facade.
//!
//! `Kernel` owns one instance of every subsystem and is the only place that
//! mutates them. Each mutating entry point runs with interrupts masked
//! through [`HAL::without_interrupts`], so the timer never observes a
//! half-updated frame bitmap, page table or run queue.

use alloc::string::String;
use alloc::vec::Vec;

use lumen_hal::HAL;

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::klog;
use crate::log::Logger;
use crate::memory::{FrameAllocator, LockedHeap, MemoryStats, Vmm};
use crate::process::{CpuContext, Pid, ProcessInfo, ProcessResources, ProcessState, Scheduler};
use crate::syscall::{Syscall, SYSCALL_ERROR};

/// Switch decided by [`Kernel::timer_tick`].
///
/// `None` on either side stands for the idle boot context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextSwitch {
    pub from: Option<Pid>,
    pub to: Option<Pid>,
}

/// The kernel, generic over HAL implementation.
pub struct Kernel<H: HAL> {
    hal: H,
    frames: FrameAllocator,
    vmm: Vmm,
    heap: &'static LockedHeap,
    scheduler: Scheduler,
    log: Logger,
    config: KernelConfig,
    /// Registers of the boot thread while a process runs
    idle_context: CpuContext,
}

impl<H: HAL> Kernel<H> {
    /// Assemble a kernel from a seeded frame allocator and an initialized heap
    pub fn new(hal: H, frames: FrameAllocator, heap: &'static LockedHeap, config: KernelConfig) -> Self {
        let mut log = Logger::new(config.log_level);
        klog!(
            log,
            &hal,
            Info,
            "pfa",
            "{} frames, {} KiB free",
            frames.total_frames(),
            frames.free_bytes() / 1024
        );
        Self {
            hal,
            frames,
            vmm: Vmm::new(),
            heap,
            scheduler: Scheduler::new(config.time_slice),
            log,
            config,
            idle_context: CpuContext::default(),
        }
    }

    /// Get reference to HAL
    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn vmm(&self) -> &Vmm {
        &self.vmm
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Log history, oldest line first
    pub fn log_contents(&self) -> String {
        self.log.contents()
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Build the kernel address space and switch to it
    pub fn init_paging(&mut self) -> Result<(), KernelError> {
        let hal = &self.hal;
        let frames = &mut self.frames;
        let vmm = &mut self.vmm;
        let config = &self.config;

        match hal.without_interrupts(|| vmm.init(hal, frames, config)) {
            Ok(()) => {
                let root = vmm.kernel_space().map(|s| s.root().as_u64()).unwrap_or(0);
                klog!(
                    self.log,
                    hal,
                    Info,
                    "vmm",
                    "paging enabled, {} MiB identity-mapped, root {:#x}",
                    config.identity_map_limit / (1024 * 1024),
                    root
                );
                Ok(())
            }
            Err(e) => {
                klog!(self.log, hal, Error, "vmm", "paging init failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Physical and heap usage snapshot
    pub fn memory_stats(&self) -> MemoryStats {
        let (heap_free_bytes, heap_used_bytes, heap_largest_free) = self
            .heap
            .with(|h| (h.free_bytes(), h.used_bytes(), h.largest_free()))
            .unwrap_or_default();

        MemoryStats {
            total_frames: self.frames.total_frames(),
            free_frames: self.frames.free_frames(),
            phys_free_bytes: self.frames.free_bytes(),
            phys_used_bytes: self.frames.used_bytes(),
            heap_free_bytes,
            heap_used_bytes,
            heap_largest_free,
        }
    }

    // ========================================================================
    // Process Management
    // ========================================================================

    /// Create a process and append it to the run queue
    pub fn spawn(&mut self, name: &str, entry: u64) -> Result<Pid, KernelError> {
        if self.vmm.kernel_space().is_none() {
            return Err(KernelError::PagingNotInitialized);
        }

        let hal = &self.hal;
        let frames = &mut self.frames;
        let vmm = &mut self.vmm;
        let heap = self.heap;
        let scheduler = &mut self.scheduler;

        let result = hal.without_interrupts(|| -> Result<Pid, KernelError> {
            let res = ProcessResources { hal, frames, vmm, heap };
            let pid = scheduler.create(res, name, entry)?;
            scheduler.enqueue(pid);
            Ok(pid)
        });

        match result {
            Ok(pid) => klog!(self.log, hal, Info, "sched", "created {} (PID {})", name, pid.0),
            Err(e) => klog!(self.log, hal, Error, "sched", "failed to create {}: {}", name, e),
        }
        result
    }

    /// Destroy a process immediately, whatever its state.
    ///
    /// If its address space is loaded the kernel space is loaded first.
    pub fn kill(&mut self, pid: Pid) -> Result<(), KernelError> {
        let root = self
            .scheduler
            .get(pid)
            .map(|pcb| pcb.address_space().root())
            .ok_or(KernelError::ProcessNotFound)?;

        let hal = &self.hal;
        let frames = &mut self.frames;
        let vmm = &mut self.vmm;
        let heap = self.heap;
        let scheduler = &mut self.scheduler;

        hal.without_interrupts(|| {
            if vmm.active() == Some(root) {
                vmm.switch_to_kernel(hal);
            }
            scheduler.destroy(ProcessResources { hal, frames, vmm, heap }, pid);
        });

        klog!(self.log, hal, Info, "sched", "killed PID {}", pid.0);
        Ok(())
    }

    /// Destroy every Terminated process other than the current one
    pub fn reap(&mut self) -> usize {
        let hal = &self.hal;
        let frames = &mut self.frames;
        let vmm = &mut self.vmm;
        let heap = self.heap;
        let scheduler = &mut self.scheduler;

        let reaped =
            hal.without_interrupts(|| scheduler.reap_terminated(ProcessResources { hal, frames, vmm, heap }));
        if reaped > 0 {
            klog!(self.log, hal, Debug, "sched", "reaped {} process(es)", reaped);
        }
        reaped
    }

    pub fn process(&self, pid: Pid) -> Option<ProcessInfo> {
        self.scheduler.get(pid).map(|pcb| pcb.info())
    }

    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        self.scheduler.list()
    }

    // ========================================================================
    // Timer and context switching
    // ========================================================================

    /// Timer interrupt entry.
    ///
    /// Advances the clock and, once the current process stops Running,
    /// picks the next one. When nothing can run the CPU goes back to the
    /// boot context. Returns the switch the caller must perform, or `None`
    /// to keep running what is already on the CPU.
    pub fn timer_tick(&mut self) -> Option<ContextSwitch> {
        let hal = &self.hal;
        let scheduler = &mut self.scheduler;

        let (from, to) = hal.without_interrupts(|| {
            let from = scheduler.current_pid();
            scheduler.tick();
            if Self::is_running(scheduler, from) {
                return (from, from);
            }
            let to = scheduler.next();
            if Self::is_running(scheduler, to) {
                (from, to)
            } else {
                scheduler.idle();
                (from, None)
            }
        });

        if from == to {
            return None;
        }

        if self.vmm.kernel_space().is_some() {
            match to.and_then(|pid| self.scheduler.get(pid)) {
                Some(pcb) => self.vmm.switch_address_space(&self.hal, pcb.address_space()),
                None => {
                    self.vmm.switch_to_kernel(&self.hal);
                }
            }
        }
        klog!(
            self.log,
            &self.hal,
            Debug,
            "sched",
            "switch {:?} -> {:?}",
            from.map(|p| p.0),
            to.map(|p| p.0)
        );
        Some(ContextSwitch { from, to })
    }

    fn is_running(scheduler: &Scheduler, pid: Option<Pid>) -> bool {
        pid.and_then(|pid| scheduler.get(pid))
            .is_some_and(|pcb| pcb.state() == ProcessState::Running)
    }

    /// Save/restore targets for the context-switch routine.
    ///
    /// An idle side (or a `from` that no longer exists) uses the boot
    /// thread's context. `None` if `to` names a process that is gone.
    pub fn contexts(&mut self, switch: ContextSwitch) -> Option<(*mut CpuContext, *const CpuContext)> {
        let idle = &mut self.idle_context as *mut CpuContext;
        let to = match switch.to {
            Some(pid) => self.scheduler.context_ptr(pid)? as *const CpuContext,
            None => idle as *const CpuContext,
        };
        let from = switch
            .from
            .and_then(|pid| self.scheduler.context_ptr(pid))
            .unwrap_or(idle);
        Some((from, to))
    }

    // ========================================================================
    // Syscalls
    // ========================================================================

    /// Dispatch a process syscall; unknown numbers yield `u64::MAX`
    pub fn handle_syscall(&mut self, num: u64, arg1: u64, _arg2: u64, _arg3: u64) -> u64 {
        let Some(call) = Syscall::decode(num, arg1) else {
            klog!(self.log, &self.hal, Warn, "syscall", "unknown syscall {}", num);
            return SYSCALL_ERROR;
        };

        let scheduler = &mut self.scheduler;
        self.hal.without_interrupts(|| match call {
            Syscall::Exit { status } => {
                scheduler.exit(status);
                0
            }
            Syscall::GetPid => scheduler.current_pid().map_or(0, |pid| u64::from(pid.0)),
            Syscall::Sleep { ticks } => {
                scheduler.sleep(ticks);
                0
            }
            Syscall::Yield => {
                scheduler.yield_now();
                0
            }
        })
    }
}

#[cfg(test)]
#[path = "kernel_tests.rs"]
mod kernel_tests;
