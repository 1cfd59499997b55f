//! Round-robin scheduler
//!
//! PCBs live in a slab (`Vec<Option<Pcb>>`); the run queue is a FIFO
//! singly linked through [`Pcb`]'s `next` slab index. Priority is stored
//! but every process gets the same time slice.

use alloc::string::String;
use alloc::vec::Vec;

use lumen_hal::HAL;

use super::pcb::{truncate_name, CpuContext, KernelStack, Pcb, Pid, ProcessInfo, ProcessState};
use crate::config::{KERNEL_STACK_SIZE, MAX_PROCESS_NAME};
use crate::error::{KernelError, MemoryError};
use crate::memory::{FrameAllocator, LockedHeap, Vmm};

/// Priority given to every new process
const DEFAULT_PRIORITY: u32 = 1;

/// Memory collaborators process creation and destruction draw on
pub struct ProcessResources<'r, H: HAL> {
    pub hal: &'r H,
    pub frames: &'r mut FrameAllocator,
    pub vmm: &'r mut Vmm,
    pub heap: &'r LockedHeap,
}

/// Process table and run queue
pub struct Scheduler {
    slots: Vec<Option<Pcb>>,
    head: Option<usize>,
    tail: Option<usize>,
    current: Option<usize>,
    next_pid: u32,
    ticks: u64,
    time_slice: u64,
}

impl Scheduler {
    /// Empty scheduler handing out `time_slice` ticks per turn
    pub fn new(time_slice: u64) -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            tail: None,
            current: None,
            next_pid: 1,
            ticks: 0,
            time_slice: time_slice.max(1),
        }
    }

    /// Create a Ready process that starts at `entry`.
    ///
    /// Takes a PCB slot, an 8 KiB kernel stack from the heap and a fresh
    /// address space. Whatever was acquired is released again if a later
    /// step fails. The process is not queued.
    pub fn create<H: HAL>(
        &mut self,
        res: ProcessResources<'_, H>,
        name: &str,
        entry: u64,
    ) -> Result<Pid, KernelError> {
        let following = self.next_pid.checked_add(1).ok_or(KernelError::SlabExhausted)?;
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.slots
                    .try_reserve(1)
                    .map_err(|_| KernelError::SlabExhausted)?;
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        let name = truncate_name(name, MAX_PROCESS_NAME);
        let mut owned_name = String::new();
        owned_name
            .try_reserve_exact(name.len())
            .map_err(|_| KernelError::SlabExhausted)?;
        owned_name.push_str(name);

        let block = match res.heap.allocate(KERNEL_STACK_SIZE)? {
            Some(block) => block,
            None => return Err(MemoryError::HeapExhausted.into()),
        };
        let Some(base) = res.heap.address_of(block) else {
            res.heap.free(block);
            return Err(MemoryError::HeapExhausted.into());
        };
        let stack = KernelStack {
            block,
            top: (base + KERNEL_STACK_SIZE) as u64,
        };

        let mut space = match res.vmm.create_address_space(res.hal, res.frames) {
            Ok(space) => space,
            Err(e) => {
                res.heap.free(block);
                return Err(e.into());
            }
        };
        if let Err(e) = res.vmm.share_kernel_mappings(res.hal, &mut space) {
            res.vmm.destroy_address_space(res.frames, space);
            res.heap.free(block);
            return Err(e.into());
        }

        let pid = Pid(self.next_pid);
        self.next_pid = following;

        let context = CpuContext::new(entry, stack.top, space.root().as_u64());
        self.slots[slot] = Some(Pcb {
            pid,
            name: owned_name,
            state: ProcessState::Ready,
            context,
            space,
            stack,
            priority: DEFAULT_PRIORITY,
            time_slice: self.time_slice,
            wake_at: None,
            exit_status: None,
            next: None,
            queued: false,
        });

        Ok(pid)
    }

    /// Release a process's address space, stack and slot.
    ///
    /// The PCB is unlinked from the run queue first if the caller has not
    /// done so. Returns `false` for an unknown pid.
    pub fn destroy<H: HAL>(&mut self, res: ProcessResources<'_, H>, pid: Pid) -> bool {
        let Some(idx) = self.index_of(pid) else {
            return false;
        };
        self.unlink(idx);
        if self.current == Some(idx) {
            self.current = None;
        }

        let Some(pcb) = self.slots[idx].take() else {
            return false;
        };
        res.vmm.destroy_address_space(res.frames, pcb.space);
        res.heap.free(pcb.stack.block);
        true
    }

    /// Append to the tail of the run queue; no-op if unknown or already queued
    pub fn enqueue(&mut self, pid: Pid) -> bool {
        let Some(idx) = self.index_of(pid) else {
            return false;
        };
        if let Some(pcb) = self.pcb_mut(idx) {
            if pcb.queued {
                return false;
            }
            pcb.queued = true;
            pcb.next = None;
        }

        match self.tail.and_then(|tail| self.pcb_mut(tail)) {
            Some(tail) => tail.next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        true
    }

    /// Remove from the run queue wherever it sits
    pub fn dequeue(&mut self, pid: Pid) -> bool {
        match self.index_of(pid) {
            Some(idx) => self.unlink(idx),
            None => false,
        }
    }

    fn unlink(&mut self, idx: usize) -> bool {
        let next = match self.pcb_mut(idx) {
            Some(pcb) if pcb.queued => {
                pcb.queued = false;
                pcb.next.take()
            }
            _ => return false,
        };

        let mut prev = None;
        let mut cursor = self.head;
        while let Some(at) = cursor {
            if at == idx {
                break;
            }
            prev = Some(at);
            cursor = self.pcb(at).and_then(|p| p.next);
        }

        match prev.and_then(|p| self.pcb_mut(p)) {
            Some(prev) => prev.next = next,
            None => self.head = next,
        }
        if self.tail == Some(idx) {
            self.tail = prev;
        }
        true
    }

    /// Advance time by one tick.
    ///
    /// Wakes every queued sleeper whose wake tick has arrived, then charges
    /// the running process and demotes it to Ready when its slice runs out.
    pub fn tick(&mut self) {
        self.ticks += 1;
        let now = self.ticks;

        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let Some(pcb) = self.pcb_mut(idx) else {
                break;
            };
            if pcb.state == ProcessState::Blocked && pcb.wake_at.is_some_and(|wake| now >= wake) {
                pcb.wake_at = None;
                pcb.state = ProcessState::Ready;
            }
            cursor = pcb.next;
        }

        let slice = self.time_slice;
        if let Some(pcb) = self.current_pcb_mut() {
            if pcb.state == ProcessState::Running {
                pcb.time_slice = pcb.time_slice.saturating_sub(1);
                if pcb.time_slice == 0 {
                    pcb.state = ProcessState::Ready;
                    pcb.time_slice = slice;
                }
            }
        }
    }

    /// Pick the next process to run.
    ///
    /// Scans round-robin from the entry after the current process, wrapping
    /// at the tail. The first Ready process becomes Running with a fresh
    /// slice, and a still-Running predecessor goes back to Ready. With
    /// nothing Ready the current process is returned unchanged.
    pub fn next(&mut self) -> Option<Pid> {
        let head = self.head?;
        let start = self
            .current
            .and_then(|idx| self.pcb(idx))
            .filter(|pcb| pcb.queued)
            .and_then(|pcb| pcb.next)
            .unwrap_or(head);

        let mut idx = start;
        loop {
            let Some(pcb) = self.pcb(idx) else {
                break;
            };
            if pcb.state == ProcessState::Ready {
                return Some(self.promote(idx));
            }
            idx = pcb.next.unwrap_or(head);
            if idx == start {
                break;
            }
        }

        self.current_pid()
    }

    fn promote(&mut self, idx: usize) -> Pid {
        if let Some(prev) = self.current.filter(|&prev| prev != idx) {
            if let Some(pcb) = self.pcb_mut(prev) {
                if pcb.state == ProcessState::Running {
                    pcb.state = ProcessState::Ready;
                }
            }
        }

        self.current = Some(idx);
        let slice = self.time_slice;
        match self.pcb_mut(idx) {
            Some(pcb) => {
                pcb.state = ProcessState::Running;
                pcb.time_slice = slice;
                pcb.pid
            }
            None => Pid(0),
        }
    }

    /// Hand the CPU back to the boot context.
    ///
    /// Nothing is current afterwards; a still-Running process goes back to
    /// Ready.
    pub fn idle(&mut self) {
        if let Some(pcb) = self.current_pcb_mut() {
            if pcb.state == ProcessState::Running {
                pcb.state = ProcessState::Ready;
            }
        }
        self.current = None;
    }

    /// Block the current process for `ticks` ticks
    pub fn sleep(&mut self, ticks: u64) {
        let wake = self.ticks.saturating_add(ticks);
        if let Some(pcb) = self.current_pcb_mut() {
            pcb.wake_at = Some(wake);
            pcb.state = ProcessState::Blocked;
        }
    }

    /// Mark the current process Terminated. Nothing is released here.
    pub fn exit(&mut self, status: i32) {
        if let Some(pcb) = self.current_pcb_mut() {
            pcb.state = ProcessState::Terminated;
            pcb.exit_status = Some(status);
        }
    }

    /// Give up the rest of the current slice
    pub fn yield_now(&mut self) {
        let slice = self.time_slice;
        if let Some(pcb) = self.current_pcb_mut() {
            if pcb.state == ProcessState::Running {
                pcb.state = ProcessState::Ready;
                pcb.time_slice = slice;
            }
        }
    }

    /// Destroy every Terminated process except the current one.
    ///
    /// Returns how many were reaped.
    pub fn reap_terminated<H: HAL>(&mut self, res: ProcessResources<'_, H>) -> usize {
        let current = self.current;
        let doomed: Vec<Pid> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(idx, _)| Some(*idx) != current)
            .filter_map(|(_, slot)| slot.as_ref())
            .filter(|pcb| pcb.state == ProcessState::Terminated)
            .map(|pcb| pcb.pid)
            .collect();

        let ProcessResources { hal, frames, vmm, heap } = res;
        for &pid in &doomed {
            self.destroy(
                ProcessResources {
                    hal,
                    frames: &mut *frames,
                    vmm: &mut *vmm,
                    heap,
                },
                pid,
            );
        }
        doomed.len()
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current.and_then(|idx| self.pcb(idx)).map(|pcb| pcb.pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.index_of(pid).and_then(|idx| self.pcb(idx))
    }

    /// Raw pointer to a process's saved context for the switch routine
    pub fn context_ptr(&mut self, pid: Pid) -> Option<*mut CpuContext> {
        let idx = self.index_of(pid)?;
        self.pcb_mut(idx).map(|pcb| &mut pcb.context as *mut CpuContext)
    }

    /// Every live process, ordered by pid
    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self.slots.iter().flatten().map(Pcb::info).collect();
        infos.sort_by_key(|info| info.pid);
        infos
    }

    /// Pids in run-queue order
    pub fn queue(&self) -> Vec<Pid> {
        let mut pids = Vec::new();
        let mut cursor = self.head;
        while let Some(pcb) = cursor.and_then(|idx| self.pcb(idx)) {
            pids.push(pcb.pid);
            cursor = pcb.next;
        }
        pids
    }

    /// Ticks since boot
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn time_slice(&self) -> u64 {
        self.time_slice
    }

    pub fn process_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn index_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|pcb| pcb.pid == pid))
    }

    fn pcb(&self, idx: usize) -> Option<&Pcb> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn pcb_mut(&mut self, idx: usize) -> Option<&mut Pcb> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn current_pcb_mut(&mut self) -> Option<&mut Pcb> {
        let idx = self.current?;
        self.pcb_mut(idx)
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod scheduler_tests;
