use super::*;
use alloc::boxed::Box;
use alloc::vec;

use crate::config::{DEFAULT_TIME_SLICE, PAGE_SIZE};
use crate::memory::heap::HEADER_SIZE;
use crate::testing::MockHal;

const ENTRY: u64 = 0x10_0000;

struct Fixture {
    hal: MockHal,
    frames: FrameAllocator,
    vmm: Vmm,
    heap: &'static LockedHeap,
    sched: Scheduler,
}

impl Fixture {
    /// `frames` pages of mock memory (frame 0 reserved) and a heap arena of
    /// `heap_bytes`
    fn new(frames: usize, heap_bytes: usize) -> Self {
        let hal = MockHal::new(frames);
        let mut allocator = FrameAllocator::with_memory(hal.memory_size());
        allocator.release_region(PAGE_SIZE as u64, hal.memory_size());

        let heap: &'static LockedHeap = Box::leak(Box::new(LockedHeap::empty()));
        heap.init(Box::leak(vec![0u8; heap_bytes].into_boxed_slice()));

        Self {
            hal,
            frames: allocator,
            vmm: Vmm::new(),
            heap,
            sched: Scheduler::new(DEFAULT_TIME_SLICE),
        }
    }

    fn roomy() -> Self {
        Self::new(64, 16 * (KERNEL_STACK_SIZE + HEADER_SIZE) + 64)
    }

    fn create(&mut self, name: &str) -> Result<Pid, KernelError> {
        let res = ProcessResources {
            hal: &self.hal,
            frames: &mut self.frames,
            vmm: &mut self.vmm,
            heap: self.heap,
        };
        self.sched.create(res, name, ENTRY)
    }

    fn spawn(&mut self, name: &str) -> Pid {
        let pid = self.create(name).unwrap();
        assert!(self.sched.enqueue(pid));
        pid
    }

    fn destroy(&mut self, pid: Pid) -> bool {
        let res = ProcessResources {
            hal: &self.hal,
            frames: &mut self.frames,
            vmm: &mut self.vmm,
            heap: self.heap,
        };
        self.sched.destroy(res, pid)
    }

    fn reap(&mut self) -> usize {
        let res = ProcessResources {
            hal: &self.hal,
            frames: &mut self.frames,
            vmm: &mut self.vmm,
            heap: self.heap,
        };
        self.sched.reap_terminated(res)
    }

    fn heap_used(&self) -> usize {
        self.heap.with(|h| h.used_bytes()).unwrap()
    }

    fn state(&self, pid: Pid) -> ProcessState {
        self.sched.get(pid).unwrap().state()
    }

    fn running(&self) -> usize {
        self.sched
            .list()
            .iter()
            .filter(|p| p.state == ProcessState::Running)
            .count()
    }
}

#[test]
fn test_create_initializes_pcb() {
    let mut fx = Fixture::roomy();
    let free_before = fx.frames.free_frames();

    let pid = fx.create("init").unwrap();
    let pcb = fx.sched.get(pid).unwrap();

    assert_eq!(pid, Pid(1));
    assert_eq!(pcb.name(), "init");
    assert_eq!(pcb.state(), ProcessState::Ready);
    assert_eq!(pcb.priority(), 1);
    assert_eq!(pcb.time_slice(), DEFAULT_TIME_SLICE);
    assert_eq!(pcb.wake_at(), None);
    assert!(!pcb.is_queued());

    let ctx = pcb.context();
    assert_eq!(ctx.rip, ENTRY);
    assert_eq!(ctx.rsp, pcb.stack().top);
    assert_eq!(ctx.rflags, 0x202);
    assert_eq!(ctx.cr3, pcb.address_space().root().as_u64());
    assert_eq!(ctx.rsp % 16, 0);

    assert_eq!(fx.heap_used(), KERNEL_STACK_SIZE);
    assert_eq!(fx.frames.free_frames(), free_before - 1);
}

#[test]
fn test_pids_are_never_reused() {
    let mut fx = Fixture::roomy();

    let a = fx.create("a").unwrap();
    assert!(fx.destroy(a));
    let b = fx.create("b").unwrap();

    assert_eq!(b, Pid(2));
    assert_eq!(fx.sched.process_count(), 1);
    assert!(fx.sched.get(a).is_none());
}

#[test]
fn test_long_names_are_truncated() {
    let mut fx = Fixture::roomy();
    let name = "n".repeat(100);

    let pid = fx.create(&name).unwrap();
    assert_eq!(fx.sched.get(pid).unwrap().name().len(), MAX_PROCESS_NAME);
}

#[test]
fn test_create_rolls_back_when_frames_run_out() {
    // Only frame 0 exists and it is reserved
    let mut fx = Fixture::new(1, 4 * KERNEL_STACK_SIZE);

    let err = fx.create("doomed").unwrap_err();
    assert_eq!(err, KernelError::Memory(MemoryError::OutOfFrames));
    assert!(err.is_out_of_memory());
    assert_eq!(fx.heap_used(), 0);
    assert_eq!(fx.sched.process_count(), 0);
}

#[test]
fn test_create_fails_when_heap_is_full() {
    let mut fx = Fixture::new(16, KERNEL_STACK_SIZE);
    let free_before = fx.frames.free_frames();

    let err = fx.create("doomed").unwrap_err();
    assert_eq!(err, KernelError::Memory(MemoryError::HeapExhausted));
    assert_eq!(fx.frames.free_frames(), free_before);
    assert_eq!(fx.sched.process_count(), 0);
}

#[test]
fn test_destroy_releases_everything() {
    let mut fx = Fixture::roomy();
    let free_before = fx.frames.free_frames();

    let a = fx.spawn("a");
    let b = fx.spawn("b");
    assert!(fx.destroy(a));

    assert_eq!(fx.sched.queue(), vec![b]);
    assert_eq!(fx.frames.free_frames(), free_before - 1);
    assert_eq!(fx.heap_used(), KERNEL_STACK_SIZE);

    assert!(fx.destroy(b));
    assert!(fx.sched.queue().is_empty());
    assert_eq!(fx.frames.free_frames(), free_before);
    assert_eq!(fx.heap_used(), 0);

    // Unknown pid
    assert!(!fx.destroy(b));
}

#[test]
fn test_queue_is_fifo_and_dequeue_repairs_links() {
    let mut fx = Fixture::roomy();
    let a = fx.spawn("a");
    let b = fx.spawn("b");
    let c = fx.spawn("c");
    let d = fx.spawn("d");
    assert_eq!(fx.sched.queue(), vec![a, b, c, d]);

    // Already queued
    assert!(!fx.sched.enqueue(b));
    assert_eq!(fx.sched.queue(), vec![a, b, c, d]);

    // Middle, head, tail
    assert!(fx.sched.dequeue(b));
    assert_eq!(fx.sched.queue(), vec![a, c, d]);
    assert!(fx.sched.dequeue(a));
    assert_eq!(fx.sched.queue(), vec![c, d]);
    assert!(fx.sched.dequeue(d));
    assert_eq!(fx.sched.queue(), vec![c]);
    assert!(!fx.sched.dequeue(d));

    // Tail must be right for the next append
    assert!(fx.sched.enqueue(a));
    assert_eq!(fx.sched.queue(), vec![c, a]);
    assert!(fx.sched.dequeue(c));
    assert!(fx.sched.dequeue(a));
    assert!(fx.sched.queue().is_empty());
    assert!(fx.sched.enqueue(b));
    assert_eq!(fx.sched.queue(), vec![b]);
}

#[test]
fn test_round_robin_visits_each_once() {
    let mut fx = Fixture::roomy();
    let pids = [fx.spawn("a"), fx.spawn("b"), fx.spawn("c")];

    for round in 0..3 {
        for &expected in &pids {
            assert_eq!(fx.sched.next(), Some(expected), "round {}", round);
            assert_eq!(fx.state(expected), ProcessState::Running);
            assert_eq!(fx.running(), 1);
        }
    }
}

#[test]
fn test_slice_expiry_demotes_running() {
    let mut fx = Fixture::roomy();
    let a = fx.spawn("a");
    let b = fx.spawn("b");

    assert_eq!(fx.sched.next(), Some(a));
    for _ in 0..DEFAULT_TIME_SLICE - 1 {
        fx.sched.tick();
    }
    assert_eq!(fx.state(a), ProcessState::Running);
    assert_eq!(fx.sched.get(a).unwrap().time_slice(), 1);

    fx.sched.tick();
    assert_eq!(fx.state(a), ProcessState::Ready);
    assert_eq!(fx.sched.get(a).unwrap().time_slice(), DEFAULT_TIME_SLICE);

    assert_eq!(fx.sched.next(), Some(b));
    assert_eq!(fx.sched.ticks(), DEFAULT_TIME_SLICE);
}

#[test]
fn test_sleep_and_wake() {
    let mut fx = Fixture::roomy();
    let a = fx.spawn("a");
    let b = fx.spawn("b");

    assert_eq!(fx.sched.next(), Some(a));
    fx.sched.sleep(3);
    assert_eq!(fx.state(a), ProcessState::Blocked);
    assert_eq!(fx.sched.get(a).unwrap().wake_at(), Some(3));

    assert_eq!(fx.sched.next(), Some(b));
    fx.sched.tick();
    fx.sched.tick();
    assert_eq!(fx.state(a), ProcessState::Blocked);
    fx.sched.tick();
    assert_eq!(fx.state(a), ProcessState::Ready);
    assert_eq!(fx.sched.get(a).unwrap().wake_at(), None);
}

#[test]
fn test_zero_sleep_at_boot_still_wakes() {
    let mut fx = Fixture::roomy();
    let a = fx.spawn("a");

    assert_eq!(fx.sched.next(), Some(a));
    fx.sched.sleep(0);
    assert_eq!(fx.sched.get(a).unwrap().wake_at(), Some(0));

    fx.sched.tick();
    assert_eq!(fx.state(a), ProcessState::Ready);
}

#[test]
fn test_idle_retention() {
    let mut fx = Fixture::roomy();
    assert_eq!(fx.sched.next(), None);

    let a = fx.spawn("a");
    assert_eq!(fx.sched.next(), Some(a));
    // Only process and still Running: kept
    assert_eq!(fx.sched.next(), Some(a));
    assert_eq!(fx.state(a), ProcessState::Running);

    // Nothing Ready at all: current returned unchanged
    fx.sched.sleep(100);
    assert_eq!(fx.sched.next(), Some(a));
    assert_eq!(fx.state(a), ProcessState::Blocked);
}

#[test]
fn test_yield_hands_over() {
    let mut fx = Fixture::roomy();
    let a = fx.spawn("a");
    let b = fx.spawn("b");

    assert_eq!(fx.sched.next(), Some(a));
    fx.sched.yield_now();
    assert_eq!(fx.state(a), ProcessState::Ready);
    assert_eq!(fx.sched.next(), Some(b));
    assert_eq!(fx.sched.next(), Some(a));
}

#[test]
fn test_exit_then_reap() {
    let mut fx = Fixture::roomy();
    let free_before = fx.frames.free_frames();
    let a = fx.spawn("a");
    let b = fx.spawn("b");

    assert_eq!(fx.sched.next(), Some(a));
    fx.sched.exit(7);
    assert_eq!(fx.state(a), ProcessState::Terminated);
    assert_eq!(fx.sched.get(a).unwrap().exit_status(), Some(7));
    // Still resident and queued until reaped
    assert_eq!(fx.sched.queue(), vec![a, b]);

    // The current process is never reaped from under itself
    assert_eq!(fx.reap(), 0);

    assert_eq!(fx.sched.next(), Some(b));
    assert_eq!(fx.state(a), ProcessState::Terminated);
    assert_eq!(fx.reap(), 1);
    assert_eq!(fx.sched.queue(), vec![b]);
    assert!(fx.sched.get(a).is_none());
    assert_eq!(fx.frames.free_frames(), free_before - 1);

    // Terminated processes are skipped by selection
    assert_eq!(fx.sched.next(), Some(b));
}

#[test]
fn test_next_after_current_dequeued_starts_at_head() {
    let mut fx = Fixture::roomy();
    let a = fx.spawn("a");
    let b = fx.spawn("b");
    let c = fx.spawn("c");

    assert_eq!(fx.sched.next(), Some(a));
    assert_eq!(fx.sched.next(), Some(b));
    assert!(fx.sched.dequeue(b));
    // `a` was demoted when `b` took over
    assert_eq!(fx.sched.next(), Some(a));
    assert_eq!(fx.sched.next(), Some(c));
}

#[test]
fn test_list_is_ordered_by_pid() {
    let mut fx = Fixture::roomy();
    let a = fx.create("a").unwrap();
    let b = fx.create("b").unwrap();
    let c = fx.create("c").unwrap();
    assert!(fx.destroy(a));
    let d = fx.create("d").unwrap();

    let pids: Vec<Pid> = fx.sched.list().iter().map(|p| p.pid).collect();
    assert_eq!(pids, vec![b, c, d]);
    assert_eq!(fx.sched.list()[0].name, "b");
}

#[test]
fn test_idle_releases_current() {
    let mut fx = Fixture::roomy();
    let a = fx.spawn("a");
    let b = fx.spawn("b");

    assert_eq!(fx.sched.next(), Some(a));
    fx.sched.idle();
    assert_eq!(fx.sched.current_pid(), None);
    assert_eq!(fx.state(a), ProcessState::Ready);
    assert_eq!(fx.running(), 0);

    // A Terminated process stops being current and becomes reapable
    assert_eq!(fx.sched.next(), Some(a));
    fx.sched.exit(0);
    fx.sched.idle();
    assert_eq!(fx.state(a), ProcessState::Terminated);
    assert_eq!(fx.reap(), 1);
    assert_eq!(fx.sched.next(), Some(b));
}

#[test]
fn test_pid_space_exhaustion() {
    let mut fx = Fixture::roomy();
    let free_before = fx.frames.free_frames();
    fx.sched.next_pid = u32::MAX - 1;

    assert_eq!(fx.create("last"), Ok(Pid(u32::MAX - 1)));
    assert_eq!(fx.create("over"), Err(KernelError::SlabExhausted));
    assert_eq!(fx.sched.process_count(), 1);
    assert_eq!(fx.heap_used(), KERNEL_STACK_SIZE);
    assert_eq!(fx.frames.free_frames(), free_before - 1);
    assert_eq!(fx.sched.next_pid, u32::MAX);
}
