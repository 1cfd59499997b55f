//! Processes and scheduling
//!
//! - [`pcb`]: process control blocks and the saved CPU context
//! - [`scheduler`]: PCB table, FIFO run queue, round-robin selection and
//!   tick-driven sleep/wake

pub mod pcb;
pub mod scheduler;

pub use pcb::{ContextSwitchFn, CpuContext, KernelStack, Pcb, Pid, ProcessInfo, ProcessState};
pub use scheduler::{ProcessResources, Scheduler};
