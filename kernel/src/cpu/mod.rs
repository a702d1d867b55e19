// SPDX-License-Identifier: MPL-2.0

//! Per-CPU state: the current-thread authority and the run-queue homes.
//!
//! Each CPU's `current` pointer is the unique authority on what is running
//! there. Only the scheduler's pick routine changes it, under the CPU's
//! spinlock; the gate code relies on it staying put between a lock/unlock
//! pair on a given kernel path.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::process::Thread;
use crate::sched::RunQueues;
use crate::sync::{Gate, SpinLock};

pub type CpuId = u32;

/// Upper bound on CPUs the kernel will drive.
pub const MAX_CPUS: usize = 32;

/// One core's scheduling state.
pub struct Cpu {
    id: CpuId,
    /// What is executing here right now. Changes only under this lock,
    /// from the pick routine of this CPU.
    current: SpinLock<Option<Arc<Thread>>>,
    /// The per-CPU priority run queues.
    pub(crate) queues: Gate<RunQueues>,
}

impl Cpu {
    fn new(id: CpuId) -> Self {
        Self {
            id,
            current: SpinLock::new(None),
            queues: Gate::new(RunQueues::new()),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn current(&self) -> Option<Arc<Thread>> {
        self.current.lock().clone()
    }

    /// Swap the running thread. Also refreshes the ambient thread token
    /// the gates use for owner tracking.
    pub(crate) fn set_current(&self, thread: Option<Arc<Thread>>) {
        let token = thread.as_ref().map(thread_token).unwrap_or(0);
        *self.current.lock() = thread;
        set_current_token(token);
    }
}

/// The table of all CPUs, sized at boot.
pub struct CpuTable {
    cpus: Vec<Cpu>,
    boot_cpu: CpuId,
}

impl CpuTable {
    pub fn new(count: u32) -> Self {
        assert!(count >= 1 && count as usize <= MAX_CPUS);
        Self {
            cpus: (0..count).map(Cpu::new).collect(),
            boot_cpu: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.cpus.len() as u32
    }

    pub fn boot_cpu(&self) -> CpuId {
        self.boot_cpu
    }

    pub fn cpu(&self, id: CpuId) -> &Cpu {
        &self.cpus[id as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.iter()
    }
}

/// Identity token for a thread, as tracked by gate ownership.
pub fn thread_token(thread: &Arc<Thread>) -> usize {
    Arc::as_ptr(thread) as usize
}

#[cfg(test)]
mod context {
    use core::cell::Cell;

    std::thread_local! {
        static THIS_CPU: Cell<u32> = const { Cell::new(0) };
        static TOKEN: Cell<usize> = const { Cell::new(0) };
    }

    pub fn this_cpu() -> u32 {
        THIS_CPU.with(|c| c.get())
    }

    pub fn set_this_cpu(id: u32) {
        THIS_CPU.with(|c| c.set(id));
    }

    pub fn current_token() -> usize {
        TOKEN.with(|c| c.get())
    }

    pub fn set_current_token(token: usize) {
        TOKEN.with(|c| c.set(token));
    }
}

#[cfg(not(test))]
mod context {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use spin::Once;

    use super::MAX_CPUS;

    /// Installed by the port early in boot; reports the executing CPU.
    static CPU_ID_SOURCE: Once<fn() -> u32> = Once::new();

    const TOKEN_INIT: AtomicUsize = AtomicUsize::new(0);
    static TOKENS: [AtomicUsize; MAX_CPUS] = [TOKEN_INIT; MAX_CPUS];

    pub fn install_cpu_id_source(source: fn() -> u32) {
        CPU_ID_SOURCE.call_once(|| source);
    }

    pub fn this_cpu() -> u32 {
        CPU_ID_SOURCE.get().map(|f| f()).unwrap_or(0)
    }

    pub fn current_token() -> usize {
        TOKENS[this_cpu() as usize].load(Ordering::Acquire)
    }

    pub fn set_current_token(token: usize) {
        TOKENS[this_cpu() as usize].store(token, Ordering::Release);
    }
}

#[cfg(not(test))]
pub use context::install_cpu_id_source;
#[cfg(test)]
pub use context::set_this_cpu;
pub use context::{current_token, this_cpu};
pub(crate) use context::set_current_token;
