// SPDX-License-Identifier: MPL-2.0

use crate::config::{
    FIRST_TID, KERNEL_SPACE_BASE, PAGE_SIZE, THREAD_MAX, THREAD_MAX_STACK_PAGES,
};
use crate::cpu::CpuId;
use crate::error::{KernelError, Result};
use crate::mm::{VmaFlags, VmaKind};
use crate::prelude::*;
use crate::process::table::Role;
use crate::process::{Pid, ProcessInner, Tid};
use crate::sched;
use crate::sync::Gate;

bitflags! {
    pub struct ThreadFlags: u8 {
        const IN_USER_MODE  = 1 << 0;
        const IS_DRIVER     = 1 << 1;
        const HAS_IO_BITMAP = 1 << 2;
    }
}

/// The scheduling state of a thread. The state and the thread's run-queue
/// membership agree at every quiescent point.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    /// Not queued, waiting for an event (sleep timer, role wait).
    Sleeping,
    /// Queued, waiting for CPU time.
    InRunQueue,
    /// Queued and executing on its CPU.
    Running,
    /// Blocked in send, waiting for the partner's reply.
    WaitingForReply,
    /// Blocked in recv, waiting for any acceptable message.
    WaitingForMsg,
    /// Parked after a signal interrupted it.
    WaitingAfterSignal,
    /// Forcibly stopped by a senior process.
    Held,
    /// About to be destroyed.
    Dead,
}

/// Portable register snapshot. The port widens this with whatever the
/// architecture actually saves; the core only steers the program counter,
/// stack and the syscall result register.
#[derive(Clone, Copy, Default, Debug)]
pub struct SavedRegisters {
    pub pc: Vaddr,
    pub sp: Vaddr,
    pub result: isize,
}

/// A priority temporarily inherited from an IPC sender, recorded with the
/// grantor so nested sends cannot double-raise.
#[derive(Clone, Copy, Debug)]
pub struct GrantedPriority {
    pub level: u8,
    pub by: (Pid, Tid),
}

pub struct ThreadInner {
    pub flags: ThreadFlags,
    pub state: ThreadState,
    /// CPU the thread last ran on (its queue home).
    pub cpu: CpuId,
    pub timeslice: u32,
    pub priority: u8,
    pub granted: Option<GrantedPriority>,
    pub points: u64,
    /// Scheduling bounds copied from the owning process.
    pub priority_low: u8,
    pub priority_high: u8,
    /// Which (cpu, priority) queue currently holds the thread, if any.
    pub queued_at: Option<(CpuId, u8)>,
    /// Partner thread in an ongoing synchronous exchange.
    pub reply_source: Option<(Pid, Tid)>,
    /// User address of the message control block submitted to send/recv.
    pub msg_block: Option<Vaddr>,
    pub waiting_for_role: Option<Role>,
    /// Where the thread's user stack starts (stacks grow down).
    pub stack_base: Vaddr,
    pub kstack_block: usize,
    pub kstack_top: usize,
    pub regs: SavedRegisters,
}

/// A thread record. Owned by its process's thread table; run queues hold
/// transient clones while the thread is schedulable.
pub struct Thread {
    pid: Pid,
    tid: Tid,
    inner: Gate<ThreadInner>,
}

impl Thread {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn inner(&self) -> &Gate<ThreadInner> {
        &self.inner
    }

    pub fn state(&self) -> ThreadState {
        self.inner.read().map(|i| i.state).unwrap_or(ThreadState::Dead)
    }
}

/// The stack area reserved for a tid: top-of-user-space minus
/// tid x per-thread-stack-size, growing downwards within the area.
pub(crate) fn stack_area_for(tid: Tid) -> (Vaddr, usize) {
    let size = THREAD_MAX_STACK_PAGES * PAGE_SIZE;
    (KERNEL_SPACE_BASE - size * tid as usize, size)
}

fn allocate_tid(inner: &mut ProcessInner) -> Result<Tid> {
    if inner.threads.len() as u32 >= THREAD_MAX {
        return Err(KernelError::Failure);
    }
    loop {
        let candidate = inner.next_tid;
        inner.next_tid += 1;
        if inner.next_tid >= THREAD_MAX {
            inner.next_tid = FIRST_TID;
        }
        if !inner.threads.contains_key(&candidate) {
            return Ok(candidate);
        }
    }
}

fn build(
    kernel: &Kernel,
    pid: Pid,
    inner: &mut ProcessInner,
    tid: Tid,
    stack_base: Vaddr,
    template: Option<&ThreadInner>,
) -> Result<Arc<Thread>> {
    // one page of kernel stack per thread
    let kstack = kernel.malloc(PAGE_SIZE)? as usize;

    let (flags, regs, timeslice, priority) = match template {
        Some(src) => (src.flags, src.regs, src.timeslice, src.priority),
        None => (
            ThreadFlags::empty(),
            SavedRegisters::default(),
            crate::config::SCHED_TIMESLICE,
            inner.priority_low.max(sched::PRIORITY_MIN),
        ),
    };

    let thread = Arc::new(Thread {
        pid,
        tid,
        inner: Gate::new(ThreadInner {
            flags,
            state: ThreadState::Sleeping,
            cpu: inner.cpu_hint,
            timeslice,
            priority,
            granted: None,
            points: sched::base_points(priority),
            priority_low: inner.priority_low,
            priority_high: inner.priority_high,
            queued_at: None,
            reply_source: None,
            msg_block: None,
            waiting_for_role: None,
            stack_base,
            kstack_block: kstack,
            kstack_top: kstack + PAGE_SIZE,
            regs,
        }),
    });

    inner.threads.insert(tid, thread.clone());
    Ok(thread)
}

/// Create a fresh thread inside a process. Reserves the deterministic
/// per-tid user stack area and a one-page kernel stack. The new thread is
/// asleep until the caller queues it.
pub fn create_thread(
    kernel: &Kernel,
    pid: Pid,
    inner: &mut ProcessInner,
) -> Result<Arc<Thread>> {
    let tid = allocate_tid(inner)?;

    let (stack_base, stack_size) = stack_area_for(tid);
    inner.space.add(
        kernel,
        pid,
        stack_base,
        stack_size,
        VmaFlags::WRITEABLE | VmaFlags::MEMSOURCE,
        VmaKind::Stack,
        0,
    )?;

    // stacks grow down from the top of the reserved area
    let thread = build(kernel, pid, inner, tid, stack_base + stack_size, None)?;
    trace!(
        "thread: created tid {} for pid {} (ustack {:#x})",
        tid,
        pid,
        stack_base
    );
    Ok(thread)
}

/// Make an exact copy of a thread in another process (fork). The memory
/// mappings are taken care of by the address-space clone; register state
/// is copied from the source and the new thread keeps the same tid.
pub fn duplicate_thread(
    kernel: &Kernel,
    pid: Pid,
    inner: &mut ProcessInner,
    source: &Arc<Thread>,
) -> Result<Arc<Thread>> {
    let src = source.inner().read()?;
    let tid = source.tid();
    if inner.threads.contains_key(&tid) {
        return Err(KernelError::Exists);
    }
    let thread = build(kernel, pid, inner, tid, src.stack_base, Some(&*src))?;
    // granted priority is not inherited across fork
    {
        let mut fresh = thread.inner().write()?;
        fresh.granted = None;
        let priority = fresh.priority;
        fresh.points = sched::base_points(priority);
    }
    trace!(
        "thread: cloned tid {} of pid {} into pid {}",
        tid,
        source.pid(),
        pid
    );
    Ok(thread)
}
