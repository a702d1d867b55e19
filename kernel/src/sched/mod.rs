// SPDX-License-Identifier: MPL-2.0

//! The scheduler.
//!
//! Cooperative within a core, parallel across cores. Each CPU owns an
//! array of priority run queues; threads earn and lose priority points as
//! they block voluntarily or burn whole timeslices, drifting between
//! levels inside the bounds their process allows. Load balancing steers
//! fresh work away from CPUs holding more than their fair share.

mod queues;

pub use self::queues::RunQueues;

use crate::config::{SCHED_CARETAKER, SCHED_TIMESLICE};
use crate::cpu::{self, CpuId};
use crate::error::{KernelError, Result};
use crate::ipc;
use crate::mm::Pool;
use crate::prelude::*;
use crate::process::{Pid, Process, ProcessFlags, Thread, ThreadFlags, ThreadInner, ThreadState, Tid};
use crate::sync::SpinLock;

/// Priority levels per CPU. Level 0 is reserved for interrupt-handling
/// driver threads, level 1 for misbehaving ones; ordinary threads live in
/// 2..=31 with lower numbers scheduled first.
pub const PRIORITY_LEVELS: usize = 32;
pub const PRIORITY_INTERRUPTS: u8 = 0;
pub const PRIORITY_INTERRUPTS_PUNISHED: u8 = 1;
pub const PRIORITY_MIN: u8 = 2;
pub const PRIORITY_MAX: u8 = (PRIORITY_LEVELS - 1) as u8;

/// A thread's starting fairness score at a level.
pub fn base_points(priority: u8) -> u64 {
    1u64 << priority
}

/// The score that promotes a thread a level.
pub fn max_points(priority: u8) -> u64 {
    2 * base_points(priority)
}

/// What happens when a sleep timer expires.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SnoozeAction {
    /// Re-queue the thread.
    Wake,
    /// Send SIGALRM to the thread's process.
    Alarm,
}

/// An entry in the sleep-timer pool.
#[derive(Clone, Copy, Debug)]
pub struct SleepTimer {
    pub pid: Pid,
    pub tid: Tid,
    pub ticks: u32,
    pub action: SnoozeAction,
}

/// Scheduler-wide shared state: accounting counters, the balancing
/// cursor, and the pool of sleeping threads waiting on the clock.
pub struct SchedGlobal {
    total_queued: SpinLock<u32>,
    next_queue: SpinLock<CpuId>,
    caretaker: SpinLock<u32>,
    ticks: SpinLock<u64>,
    bedroom: SpinLock<Option<Pool<SleepTimer>>>,
}

impl SchedGlobal {
    pub fn new() -> Self {
        Self {
            total_queued: SpinLock::new(0),
            next_queue: SpinLock::new(0),
            caretaker: SpinLock::new(SCHED_CARETAKER),
            ticks: SpinLock::new(0),
            bedroom: SpinLock::new(None),
        }
    }

    /// Scheduler ticks since boot (10ms each).
    pub fn uptime_ticks(&self) -> u64 {
        *self.ticks.lock()
    }

    fn inc_queued(&self) {
        *self.total_queued.lock() += 1;
    }

    fn dec_queued(&self) {
        let mut count = self.total_queued.lock();
        let depth = count.saturating_sub(1);
        *count = depth;
    }

    pub fn total_queued(&self) -> u32 {
        *self.total_queued.lock()
    }
}

/// Prepare the scheduler: build the pool of sleeping threads awaiting a
/// clock wake-up.
pub fn initialise(kernel: &Kernel) -> Result<()> {
    let pool = Pool::new(kernel, 4)?;
    *kernel.sched().bedroom.lock() = Some(pool);
    Ok(())
}

/// The priority level a thread schedules at right now: the granted level
/// when one was inherited and improves on the base, the base otherwise.
/// Driver threads sit in the interrupt band regardless.
pub fn determine_priority(inner: &ThreadInner) -> u8 {
    if inner.flags.contains(ThreadFlags::IS_DRIVER) {
        return inner.priority;
    }
    let mut priority = match inner.granted {
        Some(grant) if inner.priority > grant.level => grant.level,
        _ => inner.priority,
    };
    if priority > PRIORITY_MAX {
        priority = PRIORITY_MAX;
    }
    priority
}

/// Priority-point bookkeeping requests.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PriorityRequest {
    /// Load the base score for the current level.
    Reset,
    /// The thread blocked voluntarily: add a point, promote at the cap.
    Reward,
    /// The thread was preempted: take a point, demote at zero.
    Punish,
    /// The thread burned its whole timeslice.
    ExpiryPunish,
    /// Clamp everything back into range.
    Check,
}

/// Re-calculate a thread's priority points, moving it between levels when
/// a score limit is hit. Levels are bounded by the process's range;
/// interrupt-handling driver threads are immune except for timeslice
/// punishment, which drops them into the misbehaving band.
pub fn priority_calc(thread: &Arc<Thread>, request: PriorityRequest) {
    let mut inner = match thread.inner().write() {
        Ok(inner) => inner,
        Err(_) => return,
    };

    if inner.flags.contains(ThreadFlags::IS_DRIVER) {
        inner.priority = if request == PriorityRequest::ExpiryPunish {
            PRIORITY_INTERRUPTS_PUNISHED
        } else {
            PRIORITY_INTERRUPTS
        };
        return;
    }

    let priority = determine_priority(&inner);
    let low_limit = inner.priority_low.max(PRIORITY_MIN);
    let high_limit = inner.priority_high.min(PRIORITY_MAX);

    match request {
        PriorityRequest::Reset => {
            inner.points = base_points(priority);
        }
        PriorityRequest::Reward => {
            if inner.points < max_points(priority) {
                inner.points += 1;
            }
            if inner.points == max_points(priority) && inner.priority > low_limit {
                inner.priority -= 1;
                inner.points = base_points(priority);
            }
        }
        PriorityRequest::Punish | PriorityRequest::ExpiryPunish => {
            if inner.points > 0 {
                inner.points -= 1;
            }
            if inner.points == 0 && inner.priority < high_limit {
                inner.priority += 1;
                inner.points = base_points(priority);
            }
        }
        PriorityRequest::Check => {
            if inner.points > max_points(priority) {
                inner.points = max_points(priority);
            }
            if inner.priority > high_limit {
                inner.priority = high_limit;
            }
            if inner.priority < low_limit {
                inner.priority = low_limit;
            }
            if let Some(grant) = inner.granted.as_mut() {
                if grant.level > PRIORITY_MAX {
                    grant.level = PRIORITY_MAX;
                }
            }
        }
    }
}

/// Balance load across the per-CPU queues: stick with the hinted CPU
/// unless it holds more than its fair share (or the clock-arm queue is
/// empty), in which case take the next queue and advance the arm.
pub fn pick_queue(kernel: &Kernel, hint: CpuId) -> CpuId {
    let cpus = kernel.cpus();
    if cpus.count() == 1 {
        return cpus.boot_cpu();
    }
    let hint = if hint >= cpus.count() {
        cpus.boot_cpu()
    } else {
        hint
    };

    let max_fair_share = (kernel.sched().total_queued() / cpus.count()).max(1);

    let mut next_queue = kernel.sched().next_queue.lock();
    if *next_queue >= cpus.count() {
        *next_queue = 0;
    }
    if *next_queue == hint {
        *next_queue += 1;
        if *next_queue >= cpus.count() {
            *next_queue = 0;
        }
    }

    let hint_depth = match cpus.cpu(hint).queues.read() {
        Ok(q) => q.queued_count(),
        Err(_) => 0,
    };
    let next_depth = match cpus.cpu(*next_queue).queues.read() {
        Ok(q) => q.queued_count(),
        Err(_) => 0,
    };

    let picked = if (next_depth == 0 || hint_depth > max_fair_share) && hint_depth != 0 {
        let choice = *next_queue;
        *next_queue += 1;
        choice
    } else {
        hint
    };
    trace!("sched: load balance hint {} -> cpu {}", hint, picked);
    picked
}

/// Add a thread to a run queue, head side, at its current priority.
pub fn add(kernel: &Kernel, cpu_hint: CpuId, thread: &Arc<Thread>) {
    let cpu = pick_queue(kernel, cpu_hint);

    let mut inner = match thread.inner().write() {
        Ok(inner) => inner,
        Err(_) => return,
    };
    if inner.queued_at.is_some() {
        trace!(
            "sched: thread {}.{} already queued, add skipped",
            thread.pid(),
            thread.tid()
        );
        return;
    }
    let priority = determine_priority(&inner);

    let mut queues = match kernel.cpus().cpu(cpu).queues.write() {
        Ok(queues) => queues,
        Err(_) => return,
    };
    queues.push_head(priority, thread.clone());
    queues.queued += 1;
    drop(queues);
    kernel.sched().inc_queued();

    inner.state = ThreadState::InRunQueue;
    inner.timeslice = SCHED_TIMESLICE;
    inner.cpu = cpu;
    inner.queued_at = Some((cpu, priority));
    trace!(
        "sched: added thread {}.{} to cpu {} queue, priority {}",
        thread.pid(),
        thread.tid(),
        cpu,
        priority
    );
}

/// Put a thread at the end of a run queue (round-robin rotation).
pub fn move_to_end(kernel: &Kernel, cpu: CpuId, thread: &Arc<Thread>) {
    let mut inner = match thread.inner().write() {
        Ok(inner) => inner,
        Err(_) => return,
    };

    // pull it out of whichever queue holds it
    if let Some((old_cpu, old_priority)) = inner.queued_at.take() {
        if let Ok(mut queues) = kernel.cpus().cpu(old_cpu).queues.write() {
            queues.unlink(old_priority, thread);
            let depth = queues.queued.saturating_sub(1);
            queues.queued = depth;
            if queues.lowest_filled >= old_priority as usize {
                queues.rescan();
            }
        }
        kernel.sched().dec_queued();
    }

    let priority = determine_priority(&inner);
    let mut queues = match kernel.cpus().cpu(cpu).queues.write() {
        Ok(queues) => queues,
        Err(_) => return,
    };
    queues.push_tail(priority, thread.clone());
    queues.queued += 1;
    drop(queues);
    kernel.sched().inc_queued();

    inner.state = ThreadState::InRunQueue;
    inner.timeslice = SCHED_TIMESLICE;
    inner.cpu = cpu;
    inner.queued_at = Some((cpu, priority));
    trace!(
        "sched: moved thread {}.{} to end of cpu {} queue, priority {}",
        thread.pid(),
        thread.tid(),
        cpu,
        priority
    );
}

/// Remove a thread from its run queue, recording why it left. A victim
/// running on another core is poked with a reschedule IPI so it yields.
pub fn remove(kernel: &Kernel, thread: &Arc<Thread>, new_state: ThreadState) {
    let mut inner = match thread.inner().write() {
        Ok(inner) => inner,
        Err(_) => return,
    };

    let was_running = inner.state == ThreadState::Running;
    match inner.queued_at.take() {
        Some((cpu, priority)) => {
            if let Ok(mut queues) = kernel.cpus().cpu(cpu).queues.write() {
                queues.unlink(priority, thread);
                let depth = queues.queued.saturating_sub(1);
                queues.queued = depth;
                if queues.lowest_filled >= priority as usize {
                    queues.rescan();
                }
            }
            kernel.sched().dec_queued();
            if was_running && cpu != cpu::this_cpu() {
                kernel.port().ipi_reschedule(cpu);
            }
        }
        None => {
            trace!(
                "sched: thread {}.{} removed while not queued",
                thread.pid(),
                thread.tid()
            );
        }
    }
    inner.state = new_state;
}

/// Return the thread that should run next on this core without switching.
fn next_to_run(kernel: &Kernel, cpu: CpuId) -> Option<Arc<Thread>> {
    kernel.cpus().cpu(cpu).queues.read().ok()?.best()
}

/// Check the run queues for a better thread and switch to it. Returns the
/// thread switched to, or None when the current thread keeps the core.
pub fn pick(kernel: &Kernel) -> Option<Arc<Thread>> {
    let cpu_id = cpu::this_cpu();
    let cpu = kernel.cpus().cpu(cpu_id);
    let now = cpu.current();

    let mut next = next_to_run(kernel, cpu_id);
    if next.is_none() {
        if let Some(ref now) = now {
            if now.state() == ThreadState::Running {
                return None;
            }
        }
        if let Ok(mut queues) = cpu.queues.write() {
            queues.rescan();
        }
        next = next_to_run(kernel, cpu_id);
    }
    let next = next?;

    if let Some(ref now) = now {
        if Arc::ptr_eq(now, &next) {
            if let Ok(mut inner) = next.inner().write() {
                inner.state = ThreadState::Running;
            }
            return None;
        }
        // keep the current thread while it outranks the candidate; a
        // sealed (dying) current thread never outranks anyone
        let now_priority = now
            .inner()
            .read()
            .map(|i| determine_priority(&i))
            .unwrap_or(u8::MAX);
        let next_priority = next.inner().read().map(|i| determine_priority(&i)).ok()?;
        if next_priority > now_priority && now.state() == ThreadState::Running {
            return None;
        }
        if let Ok(mut inner) = now.inner().write() {
            if inner.state == ThreadState::Running {
                inner.state = ThreadState::InRunQueue;
            }
        }
    }

    if let Ok(mut inner) = next.inner().write() {
        inner.cpu = cpu_id;
        inner.state = ThreadState::Running;
    }

    // the only place the current-thread pointer changes; the gate code
    // relies on it staying put between a lock/unlock pair
    cpu.set_current(Some(next.clone()));
    kernel.port().context_switch(now.as_ref(), &next);
    trace!(
        "sched: cpu {} switched to thread {}.{}",
        cpu_id,
        next.pid(),
        next.tid()
    );
    Some(next)
}

/// The 100Hz tick. Walks the sleep-timer pool on the boot CPU, burns the
/// current thread's timeslice and rotates it out when exhausted.
pub fn tick(kernel: &Kernel) {
    let cpu_id = cpu::this_cpu();

    if cpu_id == kernel.cpus().boot_cpu() {
        *kernel.sched().ticks.lock() += 1;
        {
            let mut countdown = kernel.sched().caretaker.lock();
            if *countdown == 0 {
                *countdown = SCHED_CARETAKER;
                drop(countdown);
                caretaker(kernel);
            } else {
                *countdown -= 1;
            }
        }
        run_sleep_timers(kernel);
    }

    let cpu = kernel.cpus().cpu(cpu_id);
    let Some(current) = cpu.current() else {
        return;
    };

    let expired = {
        let mut inner = match current.inner().write() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        if inner.timeslice > 0 {
            inner.timeslice -= 1;
        }
        inner.timeslice == 0
    };

    if expired {
        trace!(
            "sched: timeslice for thread {}.{} expired",
            current.pid(),
            current.tid()
        );
        priority_calc(&current, PriorityRequest::ExpiryPunish);
        move_to_end(kernel, cpu_id, &current);
        pick(kernel);
    }
}

/// Periodic maintenance: refresh every CPU's best-queue hint and sanity
/// check the per-thread scores.
fn caretaker(kernel: &Kernel) {
    trace!("sched: caretaker tick");
    for cpu in kernel.cpus().iter() {
        if let Ok(mut queues) = cpu.queues.write() {
            queues.rescan();
        }
    }
}

/// Decrement the sleeping threads' countdowns and perform the expired
/// entries' actions.
fn run_sleep_timers(kernel: &Kernel) {
    let mut expired = Vec::new();
    {
        let mut bedroom = kernel.sched().bedroom.lock();
        let Some(pool) = bedroom.as_mut() else {
            return;
        };
        for handle in pool.handles() {
            let Some(entry) = pool.get_mut(handle) else {
                continue;
            };
            entry.ticks -= 1;
            if entry.ticks == 0 {
                expired.push(*entry);
                let _ = pool.free(handle);
            }
        }
    }

    for entry in expired {
        match entry.action {
            SnoozeAction::Wake => {
                if let Some(thread) = kernel.find_thread(entry.pid, entry.tid) {
                    let cpu = thread.inner().read().map(|i| i.cpu).unwrap_or(0);
                    add(kernel, cpu, &thread);
                    trace!("sched: woke snoozing thread {}.{}", entry.pid, entry.tid);
                }
            }
            SnoozeAction::Alarm => {
                if let Some(process) = kernel.registry().find(entry.pid) {
                    let _ = ipc::send_kernel_signal(kernel, &process, ipc::SIGALRM, 0);
                    trace!("sched: sent SIGALRM to pid {}", entry.pid);
                }
            }
        }
    }
}

/// Park a thread on the scheduler clock. A zero timeout cancels every
/// outstanding entry for the thread instead.
pub fn add_snoozer(
    kernel: &Kernel,
    thread: &Arc<Thread>,
    timeout: u32,
    action: SnoozeAction,
) -> Result<()> {
    if timeout == 0 {
        return remove_snoozer(kernel, thread);
    }

    {
        let mut bedroom = kernel.sched().bedroom.lock();
        let pool = bedroom.as_mut().ok_or(KernelError::Failure)?;
        pool.alloc(
            kernel,
            SleepTimer {
                pid: thread.pid(),
                tid: thread.tid(),
                ticks: timeout,
                action,
            },
        )?;
    }
    trace!(
        "sched: thread {}.{} snoozing for {} ticks ({:?})",
        thread.pid(),
        thread.tid(),
        timeout,
        action
    );

    if action == SnoozeAction::Wake {
        remove(kernel, thread, ThreadState::Sleeping);
    }
    Ok(())
}

/// Drop every sleep-timer entry for a thread.
pub fn remove_snoozer(kernel: &Kernel, thread: &Arc<Thread>) -> Result<()> {
    let mut bedroom = kernel.sched().bedroom.lock();
    let pool = bedroom.as_mut().ok_or(KernelError::Failure)?;
    let mut found = Err(KernelError::NotFound);
    for handle in pool.handles() {
        if let Some(entry) = pool.get(handle) {
            if entry.pid == thread.pid() && entry.tid == thread.tid() {
                let _ = pool.free(handle);
                found = Ok(());
            }
        }
    }
    found
}

/// Outstanding sleep-timer entries for a thread. Test support.
pub fn snoozer_count(kernel: &Kernel, pid: Pid, tid: Tid) -> usize {
    let bedroom = kernel.sched().bedroom.lock();
    match bedroom.as_ref() {
        Some(pool) => pool
            .handles()
            .into_iter()
            .filter_map(|h| pool.get(h))
            .filter(|e| e.pid == pid && e.tid == tid)
            .count(),
        None => 0,
    }
}

/// Stop a thread from running until it is unlocked. It is inappropriate
/// for a thread to lock itself.
pub fn lock_thread(kernel: &Kernel, victim: &Arc<Thread>) -> Result<()> {
    let cpu = kernel.cpus().cpu(cpu::this_cpu());
    if let Some(current) = cpu.current() {
        if Arc::ptr_eq(&current, victim) {
            return Err(KernelError::Failure);
        }
    }
    match victim.state() {
        ThreadState::Running | ThreadState::InRunQueue => {
            remove(kernel, victim, ThreadState::Held);
        }
        _ => {}
    }
    Ok(())
}

/// Release a held thread back into its run queue.
pub fn unlock_thread(kernel: &Kernel, thread: &Arc<Thread>) -> Result<()> {
    let runlocked = kernel
        .registry()
        .find(thread.pid())
        .and_then(|p| p.inner().read().ok().map(|i| i.flags.contains(ProcessFlags::RUNLOCKED)))
        .unwrap_or(true);
    if thread.state() != ThreadState::Held || runlocked {
        return Err(KernelError::Failure);
    }
    let cpu = thread.inner().read().map(|i| i.cpu).unwrap_or(0);
    add(kernel, cpu, thread);
    Ok(())
}

/// Cooperative stop-the-world for one process: flag it run-locked, pull
/// every thread from the queues and wait until no core still executes
/// one of them.
pub fn lock_process(kernel: &Kernel, process: &Arc<Process>) -> Result<()> {
    let cpu = kernel.cpus().cpu(cpu::this_cpu());
    if let Some(current) = cpu.current() {
        if current.pid() == process.pid() {
            return Err(KernelError::Failure);
        }
    }
    debug!("sched: locking process {}", process.pid());

    let threads: Vec<Arc<Thread>> = {
        let mut inner = process.inner().write()?;
        inner.flags |= ProcessFlags::RUNLOCKED;
        inner.threads.values().cloned().collect()
    };
    for thread in &threads {
        let _ = lock_thread(kernel, thread);
    }

    // wait for any core still executing one of the victim's threads to
    // observe the removal and move on
    for thread in &threads {
        wait_until_dismissed(kernel, thread);
    }
    Ok(())
}

/// Release a run-locked process and queue its held threads.
pub fn unlock_process(kernel: &Kernel, process: &Arc<Process>) -> Result<()> {
    let threads: Vec<Arc<Thread>> = {
        let mut inner = process.inner().write()?;
        inner.flags -= ProcessFlags::RUNLOCKED;
        inner.threads.values().cloned().collect()
    };
    for thread in threads {
        if thread.state() == ThreadState::Held {
            let cpu = thread.inner().read().map(|i| i.cpu).unwrap_or(0);
            add(kernel, cpu, &thread);
        }
    }
    Ok(())
}

/// Spin until the CPU that last ran `thread` confirms, through its
/// current-thread pointer, that it has moved on.
pub fn wait_until_dismissed(kernel: &Kernel, thread: &Arc<Thread>) {
    let cpu = thread.inner().read().map(|i| i.cpu).unwrap_or(0);
    if cpu == cpu::this_cpu() {
        // this core is the one tearing the thread down; it is off the CPU
        // as soon as the teardown path picks a successor
        return;
    }
    loop {
        match kernel.cpus().cpu(cpu).current() {
            Some(current) if Arc::ptr_eq(&current, thread) => core::hint::spin_loop(),
            _ => break,
        }
    }
}
