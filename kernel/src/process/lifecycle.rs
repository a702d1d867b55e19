// SPDX-License-Identifier: MPL-2.0

//! Process and thread destruction.

use crate::error::{KernelError, Result};
use crate::ipc;
use crate::prelude::*;
use crate::process::table::Role;
use crate::process::thread::{stack_area_for, Thread, ThreadState};
use crate::process::{Pid, Process};
use crate::sched;

/// Can `slayer` kill `victim`? The victim must live in a less privileged
/// layer, or be a direct child. A process may always kill itself.
fn may_kill(slayer: &Arc<Process>, victim: &Arc<Process>) -> Result<()> {
    if Arc::ptr_eq(slayer, victim) {
        return Ok(());
    }
    if victim.layer() > slayer.layer() {
        return Ok(());
    }
    let is_child = slayer
        .inner()
        .read()?
        .children
        .contains(&victim.pid());
    if is_child {
        return Ok(());
    }
    Err(KernelError::NoRights)
}

/// Destroy one thread, freeing its kernel-held resources: queue entries,
/// sleep timers, role snoozes, the user-stack area and the kernel stack.
pub fn kill_thread(kernel: &Kernel, owner: &Arc<Process>, victim: &Arc<Thread>) -> Result<()> {
    if victim.pid() != owner.pid() {
        return Err(KernelError::Failure);
    }

    // pull it off the queues; if it is this very thread, just mark it dead
    if sched::lock_thread(kernel, victim).is_err() {
        sched::remove(kernel, victim, ThreadState::Dead);
    }

    // do not tear the record down while another core still executes it
    sched::wait_until_dismissed(kernel, victim);

    let _ = sched::remove_snoozer(kernel, victim);
    kernel.registry().cancel_snoozer(victim.pid(), victim.tid());

    let kstack = {
        let mut inner = victim.inner().write()?;
        inner.state = ThreadState::Dead;
        inner.kstack_block
    };

    {
        let mut proc_inner = owner.inner().write()?;
        let (stack_base, _) = stack_area_for(victim.tid());
        let _ = proc_inner.space.unlink(kernel, owner.pid(), stack_base);
        proc_inner.threads.remove(&victim.tid());
    }

    // seal the thread's gate so stale references fail fast
    drop(victim.inner().write_destroy()?);

    kernel.heap_free(kstack as *mut u8)?;
    debug!("thread: killed {}.{}", victim.pid(), victim.tid());
    Ok(())
}

/// Request to kill a process. `slayer` is None for kernel-initiated
/// teardown (exit, fatal signals), which skips the rights check.
pub fn kill_process(kernel: &Kernel, victim_pid: Pid, slayer: Option<&Arc<Process>>) -> Result<()> {
    let victim = kernel
        .registry()
        .find(victim_pid)
        .ok_or(KernelError::Failure)?;

    if let Some(slayer) = slayer {
        may_kill(slayer, &victim)?;
    }

    // the system executive must never die
    if victim.inner().read()?.role == Role::Executive {
        panic!("system executive just died");
    }

    let parent_pid = victim.inner().read()?.parent;

    // stop the victim from running anywhere. a process cannot run-lock
    // itself; for self-destruction every thread is marked dead directly
    if sched::lock_process(kernel, &victim).is_err() {
        let threads: Vec<Arc<Thread>> = victim
            .inner()
            .read()?
            .threads
            .values()
            .cloned()
            .collect();
        for thread in threads {
            sched::remove(kernel, &thread, ThreadState::Dead);
        }
    }

    // the victim is now dead to the system
    kernel.registry().remove(victim_pid);

    // anyone parked waiting to send to it learns there is no receiver
    ipc::drain_queued_senders(kernel, &victim);

    // destroy the threads
    let threads: Vec<Arc<Thread>> = victim
        .inner()
        .read()?
        .threads
        .values()
        .cloned()
        .collect();
    for thread in threads {
        let _ = kill_thread(kernel, &victim, &thread);
    }

    // orphaned children move to the system executive
    let children = victim.inner().read()?.children.clone();
    if !children.is_empty() {
        let executive = kernel.registry().role_lookup(Role::Executive);
        for child_pid in children {
            let Some(child) = kernel.registry().find(child_pid) else {
                continue;
            };
            if let Ok(mut child_inner) = child.inner().write() {
                let old_parent = child_inner.parent;
                child_inner.prev_parent = old_parent;
                child_inner.parent = executive.as_ref().map(|e| e.pid()).unwrap_or(0);
            }
            if let Some(executive) = executive.as_ref() {
                if let Ok(mut exec_inner) = executive.inner().write() {
                    exec_inner.attach_child(child_pid);
                }
            }
        }
    }

    // tear down memory: areas first, then the page tables, whose frames
    // (and any frames the space owned) go back on the stacks
    {
        let mut inner = victim.inner().write()?;
        let _ = inner.space.destroy(kernel, victim_pid);

        if let Some(pool) = inner.signals.system_pool.take() {
            let _ = pool.destroy(kernel);
        }
        if let Some(pool) = inner.signals.user_pool.take() {
            let _ = pool.destroy(kernel);
        }
        if let Some(pool) = inner.msg_waiting.take() {
            let _ = pool.destroy(kernel);
        }

        let root = inner.page_root;
        if let Ok(frames) = kernel.port().destroy_address_space(root) {
            for frame in frames {
                let _ = kernel.phys().release(frame);
            }
        }

        // driver-owned contiguous blocks go back too
        let blocks = core::mem::take(&mut inner.phys_blocks);
        for block in blocks {
            for page in 0..block.pages as usize {
                let _ = kernel.phys().release(block.base + page * crate::config::PAGE_SIZE);
            }
        }

        inner.irqs.clear();
    }

    // give up any role slot
    let role = victim.inner().read()?.role;
    if role != Role::None {
        let _ = kernel.registry().role_remove(&victim, role);
    }

    // the record itself is done; seal the gate
    drop(victim.inner().write_destroy()?);

    // tell the bereaved parent, who may not care
    if let Some(parent) = kernel.registry().find(parent_pid) {
        let _ = ipc::send_kernel_signal(kernel, &parent, ipc::SIGCHLD, victim_pid);
    }

    debug!("proc: killed process {}", victim_pid);
    Ok(())
}

/// A process ends itself. Skips the rights check and never returns an
/// executive panic to the caller.
pub fn exit_process(kernel: &Kernel, process: &Arc<Process>) -> Result<()> {
    kill_process(kernel, process.pid(), None)
}
