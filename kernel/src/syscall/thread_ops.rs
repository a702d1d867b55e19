// SPDX-License-Identifier: MPL-2.0

use crate::cpu;
use crate::error::{KernelError, Result};
use crate::prelude::*;
use crate::process::{
    create_thread, exit_process, kill_thread, Thread,
};
use crate::sched;

/// Give the CPU up voluntarily: rotate to the back of the queue.
pub(super) fn yield_cpu(kernel: &Kernel, current: &Arc<Thread>) -> Result<usize> {
    sched::priority_calc(current, sched::PriorityRequest::Reward);
    sched::move_to_end(kernel, cpu::this_cpu(), current);
    Ok(0)
}

/// End the calling thread. The last thread out ends the process.
pub(super) fn thread_exit(kernel: &Kernel, current: &Arc<Thread>) -> Result<usize> {
    let process = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;
    let remaining = process.inner().read()?.threads.len();
    if remaining <= 1 {
        exit_process(kernel, &process)?;
        return Ok(0);
    }
    kill_thread(kernel, &process, current)?;
    Ok(0)
}

/// Start a new thread in the calling process, beginning at the same point
/// with a zero result, on its own stack.
pub(super) fn thread_fork(kernel: &Kernel, current: &Arc<Thread>) -> Result<usize> {
    let process = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;

    let (regs, cpu) = {
        let inner = current.inner().read()?;
        (inner.regs, inner.cpu)
    };

    let thread = {
        let mut inner = process.inner().write()?;
        create_thread(kernel, process.pid(), &mut inner)?
    };
    let new_tid = thread.tid();
    {
        let mut inner = thread.inner().write()?;
        let stack_top = inner.stack_base;
        inner.regs = regs;
        inner.regs.result = 0;
        inner.regs.sp = stack_top;
    }
    sched::add(kernel, cpu, &thread);

    Ok(new_tid as usize)
}

/// Destroy a thread of the calling process. A thread ends itself through
/// thread-exit instead.
pub(super) fn thread_kill(kernel: &Kernel, current: &Arc<Thread>, tid: u32) -> Result<usize> {
    if tid == current.tid() {
        return Err(KernelError::BadParams);
    }
    let process = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;
    let victim = process
        .inner()
        .read()?
        .find_thread(tid)
        .ok_or(KernelError::NotFound)?;
    kill_thread(kernel, &process, &victim)?;
    Ok(0)
}
