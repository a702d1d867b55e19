// SPDX-License-Identifier: MPL-2.0

use crate::error::{KernelError, Result};
use crate::prelude::*;
use crate::process::{process_new, Thread};
use crate::sched;

/// Clone the calling process. The parent gets the child's pid; the child
/// resumes from the same point with a zero result.
pub(super) fn fork(kernel: &Kernel, current: &Arc<Thread>) -> Result<usize> {
    let parent = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;

    let child = process_new(kernel, Some(&parent), Some(current))?;
    let child_pid = child.pid();

    let thread = child
        .inner()
        .read()?
        .find_thread(current.tid())
        .ok_or(KernelError::Failure)?;
    {
        let mut inner = thread.inner().write()?;
        inner.regs.result = 0;
    }
    let cpu = thread.inner().read()?.cpu;
    sched::add(kernel, cpu, &thread);

    Ok(child_pid as usize)
}
