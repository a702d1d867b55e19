// SPDX-License-Identifier: MPL-2.0

use crate::error::{KernelError, Result};
use crate::prelude::*;
use crate::process::{kill_process, Thread};

pub(super) fn kill(kernel: &Kernel, current: &Arc<Thread>, pid: u32) -> Result<usize> {
    let slayer = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;
    kill_process(kernel, pid, Some(&slayer))?;
    Ok(0)
}
