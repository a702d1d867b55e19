// SPDX-License-Identifier: MPL-2.0

use crate::error::{KernelError, Result};
use crate::prelude::*;
use crate::process::{exit_process, Thread};

pub(super) fn exit(kernel: &Kernel, current: &Arc<Thread>) -> Result<usize> {
    let process = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;
    exit_process(kernel, &process)?;
    Ok(0)
}
