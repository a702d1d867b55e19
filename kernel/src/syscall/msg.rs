// SPDX-License-Identifier: MPL-2.0

use crate::error::Result;
use crate::ipc;
use crate::prelude::*;
use crate::process::Thread;

pub(super) fn send(kernel: &Kernel, current: &Arc<Thread>, info: Vaddr) -> Result<usize> {
    ipc::send(kernel, current, info)?;
    Ok(0)
}

pub(super) fn recv(kernel: &Kernel, current: &Arc<Thread>, info: Vaddr) -> Result<usize> {
    ipc::recv(kernel, current, info)?;
    Ok(0)
}
