// SPDX-License-Identifier: MPL-2.0

use crate::error::{KernelError, Result};
use crate::prelude::*;
use crate::process::Thread;

/// Longest line a single debug-write moves.
const DEBUG_WRITE_MAX: usize = 512;

/// Copy a user string out and emit it on the kernel debug channel.
pub(super) fn debug_write(
    kernel: &Kernel,
    current: &Arc<Thread>,
    buffer: Vaddr,
    length: usize,
) -> Result<usize> {
    if length == 0 {
        return Ok(0);
    }
    let length = length.min(DEBUG_WRITE_MAX);
    crate::mm::check_user_range(buffer, length)?;

    let process = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;
    let root = process.inner().read()?.page_root;

    let mut bytes = vec![0u8; length];
    kernel.port().read_user(root, buffer, &mut bytes)?;
    let text = core::str::from_utf8(&bytes).map_err(|_| KernelError::BadParams)?;
    info!("[pid {}] {}", current.pid(), text.trim_end_matches('\n'));
    Ok(length)
}
