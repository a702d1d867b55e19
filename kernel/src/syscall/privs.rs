// SPDX-License-Identifier: MPL-2.0

use crate::error::{KernelError, Result};
use crate::prelude::*;
use crate::process::{ProcessFlags, Thread};
use crate::syscall::PrivsRequest;

/// Privilege management: a process can only give privilege away.
pub(super) fn privs(
    kernel: &Kernel,
    current: &Arc<Thread>,
    request: PrivsRequest,
) -> Result<usize> {
    let process = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;
    let mut inner = process.inner().write()?;

    match request {
        PrivsRequest::LayerUp => {
            let layer = inner.layer_up()?;
            Ok(layer as usize)
        }
        PrivsRequest::ClearRights { bits } => {
            inner.clear_rights(ProcessFlags::from_bits_truncate(bits));
            Ok(0)
        }
        PrivsRequest::IoRightsRemove => {
            // give up I/O port access entirely
            inner.io_bitmap = None;
            Ok(0)
        }
        PrivsRequest::IoRightsClear { port, count } => {
            let bitmap = inner.io_bitmap.as_mut().ok_or(KernelError::NoRights)?;
            // a set bit denies access
            for p in port as usize..(port as usize + count as usize).min(bitmap.len() * 8) {
                bitmap[p / 8] |= 1 << (p % 8);
            }
            Ok(0)
        }
        PrivsRequest::AcceptUnixSignals { mask } => {
            inner.signals.unix_accepted = mask;
            Ok(0)
        }
        PrivsRequest::AcceptKernelSignals { mask } => {
            inner.signals.kernel_accepted = mask;
            Ok(0)
        }
    }
}
