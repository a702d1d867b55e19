// SPDX-License-Identifier: MPL-2.0

use crate::error::{KernelError, Result};
use crate::mm;
use crate::prelude::*;
use crate::process::Thread;
use crate::sched;
use crate::syscall::InfoRequest;

const KERNEL_IDENTIFIER: &[u8] = b"diosix microkernel (portable core)";
const RELEASE_MAJOR: u8 = 0;
const RELEASE_MINOR: u8 = 1;
const KERNEL_API_REVISION: u8 = 1;

/// Answer to an info(thread) request.
#[repr(C)]
#[derive(Clone, Copy)]
struct ThreadInfo {
    tid: u32,
    cpu: u32,
    priority: u8,
    _pad: [u8; 3],
}

/// Answer to an info(process) request.
#[repr(C)]
#[derive(Clone, Copy)]
struct ProcessInfo {
    pid: u32,
    parent_pid: u32,
    flags: u32,
    layer: u8,
    _pad: [u8; 3],
    role: u32,
    ruid: u32,
    euid: u32,
    ssuid: u32,
    rgid: u32,
    egid: u32,
    ssgid: u32,
    proc_group_id: u32,
    session_id: u32,
}

/// Answer to an info(kernel) request.
#[repr(C)]
#[derive(Clone, Copy)]
struct KernelInfo {
    identifier: [u8; 64],
    release_major: u8,
    release_minor: u8,
    kernel_api_revision: u8,
    _pad: u8,
}

/// Answer to an info(statistics) request.
#[repr(C)]
#[derive(Clone, Copy)]
struct KernelStats {
    /// Rough uptime in milliseconds.
    kernel_uptime: u32,
}

pub(super) fn info(kernel: &Kernel, current: &Arc<Thread>, request: InfoRequest) -> Result<usize> {
    let process = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;
    let root = process.inner().read()?.page_root;

    match request {
        InfoRequest::Thread { buffer } => {
            let inner = current.inner().read()?;
            let block = ThreadInfo {
                tid: current.tid(),
                cpu: inner.cpu,
                priority: sched::determine_priority(&inner),
                _pad: [0; 3],
            };
            drop(inner);
            mm::write_user_struct(kernel.port(), root, buffer, &block)?;
        }
        InfoRequest::Process { buffer } => {
            let inner = process.inner().read()?;
            let block = ProcessInfo {
                pid: process.pid(),
                parent_pid: inner.parent,
                flags: inner.flags.bits(),
                layer: inner.layer,
                _pad: [0; 3],
                role: inner.role as u32,
                ruid: inner.creds.uid.real,
                euid: inner.creds.uid.effective,
                ssuid: inner.creds.uid.saved,
                rgid: inner.creds.gid.real,
                egid: inner.creds.gid.effective,
                ssgid: inner.creds.gid.saved,
                proc_group_id: inner.creds.pgid,
                session_id: inner.creds.sid,
            };
            drop(inner);
            mm::write_user_struct(kernel.port(), root, buffer, &block)?;
        }
        InfoRequest::Kernel { buffer } => {
            let mut identifier = [0u8; 64];
            identifier[..KERNEL_IDENTIFIER.len()].copy_from_slice(KERNEL_IDENTIFIER);
            let block = KernelInfo {
                identifier,
                release_major: RELEASE_MAJOR,
                release_minor: RELEASE_MINOR,
                kernel_api_revision: KERNEL_API_REVISION,
                _pad: 0,
            };
            mm::write_user_struct(kernel.port(), root, buffer, &block)?;
        }
        InfoRequest::Statistics { buffer } => {
            let ticks = kernel.sched().uptime_ticks();
            let block = KernelStats {
                kernel_uptime: (ticks * (1000 / crate::config::SCHED_FREQUENCY as u64)) as u32,
            };
            mm::write_user_struct(kernel.port(), root, buffer, &block)?;
        }
    }
    Ok(0)
}
