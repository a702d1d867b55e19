// SPDX-License-Identifier: MPL-2.0

//! Signals.
//!
//! A signal is a message of type SIGNAL carrying a (number, extra) pair;
//! delivery funnels through one internal primitive shared with the message
//! path. Numbers 1-31 carry POSIX-compatible meanings, 32-63 are
//! kernel-originated, 64 and up are user-defined. Delivery is best-effort:
//! a signal nobody is willing to take right now is recorded in the target
//! process's pool and handed over at the next receive.

use crate::error::{KernelError, Result};
use crate::ipc::message::{MsgFlags, MsgInfo, SignalField};
use crate::mm;
use crate::prelude::*;
use crate::process::{Pid, Process, ProcessFlags, Thread, ThreadState, Tid};
use crate::sched;

// POSIX-compatible numbers (the subset the kernel recognises)
pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGSYS: u32 = 31;

// kernel-originated numbers
pub const SIG_KERNEL_BASE: u32 = 32;
pub const SIG_KERNEL_PROC_KILLED: u32 = 32;
pub const SIG_KERNEL_PROC_CLONED: u32 = 33;
pub const SIG_KERNEL_PROC_EXIT_REQ: u32 = 34;
pub const SIG_KERNEL_THREAD_KILLED: u32 = 35;
pub const SIG_KERNEL_THREAD_EXIT_REQ: u32 = 36;
pub const SIG_KERNEL_IRQ: u32 = 37;
/// Fault forwarded to the userspace pager; extra carries the page address.
pub const SIG_KERNEL_PAGE_REQUEST: u32 = 38;

/// First user-defined number.
pub const SIG_USER_BASE: u32 = 64;

/// A signal held in a process's pool until a handler collects it.
#[derive(Clone, Copy, Debug)]
pub struct QueuedSignal {
    pub number: u32,
    pub extra: u32,
    pub sender_pid: Pid,
    pub sender_tid: Tid,
    pub sender_uid: u32,
    pub sender_gid: u32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SignalRange {
    Unix,
    Kernel,
    User,
}

fn classify(number: u32) -> Result<SignalRange> {
    match number {
        1..=31 => Ok(SignalRange::Unix),
        32..=63 => Ok(SignalRange::Kernel),
        64.. => Ok(SignalRange::User),
        _ => Err(KernelError::BadParams),
    }
}

/// Send a kernel-originated signal to a process.
pub fn send_kernel_signal(
    kernel: &Kernel,
    target: &Arc<Process>,
    number: u32,
    extra: u32,
) -> Result<()> {
    send_signal(kernel, None, target, number, extra)
}

/// Send a signal to a process. `sender` is None when the kernel itself is
/// the source. This call never blocks: it either wakes a willing receiver
/// or queues the signal and returns.
pub fn send_signal(
    kernel: &Kernel,
    sender: Option<&Arc<Thread>>,
    target: &Arc<Process>,
    number: u32,
    extra: u32,
) -> Result<()> {
    let range = classify(number)?;

    // only the kernel may originate kernel-range signals, and POSIX
    // numbers need the unix-signal right
    if let Some(sender) = sender {
        let sender_proc = kernel
            .registry()
            .find(sender.pid())
            .ok_or(KernelError::Failure)?;
        let flags = sender_proc.inner().read()?.flags;
        match range {
            SignalRange::Unix if !flags.contains(ProcessFlags::CAN_UNIX_SIGNAL) => {
                return Err(KernelError::NoRights);
            }
            SignalRange::Kernel => return Err(KernelError::NoRights),
            _ => {}
        }
    }

    // a fault signal landing while the previous one is still in progress
    // means the handler itself is broken: kill the process instead
    if (number == SIGSEGV || number == SIGBUS) && range == SignalRange::Unix {
        let in_progress = {
            let inner = target.inner().read()?;
            inner.signals.unix_inprogress & (1 << (number - 1)) != 0
        };
        if in_progress {
            warn!(
                "signal: pid {} re-faulted with {} mid-handler, killing it",
                target.pid(),
                number
            );
            return crate::process::kill_process(kernel, target.pid(), None);
        }
    }

    let queued = QueuedSignal {
        number,
        extra,
        sender_pid: sender.map(|t| t.pid()).unwrap_or(0),
        sender_tid: sender.map(|t| t.tid()).unwrap_or(0),
        sender_uid: sender
            .and_then(|t| kernel.registry().find(t.pid()))
            .and_then(|p| p.inner().read().ok().map(|i| i.creds.uid.effective))
            .unwrap_or(0),
        sender_gid: sender
            .and_then(|t| kernel.registry().find(t.pid()))
            .and_then(|p| p.inner().read().ok().map(|i| i.creds.gid.effective))
            .unwrap_or(0),
    };

    // is the target willing, and is anyone listening right now?
    let accepted = {
        let inner = target.inner().read()?;
        match range {
            SignalRange::Unix => inner.signals.unix_accepted & (1 << (number - 1)) != 0,
            SignalRange::Kernel => {
                inner.signals.kernel_accepted & (1 << (number - SIG_KERNEL_BASE)) != 0
            }
            SignalRange::User => true,
        }
    };

    if accepted {
        if let Some(listener) = find_signal_listener(kernel, target, sender.is_none()) {
            deliver_to(kernel, target, &listener, &queued)?;
            if range == SignalRange::Unix {
                let mut inner = target.inner().write()?;
                inner.signals.unix_inprogress |= 1 << (number - 1);
            }
            return Ok(());
        }
    }

    // best-effort: record it and carry on
    let mut inner = target.inner().write()?;
    let pool = match range {
        SignalRange::User => inner.signals.user_pool.as_mut(),
        _ => inner.signals.system_pool.as_mut(),
    };
    match pool {
        Some(pool) => {
            pool.alloc(kernel, queued)?;
            trace!("signal: queued {} for pid {}", number, target.pid());
            Ok(())
        }
        None => Err(KernelError::NoHandler),
    }
}

/// Walk the target's threads for one blocked in receive with the SIGNAL
/// type bit in its accept mask. `from_kernel` marks kernel-originated
/// deliveries, which are the only ones a KERNEL_ONLY receiver takes.
fn find_signal_listener(
    kernel: &Kernel,
    target: &Arc<Process>,
    from_kernel: bool,
) -> Option<Arc<Thread>> {
    let (root, threads): (PageTableRoot, Vec<Arc<Thread>>) = {
        let inner = target.inner().read().ok()?;
        (inner.page_root, inner.threads.values().cloned().collect())
    };
    for thread in threads {
        let Ok(inner) = thread.inner().read() else {
            continue;
        };
        let receiving = inner.state == ThreadState::WaitingForMsg;
        let block = inner.msg_block;
        drop(inner);
        if !receiving {
            continue;
        }
        let Some(block) = block else { continue };
        let Ok(tmsg) = mm::read_user_struct::<MsgInfo>(kernel.port(), root, block) else {
            continue;
        };
        let flags = tmsg.flag_bits();
        if !flags.contains(MsgFlags::SIGNAL) {
            continue;
        }
        if flags.contains(MsgFlags::KERNEL_ONLY) && !from_kernel {
            continue;
        }
        return Some(thread);
    }
    None
}

/// Write the signal into the listener's control block and wake it.
fn deliver_to(
    kernel: &Kernel,
    target: &Arc<Process>,
    listener: &Arc<Thread>,
    queued: &QueuedSignal,
) -> Result<()> {
    let root = target.inner().read()?.page_root;
    let block = listener
        .inner()
        .read()?
        .msg_block
        .ok_or(KernelError::Failure)?;
    let mut rmsg: MsgInfo = mm::read_user_struct(kernel.port(), root, block)?;
    rmsg.signal = SignalField {
        number: queued.number,
        extra: queued.extra,
    };
    rmsg.pid = queued.sender_pid;
    rmsg.tid = queued.sender_tid;
    rmsg.uid = queued.sender_uid;
    rmsg.gid = queued.sender_gid;
    rmsg.recv_size = 0;
    mm::write_user_struct(kernel.port(), root, block, &rmsg)?;

    let cpu = listener.inner().read()?.cpu;
    sched::add(kernel, cpu, listener);
    trace!(
        "signal: delivered {} to thread {}.{}",
        queued.number,
        listener.pid(),
        listener.tid()
    );
    Ok(())
}

/// Pop the oldest queued signal the process accepts, clearing the
/// in-progress bits (the handler thread is back in receive, so any prior
/// handler run has finished).
pub(super) fn take_queued(_kernel: &Kernel, process: &Arc<Process>) -> Option<QueuedSignal> {
    let mut inner = process.inner().write().ok()?;
    inner.signals.unix_inprogress = 0;

    let unix_accepted = inner.signals.unix_accepted;
    let kernel_accepted = inner.signals.kernel_accepted;

    // oldest first: head insertion means the tail is oldest
    let picked = inner.signals.system_pool.as_ref().and_then(|pool| {
        pool.handles()
            .into_iter()
            .rev()
            .filter_map(|handle| pool.get(handle).copied().map(|entry| (handle, entry)))
            .find(|(_, entry)| match entry.number {
                1..=31 => unix_accepted & (1 << (entry.number - 1)) != 0,
                32..=63 => kernel_accepted & (1 << (entry.number - SIG_KERNEL_BASE)) != 0,
                _ => false,
            })
    });
    if let Some((handle, entry)) = picked {
        if let Some(pool) = inner.signals.system_pool.as_mut() {
            let _ = pool.free(handle);
        }
        if (1..=31).contains(&entry.number) {
            inner.signals.unix_inprogress |= 1 << (entry.number - 1);
        }
        return Some(entry);
    }

    let picked = inner.signals.user_pool.as_ref().and_then(|pool| {
        pool.handles()
            .into_iter()
            .next_back()
            .and_then(|handle| pool.get(handle).copied().map(|entry| (handle, entry)))
    });
    if let Some((handle, entry)) = picked {
        if let Some(pool) = inner.signals.user_pool.as_mut() {
            let _ = pool.free(handle);
        }
        return Some(entry);
    }
    None
}

/// Send a signal to every process in a process group. A zero `pgid` means
/// the sender's own group.
pub fn send_group_signal(
    kernel: &Kernel,
    pgid: u32,
    sender: Option<&Arc<Thread>>,
    number: u32,
    extra: u32,
) -> Result<()> {
    let pgid = if pgid == 0 {
        let sender = sender.ok_or(KernelError::BadParams)?;
        let process = kernel
            .registry()
            .find(sender.pid())
            .ok_or(KernelError::Failure)?;
        let own = process.inner().read()?.creds.pgid;
        own
    } else {
        pgid
    };

    for process in kernel.registry().processes() {
        let matches = process
            .inner()
            .read()
            .map(|i| i.creds.pgid == pgid)
            .unwrap_or(false);
        if matches {
            send_signal(kernel, sender, &process, number, extra)?;
        }
    }
    Ok(())
}
