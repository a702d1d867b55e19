// SPDX-License-Identifier: MPL-2.0

use crate::config::MSG_MAX_SIZE;
use crate::error::{KernelError, Result};
use crate::ipc::signal;
use crate::mm::{self, FaultAccess};
use crate::prelude::*;
use crate::process::{
    GrantedPriority, Pid, Process, ProcessFlags, Thread, ThreadState, Tid,
};
use crate::sched;

bitflags! {
    /// The message control word: four type bits low, control flags high.
    pub struct MsgFlags: u32 {
        // simple type bits
        const GENERIC       = 1;
        const SIGNAL        = 2;
        // control flags
        const IN_A_PROC_GRP = 1 << 23;
        const IN_MY_PROC_GRP = 1 << 24;
        const QUEUE_ME      = 1 << 25;
        const SHARE_VMA     = 1 << 26;
        const KERNEL_ONLY   = 1 << 27;
        const SEND_AS_USER  = 1 << 28;
        const RECV_ON_REPLY = 1 << 29;
        const MULTIPART     = 1 << 30;
        const REPLY         = 1 << 31;
    }
}

impl MsgFlags {
    pub const TYPE_MASK: MsgFlags =
        MsgFlags::from_bits_truncate(MsgFlags::GENERIC.bits() | MsgFlags::SIGNAL.bits());
}

/// Zero names "any thread"/"any process" in the target fields.
pub const MSG_ANY: u32 = 0;

/// A signal number and an extra word of information.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct SignalField {
    pub number: u32,
    pub extra: u32,
}

/// A memory share request carried in a reply.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct ShareRequest {
    pub base: usize,
    pub size: usize,
}

/// One segment of a multipart send.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MsgMultipart {
    pub size: usize,
    pub data: usize,
}

/// The message control block a thread hands to send/recv. Lives in user
/// memory; the kernel reads and updates it through the port.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgInfo {
    /// Name the receiver by role, or zero to use pid+tid.
    pub role: u32,
    pub pid: u32,
    pub tid: u32,
    /// Effective ids of the sender, filled in by the kernel.
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    /// Bytes to send, or the number of multipart entries.
    pub send_size: usize,
    pub send: usize,
    pub signal: SignalField,
    pub mem_req: ShareRequest,
    /// Maximum bytes the receive buffer accepts; zero when replying.
    pub recv_max_size: usize,
    /// Actual bytes received, filled in by the kernel.
    pub recv_size: usize,
    pub recv: usize,
}

impl MsgInfo {
    pub fn flag_bits(&self) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.flags)
    }
}

/// A sender parked on a process waiting for a receiver to appear.
#[derive(Clone, Copy, Debug)]
pub struct QueuedSender {
    pub pid: Pid,
    pub tid: Tid,
}

/// How a send call left the calling thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendOutcome {
    /// Payload moved; non-reply senders are now waiting for the reply.
    Delivered,
    /// No receiver yet; the sender is parked on the target's queue.
    Queued,
}

/// How a recv call left the calling thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecvOutcome {
    /// A queued signal was handed over immediately.
    Delivered,
    /// The thread is off the run queue until a message arrives.
    Blocked,
}

fn thread_root(kernel: &Kernel, thread: &Arc<Thread>) -> Result<PageTableRoot> {
    let process = kernel
        .registry()
        .find(thread.pid())
        .ok_or(KernelError::Failure)?;
    let root = process.inner().read()?.page_root;
    Ok(root)
}

/// Check whether `target` can take `msg` from `sender` right now: the
/// receiver must sit in a lower privilege layer unless this is a reply,
/// its declared control block must be valid user memory, and it must be
/// blocked either waiting for this sender's reply or willing to accept
/// the message type.
pub fn test_receiver(
    kernel: &Kernel,
    sender: &Arc<Thread>,
    target: &Arc<Thread>,
    msg: &MsgInfo,
) -> Result<()> {
    let flags = msg.flag_bits();

    let sender_proc = kernel
        .registry()
        .find(sender.pid())
        .ok_or(KernelError::Failure)?;
    let target_proc = kernel
        .registry()
        .find(target.pid())
        .ok_or(KernelError::Failure)?;

    // messages flow down through the layers; only replies go back up
    if target_proc.layer() > sender_proc.layer() && !flags.contains(MsgFlags::REPLY) {
        trace!(
            "ipc: receiver layer {} not below sender layer {} and not a reply",
            target_proc.layer(),
            sender_proc.layer()
        );
        return Err(KernelError::NoReceiver);
    }

    let (state, reply_source, block_addr) = {
        let inner = target.inner().read()?;
        (inner.state, inner.reply_source, inner.msg_block)
    };
    let Some(block_addr) = block_addr else {
        return Err(KernelError::NoReceiver);
    };

    // the target's control block must be sane before we scribble on it
    mm::resolve_user_range(
        kernel,
        &target_proc,
        block_addr,
        core::mem::size_of::<MsgInfo>(),
        FaultAccess::WRITE,
    )
    .map_err(|_| KernelError::Failure)?;

    // a reply must match the thread the receiver is waiting on
    if state == ThreadState::WaitingForReply
        && flags.contains(MsgFlags::REPLY)
        && reply_source == Some((sender.pid(), sender.tid()))
    {
        return Ok(());
    }

    // otherwise the target must be receiving and accept the type bits
    if state == ThreadState::WaitingForMsg {
        let root = target_proc.inner().read()?.page_root;
        let tmsg: MsgInfo = mm::read_user_struct(kernel.port(), root, block_addr)?;
        if (flags & MsgFlags::TYPE_MASK).bits() & tmsg.flags != 0 {
            return Ok(());
        }
    }

    Err(KernelError::NoReceiver)
}

/// Identify a potential receiver for a message: the named thread, or any
/// thread of the target process that passes the receiver test.
pub fn find_receiver(
    kernel: &Kernel,
    sender: &Arc<Thread>,
    msg: &MsgInfo,
) -> Result<Arc<Thread>> {
    let target_proc = if msg.role != 0 {
        let role =
            crate::process::Role::from_u32(msg.role).ok_or(KernelError::BadParams)?;
        kernel
            .registry()
            .role_lookup(role)
            .ok_or(KernelError::NoReceiver)?
    } else {
        kernel
            .registry()
            .find(msg.pid)
            .ok_or(KernelError::NoReceiver)?
    };

    if msg.tid != MSG_ANY {
        let thread = target_proc
            .inner()
            .read()?
            .find_thread(msg.tid)
            .ok_or(KernelError::NoReceiver)?;
        test_receiver(kernel, sender, &thread, msg)?;
        return Ok(thread);
    }

    let candidates: Vec<Arc<Thread>> = {
        let inner = target_proc.inner().read()?;
        inner.threads.values().cloned().collect()
    };
    for thread in candidates {
        if test_receiver(kernel, sender, &thread, msg).is_ok() {
            return Ok(thread);
        }
    }
    Err(KernelError::NoReceiver)
}

/// Gather the whole outgoing payload into kernel memory, bounded by the
/// receiver's declared maximum and the system ceiling. Nothing is written
/// to the receiver until the entire payload has been collected, so an
/// overrun rolls back to an untouched buffer.
fn gather_payload(
    kernel: &Kernel,
    sender_root: PageTableRoot,
    msg: &MsgInfo,
    recv_max: usize,
) -> Result<Vec<u8>> {
    let limit = recv_max.min(MSG_MAX_SIZE);
    let mut payload = Vec::new();

    if msg.flag_bits().contains(MsgFlags::MULTIPART) {
        // send_size is the number of multipart records
        let parts = msg.send_size;
        let table_bytes = parts
            .checked_mul(core::mem::size_of::<MsgMultipart>())
            .ok_or(KernelError::BadAddress)?;
        mm::check_user_range(msg.send, table_bytes)?;
        for index in 0..parts {
            let entry: MsgMultipart = mm::read_user_struct(
                kernel.port(),
                sender_root,
                msg.send + index * core::mem::size_of::<MsgMultipart>(),
            )?;
            if payload.len() + entry.size > limit {
                return Err(KernelError::TooBig);
            }
            let start = payload.len();
            payload.resize(start + entry.size, 0);
            kernel
                .port()
                .read_user(sender_root, entry.data, &mut payload[start..])
                .map_err(|_| KernelError::BadSourceAddress)?;
        }
    } else {
        if msg.send_size > limit {
            return Err(KernelError::TooBig);
        }
        payload.resize(msg.send_size, 0);
        kernel
            .port()
            .read_user(sender_root, msg.send, &mut payload)
            .map_err(|_| KernelError::BadSourceAddress)?;
    }
    Ok(payload)
}

/// Send a message. The kernel does not interpret the payload. Non-reply
/// sends block the caller until the receiver replies; reply sends return
/// immediately. With `QUEUE_ME` a send that finds no receiver parks the
/// caller on the target process instead of failing.
pub fn send(kernel: &Kernel, sender: &Arc<Thread>, msg_addr: Vaddr) -> Result<SendOutcome> {
    mm::check_user_range(msg_addr, core::mem::size_of::<MsgInfo>())?;
    let sender_root = thread_root(kernel, sender)?;
    let mut msg: MsgInfo = mm::read_user_struct(kernel.port(), sender_root, msg_addr)?;
    let flags = msg.flag_bits();

    // signals share this entry point: divert to the signal primitive
    if flags.contains(MsgFlags::SIGNAL) {
        return send_signal_message(kernel, sender, &msg).map(|_| SendOutcome::Delivered);
    }

    if flags.contains(MsgFlags::SEND_AS_USER) {
        let sender_proc = kernel
            .registry()
            .find(sender.pid())
            .ok_or(KernelError::Failure)?;
        if !sender_proc
            .inner()
            .read()?
            .flags
            .contains(ProcessFlags::CAN_MSG_AS_USER)
        {
            return Err(KernelError::NoRights);
        }
    }

    let receiver = match find_receiver(kernel, sender, &msg) {
        Ok(receiver) => receiver,
        Err(KernelError::NoReceiver)
            if flags.contains(MsgFlags::QUEUE_ME) && !flags.contains(MsgFlags::REPLY) =>
        {
            return queue_sender(kernel, sender, &msg, msg_addr);
        }
        Err(err) => return Err(err),
    };

    deliver(kernel, sender, &receiver, &mut msg, msg_addr, sender_root)?;

    // a replier can atomically turn around and block for the next message
    if flags.contains(MsgFlags::REPLY) && flags.contains(MsgFlags::RECV_ON_REPLY) {
        recv(kernel, sender, msg_addr)?;
    }
    Ok(SendOutcome::Delivered)
}

/// The actual payload handover once a receiver has been identified.
fn deliver(
    kernel: &Kernel,
    sender: &Arc<Thread>,
    receiver: &Arc<Thread>,
    msg: &mut MsgInfo,
    msg_addr: Vaddr,
    sender_root: PageTableRoot,
) -> Result<()> {
    let flags = msg.flag_bits();
    let receiver_proc = kernel
        .registry()
        .find(receiver.pid())
        .ok_or(KernelError::Failure)?;
    let receiver_root = receiver_proc.inner().read()?.page_root;

    let block_addr = receiver
        .inner()
        .read()?
        .msg_block
        .ok_or(KernelError::BadTargetAddress)?;
    let mut rmsg: MsgInfo = mm::read_user_struct(kernel.port(), receiver_root, block_addr)?;

    // fault in the receive buffer before copying into it
    mm::resolve_user_range(
        kernel,
        &receiver_proc,
        rmsg.recv,
        rmsg.recv_max_size,
        FaultAccess::WRITE,
    )
    .map_err(|_| KernelError::BadTargetAddress)?;

    let payload = gather_payload(kernel, sender_root, msg, rmsg.recv_max_size)?;
    if !payload.is_empty() {
        kernel
            .port()
            .write_user(receiver_root, rmsg.recv, &payload)
            .map_err(|_| KernelError::BadTargetAddress)?;
    }

    // tell each side who it talked to
    msg.pid = receiver.pid();
    msg.tid = receiver.tid();
    rmsg.recv_size = payload.len();
    rmsg.pid = sender.pid();
    rmsg.tid = sender.tid();
    {
        let sender_proc = kernel
            .registry()
            .find(sender.pid())
            .ok_or(KernelError::Failure)?;
        let inner = sender_proc.inner().read()?;
        rmsg.uid = inner.creds.uid.effective;
        rmsg.gid = inner.creds.gid.effective;
    }
    mm::write_user_struct(kernel.port(), receiver_root, block_addr, &rmsg)?;
    mm::write_user_struct(kernel.port(), sender_root, msg_addr, &*msg)?;

    if flags.contains(MsgFlags::REPLY) {
        // a share request piggybacks on the reply
        if flags.contains(MsgFlags::SHARE_VMA) && msg.mem_req.size != 0 {
            share_area(kernel, sender, receiver, &msg.mem_req)?;
        }

        // the replier hands back any priority it was granted to get here
        // and is re-queued at its own level
        let requeue = {
            let mut inner = sender.inner().write()?;
            inner.granted = None;
            inner.queued_at.map(|(cpu, _)| cpu)
        };
        sched::priority_calc(sender, sched::PriorityRequest::Check);
        if let Some(cpu) = requeue {
            sched::move_to_end(kernel, cpu, sender);
        }

        let mut inner = receiver.inner().write()?;
        inner.reply_source = None;
        drop(inner);
    } else {
        // block the sender until the receiver replies
        sched::remove(kernel, sender, ThreadState::WaitingForReply);
        {
            let mut inner = sender.inner().write()?;
            inner.reply_source = Some((receiver.pid(), receiver.tid()));
            inner.msg_block = Some(msg_addr);
        }

        // priority inheritance: lend the receiver the sender's better
        // priority so the reply cannot be starved
        let sender_priority = {
            let inner = sender.inner().read()?;
            sched::determine_priority(&inner)
        };
        {
            let mut inner = receiver.inner().write()?;
            if sender_priority < inner.priority {
                inner.granted = Some(GrantedPriority {
                    level: sender_priority,
                    by: (sender.pid(), sender.tid()),
                });
            } else {
                inner.granted = None;
            }
        }
        sched::priority_calc(receiver, sched::PriorityRequest::Check);
    }

    // recomputation happened above, so the receiver queues at its
    // effective priority
    let cpu = receiver.inner().read()?.cpu;
    sched::add(kernel, cpu, receiver);

    trace!(
        "ipc: thread {}.{} sent {} bytes to thread {}.{}",
        sender.pid(),
        sender.tid(),
        rmsg.recv_size,
        receiver.pid(),
        receiver.tid()
    );
    Ok(())
}

/// Park a sender on the target process until a receiver turns up.
fn queue_sender(
    kernel: &Kernel,
    sender: &Arc<Thread>,
    msg: &MsgInfo,
    msg_addr: Vaddr,
) -> Result<SendOutcome> {
    let target = kernel
        .registry()
        .find(msg.pid)
        .ok_or(KernelError::NoReceiver)?;
    {
        let mut inner = target.inner().write()?;
        let entry = QueuedSender {
            pid: sender.pid(),
            tid: sender.tid(),
        };
        let pool = inner.msg_waiting.as_mut().ok_or(KernelError::NoReceiver)?;
        let already_parked = pool
            .handles()
            .into_iter()
            .filter_map(|h| pool.get(h))
            .any(|e| e.pid == entry.pid && e.tid == entry.tid);
        if !already_parked {
            pool.alloc(kernel, entry)?;
        }
    }
    sender.inner().write()?.msg_block = Some(msg_addr);
    sched::remove(kernel, sender, ThreadState::WaitingForMsg);
    trace!(
        "ipc: queued sender {}.{} on pid {}",
        sender.pid(),
        sender.tid(),
        msg.pid
    );
    Ok(SendOutcome::Queued)
}

/// Retry the senders parked on `process` now a receiver exists. Called by
/// recv after it registers; at most one parked send will complete.
fn flush_queued_senders(kernel: &Kernel, process: &Arc<Process>) {
    let entries: Vec<(crate::mm::PoolHandle, QueuedSender)> = {
        let Ok(inner) = process.inner().read() else {
            return;
        };
        let Some(pool) = inner.msg_waiting.as_ref() else {
            return;
        };
        pool.handles()
            .into_iter()
            .filter_map(|h| pool.get(h).map(|e| (h, *e)))
            .collect()
    };

    for (handle, entry) in entries {
        let Some(thread) = kernel.find_thread(entry.pid, entry.tid) else {
            if let Ok(mut inner) = process.inner().write() {
                if let Some(pool) = inner.msg_waiting.as_mut() {
                    let _ = pool.free(handle);
                }
            }
            continue;
        };
        let Some(block) = thread.inner().read().ok().and_then(|i| i.msg_block) else {
            continue;
        };
        match send(kernel, &thread, block) {
            Ok(SendOutcome::Delivered) => {
                if let Ok(mut t) = thread.inner().write() {
                    t.regs.result = 0;
                }
                if let Ok(mut inner) = process.inner().write() {
                    if let Some(pool) = inner.msg_waiting.as_mut() {
                        let _ = pool.free(handle);
                    }
                }
                // one receiver, one delivery
                break;
            }
            Ok(SendOutcome::Queued) | Err(KernelError::NoReceiver) => {}
            Err(err) => {
                // unblock the sender with the bad news
                if let Ok(mut t) = thread.inner().write() {
                    t.regs.result = err.to_syscall();
                }
                let cpu = thread.inner().read().map(|i| i.cpu).unwrap_or(0);
                sched::add(kernel, cpu, &thread);
                if let Ok(mut inner) = process.inner().write() {
                    if let Some(pool) = inner.msg_waiting.as_mut() {
                        let _ = pool.free(handle);
                    }
                }
            }
        }
    }
}

/// Wake every sender parked on a dying process with "no receiver".
pub fn drain_queued_senders(kernel: &Kernel, process: &Arc<Process>) {
    let entries: Vec<QueuedSender> = {
        let Ok(inner) = process.inner().read() else {
            return;
        };
        match inner.msg_waiting.as_ref() {
            Some(pool) => pool
                .handles()
                .into_iter()
                .filter_map(|h| pool.get(h).copied())
                .collect(),
            None => return,
        }
    };
    for entry in entries {
        if let Some(thread) = kernel.find_thread(entry.pid, entry.tid) {
            if let Ok(mut inner) = thread.inner().write() {
                inner.regs.result = KernelError::NoReceiver.to_syscall();
            }
            let cpu = thread.inner().read().map(|i| i.cpu).unwrap_or(0);
            sched::add(kernel, cpu, &thread);
        }
    }
}

/// Block a thread until a message or signal comes in. If an acceptable
/// signal is already queued it is handed over without blocking.
pub fn recv(kernel: &Kernel, receiver: &Arc<Thread>, msg_addr: Vaddr) -> Result<RecvOutcome> {
    mm::check_user_range(msg_addr, core::mem::size_of::<MsgInfo>())?;
    let root = thread_root(kernel, receiver)?;
    let msg: MsgInfo = mm::read_user_struct(kernel.port(), root, msg_addr)?;
    if msg.recv == 0 || msg.recv_max_size == 0 {
        return Err(KernelError::BadAddress);
    }

    receiver.inner().write()?.msg_block = Some(msg_addr);

    let process = kernel
        .registry()
        .find(receiver.pid())
        .ok_or(KernelError::Failure)?;

    // a queued signal beats blocking
    if msg.flags & MsgFlags::SIGNAL.bits() != 0 {
        if let Some(queued) = signal::take_queued(kernel, &process) {
            let mut rmsg = msg;
            rmsg.signal = SignalField {
                number: queued.number,
                extra: queued.extra,
            };
            rmsg.pid = queued.sender_pid;
            rmsg.tid = queued.sender_tid;
            rmsg.uid = queued.sender_uid;
            rmsg.gid = queued.sender_gid;
            rmsg.recv_size = 0;
            mm::write_user_struct(kernel.port(), root, msg_addr, &rmsg)?;
            return Ok(RecvOutcome::Delivered);
        }
    }

    sched::remove(kernel, receiver, ThreadState::WaitingForMsg);
    trace!(
        "ipc: thread {}.{} now receiving",
        receiver.pid(),
        receiver.tid()
    );

    // a parked sender may have been waiting for exactly this
    flush_queued_senders(kernel, &process);
    Ok(RecvOutcome::Blocked)
}

/// A signal expressed through the message interface.
fn send_signal_message(kernel: &Kernel, sender: &Arc<Thread>, msg: &MsgInfo) -> Result<()> {
    let flags = msg.flag_bits();

    if flags.contains(MsgFlags::IN_MY_PROC_GRP) || flags.contains(MsgFlags::IN_A_PROC_GRP) {
        let pgid = if flags.contains(MsgFlags::IN_MY_PROC_GRP) {
            0
        } else {
            msg.pid
        };
        return signal::send_group_signal(
            kernel,
            pgid,
            Some(sender),
            msg.signal.number,
            msg.signal.extra,
        );
    }

    let target = if msg.role != 0 {
        let role =
            crate::process::Role::from_u32(msg.role).ok_or(KernelError::BadParams)?;
        kernel
            .registry()
            .role_lookup(role)
            .ok_or(KernelError::NoReceiver)?
    } else {
        kernel
            .registry()
            .find(msg.pid)
            .ok_or(KernelError::NoReceiver)?
    };
    signal::send_signal(kernel, Some(sender), &target, msg.signal.number, msg.signal.extra)
}

/// Mount a VMA of the replier into the receiver's tree (the SHARE_VMA
/// reply flag).
fn share_area(
    kernel: &Kernel,
    sender: &Arc<Thread>,
    receiver: &Arc<Thread>,
    request: &ShareRequest,
) -> Result<()> {
    let sender_proc = kernel
        .registry()
        .find(sender.pid())
        .ok_or(KernelError::Failure)?;
    let receiver_proc = kernel
        .registry()
        .find(receiver.pid())
        .ok_or(KernelError::Failure)?;

    let vma = {
        let inner = sender_proc.inner().read()?;
        inner
            .space
            .find(request.base)
            .map(|(_, vma)| vma)
            .ok_or(KernelError::NotFound)?
    };
    let mut inner = receiver_proc.inner().write()?;
    let pid = receiver_proc.pid();
    inner.space.link(kernel, pid, request.base, &vma)
}
