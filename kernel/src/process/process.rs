// SPDX-License-Identifier: MPL-2.0

use crate::config::{FIRST_TID, LAYER_EXECUTIVE, LAYER_MAX};
use crate::cpu::CpuId;
use crate::error::{KernelError, Result};
use crate::ipc::{QueuedSender, QueuedSignal};
use crate::mm::{AddressSpace, Pool};
use crate::prelude::*;
use crate::process::table::Role;
use crate::process::thread::{create_thread, duplicate_thread, Thread};
use crate::process::{Credentials, Pid, Tid};
use crate::sched;
use crate::sync::Gate;

bitflags! {
    /// Process status and rights bits. Rights may only be cleared after
    /// creation, never granted.
    pub struct ProcessFlags: u32 {
        /// Scheduler must not run this process's threads.
        const RUNLOCKED       = 1 << 0;
        /// May send messages on behalf of an unprivileged user process.
        const CAN_MSG_AS_USER = 1 << 1;
        /// May register as a driver process.
        const CAN_BE_DRIVER   = 1 << 2;
        /// May map physical memory into its virtual space.
        const CAN_MAP_PHYS    = 1 << 3;
        /// May send POSIX-compatible signals.
        const CAN_UNIX_SIGNAL = 1 << 4;
        /// May register a role within the operating system.
        const CAN_PLAY_ROLE   = 1 << 5;
        /// Has replaced its image with exec().
        const CALLED_EXEC     = 1 << 6;
    }
}

impl ProcessFlags {
    pub const RIGHTS_MASK: ProcessFlags = ProcessFlags::from_bits_truncate(
        ProcessFlags::CAN_MSG_AS_USER.bits()
            | ProcessFlags::CAN_BE_DRIVER.bits()
            | ProcessFlags::CAN_MAP_PHYS.bits()
            | ProcessFlags::CAN_UNIX_SIGNAL.bits()
            | ProcessFlags::CAN_PLAY_ROLE.bits(),
    );
}

/// A driver-owned block of contiguous physical memory.
#[derive(Clone, Copy, Debug)]
pub struct PhysBlock {
    pub base: Paddr,
    pub pages: u16,
}

/// A registered IRQ handler entry.
#[derive(Clone, Copy, Debug)]
pub struct IrqEntry {
    pub irq: u32,
    pub tid: Tid,
}

/// Per-process signal bookkeeping: accept masks for the POSIX-compatible
/// and kernel ranges, in-progress bits, and the queued pools.
pub struct SignalState {
    pub unix_accepted: u32,
    pub unix_inprogress: u32,
    pub kernel_accepted: u32,
    pub system_pool: Option<Pool<QueuedSignal>>,
    pub user_pool: Option<Pool<QueuedSignal>>,
}

pub struct ProcessInner {
    pub parent: Pid,
    pub prev_parent: Pid,
    /// Privilege layer, 0 most privileged. Never decreases.
    pub layer: u8,
    pub flags: ProcessFlags,
    /// Preferred CPU; threads are kept together when the load allows.
    pub cpu_hint: CpuId,
    pub page_root: PageTableRoot,
    /// Where code execution begins.
    pub entry: Vaddr,
    pub threads: HashMap<Tid, Arc<Thread>>,
    pub next_tid: Tid,
    pub priority_low: u8,
    pub priority_high: u8,
    pub children: Vec<Pid>,
    pub space: AddressSpace,
    pub phys_blocks: Vec<PhysBlock>,
    pub irqs: Vec<IrqEntry>,
    pub creds: Credentials,
    pub role: Role,
    /// One bit per I/O port; a set bit denies access. Absent means the
    /// process touches no ports at all.
    pub io_bitmap: Option<Box<[u8]>>,
    pub signals: SignalState,
    /// Senders parked on this process waiting for a receiver.
    pub msg_waiting: Option<Pool<QueuedSender>>,
}

impl ProcessInner {
    pub fn find_thread(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.threads.get(&tid).cloned()
    }

    pub fn any_thread(&self) -> Option<Arc<Thread>> {
        self.threads.values().next().cloned()
    }

    pub fn attach_child(&mut self, pid: Pid) {
        if !self.children.contains(&pid) {
            self.children.push(pid);
        }
    }

    pub fn remove_child(&mut self, pid: Pid) {
        self.children.retain(|c| *c != pid);
    }

    /// Clear rights bits; set bits in `bits` are removed. Rights are never
    /// granted this way.
    pub fn clear_rights(&mut self, bits: ProcessFlags) {
        self.flags -= bits & ProcessFlags::RIGHTS_MASK;
    }

    /// Move one layer away from the kernel.
    pub fn layer_up(&mut self) -> Result<u8> {
        if self.layer >= LAYER_MAX {
            return Err(KernelError::MaxLayer);
        }
        self.layer += 1;
        Ok(self.layer)
    }
}

/// A process record. The registry owns these; everything else refers to a
/// process by pid.
pub struct Process {
    pid: Pid,
    inner: Gate<ProcessInner>,
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn inner(&self) -> &Gate<ProcessInner> {
        &self.inner
    }

    pub fn layer(&self) -> u8 {
        self.inner.read().map(|i| i.layer).unwrap_or(LAYER_MAX)
    }
}

/// Clone a process, or create an entirely fresh one.
///
/// With a `parent` and a `caller` thread this is fork: the page tables are
/// duplicated copy-on-write, every parent area is linked (not copied) into
/// the child, and the calling thread is duplicated. With no caller the
/// kernel is building a boot process: a blank address space and a fresh
/// first thread.
pub fn process_new(
    kernel: &Kernel,
    parent: Option<&Arc<Process>>,
    caller: Option<&Arc<Thread>>,
) -> Result<Arc<Process>> {
    let registry = kernel.registry();
    let pid = registry.allocate_pid()?;

    // port-specific address space setup: clone for fork, blank for boot
    let page_root = match (parent, caller) {
        (Some(parent), Some(_)) => {
            let root = parent.inner().read()?.page_root;
            kernel.port().clone_address_space(root)?
        }
        _ => kernel.port().new_address_space()?,
    };

    let signals = SignalState {
        unix_accepted: 0,
        unix_inprogress: 0,
        kernel_accepted: 0,
        system_pool: Some(Pool::new(kernel, 8)?),
        user_pool: Some(Pool::new(kernel, 8)?),
    };

    let mut inner = ProcessInner {
        parent: 0,
        prev_parent: 0,
        layer: LAYER_EXECUTIVE,
        flags: ProcessFlags::empty(),
        cpu_hint: kernel.cpus().boot_cpu(),
        page_root,
        entry: 0,
        threads: HashMap::new(),
        next_tid: FIRST_TID,
        priority_low: sched::PRIORITY_MIN,
        priority_high: sched::PRIORITY_MAX,
        children: Vec::new(),
        space: AddressSpace::new(),
        phys_blocks: Vec::new(),
        irqs: Vec::new(),
        creds: Credentials::superuser(),
        role: Role::None,
        io_bitmap: None,
        signals,
        msg_waiting: Some(Pool::new(kernel, 4)?),
    };

    if let Some(parent) = parent {
        let src = parent.inner().read()?;
        inner.parent = parent.pid();
        inner.flags = src.flags;
        inner.layer = src.layer;
        inner.cpu_hint = src.cpu_hint;
        inner.priority_low = src.priority_low;
        inner.priority_high = src.priority_high;
        inner.creds = src.creds.clone();
        // a fork carries the parent's tid cursor; a kernel-built process
        // starts numbering afresh
        inner.next_tid = if caller.is_some() {
            src.next_tid
        } else {
            FIRST_TID
        };
        if caller.is_some() {
            src.space.duplicate_into(kernel, pid, &mut inner.space)?;
        }
    }

    match caller {
        Some(caller) => {
            duplicate_thread(kernel, pid, &mut inner, caller)?;
        }
        None => {
            create_thread(kernel, pid, &mut inner)?;
        }
    }

    let process = Arc::new(Process {
        pid,
        inner: Gate::new(inner),
    });

    if let Some(parent) = parent {
        parent.inner().write()?.attach_child(pid);
    }

    registry.insert(process.clone())?;
    debug!("proc: created process {}", pid);
    Ok(process)
}
